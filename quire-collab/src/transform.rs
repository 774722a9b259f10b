//! Operation transformer.
//!
//! Rewrites an incoming edit, expressed against the document the submitter
//! last saw, into an edit valid against the current document by folding it
//! through every concurrent edit accepted since that baseline.
//!
//! ```text
//!   baseline ── p1 ── p2 ── p3 ──► current
//!       │
//!       └── incoming ──► T(p1) ──► T(p2) ──► T(p3) ──► transformed
//! ```
//!
//! Rules for each concurrent edit `p`, oldest first by `(timestamp, id)`:
//!
//! | `p` | effect on incoming `(pos, len)` |
//! |-----|---------------------------------|
//! | insert at or before `pos` | `pos += inserted` |
//! | insert strictly inside `(pos, pos+len)` | `len += inserted` |
//! | delete entirely before `pos` | `pos -= deleted` |
//! | delete overlapping `[pos, pos+len)` | `len -= overlap`, `pos` moves to the span start |
//! | replace | delete, then insert at the same position |
//!
//! This is position shifting over scalars, not an intention-preserving OT
//! control algorithm. Two inserts at the same offset resolve by log order
//! only, so replicas replaying a different order may diverge.

use log::warn;
use serde::{Deserialize, Serialize};

use crate::operation::{OpKind, Operation};

/// Diagnostic raised when a transformed edit fell outside the document and
/// was clamped. The edit is still applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformClamped {
    pub requested_position: usize,
    pub requested_length: usize,
    pub position: usize,
    pub length: usize,
    pub document_len: usize,
}

/// Result of transforming one incoming edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transformed {
    pub kind: OpKind,
    pub clamped: Option<TransformClamped>,
}

/// Position and affected length of an edit while it is being shifted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    position: usize,
    length: usize,
}

impl Span {
    fn of(kind: &OpKind) -> Self {
        Self {
            position: kind.position(),
            length: kind.deleted_len(),
        }
    }

    /// Saturates so oversized input still reaches `clamp`.
    fn end(&self) -> usize {
        self.position.saturating_add(self.length)
    }

    /// Account for `inserted` characters added at `at`.
    fn after_insert(self, at: usize, inserted: usize) -> Self {
        if inserted == 0 {
            return self;
        }
        if at <= self.position {
            Span {
                position: self.position.saturating_add(inserted),
                ..self
            }
        } else if at < self.end() {
            Span {
                length: self.length.saturating_add(inserted),
                ..self
            }
        } else {
            self
        }
    }

    /// Account for `deleted` characters removed from `at`.
    fn after_delete(self, at: usize, deleted: usize) -> Self {
        if deleted == 0 {
            return self;
        }
        let del_end = at.saturating_add(deleted);
        let before = if at < self.position {
            del_end.min(self.position) - at
        } else {
            0
        };
        let overlap = del_end
            .min(self.end())
            .saturating_sub(at.max(self.position));
        Span {
            position: self.position - before,
            length: self.length - overlap,
        }
    }

    fn after(self, applied: &OpKind) -> Self {
        let at = applied.position();
        self.after_delete(at, applied.deleted_len())
            .after_insert(at, applied.inserted_len())
    }
}

/// Transform `incoming` against the concurrent edits that reached the
/// document after the submitter's baseline.
///
/// `concurrent` pairs each logged operation with the form in which it was
/// actually applied; they are consumed in `(timestamp, id)` order regardless
/// of slice order. `document_len` is the current length in chars.
pub fn transform(
    incoming: &OpKind,
    concurrent: &[(&Operation, &OpKind)],
    document_len: usize,
) -> Transformed {
    let mut ordered: Vec<&(&Operation, &OpKind)> = concurrent.iter().collect();
    ordered.sort_by_key(|(op, _)| op.order_key());

    let span = ordered
        .iter()
        .fold(Span::of(incoming), |span, (_, applied)| span.after(applied));

    let (position, length, clamped) = clamp(span, document_len);
    let kind = incoming.with_span(position, length);

    if clamped {
        let diag = TransformClamped {
            requested_position: span.position,
            requested_length: span.length,
            position,
            length,
            document_len,
        };
        warn!(
            "Transform clamped {} from ({}, {}) to ({}, {}) on a {}-char document",
            incoming.kind_name(),
            span.position,
            span.length,
            position,
            length,
            document_len
        );
        return Transformed {
            kind,
            clamped: Some(diag),
        };
    }

    Transformed {
        kind,
        clamped: None,
    }
}

fn clamp(span: Span, document_len: usize) -> (usize, usize, bool) {
    let position = span.position.min(document_len);
    let length = span.length.min(document_len - position);
    let clamped = position != span.position || length != span.length;
    (position, length, clamped)
}

/// Map an absolute offset through an applied edit. Used to keep cursors
/// anchored when remote edits land.
pub fn map_position(position: usize, applied: &OpKind) -> usize {
    Span { position, length: 0 }.after(applied).position
}
