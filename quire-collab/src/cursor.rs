//! Cursor tracker.
//!
//! Holds the latest cursor and selection per participant. Offsets are kept
//! inside `[0, len(content)]`: updates are clamped on arrival, and every
//! applied edit maps all cursors through it before clamping again.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::operation::OpKind;
use crate::transform::map_position;
use crate::types::{now_millis, ParticipantId, Timestamp};

/// A participant's caret and selection, in chars.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub participant: ParticipantId,
    pub position: usize,
    pub selection_start: usize,
    pub selection_end: usize,
    pub updated_at: Timestamp,
}

impl Cursor {
    fn at_start(participant: ParticipantId) -> Self {
        Self {
            participant,
            position: 0,
            selection_start: 0,
            selection_end: 0,
            updated_at: now_millis(),
        }
    }

    fn clamp_to(&mut self, document_len: usize) -> bool {
        let before = (self.position, self.selection_start, self.selection_end);
        self.position = self.position.min(document_len);
        self.selection_start = self.selection_start.min(document_len);
        self.selection_end = self.selection_end.min(document_len);
        before != (self.position, self.selection_start, self.selection_end)
    }

    fn map_through(&mut self, edit: &OpKind) {
        self.position = map_position(self.position, edit);
        self.selection_start = map_position(self.selection_start, edit);
        self.selection_end = map_position(self.selection_end, edit);
    }

    pub fn has_selection(&self) -> bool {
        self.selection_start != self.selection_end
    }
}

/// Cursor records for one session.
#[derive(Debug, Default)]
pub struct CursorTracker {
    cursors: HashMap<ParticipantId, Cursor>,
}

impl CursorTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Give `participant` a cursor at offset 0 unless it already has one.
    pub fn place(&mut self, participant: &ParticipantId) -> &Cursor {
        self.cursors
            .entry(participant.clone())
            .or_insert_with(|| Cursor::at_start(participant.clone()))
    }

    /// Overwrite `participant`'s cursor, clamped to `document_len`.
    pub fn update(
        &mut self,
        participant: &ParticipantId,
        position: usize,
        selection_start: usize,
        selection_end: usize,
        document_len: usize,
    ) -> Cursor {
        let mut cursor = Cursor {
            participant: participant.clone(),
            position,
            selection_start,
            selection_end,
            updated_at: now_millis(),
        };
        if cursor.clamp_to(document_len) {
            log::debug!(
                "Cursor for {participant} clamped from {position} to {} (document length {document_len})",
                cursor.position
            );
        }
        self.cursors.insert(participant.clone(), cursor.clone());
        cursor
    }

    pub fn remove(&mut self, participant: &ParticipantId) -> Option<Cursor> {
        self.cursors.remove(participant)
    }

    pub fn get(&self, participant: &ParticipantId) -> Option<&Cursor> {
        self.cursors.get(participant)
    }

    /// Read-only copy for broadcast.
    pub fn snapshot(&self) -> HashMap<ParticipantId, Cursor> {
        self.cursors.clone()
    }

    /// Keep every cursor anchored after `edit` was applied, then clamp to
    /// the new `document_len`.
    pub fn transform_all(&mut self, edit: &OpKind, document_len: usize) {
        for cursor in self.cursors.values_mut() {
            cursor.map_through(edit);
            cursor.clamp_to(document_len);
        }
    }

    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }
}
