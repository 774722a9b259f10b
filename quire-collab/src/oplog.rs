//! Append-only operation log, one per session.
//!
//! Entries keep the submitted operation untouched next to the transformed
//! form that was applied. Sequence numbers are 1-based and double as
//! [`OperationId`]s; the log's length is the document version.

use serde::{Deserialize, Serialize};

use crate::document::DocumentState;
use crate::operation::{OpKind, Operation};
use crate::types::{OperationId, ParticipantId, Timestamp};

/// One accepted edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggedOperation {
    /// The edit as submitted (pre-transform position).
    pub operation: Operation,
    /// The edit as applied to the document.
    pub transformed: OpKind,
    /// Set once the transformed edit has been spliced into the content.
    pub applied: bool,
    /// Whether the transform had to clamp the edit.
    pub clamped: bool,
}

impl LoggedOperation {
    pub fn id(&self) -> OperationId {
        self.operation.id
    }
}

/// Ordered history of a document's edits.
#[derive(Debug, Default)]
pub struct OperationLog {
    entries: Vec<LoggedOperation>,
    /// Entries `[..applied_through]` are applied; the rest are pending.
    applied_through: usize,
}

impl OperationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of logged operations.
    pub fn version(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Identifier the next appended operation will receive.
    pub fn next_id(&self) -> OperationId {
        OperationId(self.version() + 1)
    }

    /// Timestamp of the newest entry (0 if empty).
    pub fn last_timestamp(&self) -> Timestamp {
        self.entries.last().map_or(0, |e| e.operation.timestamp)
    }

    /// Entries after `base_version` authored by someone other than `author`,
    /// paired with the form in which they were applied.
    pub fn concurrent_with(
        &self,
        base_version: u64,
        author: &ParticipantId,
    ) -> Vec<(&Operation, &OpKind)> {
        self.since(base_version)
            .iter()
            .filter(|e| &e.operation.participant != author)
            .map(|e| (&e.operation, &e.transformed))
            .collect()
    }

    /// Record an accepted edit. It is not yet applied.
    pub fn append(&mut self, operation: Operation, transformed: OpKind, clamped: bool) -> &LoggedOperation {
        debug_assert_eq!(operation.id, self.next_id());
        self.entries.push(LoggedOperation {
            operation,
            transformed,
            applied: false,
            clamped,
        });
        let last = self.entries.len() - 1;
        &self.entries[last]
    }

    /// Oldest entry that has not been applied yet.
    pub fn next_unapplied(&self) -> Option<&LoggedOperation> {
        self.entries.get(self.applied_through)
    }

    /// Flag `id` as applied. Only the oldest pending entry can be marked;
    /// returns `false` for anything else (already applied, out of order or
    /// unknown).
    pub fn mark_applied(&mut self, id: OperationId) -> bool {
        match self.entries.get_mut(self.applied_through) {
            Some(entry) if entry.id() == id => {
                entry.applied = true;
                self.applied_through += 1;
                true
            }
            _ => false,
        }
    }

    /// Entries with sequence `> version`.
    pub fn since(&self, version: u64) -> &[LoggedOperation] {
        let start = (version as usize).min(self.entries.len());
        &self.entries[start..]
    }

    pub fn entries(&self) -> &[LoggedOperation] {
        &self.entries
    }

    /// Fold every applied edit over `initial`, in log order.
    pub fn replay(&self, initial: &str) -> String {
        let mut doc = DocumentState::new(initial);
        for entry in self.entries.iter().filter(|e| e.applied) {
            doc.apply(&entry.transformed);
        }
        doc.content().to_string()
    }

    pub fn clamped_count(&self) -> usize {
        self.entries.iter().filter(|e| e.clamped).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DocumentId;

    fn submit(log: &mut OperationLog, who: &str, ts: u64, kind: OpKind) -> OperationId {
        let op = Operation {
            id: log.next_id(),
            participant: ParticipantId::from(who),
            document: DocumentId::from("doc"),
            kind: kind.clone(),
            timestamp: ts,
        };
        let id = op.id;
        log.append(op, kind, false);
        id
    }

    #[test]
    fn test_append_assigns_sequential_ids() {
        let mut log = OperationLog::new();
        assert_eq!(log.next_id(), OperationId(1));
        let a = submit(&mut log, "a", 1, OpKind::insert(0, "x"));
        let b = submit(&mut log, "b", 2, OpKind::insert(0, "y"));
        assert_eq!(a, OperationId(1));
        assert_eq!(b, OperationId(2));
        assert_eq!(log.version(), 2);
        assert_eq!(log.last_timestamp(), 2);
    }

    #[test]
    fn test_mark_applied_once() {
        let mut log = OperationLog::new();
        let id = submit(&mut log, "a", 1, OpKind::insert(0, "x"));
        assert_eq!(log.next_unapplied().map(|e| e.id()), Some(id));
        assert!(log.mark_applied(id));
        assert!(!log.mark_applied(id));
        assert!(log.next_unapplied().is_none());
        assert!(!log.mark_applied(OperationId(42)));
    }

    #[test]
    fn test_mark_applied_in_log_order_only() {
        let mut log = OperationLog::new();
        let a = submit(&mut log, "a", 1, OpKind::insert(0, "x"));
        let b = submit(&mut log, "b", 2, OpKind::insert(0, "y"));
        assert!(!log.mark_applied(b));
        assert!(log.mark_applied(a));
        assert!(log.mark_applied(b));
    }

    #[test]
    fn test_concurrent_excludes_author_and_baseline() {
        let mut log = OperationLog::new();
        submit(&mut log, "a", 1, OpKind::insert(0, "1"));
        submit(&mut log, "b", 2, OpKind::insert(0, "2"));
        submit(&mut log, "a", 3, OpKind::insert(0, "3"));
        submit(&mut log, "c", 4, OpKind::insert(0, "4"));

        let concurrent = log.concurrent_with(1, &ParticipantId::from("a"));
        let ids: Vec<u64> = concurrent.iter().map(|(op, _)| op.id.0).collect();
        assert_eq!(ids, vec![2, 4]);

        assert!(log.concurrent_with(4, &ParticipantId::from("z")).is_empty());
        assert!(log.concurrent_with(99, &ParticipantId::from("z")).is_empty());
    }

    #[test]
    fn test_replay_folds_applied_entries() {
        let mut log = OperationLog::new();
        let a = submit(&mut log, "a", 1, OpKind::insert(5, " world"));
        let b = submit(&mut log, "b", 2, OpKind::delete(0, 1));
        log.mark_applied(a);
        assert_eq!(log.replay("hello"), "hello world");
        log.mark_applied(b);
        assert_eq!(log.replay("hello"), "ello world");
    }

    #[test]
    fn test_since_bounds() {
        let mut log = OperationLog::new();
        submit(&mut log, "a", 1, OpKind::insert(0, "x"));
        submit(&mut log, "a", 2, OpKind::insert(0, "y"));
        assert_eq!(log.since(0).len(), 2);
        assert_eq!(log.since(1).len(), 1);
        assert_eq!(log.since(5).len(), 0);
    }
}
