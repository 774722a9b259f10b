//! In-process persistence, used by tests and as the server default when no
//! data directory is configured.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use crate::collaborators::DocumentPersistence;
use crate::document::DocumentState;
use crate::oplog::LoggedOperation;
use crate::storage::PersistenceError;
use crate::types::DocumentId;

/// Content map guarded by a std `RwLock`; calls arrive on the blocking pool.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    documents: RwLock<HashMap<DocumentId, String>>,
    journal: RwLock<HashMap<DocumentId, Vec<LoggedOperation>>>,
    loads: AtomicU64,
    saves: AtomicU64,
    fail_loads: AtomicBool,
    fail_saves: AtomicBool,
    /// Artificial latency on `load` and `save`, to widen race windows in
    /// tests.
    load_delay: Option<Duration>,
    save_delay: Option<Duration>,
}

fn poisoned<E>(_: E) -> PersistenceError {
    PersistenceError::Unavailable("memory store lock poisoned".into())
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a document before any session opens it.
    pub fn with_document(self, document: impl Into<DocumentId>, content: impl Into<String>) -> Self {
        if let Ok(mut docs) = self.documents.write() {
            docs.insert(document.into(), content.into());
        }
        self
    }

    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = Some(delay);
        self
    }

    pub fn with_save_delay(mut self, delay: Duration) -> Self {
        self.save_delay = Some(delay);
        self
    }

    /// Make every subsequent `load` fail with `Unavailable`.
    pub fn set_fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent `save` fail with `Unavailable`.
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Stored content, if the document was ever saved or seeded.
    pub fn content(&self, document: &DocumentId) -> Option<String> {
        self.documents.read().ok()?.get(document).cloned()
    }

    /// Operations journaled for `document` since its last save.
    pub fn journal(&self, document: &DocumentId) -> Vec<LoggedOperation> {
        self.journal
            .read()
            .ok()
            .and_then(|j| j.get(document).cloned())
            .unwrap_or_default()
    }

    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::SeqCst)
    }
}

impl DocumentPersistence for MemoryPersistence {
    fn load(&self, document: &DocumentId) -> Result<String, PersistenceError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.load_delay {
            std::thread::sleep(delay);
        }
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(PersistenceError::Unavailable(format!(
                "load of {document} refused"
            )));
        }
        let snapshot = self
            .documents
            .read()
            .map_err(poisoned)?
            .get(document)
            .cloned()
            .unwrap_or_default();

        let leftover = self.journal.write().map_err(poisoned)?.remove(document);
        let Some(journal) = leftover.filter(|j| !j.is_empty()) else {
            return Ok(snapshot);
        };
        let mut state = DocumentState::new(snapshot);
        for entry in &journal {
            state.apply(&entry.transformed);
        }
        log::warn!(
            "Recovered {} journaled operation(s) for document {document}",
            journal.len()
        );
        self.documents
            .write()
            .map_err(poisoned)?
            .insert(document.clone(), state.content().to_string());
        Ok(state.content().to_string())
    }

    fn save(
        &self,
        document: &DocumentId,
        content: &str,
        through: u64,
    ) -> Result<(), PersistenceError> {
        if let Some(delay) = self.save_delay {
            std::thread::sleep(delay);
        }
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(PersistenceError::Unavailable(format!(
                "save of {document} refused"
            )));
        }
        self.documents
            .write()
            .map_err(poisoned)?
            .insert(document.clone(), content.to_string());
        if let Some(journal) = self.journal.write().map_err(poisoned)?.get_mut(document) {
            journal.retain(|entry| entry.id().0 > through);
        }
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn record_operation(
        &self,
        document: &DocumentId,
        entry: &LoggedOperation,
    ) -> Result<(), PersistenceError> {
        self.journal
            .write()
            .map_err(poisoned)?
            .entry(document.clone())
            .or_default()
            .push(entry.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{OpKind, Operation};
    use crate::types::{OperationId, ParticipantId};

    #[test]
    fn test_missing_document_loads_empty() {
        let store = MemoryPersistence::new();
        assert_eq!(store.load(&DocumentId::from("nope")).unwrap(), "");
        assert_eq!(store.load_count(), 1);
    }

    #[test]
    fn test_save_then_load() {
        let store = MemoryPersistence::new().with_document("d", "seed");
        assert_eq!(store.load(&DocumentId::from("d")).unwrap(), "seed");
        store.save(&DocumentId::from("d"), "updated", 0).unwrap();
        assert_eq!(store.load(&DocumentId::from("d")).unwrap(), "updated");
        assert_eq!(store.save_count(), 1);
    }

    fn logged(seq: u64, kind: OpKind) -> LoggedOperation {
        LoggedOperation {
            operation: Operation {
                id: OperationId(seq),
                participant: ParticipantId::from("p"),
                document: DocumentId::from("d"),
                kind: kind.clone(),
                timestamp: seq,
            },
            transformed: kind,
            applied: true,
            clamped: false,
        }
    }

    #[test]
    fn test_save_drops_only_covered_journal() {
        let store = MemoryPersistence::new().with_document("d", "ab");
        let doc = DocumentId::from("d");
        store.record_operation(&doc, &logged(1, OpKind::insert(2, "c"))).unwrap();
        store.record_operation(&doc, &logged(2, OpKind::insert(3, "d"))).unwrap();

        store.save(&doc, "abc", 1).unwrap();
        let rest = store.journal(&doc);
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id(), OperationId(2));

        // The tail is folded back in on the next load.
        assert_eq!(store.load(&doc).unwrap(), "abcd");
        assert!(store.journal(&doc).is_empty());
        assert_eq!(store.content(&doc).as_deref(), Some("abcd"));
    }

    #[test]
    fn test_failure_switches() {
        let store = MemoryPersistence::new();
        store.set_fail_loads(true);
        assert!(matches!(
            store.load(&DocumentId::from("d")),
            Err(PersistenceError::Unavailable(_))
        ));
        store.set_fail_saves(true);
        assert!(store.save(&DocumentId::from("d"), "x", 0).is_err());
        assert_eq!(store.save_count(), 0);
        assert_eq!(store.content(&DocumentId::from("d")), None);
    }
}
