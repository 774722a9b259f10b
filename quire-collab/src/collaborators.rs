//! Seams to the systems the editing core depends on but does not own.
//!
//! Both traits are synchronous. The registry calls persistence from tokio's
//! blocking pool, so implementations are free to do disk or network I/O.

use std::collections::HashMap;

use crate::oplog::LoggedOperation;
use crate::storage::PersistenceError;
use crate::types::{DocumentId, ParticipantId};

/// Display data for a participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub display_name: String,
    pub avatar: Option<String>,
}

/// Resolves display data when a joiner does not supply it.
pub trait IdentityLookup: Send + Sync {
    fn resolve(&self, participant: &ParticipantId) -> Option<Identity>;
}

/// Lookup backed by a fixed table. An empty table resolves nothing, which
/// makes the participant id the display name.
#[derive(Debug, Default)]
pub struct StaticIdentities {
    entries: HashMap<ParticipantId, Identity>,
}

impl StaticIdentities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(
        mut self,
        participant: impl Into<ParticipantId>,
        display_name: impl Into<String>,
        avatar: Option<String>,
    ) -> Self {
        self.entries.insert(
            participant.into(),
            Identity {
                display_name: display_name.into(),
                avatar,
            },
        );
        self
    }
}

impl IdentityLookup for StaticIdentities {
    fn resolve(&self, participant: &ParticipantId) -> Option<Identity> {
        self.entries.get(participant).cloned()
    }
}

/// Durable home of one content blob per document.
pub trait DocumentPersistence: Send + Sync {
    /// Current content. A document that was never saved loads as `""`.
    fn load(&self, document: &DocumentId) -> Result<String, PersistenceError>;

    /// Replace the stored content. `content` reflects every operation with
    /// sequence `<= through`; journal entries up to there are dropped and
    /// later ones are kept.
    fn save(
        &self,
        document: &DocumentId,
        content: &str,
        through: u64,
    ) -> Result<(), PersistenceError>;

    /// Journal one applied operation. Called only when the registry is
    /// configured for per-apply durability.
    fn record_operation(
        &self,
        _document: &DocumentId,
        _entry: &LoggedOperation,
    ) -> Result<(), PersistenceError> {
        Ok(())
    }
}
