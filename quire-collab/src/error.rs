//! Error taxonomy for the editing core.
//!
//! Every error is resolved at the operation boundary (join / leave / edit /
//! cursor) and returned to the caller. Nothing here is retried by the core.
//! `TransformClamped` is not an error; see [`crate::transform::TransformClamped`].

use crate::types::{DocumentId, ParticipantId};

/// Errors surfaced by the session registry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollabError {
    #[error("No active session for document {0}")]
    SessionNotFound(DocumentId),

    #[error("Participant {participant} has not joined document {document}")]
    ParticipantNotInSession {
        document: DocumentId,
        participant: ParticipantId,
    },

    #[error("Failed to initialize session for document {document}: {reason}")]
    SessionInit {
        document: DocumentId,
        reason: String,
    },

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Session for document {document} is full ({limit} participants)")]
    SessionFull {
        document: DocumentId,
        limit: usize,
    },
}

impl CollabError {
    /// Short machine-readable tag, used on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            CollabError::SessionNotFound(_) => "session_not_found",
            CollabError::ParticipantNotInSession { .. } => "participant_not_in_session",
            CollabError::SessionInit { .. } => "session_init_error",
            CollabError::InvalidOperation(_) => "invalid_operation",
            CollabError::SessionFull { .. } => "session_full",
        }
    }
}

pub type CollabResult<T> = Result<T, CollabError>;
