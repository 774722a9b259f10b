//! Binary wire protocol for the WebSocket transport.
//!
//! Every WebSocket binary frame carries one bincode-encoded message
//! (serde mode, standard config):
//! ```text
//! client ── ClientMessage ──► server      Join · Leave · Edit · Cursor ·
//!                                          GetState · History · Ping
//! client ◄── ServerMessage ── server      Joined · EditAck · Left · State ·
//!                                          History · Notification · Error · Pong
//! ```
//!
//! A connection is bound to at most one (document, participant) pair, set
//! by `Join`; every other request acts on that pair.

use serde::{Deserialize, Serialize};

use crate::error::CollabError;
use crate::fanout::Notification;
use crate::operation::RawOperation;
use crate::oplog::LoggedOperation;
use crate::session::{EditOutcome, JoinResult, LeaveResult, SessionSnapshot};
use crate::types::{DocumentId, ParticipantId};

/// Requests from a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientMessage {
    Join {
        document: DocumentId,
        participant: ParticipantId,
        display_name: Option<String>,
        avatar: Option<String>,
    },
    Leave,
    Edit {
        operation: RawOperation,
        /// Document version the edit was written against.
        base_version: u64,
    },
    Cursor {
        position: usize,
        selection_start: usize,
        selection_end: usize,
    },
    GetState,
    /// Logged operations after `since`.
    History { since: u64 },
    Ping,
}

/// Replies and pushed events from the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    Joined(JoinResult),
    EditAck(EditOutcome),
    Left(LeaveResult),
    State(SessionSnapshot),
    History(Vec<LoggedOperation>),
    Notification(Notification),
    Error { kind: String, message: String },
    Pong,
}

impl ServerMessage {
    pub fn error(kind: impl Into<String>, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl From<&CollabError> for ServerMessage {
    fn from(e: &CollabError) -> Self {
        ServerMessage::error(e.kind(), e.to_string())
    }
}

impl From<&ProtocolError> for ServerMessage {
    fn from(e: &ProtocolError) -> Self {
        ServerMessage::error(e.kind(), e.to_string())
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Connection has not joined a document")]
    NotJoined,

    #[error("Connection already joined document {0}")]
    AlreadyJoined(DocumentId),

    #[error("Participant {1} is already connected to {0}")]
    ParticipantConnected(DocumentId, ParticipantId),
}

impl ProtocolError {
    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolError::Serialization(_) => "serialization_error",
            ProtocolError::Deserialization(_) => "malformed_message",
            ProtocolError::NotJoined => "not_joined",
            ProtocolError::AlreadyJoined(_) => "already_joined",
            ProtocolError::ParticipantConnected(..) => "participant_connected",
        }
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(msg)
}

impl ClientMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }

    pub fn join(document: impl Into<DocumentId>, participant: impl Into<ParticipantId>) -> Self {
        ClientMessage::Join {
            document: document.into(),
            participant: participant.into(),
            display_name: None,
            avatar: None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ClientMessage::Join { .. } => "join",
            ClientMessage::Leave => "leave",
            ClientMessage::Edit { .. } => "edit",
            ClientMessage::Cursor { .. } => "cursor",
            ClientMessage::GetState => "get_state",
            ClientMessage::History { .. } => "history",
            ClientMessage::Ping => "ping",
        }
    }
}

impl ServerMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}
