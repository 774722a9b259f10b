//! Edit operations.
//!
//! [`OpKind`] is the tagged edit the transformer and the document store match
//! on. [`RawOperation`] is the loosely typed record a transport hands in; it
//! is converted (and rejected when malformed) before anything reaches the log.
//!
//! All positions and lengths count `char`s.

use serde::{Deserialize, Serialize};

use crate::error::CollabError;
use crate::types::{DocumentId, OperationId, ParticipantId, Timestamp};

/// A single text edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    Insert { position: usize, text: String },
    Delete { position: usize, length: usize },
    Replace { position: usize, length: usize, text: String },
}

impl OpKind {
    pub fn insert(position: usize, text: impl Into<String>) -> Self {
        OpKind::Insert { position, text: text.into() }
    }

    pub fn delete(position: usize, length: usize) -> Self {
        OpKind::Delete { position, length }
    }

    pub fn replace(position: usize, length: usize, text: impl Into<String>) -> Self {
        OpKind::Replace { position, length, text: text.into() }
    }

    pub fn position(&self) -> usize {
        match self {
            OpKind::Insert { position, .. }
            | OpKind::Delete { position, .. }
            | OpKind::Replace { position, .. } => *position,
        }
    }

    /// Number of existing characters this edit removes.
    pub fn deleted_len(&self) -> usize {
        match self {
            OpKind::Insert { .. } => 0,
            OpKind::Delete { length, .. } | OpKind::Replace { length, .. } => *length,
        }
    }

    /// Number of characters this edit adds.
    pub fn inserted_len(&self) -> usize {
        self.text().map_or(0, |t| t.chars().count())
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            OpKind::Insert { text, .. } | OpKind::Replace { text, .. } => Some(text),
            OpKind::Delete { .. } => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            OpKind::Insert { .. } => "insert",
            OpKind::Delete { .. } => "delete",
            OpKind::Replace { .. } => "replace",
        }
    }

    /// Copy of this edit moved to a new position / affected length.
    ///
    /// `length` is ignored for inserts.
    pub fn with_span(&self, position: usize, length: usize) -> Self {
        match self {
            OpKind::Insert { text, .. } => OpKind::Insert { position, text: text.clone() },
            OpKind::Delete { .. } => OpKind::Delete { position, length },
            OpKind::Replace { text, .. } => OpKind::Replace {
                position,
                length,
                text: text.clone(),
            },
        }
    }

    /// Edits with no effect are rejected before they enter the log.
    pub fn validate(&self) -> Result<(), CollabError> {
        match self {
            OpKind::Insert { text, .. } if text.is_empty() => Err(CollabError::InvalidOperation(
                "insert requires non-empty content".into(),
            )),
            OpKind::Delete { length: 0, .. } => Err(CollabError::InvalidOperation(
                "delete requires a positive length".into(),
            )),
            OpKind::Replace { length: 0, text, .. } if text.is_empty() => {
                Err(CollabError::InvalidOperation(
                    "replace requires a positive length or non-empty content".into(),
                ))
            }
            _ => Ok(()),
        }
    }
}

/// A submitted edit as recorded in the operation log.
///
/// `kind` keeps the position the submitter saw; the transformed copy lives
/// next to it in [`crate::oplog::LoggedOperation`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OperationId,
    pub participant: ParticipantId,
    pub document: DocumentId,
    pub kind: OpKind,
    /// Submission time (ms), non-decreasing within a session.
    pub timestamp: Timestamp,
}

impl Operation {
    /// Total order used when resolving concurrent edits: timestamp first,
    /// operation id as the tiebreaker.
    pub fn order_key(&self) -> (Timestamp, OperationId) {
        (self.timestamp, self.id)
    }
}

/// Transport-level edit record, before validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawOperation {
    /// `"insert"`, `"delete"` or `"replace"`.
    pub kind: String,
    pub position: i64,
    #[serde(default)]
    pub length: i64,
    #[serde(default)]
    pub content: Option<String>,
}

impl RawOperation {
    pub fn insert(position: i64, content: impl Into<String>) -> Self {
        Self {
            kind: "insert".into(),
            position,
            length: 0,
            content: Some(content.into()),
        }
    }

    pub fn delete(position: i64, length: i64) -> Self {
        Self {
            kind: "delete".into(),
            position,
            length,
            content: None,
        }
    }

    pub fn replace(position: i64, length: i64, content: impl Into<String>) -> Self {
        Self {
            kind: "replace".into(),
            position,
            length,
            content: Some(content.into()),
        }
    }
}

impl TryFrom<RawOperation> for OpKind {
    type Error = CollabError;

    fn try_from(raw: RawOperation) -> Result<Self, Self::Error> {
        let position = usize::try_from(raw.position).map_err(|_| {
            CollabError::InvalidOperation(format!("negative position {}", raw.position))
        })?;
        let length = usize::try_from(raw.length).map_err(|_| {
            CollabError::InvalidOperation(format!("negative length {}", raw.length))
        })?;

        let kind = match raw.kind.as_str() {
            "insert" => OpKind::Insert {
                position,
                text: raw.content.ok_or_else(|| {
                    CollabError::InvalidOperation("insert without content".into())
                })?,
            },
            "delete" => OpKind::Delete { position, length },
            "replace" => OpKind::Replace {
                position,
                length,
                text: raw.content.unwrap_or_default(),
            },
            other => {
                return Err(CollabError::InvalidOperation(format!(
                    "unknown operation kind '{other}'"
                )))
            }
        };

        kind.validate()?;
        Ok(kind)
    }
}
