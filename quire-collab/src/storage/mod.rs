//! Persistence backends for document content.
//!
//! ```text
//! ┌──────────────────┐  load / save   ┌───────────────────────────────────┐
//! │ SessionRegistry  │ ─────────────► │ DocumentPersistence               │
//! │ (spawn_blocking) │  record_op     │  ├─ MemoryPersistence (HashMap)    │
//! └──────────────────┘                │  └─ RocksPersistence  (RocksDB)    │
//!                                     └───────────────────────────────────┘
//! ```
//!
//! The RocksDB store keeps three column families:
//! - `documents`  — content snapshots (LZ4 compressed)
//! - `metadata`   — per-document metadata (bincode)
//! - `operations` — journal of applied operations since the last save
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 3

pub mod memory;
pub mod rocks;

pub use memory::MemoryPersistence;
pub use rocks::{DocumentMetadata, RocksPersistence, StoreConfig};

use crate::types::DocumentId;

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PersistenceError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Document not found: {0}")]
    NotFound(DocumentId),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

impl From<rocksdb::Error> for PersistenceError {
    fn from(e: rocksdb::Error) -> Self {
        PersistenceError::Database(e.to_string())
    }
}
