//! # quire-collab — real-time collaborative plain-text editing core
//!
//! Many participants edit one document at once; the server serializes every
//! edit per document, rewrites stale edits against what landed since the
//! author's baseline, and fans the result out so all replicas converge.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ClientMessage    ┌────────────────┐
//! │ WebSocket    │ ─────────────────► │ CollabServer   │
//! │ client       │ ◄───────────────── │ (per socket)   │
//! └──────────────┘   ServerMessage    └───────┬────────┘
//!                                             │
//!                                     ┌───────▼────────┐
//!                                     │ SessionRegistry│── DocumentPersistence
//!                                     └───────┬────────┘   (RocksDB / memory)
//!                                             │ one Mutex per document
//!          ┌──────────────────┬───────────────┼───────────────┬────────────────┐
//!          ▼                  ▼               ▼               ▼                ▼
//!  ParticipantDirectory  CursorTracker  OperationLog ── transform ──► DocumentState
//! ```
//!
//! ## Modules
//!
//! - [`registry`] — session arena, lifecycle, persistence and fan-out
//! - [`session`] — per-document state machine and edit pipeline
//! - [`transform`] — position-shifting operation transformer
//! - [`document`] — content store (char-indexed splices)
//! - [`oplog`] — append-only operation log
//! - [`cursor`] / [`participant`] — presence
//! - [`fanout`] — notification broadcast
//! - [`storage`] — in-memory and RocksDB persistence
//! - [`protocol`] / [`server`] — bincode-over-WebSocket transport

pub mod collaborators;
pub mod cursor;
pub mod document;
pub mod error;
pub mod fanout;
pub mod operation;
pub mod oplog;
pub mod participant;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod storage;
pub mod transform;
pub mod types;

// Re-exports for convenience
pub use collaborators::{DocumentPersistence, Identity, IdentityLookup, StaticIdentities};
pub use cursor::{Cursor, CursorTracker};
pub use document::DocumentState;
pub use error::{CollabError, CollabResult};
pub use fanout::{FanOut, Notification};
pub use operation::{OpKind, Operation, RawOperation};
pub use oplog::{LoggedOperation, OperationLog};
pub use participant::{CursorColor, Participant, ParticipantDirectory, ParticipantStatus, PALETTE};
pub use protocol::{ClientMessage, ProtocolError, ServerMessage};
pub use registry::{CollabConfig, RegistryStats, SessionRegistry};
pub use server::{CollabServer, ServerConfig, ServerStats};
pub use session::{EditOutcome, JoinResult, LeaveResult, Session, SessionPhase, SessionSnapshot};
pub use storage::{
    DocumentMetadata, MemoryPersistence, PersistenceError, RocksPersistence, StoreConfig,
};
pub use transform::{map_position, transform, TransformClamped, Transformed};
pub use types::{DocumentId, OperationId, ParticipantId, Timestamp};
