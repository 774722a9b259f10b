//! Per-document session: the single writer for one document.
//!
//! A [`Session`] bundles the participant directory, cursor tracker,
//! document content and operation log of one document. It is synchronous
//! and owned by the registry behind one `tokio::sync::Mutex`, so every
//! mutation of a document is serialized and the lock is never held across
//! persistence I/O.
//!
//! ```text
//!                  load ok                  last leave
//! Uninitialized ───────────► Active ────────────────────► Draining
//!       │                      ▲                             │
//!       │ load failed          └──────── join ───────────────┤
//!       ▼                                                    │ saved
//!  Terminated ◄──────────────────────────────────────────────┘
//! ```
//!
//! Edit pipeline: validate → transform against concurrent log entries →
//! append → apply in log order → map cursors → refresh presence.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::cursor::{Cursor, CursorTracker};
use crate::document::DocumentState;
use crate::error::{CollabError, CollabResult};
use crate::operation::{OpKind, Operation};
use crate::oplog::{LoggedOperation, OperationLog};
use crate::participant::{CursorColor, Participant, ParticipantDirectory, ParticipantStatus};
use crate::transform::{transform, TransformClamped};
use crate::types::{now_millis, DocumentId, ParticipantId, Timestamp};

/// Lifecycle phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionPhase {
    /// Created, content not loaded yet.
    Uninitialized,
    /// Accepting joins, edits and cursor updates.
    Active,
    /// Last participant left; final save in progress.
    Draining,
    /// Gone from the registry.
    Terminated,
}

/// Returned to a joiner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinResult {
    pub document: DocumentId,
    /// The joiner's own record.
    pub participant: Participant,
    pub color: CursorColor,
    /// Every member, in join order, joiner included.
    pub participants: Vec<Participant>,
    pub content: String,
    /// Number of logged operations; the joiner's edit baseline.
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaveResult {
    pub document: DocumentId,
    pub participant: ParticipantId,
    pub remaining: usize,
    /// The session was torn down and its content saved.
    pub terminated: bool,
}

/// Result of an accepted edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditOutcome {
    pub operation: LoggedOperation,
    pub content: String,
    pub version: u64,
    pub clamped: Option<TransformClamped>,
}

/// Read-only view of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub document: DocumentId,
    pub phase: SessionPhase,
    pub participants: Vec<Participant>,
    pub cursors: HashMap<ParticipantId, Cursor>,
    pub content: String,
    pub version: u64,
    /// Logged edits whose span had to be clamped into range.
    pub clamped_operations: usize,
    pub created_at: Timestamp,
    pub last_activity: Timestamp,
}

/// State of one collaboratively edited document.
#[derive(Debug)]
pub struct Session {
    document: DocumentId,
    phase: SessionPhase,
    directory: ParticipantDirectory,
    cursors: CursorTracker,
    state: DocumentState,
    log: OperationLog,
    /// Content as loaded; the log folds over it.
    baseline: String,
    max_participants: usize,
    created_at: Timestamp,
    last_activity: Timestamp,
}

impl Session {
    pub fn new(document: DocumentId, max_participants: usize) -> Self {
        let now = now_millis();
        Self {
            document,
            phase: SessionPhase::Uninitialized,
            directory: ParticipantDirectory::new(),
            cursors: CursorTracker::new(),
            state: DocumentState::default(),
            log: OperationLog::new(),
            baseline: String::new(),
            max_participants,
            created_at: now,
            last_activity: now,
        }
    }

    /// Install loaded content and go `Active`.
    pub fn initialize(&mut self, content: String) {
        debug_assert_eq!(self.phase, SessionPhase::Uninitialized);
        self.state = DocumentState::new(content.clone());
        self.baseline = content;
        self.phase = SessionPhase::Active;
        self.last_activity = now_millis();
    }

    pub fn terminate(&mut self) {
        self.phase = SessionPhase::Terminated;
    }

    // ─── Membership ───────────────────────────────────────────────────

    /// Add `participant`, or return its existing binding if already joined.
    ///
    /// A join during `Draining` puts the session back to `Active`.
    pub fn join(
        &mut self,
        participant: &ParticipantId,
        display_name: String,
        avatar: Option<String>,
    ) -> CollabResult<JoinResult> {
        match self.phase {
            SessionPhase::Active => {}
            SessionPhase::Draining => {
                log::info!("Session {} resumed during drain by {participant}", self.document);
                self.phase = SessionPhase::Active;
            }
            SessionPhase::Uninitialized => {
                return Err(CollabError::SessionInit {
                    document: self.document.clone(),
                    reason: "content not loaded".into(),
                })
            }
            SessionPhase::Terminated => return Err(CollabError::SessionNotFound(self.document.clone())),
        }

        if !self.directory.contains(participant) && self.directory.len() >= self.max_participants {
            return Err(CollabError::SessionFull {
                document: self.document.clone(),
                limit: self.max_participants,
            });
        }

        let color = self.directory.register(participant.clone(), display_name, avatar);
        self.cursors.place(participant);
        if let Some(member) = self.directory.get_mut(participant) {
            member.touch(ParticipantStatus::Online);
        }
        self.last_activity = now_millis();

        let me = self
            .directory
            .get(participant)
            .cloned()
            .ok_or_else(|| self.not_member(participant))?;

        Ok(JoinResult {
            document: self.document.clone(),
            participant: me,
            color,
            participants: self.directory.participants(),
            content: self.state.content().to_string(),
            version: self.log.version(),
        })
    }

    /// Remove `participant`. The session starts draining when it was the
    /// last member.
    pub fn leave(&mut self, participant: &ParticipantId) -> CollabResult<Participant> {
        self.ensure_live()?;
        let removed = self
            .directory
            .unregister(participant)
            .ok_or_else(|| self.not_member(participant))?;
        self.cursors.remove(participant);
        self.last_activity = now_millis();

        if self.directory.is_empty() {
            self.phase = SessionPhase::Draining;
        }
        Ok(removed)
    }

    // ─── Edits ────────────────────────────────────────────────────────

    /// Transform, log and apply one edit from `participant`.
    ///
    /// `base_version` is the log version the submitter's edit is based on.
    pub fn submit_edit(
        &mut self,
        participant: &ParticipantId,
        kind: OpKind,
        base_version: u64,
    ) -> CollabResult<EditOutcome> {
        self.ensure_active()?;
        if !self.directory.contains(participant) {
            return Err(self.not_member(participant));
        }
        kind.validate()?;
        let version = self.log.version();
        if base_version > version {
            return Err(CollabError::InvalidOperation(format!(
                "base version {base_version} is ahead of document version {version}"
            )));
        }

        let transformed = {
            let concurrent = self.log.concurrent_with(base_version, participant);
            transform(&kind, &concurrent, self.state.len())
        };

        let operation = Operation {
            id: self.log.next_id(),
            participant: participant.clone(),
            document: self.document.clone(),
            kind,
            // Non-decreasing, so (timestamp, id) order matches log order.
            timestamp: now_millis().max(self.log.last_timestamp()),
        };
        let id = operation.id;
        self.log
            .append(operation, transformed.kind, transformed.clamped.is_some());
        self.apply_pending();

        if let Some(author) = self.directory.get_mut(participant) {
            author.touch(ParticipantStatus::Typing);
        }
        self.last_activity = now_millis();

        let entry = self
            .log
            .since(id.0 - 1)
            .first()
            .cloned()
            .ok_or_else(|| CollabError::InvalidOperation(format!("{id} missing from log")))?;
        log::debug!(
            "Applied {} {} from {participant} on {} (version {})",
            entry.transformed.kind_name(),
            id,
            self.document,
            self.log.version()
        );

        Ok(EditOutcome {
            operation: entry,
            content: self.state.content().to_string(),
            version: self.log.version(),
            clamped: transformed.clamped,
        })
    }

    /// Apply every logged-but-unapplied entry, oldest first.
    fn apply_pending(&mut self) {
        while let Some((id, edit)) = self
            .log
            .next_unapplied()
            .map(|e| (e.id(), e.transformed.clone()))
        {
            self.state.apply(&edit);
            self.cursors.transform_all(&edit, self.state.len());
            self.log.mark_applied(id);
        }
    }

    // ─── Cursors & presence ───────────────────────────────────────────

    pub fn update_cursor(
        &mut self,
        participant: &ParticipantId,
        position: usize,
        selection_start: usize,
        selection_end: usize,
    ) -> CollabResult<Cursor> {
        self.ensure_active()?;
        let member = self
            .directory
            .get_mut(participant)
            .ok_or_else(|| CollabError::ParticipantNotInSession {
                document: self.document.clone(),
                participant: participant.clone(),
            })?;
        member.touch(ParticipantStatus::Online);
        let cursor = self.cursors.update(
            participant,
            position,
            selection_start,
            selection_end,
            self.state.len(),
        );
        self.last_activity = now_millis();
        Ok(cursor)
    }

    /// Flip members silent for longer than `away_after` to `Away`.
    pub fn mark_idle_participants(&mut self, away_after: Duration) -> Vec<ParticipantId> {
        let cutoff = now_millis().saturating_sub(away_after.as_millis() as u64);
        self.directory.mark_away_before(cutoff)
    }

    // ─── Reads ────────────────────────────────────────────────────────

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            document: self.document.clone(),
            phase: self.phase,
            participants: self.directory.participants(),
            cursors: self.cursors.snapshot(),
            content: self.state.content().to_string(),
            version: self.log.version(),
            clamped_operations: self.log.clamped_count(),
            created_at: self.created_at,
            last_activity: self.last_activity,
        }
    }

    /// Logged operations with sequence `> version`.
    pub fn operations_since(&self, version: u64) -> Vec<LoggedOperation> {
        self.log.since(version).to_vec()
    }

    /// Fold the whole log over the loaded content.
    pub fn replay(&self) -> String {
        self.log.replay(&self.baseline)
    }

    pub fn document(&self) -> &DocumentId {
        &self.document
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn content(&self) -> &str {
        self.state.content()
    }

    pub fn version(&self) -> u64 {
        self.log.version()
    }

    pub fn member_count(&self) -> usize {
        self.directory.len()
    }

    pub fn participant(&self, id: &ParticipantId) -> Option<&Participant> {
        self.directory.get(id)
    }

    pub fn is_member(&self, id: &ParticipantId) -> bool {
        self.directory.contains(id)
    }

    pub fn last_activity(&self) -> Timestamp {
        self.last_activity
    }

    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn ensure_active(&self) -> CollabResult<()> {
        match self.phase {
            SessionPhase::Active => Ok(()),
            _ => Err(CollabError::SessionNotFound(self.document.clone())),
        }
    }

    fn ensure_live(&self) -> CollabResult<()> {
        match self.phase {
            SessionPhase::Active | SessionPhase::Draining => Ok(()),
            _ => Err(CollabError::SessionNotFound(self.document.clone())),
        }
    }

    fn not_member(&self, participant: &ParticipantId) -> CollabError {
        CollabError::ParticipantNotInSession {
            document: self.document.clone(),
            participant: participant.clone(),
        }
    }
}
