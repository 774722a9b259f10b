//! Session registry: the arena of live document sessions.
//!
//! ```text
//!                 RwLock<HashMap<DocumentId, Arc<SessionHandle>>>
//!                                   │
//!            ┌──────────────────────┼──────────────────────┐
//!            ▼                      ▼                      ▼
//!     SessionHandle          SessionHandle          SessionHandle
//!     ├─ Mutex<Session>      (one writer per document)
//!     ├─ FanOut  ──────► subscribers (transport)
//!     └─ save gate
//!                                   │ spawn_blocking
//!                                   ▼
//!                          DocumentPersistence
//! ```
//!
//! Lock order: the registry map lock is never acquired while a session lock
//! is held. Persistence calls run on the blocking pool. `load` happens under
//! the new session's lock so concurrent first joiners share a single load;
//! the final `save` happens after the session lock is released so a joiner
//! arriving mid-save can resurrect the draining session.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 5
//! (single-leader replication)

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, trace};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex, RwLock};

use crate::collaborators::{DocumentPersistence, IdentityLookup, StaticIdentities};
use crate::cursor::Cursor;
use crate::error::{CollabError, CollabResult};
use crate::fanout::{FanOut, Notification};
use crate::operation::{OpKind, RawOperation};
use crate::oplog::LoggedOperation;
use crate::session::{EditOutcome, JoinResult, LeaveResult, Session, SessionPhase, SessionSnapshot};
use crate::storage::{MemoryPersistence, PersistenceError};
use crate::types::{now_millis, DocumentId, ParticipantId};

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct CollabConfig {
    /// Notifications buffered per subscriber before it lags
    pub broadcast_capacity: usize,
    /// Members allowed in one session
    pub max_participants_per_session: usize,
    /// Journal every applied operation through `record_operation`
    pub journal_operations: bool,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 256,
            max_participants_per_session: 100,
            journal_operations: false,
        }
    }
}

impl CollabConfig {
    pub fn for_testing() -> Self {
        Self {
            broadcast_capacity: 64,
            max_participants_per_session: 16,
            journal_operations: false,
        }
    }
}

/// Registry counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStats {
    pub sessions_created: u64,
    pub sessions_terminated: u64,
    pub active_sessions: usize,
    pub joins: u64,
    pub leaves: u64,
    pub operations_applied: u64,
    pub transforms_clamped: u64,
    pub notifications_sent: u64,
    pub persistence_failures: u64,
}

/// Lock-free counters behind [`RegistryStats`].
#[derive(Default)]
struct AtomicRegistryStats {
    sessions_created: AtomicU64,
    sessions_terminated: AtomicU64,
    joins: AtomicU64,
    leaves: AtomicU64,
    operations_applied: AtomicU64,
    transforms_clamped: AtomicU64,
    notifications_sent: AtomicU64,
    persistence_failures: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// One live document.
struct SessionHandle {
    session: Mutex<Session>,
    fanout: FanOut,
    /// Log version of the newest content that reached storage. Orders
    /// overlapping drain and flush saves.
    saved_version: Mutex<Option<u64>>,
    /// Bumped under the session lock each time the session starts draining.
    drain_epoch: AtomicU64,
}

impl SessionHandle {
    fn new(document: DocumentId, config: &CollabConfig) -> Self {
        Self {
            session: Mutex::new(Session::new(document, config.max_participants_per_session)),
            fanout: FanOut::new(config.broadcast_capacity),
            saved_version: Mutex::new(None),
            drain_epoch: AtomicU64::new(0),
        }
    }
}

/// Run a persistence call on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T, PersistenceError>
where
    F: FnOnce() -> Result<T, PersistenceError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| PersistenceError::Unavailable(format!("blocking task failed: {e}")))?
}

/// Owner of every live session.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<DocumentId, Arc<SessionHandle>>>,
    persistence: Arc<dyn DocumentPersistence>,
    identity: Arc<dyn IdentityLookup>,
    config: CollabConfig,
    stats: AtomicRegistryStats,
}

impl SessionRegistry {
    pub fn new(
        config: CollabConfig,
        persistence: Arc<dyn DocumentPersistence>,
        identity: Arc<dyn IdentityLookup>,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            persistence,
            identity,
            config,
            stats: AtomicRegistryStats::default(),
        }
    }

    /// Default config, no identity lookup.
    pub fn with_persistence(persistence: Arc<dyn DocumentPersistence>) -> Self {
        Self::new(
            CollabConfig::default(),
            persistence,
            Arc::new(StaticIdentities::new()),
        )
    }

    /// Default config backed by [`MemoryPersistence`].
    pub fn in_memory() -> Self {
        Self::with_persistence(Arc::new(MemoryPersistence::new()))
    }

    pub fn config(&self) -> &CollabConfig {
        &self.config
    }

    // ─── Lifecycle ────────────────────────────────────────────────────

    /// Join `participant` to `document`, opening the session on first join.
    ///
    /// Missing display data is resolved through the identity lookup, then
    /// falls back to the participant id.
    pub async fn join(
        &self,
        document: &DocumentId,
        participant: &ParticipantId,
        display_name: Option<String>,
        avatar: Option<String>,
    ) -> CollabResult<JoinResult> {
        let (result, _) = self
            .join_inner(document, participant, display_name, avatar, false)
            .await?;
        Ok(result)
    }

    /// [`join`](Self::join), also subscribing to the session's notifications
    /// before any later event can be published.
    pub async fn join_and_subscribe(
        &self,
        document: &DocumentId,
        participant: &ParticipantId,
        display_name: Option<String>,
        avatar: Option<String>,
    ) -> CollabResult<(JoinResult, broadcast::Receiver<Arc<Notification>>)> {
        let (result, rx) = self
            .join_inner(document, participant, display_name, avatar, true)
            .await?;
        let rx = rx.ok_or_else(|| CollabError::SessionNotFound(document.clone()))?;
        Ok((result, rx))
    }

    async fn join_inner(
        &self,
        document: &DocumentId,
        participant: &ParticipantId,
        display_name: Option<String>,
        avatar: Option<String>,
        subscribe: bool,
    ) -> CollabResult<(JoinResult, Option<broadcast::Receiver<Arc<Notification>>>)> {
        let (display_name, avatar) = self.resolve_identity(participant, display_name, avatar);

        loop {
            let handle = self.get_or_create(document).await;
            let mut session = handle.session.lock().await;

            match session.phase() {
                SessionPhase::Uninitialized => {
                    let persistence = self.persistence.clone();
                    let doc = document.clone();
                    match blocking(move || persistence.load(&doc)).await {
                        Ok(content) => {
                            session.initialize(content);
                            bump(&self.stats.sessions_created);
                            info!(
                                "Session opened for document {document} ({} chars)",
                                session.content().chars().count()
                            );
                        }
                        Err(e) => {
                            session.terminate();
                            drop(session);
                            self.remove_if_current(document, &handle).await;
                            bump(&self.stats.persistence_failures);
                            error!("Failed to load document {document}: {e}");
                            return Err(CollabError::SessionInit {
                                document: document.clone(),
                                reason: e.to_string(),
                            });
                        }
                    }
                }
                SessionPhase::Terminated => {
                    // Lost a race with teardown or a failed load; start over.
                    drop(session);
                    self.remove_if_current(document, &handle).await;
                    continue;
                }
                SessionPhase::Active | SessionPhase::Draining => {}
            }

            let was_member = session.is_member(participant);
            let result = session.join(participant, display_name.clone(), avatar.clone())?;
            bump(&self.stats.joins);
            if !was_member {
                self.publish(
                    &handle,
                    Notification::ParticipantJoined {
                        document: document.clone(),
                        participant: result.participant.clone(),
                    },
                );
                info!(
                    "{} ({participant}) joined document {document} ({} members)",
                    result.participant.display_name,
                    result.participants.len()
                );
            }
            // After our own join event, still under the session lock.
            let rx = subscribe.then(|| handle.fanout.subscribe());
            return Ok((result, rx));
        }
    }

    /// Remove `participant` from `document`. The last leave saves the
    /// content and tears the session down.
    pub async fn leave(
        &self,
        document: &DocumentId,
        participant: &ParticipantId,
    ) -> CollabResult<LeaveResult> {
        let handle = self.handle(document).await?;
        let mut session = handle.session.lock().await;
        session.leave(participant)?;
        bump(&self.stats.leaves);
        self.publish(
            &handle,
            Notification::ParticipantLeft {
                document: document.clone(),
                participant: participant.clone(),
            },
        );
        info!("{participant} left document {document}");

        let remaining = session.member_count();
        if session.phase() != SessionPhase::Draining {
            return Ok(LeaveResult {
                document: document.clone(),
                participant: participant.clone(),
                remaining,
                terminated: false,
            });
        }

        let epoch = handle.drain_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let version = session.version();
        let content = session.content().to_string();
        drop(session);

        self.save_snapshot(document, &handle, version, content).await;

        let mut session = handle.session.lock().await;
        let still_ours = session.phase() == SessionPhase::Draining
            && handle.drain_epoch.load(Ordering::SeqCst) == epoch;
        if !still_ours {
            debug!("Session {document} was resumed during its final save");
            return Ok(LeaveResult {
                document: document.clone(),
                participant: participant.clone(),
                remaining: session.member_count(),
                terminated: false,
            });
        }

        session.terminate();
        drop(session);
        self.remove_if_current(document, &handle).await;
        bump(&self.stats.sessions_terminated);
        info!("Session for document {document} closed");

        Ok(LeaveResult {
            document: document.clone(),
            participant: participant.clone(),
            remaining: 0,
            terminated: true,
        })
    }

    /// Save `content`, which reflects the log through `version`, unless
    /// newer content of the same session already reached storage. Returns
    /// whether storage holds content at or past `version`.
    async fn save_snapshot(
        &self,
        document: &DocumentId,
        handle: &SessionHandle,
        version: u64,
        content: String,
    ) -> bool {
        let mut saved = handle.saved_version.lock().await;
        if saved.is_some_and(|newest| newest > version) {
            debug!("Skipping stale save of {document} at version {version}");
            return true;
        }
        let persistence = self.persistence.clone();
        let doc = document.clone();
        match blocking(move || persistence.save(&doc, &content, version)).await {
            Ok(()) => {
                *saved = Some(version);
                debug!("Saved document {document} at version {version}");
                true
            }
            Err(e) => {
                bump(&self.stats.persistence_failures);
                error!("Failed to save document {document} at version {version}: {e}");
                false
            }
        }
    }

    // ─── Edits & cursors ──────────────────────────────────────────────

    /// Transform and apply `operation`, written against `base_version`.
    pub async fn submit_edit(
        &self,
        document: &DocumentId,
        participant: &ParticipantId,
        operation: OpKind,
        base_version: u64,
    ) -> CollabResult<EditOutcome> {
        let handle = self.handle(document).await?;
        let mut session = handle.session.lock().await;
        let outcome = session.submit_edit(participant, operation, base_version)?;

        bump(&self.stats.operations_applied);
        if outcome.clamped.is_some() {
            bump(&self.stats.transforms_clamped);
        }
        self.publish(
            &handle,
            Notification::ContentChanged {
                document: document.clone(),
                operation: outcome.operation.clone(),
                content: outcome.content.clone(),
                version: outcome.version,
            },
        );

        if self.config.journal_operations {
            // Still under the session lock, so the journal follows log order.
            let persistence = self.persistence.clone();
            let doc = document.clone();
            let entry = outcome.operation.clone();
            if let Err(e) = blocking(move || persistence.record_operation(&doc, &entry)).await {
                bump(&self.stats.persistence_failures);
                error!(
                    "Failed to journal {} for document {document}: {e}",
                    outcome.operation.id()
                );
            }
        }
        drop(session);

        Ok(outcome)
    }

    /// [`submit_edit`](Self::submit_edit) for a transport-level record.
    pub async fn submit_raw(
        &self,
        document: &DocumentId,
        participant: &ParticipantId,
        raw: RawOperation,
        base_version: u64,
    ) -> CollabResult<EditOutcome> {
        let operation = OpKind::try_from(raw)?;
        self.submit_edit(document, participant, operation, base_version)
            .await
    }

    pub async fn update_cursor(
        &self,
        document: &DocumentId,
        participant: &ParticipantId,
        position: usize,
        selection_start: usize,
        selection_end: usize,
    ) -> CollabResult<Cursor> {
        let handle = self.handle(document).await?;
        let mut session = handle.session.lock().await;
        let cursor = session.update_cursor(participant, position, selection_start, selection_end)?;
        trace!(
            "Cursor {participant}@{document} -> {} [{}, {}]",
            cursor.position,
            cursor.selection_start,
            cursor.selection_end
        );
        self.publish(
            &handle,
            Notification::CursorMoved {
                document: document.clone(),
                cursor: cursor.clone(),
            },
        );
        Ok(cursor)
    }

    // ─── Reads ────────────────────────────────────────────────────────

    pub async fn get_session_state(&self, document: &DocumentId) -> CollabResult<SessionSnapshot> {
        let handle = self.handle(document).await?;
        let session = handle.session.lock().await;
        Self::ensure_open(&session)?;
        Ok(session.snapshot())
    }

    /// Logged operations after `version`, for catch-up.
    pub async fn operations_since(
        &self,
        document: &DocumentId,
        version: u64,
    ) -> CollabResult<Vec<LoggedOperation>> {
        let handle = self.handle(document).await?;
        let session = handle.session.lock().await;
        Self::ensure_open(&session)?;
        Ok(session.operations_since(version))
    }

    /// Receive every notification of `document` from now on.
    pub async fn subscribe(
        &self,
        document: &DocumentId,
    ) -> CollabResult<broadcast::Receiver<Arc<Notification>>> {
        let handle = self.handle(document).await?;
        Ok(handle.fanout.subscribe())
    }

    // ─── Presence sweeping ────────────────────────────────────────────

    /// Mark members of `document` silent for longer than `away_after` as away.
    pub async fn mark_idle_participants(
        &self,
        document: &DocumentId,
        away_after: Duration,
    ) -> CollabResult<Vec<ParticipantId>> {
        let handle = self.handle(document).await?;
        let mut session = handle.session.lock().await;
        Self::ensure_open(&session)?;
        let away = session.mark_idle_participants(away_after);
        if !away.is_empty() {
            debug!("{} participant(s) of {document} marked away", away.len());
        }
        Ok(away)
    }

    /// Documents whose session saw no activity for `idle_for`.
    pub async fn idle_documents(&self, idle_for: Duration) -> Vec<DocumentId> {
        let cutoff = now_millis().saturating_sub(idle_for.as_millis() as u64);
        let handles: Vec<(DocumentId, Arc<SessionHandle>)> = {
            let sessions = self.sessions.read().await;
            sessions
                .iter()
                .map(|(id, h)| (id.clone(), h.clone()))
                .collect()
        };

        let mut idle = Vec::new();
        for (document, handle) in handles {
            let session = handle.session.lock().await;
            if session.phase() == SessionPhase::Active && session.last_activity() <= cutoff {
                idle.push(document);
            }
        }
        idle.sort();
        idle
    }

    /// Save every active session's content. Sessions stay open.
    pub async fn flush_all(&self) -> usize {
        let handles: Vec<(DocumentId, Arc<SessionHandle>)> = {
            let sessions = self.sessions.read().await;
            sessions
                .iter()
                .map(|(id, h)| (id.clone(), h.clone()))
                .collect()
        };

        let mut saved = 0;
        for (document, handle) in handles {
            let (version, content) = {
                let session = handle.session.lock().await;
                if session.phase() != SessionPhase::Active {
                    continue;
                }
                (session.version(), session.content().to_string())
            };
            if self.save_snapshot(&document, &handle, version, content).await {
                saved += 1;
            }
        }
        info!("Flushed {saved} document(s)");
        saved
    }

    // ─── Introspection ────────────────────────────────────────────────

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn documents(&self) -> Vec<DocumentId> {
        let mut ids: Vec<DocumentId> = self.sessions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn stats(&self) -> RegistryStats {
        let s = &self.stats;
        RegistryStats {
            sessions_created: s.sessions_created.load(Ordering::Relaxed),
            sessions_terminated: s.sessions_terminated.load(Ordering::Relaxed),
            active_sessions: self.session_count().await,
            joins: s.joins.load(Ordering::Relaxed),
            leaves: s.leaves.load(Ordering::Relaxed),
            operations_applied: s.operations_applied.load(Ordering::Relaxed),
            transforms_clamped: s.transforms_clamped.load(Ordering::Relaxed),
            notifications_sent: s.notifications_sent.load(Ordering::Relaxed),
            persistence_failures: s.persistence_failures.load(Ordering::Relaxed),
        }
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn resolve_identity(
        &self,
        participant: &ParticipantId,
        display_name: Option<String>,
        avatar: Option<String>,
    ) -> (String, Option<String>) {
        match display_name {
            Some(name) => (name, avatar),
            None => match self.identity.resolve(participant) {
                Some(identity) => (identity.display_name, avatar.or(identity.avatar)),
                None => (participant.to_string(), avatar),
            },
        }
    }

    /// Double-checked get-or-insert of a session handle.
    async fn get_or_create(&self, document: &DocumentId) -> Arc<SessionHandle> {
        if let Some(handle) = self.sessions.read().await.get(document) {
            return handle.clone();
        }
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(document.clone())
            .or_insert_with(|| Arc::new(SessionHandle::new(document.clone(), &self.config)))
            .clone()
    }

    async fn handle(&self, document: &DocumentId) -> CollabResult<Arc<SessionHandle>> {
        self.sessions
            .read()
            .await
            .get(document)
            .cloned()
            .ok_or_else(|| CollabError::SessionNotFound(document.clone()))
    }

    /// Drop `document` from the map if it still points at `handle`.
    async fn remove_if_current(&self, document: &DocumentId, handle: &Arc<SessionHandle>) {
        let mut sessions = self.sessions.write().await;
        if sessions
            .get(document)
            .is_some_and(|current| Arc::ptr_eq(current, handle))
        {
            sessions.remove(document);
        }
    }

    fn ensure_open(session: &Session) -> CollabResult<()> {
        match session.phase() {
            SessionPhase::Active | SessionPhase::Draining => Ok(()),
            _ => Err(CollabError::SessionNotFound(session.document().clone())),
        }
    }

    fn publish(&self, handle: &SessionHandle, notification: Notification) {
        let delivered = handle.fanout.publish(notification);
        self.stats
            .notifications_sent
            .fetch_add(delivered as u64, Ordering::Relaxed);
    }
}
