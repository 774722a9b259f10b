//! WebSocket transport in front of the session registry.
//!
//! Architecture:
//! ```text
//! Client A ──┐                         ┌── Session (doc 1) ── FanOut ──┐
//!             ├── CollabServer ──────── SessionRegistry                 ├──► Client A, B
//! Client B ──┘   (one task per socket) └── Session (doc 2) ── FanOut ──┘
//!                                               │
//!                                               ▼
//!                                   DocumentPersistence (RocksDB / memory)
//! ```
//!
//! Each connection joins at most one document, and a participant is bound
//! to at most one connection per document. Requests are answered in order
//! on the same socket; session notifications are pushed in between, except
//! those the connection's own participant caused.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 8

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tokio_tungstenite::tungstenite::Message;

use crate::collaborators::{DocumentPersistence, StaticIdentities};
use crate::fanout::Notification;
use crate::protocol::{ClientMessage, ProtocolError, ServerMessage};
use crate::registry::{CollabConfig, SessionRegistry};
use crate::storage::{MemoryPersistence, PersistenceError, RocksPersistence, StoreConfig};
use crate::types::{DocumentId, ParticipantId};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// RocksDB directory (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Registry settings
    pub collab: CollabConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            storage_path: None,
            collab: CollabConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `QUIRE_BIND` and `QUIRE_DATA`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(addr) = std::env::var("QUIRE_BIND") {
            config.bind_addr = addr;
        }
        if let Ok(path) = std::env::var("QUIRE_DATA") {
            config.storage_path = Some(PathBuf::from(path));
        }
        config
    }
}

/// Connection counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
}

/// Participants currently bound to an open socket, per document.
#[derive(Debug, Default)]
struct ConnectionBindings {
    bound: Mutex<HashSet<(DocumentId, ParticipantId)>>,
}

impl ConnectionBindings {
    /// Claim `participant` on `document`; false if another socket holds it.
    async fn reserve(&self, document: &DocumentId, participant: &ParticipantId) -> bool {
        self.bound
            .lock()
            .await
            .insert((document.clone(), participant.clone()))
    }

    async fn release(&self, document: &DocumentId, participant: &ParticipantId) {
        self.bound
            .lock()
            .await
            .remove(&(document.clone(), participant.clone()));
    }
}

/// The collaboration server.
pub struct CollabServer {
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
    bindings: Arc<ConnectionBindings>,
    stats: Arc<AtomicServerStats>,
}

impl CollabServer {
    /// Build the registry over RocksDB when `storage_path` is set, memory
    /// otherwise.
    pub fn new(config: ServerConfig) -> Result<Self, PersistenceError> {
        let persistence: Arc<dyn DocumentPersistence> = match &config.storage_path {
            Some(path) => Arc::new(RocksPersistence::open(StoreConfig::new(path.clone()))?),
            None => Arc::new(MemoryPersistence::new()),
        };
        let registry = SessionRegistry::new(
            config.collab.clone(),
            persistence,
            Arc::new(StaticIdentities::new()),
        );
        Ok(Self::with_registry(config, Arc::new(registry)))
    }

    pub fn with_registry(config: ServerConfig, registry: Arc<SessionRegistry>) -> Self {
        Self {
            config,
            registry,
            bindings: Arc::new(ConnectionBindings::default()),
            stats: Arc::new(AtomicServerStats::default()),
        }
    }

    /// In-memory server on the default address.
    pub fn with_defaults() -> Self {
        Self::with_registry(
            ServerConfig::default(),
            Arc::new(SessionRegistry::in_memory()),
        )
    }

    /// Accept connections until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Collaboration server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let registry = self.registry.clone();
            let bindings = self.bindings.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, addr, registry, bindings, stats).await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        registry: Arc<SessionRegistry>,
        bindings: Arc<ConnectionBindings>,
        stats: Arc<AtomicServerStats>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {addr}");

        stats.total_connections.fetch_add(1, Ordering::Relaxed);
        stats.active_connections.fetch_add(1, Ordering::Relaxed);

        let mut conn = Connection::new(bindings);

        let result = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                stats.total_messages.fetch_add(1, Ordering::Relaxed);
                                stats.total_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);

                                let reply = match ClientMessage::decode(&data) {
                                    Ok(request) => conn.dispatch(&registry, request).await,
                                    Err(e) => {
                                        log::warn!("Failed to decode message from {addr}: {e}");
                                        Some(ServerMessage::from(&e))
                                    }
                                };
                                if let Some(reply) = reply {
                                    ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                }
                            }

                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }

                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }

                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }

                            _ => {}
                        }
                    }

                    event = async {
                        match conn.notifications.as_mut() {
                            Some(rx) => rx.recv().await,
                            // Not joined yet: wait forever.
                            None => std::future::pending().await,
                        }
                    } => {
                        match event {
                            Ok(notification) => {
                                if conn.is_own(&notification) {
                                    continue;
                                }
                                let msg = ServerMessage::Notification((*notification).clone());
                                ws_sender.send(Message::Binary(msg.encode()?.into())).await?;
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                log::warn!("Connection {addr} lagged by {n} notifications");
                            }
                            Err(broadcast::error::RecvError::Closed) => {
                                conn.notifications = None;
                            }
                        }
                    }
                }
            }
            Ok::<(), Box<dyn std::error::Error + Send + Sync>>(())
        }
        .await;

        // A dropped socket leaves the session.
        if let Some((document, participant)) = conn.joined.take() {
            if let Err(e) = registry.leave(&document, &participant).await {
                log::debug!("Leave on disconnect for {participant}@{document}: {e}");
            }
            conn.bindings.release(&document, &participant).await;
        }
        stats.active_connections.fetch_sub(1, Ordering::Relaxed);

        result
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            total_messages: self.stats.total_messages.load(Ordering::Relaxed),
            total_bytes: self.stats.total_bytes.load(Ordering::Relaxed),
        }
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }
}

/// Per-socket state.
#[derive(Default)]
struct Connection {
    joined: Option<(DocumentId, ParticipantId)>,
    notifications: Option<broadcast::Receiver<Arc<Notification>>>,
    bindings: Arc<ConnectionBindings>,
}

impl Connection {
    fn new(bindings: Arc<ConnectionBindings>) -> Self {
        Self {
            bindings,
            ..Self::default()
        }
    }

    fn is_own(&self, notification: &Notification) -> bool {
        self.joined
            .as_ref()
            .is_some_and(|(_, me)| notification.origin() == me)
    }

    fn binding(&self) -> Result<(DocumentId, ParticipantId), ProtocolError> {
        self.joined.clone().ok_or(ProtocolError::NotJoined)
    }

    /// Handle one request; `None` means no reply is sent.
    async fn dispatch(
        &mut self,
        registry: &SessionRegistry,
        request: ClientMessage,
    ) -> Option<ServerMessage> {
        log::trace!("Request {}", request.name());

        if let ClientMessage::Ping = request {
            return Some(ServerMessage::Pong);
        }

        if let ClientMessage::Join {
            document,
            participant,
            display_name,
            avatar,
        } = request
        {
            if let Some((current, _)) = &self.joined {
                return Some(ServerMessage::from(&ProtocolError::AlreadyJoined(
                    current.clone(),
                )));
            }
            let participant = if participant.is_empty() {
                ParticipantId::generate()
            } else {
                participant
            };
            if !self.bindings.reserve(&document, &participant).await {
                log::warn!("Rejected second connection for {participant}@{document}");
                return Some(ServerMessage::from(&ProtocolError::ParticipantConnected(
                    document,
                    participant,
                )));
            }
            return Some(
                match registry
                    .join_and_subscribe(&document, &participant, display_name, avatar)
                    .await
                {
                    Ok((joined, rx)) => {
                        self.joined = Some((document, participant));
                        self.notifications = Some(rx);
                        ServerMessage::Joined(joined)
                    }
                    Err(e) => {
                        self.bindings.release(&document, &participant).await;
                        ServerMessage::from(&e)
                    }
                },
            );
        }

        let (document, participant) = match self.binding() {
            Ok(binding) => binding,
            Err(e) => return Some(ServerMessage::from(&e)),
        };

        let reply = match request {
            ClientMessage::Leave => {
                let result = registry.leave(&document, &participant).await;
                if result.is_ok() {
                    self.joined = None;
                    self.notifications = None;
                    self.bindings.release(&document, &participant).await;
                }
                result.map(ServerMessage::Left)
            }
            ClientMessage::Edit {
                operation,
                base_version,
            } => registry
                .submit_raw(&document, &participant, operation, base_version)
                .await
                .map(ServerMessage::EditAck),
            ClientMessage::Cursor {
                position,
                selection_start,
                selection_end,
            } => {
                // Cursor traffic is fire-and-forget; only failures answer.
                return registry
                    .update_cursor(&document, &participant, position, selection_start, selection_end)
                    .await
                    .err()
                    .map(|e| ServerMessage::from(&e));
            }
            ClientMessage::GetState => registry
                .get_session_state(&document)
                .await
                .map(ServerMessage::State),
            ClientMessage::History { since } => registry
                .operations_since(&document, since)
                .await
                .map(ServerMessage::History),
            ClientMessage::Join { .. } | ClientMessage::Ping => return None,
        };

        Some(reply.unwrap_or_else(|e| ServerMessage::from(&e)))
    }
}
