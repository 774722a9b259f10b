//! Outbound notifications and per-session fan-out.
//!
//! Each session owns one tokio broadcast channel. The transport subscribes
//! once per connection and receives every notification of the session;
//! filtering out a connection's own events is the transport's job.
//! A subscriber that falls more than `capacity` messages behind loses the
//! oldest ones (it sees `RecvError::Lagged`) instead of stalling the session.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::cursor::Cursor;
use crate::oplog::LoggedOperation;
use crate::participant::Participant;
use crate::types::{DocumentId, ParticipantId};

/// Event fanned out to every member of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Notification {
    ParticipantJoined {
        document: DocumentId,
        participant: Participant,
    },
    ParticipantLeft {
        document: DocumentId,
        participant: ParticipantId,
    },
    ContentChanged {
        document: DocumentId,
        operation: LoggedOperation,
        content: String,
        version: u64,
    },
    CursorMoved {
        document: DocumentId,
        cursor: Cursor,
    },
}

impl Notification {
    /// Participant whose action produced this notification.
    pub fn origin(&self) -> &ParticipantId {
        match self {
            Notification::ParticipantJoined { participant, .. } => &participant.id,
            Notification::ParticipantLeft { participant, .. } => participant,
            Notification::ContentChanged { operation, .. } => &operation.operation.participant,
            Notification::CursorMoved { cursor, .. } => &cursor.participant,
        }
    }

    pub fn document(&self) -> &DocumentId {
        match self {
            Notification::ParticipantJoined { document, .. }
            | Notification::ParticipantLeft { document, .. }
            | Notification::ContentChanged { document, .. }
            | Notification::CursorMoved { document, .. } => document,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Notification::ParticipantJoined { .. } => "participant_joined",
            Notification::ParticipantLeft { .. } => "participant_left",
            Notification::ContentChanged { .. } => "content_changed",
            Notification::CursorMoved { .. } => "cursor_moved",
        }
    }
}

/// Broadcast channel for one session.
///
/// Counters are atomics so `publish` never takes a lock.
pub struct FanOut {
    sender: broadcast::Sender<Arc<Notification>>,
    published: AtomicU64,
    /// Published while nobody was subscribed.
    undelivered: AtomicU64,
}

impl FanOut {
    /// `capacity` is the per-subscriber buffer before lagging sets in.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            published: AtomicU64::new(0),
            undelivered: AtomicU64::new(0),
        }
    }

    /// Send to every current subscriber. Returns how many received it; zero
    /// subscribers is not an error.
    pub fn publish(&self, notification: Notification) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);
        match self.sender.send(Arc::new(notification)) {
            Ok(count) => count,
            Err(_) => {
                self.undelivered.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Notification>> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn undelivered(&self) -> u64 {
        self.undelivered.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::now_millis;

    fn cursor_moved(who: &str) -> Notification {
        Notification::CursorMoved {
            document: DocumentId::from("doc"),
            cursor: Cursor {
                participant: ParticipantId::from(who),
                position: 1,
                selection_start: 1,
                selection_end: 1,
                updated_at: now_millis(),
            },
        }
    }

    #[tokio::test]
    async fn test_fan_out_reaches_every_subscriber() {
        let fanout = FanOut::new(16);
        let mut rx1 = fanout.subscribe();
        let mut rx2 = fanout.subscribe();
        let mut rx3 = fanout.subscribe();

        assert_eq!(fanout.publish(cursor_moved("alice")), 3);

        for rx in [&mut rx1, &mut rx2, &mut rx3] {
            let got = rx.recv().await.unwrap();
            assert_eq!(got.origin(), &ParticipantId::from("alice"));
            assert_eq!(got.name(), "cursor_moved");
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let fanout = FanOut::new(4);
        assert_eq!(fanout.publish(cursor_moved("a")), 0);
        assert_eq!(fanout.published(), 1);
        assert_eq!(fanout.undelivered(), 1);
        assert_eq!(fanout.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_drops_oldest() {
        let fanout = FanOut::new(2);
        let mut rx = fanout.subscribe();
        for i in 0..5 {
            fanout.publish(cursor_moved(&format!("p{i}")));
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
        // Still usable after lagging.
        assert!(rx.recv().await.is_ok());
    }

    #[test]
    fn test_notification_document() {
        let n = Notification::ParticipantLeft {
            document: DocumentId::from("doc9"),
            participant: ParticipantId::from("bob"),
        };
        assert_eq!(n.document().as_str(), "doc9");
        assert_eq!(n.origin().as_str(), "bob");
    }
}
