//! Message relay: best-effort push of a persisted message to its recipient.

use std::sync::Arc;

use tracing::{debug, warn};

use parley_core::events::ServerEvent;
use parley_core::messages::Message;

use crate::presence::PresenceBroadcaster;
use crate::registry::ConnectionRegistry;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Queued on the recipient's connection.
    Delivered,
    /// Recipient has no live binding.
    Offline,
    /// Recipient was bound but its queue was full or already closed.
    Dropped,
}

/// Online-only, at-most-once fast path. Never retries, never queues.
pub struct MessageRelay {
    registry: Arc<ConnectionRegistry>,
    broadcaster: Arc<PresenceBroadcaster>,
}

impl MessageRelay {
    pub fn new(registry: Arc<ConnectionRegistry>, broadcaster: Arc<PresenceBroadcaster>) -> Self {
        Self { registry, broadcaster }
    }

    /// Push `message` to its receiver. Call only after storage has
    /// confirmed the message is durable.
    pub fn relay(&self, message: &Message) -> RelayOutcome {
        let Some(connection_id) = self.registry.lookup(&message.receiver_id) else {
            debug!(message_id = %message.id, user_id = %message.receiver_id, "recipient offline, push skipped");
            return RelayOutcome::Offline;
        };

        if self
            .broadcaster
            .send_to(&connection_id, &ServerEvent::NewMessage(message.clone()))
        {
            debug!(message_id = %message.id, connection_id = %connection_id, "message relayed");
            RelayOutcome::Delivered
        } else {
            warn!(message_id = %message.id, connection_id = %connection_id, "relay push dropped");
            RelayOutcome::Dropped
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ClientConnection;
    use parley_core::ids::{ConnectionId, MessageId, UserId};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        registry: Arc<ConnectionRegistry>,
        broadcaster: Arc<PresenceBroadcaster>,
        relay: MessageRelay,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(ConnectionRegistry::new());
        let broadcaster = Arc::new(PresenceBroadcaster::new());
        let relay = MessageRelay::new(registry.clone(), broadcaster.clone());
        Fixture {
            registry,
            broadcaster,
            relay,
        }
    }

    fn open(f: &Fixture, id: &str, capacity: usize) -> mpsc::Receiver<Arc<String>> {
        let (tx, rx) = mpsc::channel(capacity);
        let conn = ClientConnection::new(ConnectionId::from_raw(id), tx, CancellationToken::new());
        f.broadcaster.add(Arc::new(conn));
        rx
    }

    fn message_to(receiver: &str) -> Message {
        Message {
            id: MessageId::from_raw("msg_1"),
            sender_id: UserId::from_raw("a"),
            receiver_id: UserId::from_raw(receiver),
            text: Some("hi".into()),
            image: Some("https://cdn.example/x.png".into()),
            created_at: "2026-05-01T08:00:00Z".parse().unwrap(),
        }
    }

    #[test]
    fn bound_recipient_receives_full_message() {
        let f = fixture();
        let mut rx = open(&f, "c_b", 4);
        f.registry.bind(UserId::from_raw("b"), ConnectionId::from_raw("c_b"));

        let msg = message_to("b");
        assert_eq!(f.relay.relay(&msg), RelayOutcome::Delivered);

        let frame = rx.try_recv().unwrap();
        assert_eq!(ServerEvent::decode(&frame).unwrap(), ServerEvent::NewMessage(msg));
    }

    #[test]
    fn unbound_recipient_is_offline() {
        let f = fixture();
        let mut rx = open(&f, "c_b", 4);
        // Connected but never bootstrapped
        assert_eq!(f.relay.relay(&message_to("b")), RelayOutcome::Offline);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn only_the_recipient_is_pushed() {
        let f = fixture();
        let mut rx_b = open(&f, "c_b", 4);
        let mut rx_c = open(&f, "c_c", 4);
        f.registry.bind(UserId::from_raw("b"), ConnectionId::from_raw("c_b"));
        f.registry.bind(UserId::from_raw("c"), ConnectionId::from_raw("c_c"));

        f.relay.relay(&message_to("b"));
        assert!(rx_b.try_recv().is_ok());
        assert!(rx_c.try_recv().is_err());
    }

    #[test]
    fn full_queue_drops_without_retry() {
        let f = fixture();
        let _rx = open(&f, "c_b", 1);
        f.registry.bind(UserId::from_raw("b"), ConnectionId::from_raw("c_b"));

        assert_eq!(f.relay.relay(&message_to("b")), RelayOutcome::Delivered);
        assert_eq!(f.relay.relay(&message_to("b")), RelayOutcome::Dropped);
    }
}
