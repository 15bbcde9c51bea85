//! Presence broadcaster: fan-out over every open connection.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use parley_core::events::ServerEvent;
use parley_core::ids::ConnectionId;
use parley_core::presence::OnlineSet;

use crate::connection::ClientConnection;

/// Table of open connections, bound or not.
#[derive(Default)]
pub struct PresenceBroadcaster {
    connections: RwLock<HashMap<ConnectionId, Arc<ClientConnection>>>,
}

impl PresenceBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, connection: Arc<ClientConnection>) {
        let _ = self.connections.write().insert(connection.id.clone(), connection);
    }

    pub fn remove(&self, id: &ConnectionId) -> Option<Arc<ClientConnection>> {
        self.connections.write().remove(id)
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<ClientConnection>> {
        self.connections.read().get(id).cloned()
    }

    /// Push the full online set to every open connection. Returns the
    /// number of connections the frame was queued for.
    pub fn broadcast_online(&self, online: &OnlineSet) -> usize {
        let event = ServerEvent::OnlineUsers(online.clone());
        let json = match event.encode() {
            Ok(j) => Arc::new(j),
            Err(e) => {
                warn!(error = %e, "failed to encode online set");
                return 0;
            }
        };

        let conns = self.connections.read();
        let mut delivered = 0;
        for conn in conns.values() {
            if conn.send(json.clone()) {
                delivered += 1;
            } else {
                warn!(connection_id = %conn.id, "failed to queue presence update");
            }
        }
        debug!(online = online.len(), recipients = conns.len(), delivered, "presence broadcast");
        delivered
    }

    /// Send one event to one connection, if it is still open.
    pub fn send_to(&self, id: &ConnectionId, event: &ServerEvent) -> bool {
        match self.get(id) {
            Some(conn) => conn.send_event(event),
            None => false,
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::ids::UserId;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn connection(id: &str) -> (Arc<ClientConnection>, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(8);
        let conn = ClientConnection::new(ConnectionId::from_raw(id), tx, CancellationToken::new());
        (Arc::new(conn), rx)
    }

    #[test]
    fn broadcast_reaches_every_connection() {
        let broadcaster = PresenceBroadcaster::new();
        let (c1, mut rx1) = connection("c1");
        let (c2, mut rx2) = connection("c2");
        broadcaster.add(c1);
        broadcaster.add(c2);

        let online: OnlineSet = [UserId::from_raw("a")].into_iter().collect();
        assert_eq!(broadcaster.broadcast_online(&online), 2);

        let expected = r#"{"event":"getOnlineUsers","data":["a"]}"#;
        assert_eq!(&*rx1.try_recv().unwrap(), expected);
        assert_eq!(&*rx2.try_recv().unwrap(), expected);
    }

    #[test]
    fn removed_connection_gets_nothing() {
        let broadcaster = PresenceBroadcaster::new();
        let (c1, mut rx1) = connection("c1");
        broadcaster.add(c1);
        assert!(broadcaster.remove(&ConnectionId::from_raw("c1")).is_some());
        assert!(broadcaster.remove(&ConnectionId::from_raw("c1")).is_none());

        assert_eq!(broadcaster.broadcast_online(&OnlineSet::new()), 0);
        assert!(rx1.try_recv().is_err());
        assert_eq!(broadcaster.connection_count(), 0);
    }

    #[test]
    fn send_to_unknown_connection_is_false() {
        let broadcaster = PresenceBroadcaster::new();
        let event = ServerEvent::OnlineUsers(OnlineSet::new());
        assert!(!broadcaster.send_to(&ConnectionId::from_raw("ghost"), &event));
    }
}
