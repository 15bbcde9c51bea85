//! Presence hub: the single task that mutates the registry.
//!
//! Every session forwards its lifecycle and bootstrap events here as typed
//! commands. Running evict → install → broadcast on one task means no
//! observer ever sees a half-updated registry or a stale online set.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use parley_core::events::ServerEvent;
use parley_core::ids::ConnectionId;

use crate::bootstrap::{parse_setup, SetupOutcome};
use crate::connection::ClientConnection;
use crate::presence::PresenceBroadcaster;
use crate::registry::ConnectionRegistry;

const COMMAND_QUEUE: usize = 1024;

#[derive(Debug, thiserror::Error)]
#[error("presence hub has shut down")]
pub struct HubClosed;

enum HubCommand {
    Attach {
        connection: Arc<ClientConnection>,
        reply: oneshot::Sender<()>,
    },
    Setup {
        connection_id: ConnectionId,
        payload: Value,
        reply: oneshot::Sender<SetupOutcome>,
    },
    RequestOnline {
        connection_id: ConnectionId,
        reply: oneshot::Sender<bool>,
    },
    Detach {
        connection_id: ConnectionId,
        reply: oneshot::Sender<bool>,
    },
}

/// Cloneable handle used by sessions to talk to the hub.
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<HubCommand>,
}

impl HubHandle {
    async fn call<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> HubCommand) -> Result<T, HubClosed> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(build(reply)).await.map_err(|_| HubClosed)?;
        rx.await.map_err(|_| HubClosed)
    }

    /// Register an open transport and send it the current online set.
    pub async fn attach(&self, connection: Arc<ClientConnection>) -> Result<(), HubClosed> {
        self.call(|reply| HubCommand::Attach { connection, reply }).await
    }

    /// Apply a `setup` payload to a connection.
    pub async fn setup(&self, connection_id: ConnectionId, payload: Value) -> Result<SetupOutcome, HubClosed> {
        self.call(|reply| HubCommand::Setup {
            connection_id,
            payload,
            reply,
        })
        .await
    }

    /// Send the current online set to one connection. Returns whether it
    /// was queued.
    pub async fn request_online(&self, connection_id: ConnectionId) -> Result<bool, HubClosed> {
        self.call(|reply| HubCommand::RequestOnline { connection_id, reply }).await
    }

    /// The transport closed. Returns whether a binding was removed.
    pub async fn detach(&self, connection_id: ConnectionId) -> Result<bool, HubClosed> {
        self.call(|reply| HubCommand::Detach { connection_id, reply }).await
    }
}

pub struct PresenceHub {
    registry: Arc<ConnectionRegistry>,
    broadcaster: Arc<PresenceBroadcaster>,
    rx: mpsc::Receiver<HubCommand>,
}

impl PresenceHub {
    /// Spawn the hub task. It stops when `shutdown` is cancelled or every
    /// handle has been dropped.
    pub fn spawn(
        registry: Arc<ConnectionRegistry>,
        broadcaster: Arc<PresenceBroadcaster>,
        shutdown: CancellationToken,
    ) -> (HubHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        let hub = Self {
            registry,
            broadcaster,
            rx,
        };
        let task = tokio::spawn(hub.run(shutdown));
        (HubHandle { tx }, task)
    }

    async fn run(mut self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => break,
                },
            }
        }
        debug!("presence hub stopped");
    }

    fn handle(&self, cmd: HubCommand) {
        match cmd {
            HubCommand::Attach { connection, reply } => {
                let id = connection.id.clone();
                self.broadcaster.add(connection);
                self.send_online(&id);
                let _ = reply.send(());
            }
            HubCommand::Setup {
                connection_id,
                payload,
                reply,
            } => {
                let _ = reply.send(self.setup(&connection_id, &payload));
            }
            HubCommand::RequestOnline { connection_id, reply } => {
                let _ = reply.send(self.send_online(&connection_id));
            }
            HubCommand::Detach { connection_id, reply } => {
                let _ = reply.send(self.detach(&connection_id));
            }
        }
    }

    fn send_online(&self, connection_id: &ConnectionId) -> bool {
        let online = self.registry.snapshot();
        self.broadcaster
            .send_to(connection_id, &ServerEvent::OnlineUsers(online))
    }

    fn setup(&self, connection_id: &ConnectionId, payload: &Value) -> SetupOutcome {
        if self.broadcaster.get(connection_id).is_none() {
            debug!(connection_id = %connection_id, "setup from closed connection ignored");
            return SetupOutcome::Closed;
        }

        let user = match parse_setup(payload) {
            Ok(user) => user,
            Err(e) => {
                warn!(connection_id = %connection_id, kind = e.error_kind(), error = %e, "setup rejected");
                return SetupOutcome::Rejected(e);
            }
        };

        let outcome = self.registry.bind(user.clone(), connection_id.clone());

        // The superseded transport leaves the broadcast table before the
        // broadcast below, so the broadcast reflects only the new session.
        if let Some(old) = &outcome.evicted {
            if let Some(conn) = self.broadcaster.remove(old) {
                conn.terminate();
            }
            info!(user_id = %user, connection_id = %old, replaced_by = %connection_id, "session superseded");
        }

        let Some(online) = &outcome.online else {
            return SetupOutcome::Unchanged(user);
        };
        self.broadcaster.broadcast_online(online);

        match outcome.replaced {
            Some(from) => {
                info!(connection_id = %connection_id, from = %from, user_id = %user, "session re-bootstrapped");
                SetupOutcome::Rebound {
                    from,
                    to: user,
                    evicted: outcome.evicted,
                }
            }
            None => {
                info!(connection_id = %connection_id, user_id = %user, online = online.len(), "session bound");
                SetupOutcome::Bound {
                    user,
                    evicted: outcome.evicted,
                }
            }
        }
    }

    fn detach(&self, connection_id: &ConnectionId) -> bool {
        self.broadcaster.remove(connection_id);
        match self.registry.unbind(connection_id) {
            Some(online) => {
                self.broadcaster.broadcast_online(&online);
                true
            }
            None => false,
        }
    }
}
