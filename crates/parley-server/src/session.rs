//! WebSocket session lifecycle: one connected transport from upgrade
//! through disconnect.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use parley_core::events::ClientEvent;
use parley_core::ids::ConnectionId;

use crate::connection::ClientConnection;
use crate::hub::HubHandle;

/// Close code sent to a transport superseded by a newer session for the
/// same identity. Clients must not reconnect after receiving it.
pub const CLOSE_SUPERSEDED: u16 = 4000;

/// Close code sent when the server is shutting down.
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// How long the write task gets to flush a close frame.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub max_send_queue: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(90),
            max_send_queue: 256,
        }
    }
}

/// Run a WebSocket session.
///
/// 1. Attaches to the hub, which sends the current online set
/// 2. Dispatches `setup` / `getOnlineUsers` frames to the hub
/// 3. Forwards queued frames and sends periodic Pings
/// 4. Closes on peer close, heartbeat timeout, or termination
/// 5. Detaches from the hub (implicit unbind)
#[instrument(skip_all, fields(connection_id = %connection_id, user_id = tracing::field::Empty))]
pub async fn run_ws_session(
    ws: WebSocket,
    connection_id: ConnectionId,
    hub: HubHandle,
    config: SessionConfig,
    shutdown: CancellationToken,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (send_tx, mut send_rx) = mpsc::channel::<Arc<String>>(config.max_send_queue.max(1));
    let connection = Arc::new(ClientConnection::new(
        connection_id.clone(),
        send_tx,
        shutdown.child_token(),
    ));

    info!("client connected");
    if hub.attach(connection.clone()).await.is_err() {
        warn!("presence hub unavailable, closing");
        return;
    }

    let outbound_conn = connection.clone();
    let heartbeat = config.clone();
    let server_shutdown = shutdown.clone();
    let mut outbound = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(heartbeat.heartbeat_interval);
        // Skip the immediate first tick
        let _ = ping_interval.tick().await;

        loop {
            tokio::select! {
                _ = outbound_conn.terminated() => {
                    let frame = if server_shutdown.is_cancelled() {
                        CloseFrame {
                            code: CLOSE_GOING_AWAY,
                            reason: Utf8Bytes::from_static("server shutting down"),
                        }
                    } else {
                        CloseFrame {
                            code: CLOSE_SUPERSEDED,
                            reason: Utf8Bytes::from_static("session superseded"),
                        }
                    };
                    let _ = ws_tx.send(Message::Close(Some(frame))).await;
                    break;
                }
                msg = send_rx.recv() => match msg {
                    Some(text) => {
                        if ws_tx.send(Message::Text((*text).clone().into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = ping_interval.tick() => {
                    if !outbound_conn.check_alive()
                        && outbound_conn.last_seen_elapsed() > heartbeat.heartbeat_timeout
                    {
                        warn!(timeout = ?heartbeat.heartbeat_timeout, "client unresponsive, disconnecting");
                        break;
                    }
                    if ws_tx.send(Message::Ping(Default::default())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = ws_tx.close().await;
    });

    loop {
        let frame = tokio::select! {
            _ = connection.terminated() => {
                debug!("session terminated by server");
                break;
            }
            _ = &mut outbound => break,
            frame = ws_rx.next() => frame,
        };

        let msg = match frame {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                info!(error = %e, "transport error");
                break;
            }
            None => break,
        };
        connection.mark_alive();

        let decoded = match msg {
            Message::Text(text) => ClientEvent::decode(text.as_str()),
            Message::Binary(data) => ClientEvent::decode_bytes(&data),
            Message::Close(_) => {
                info!("client sent close frame");
                break;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        let event = match decoded {
            Ok(event) => event,
            Err(e) => {
                warn!(kind = e.error_kind(), error = %e, "ignoring malformed frame");
                continue;
            }
        };

        let result = match event {
            ClientEvent::Setup(payload) => hub.setup(connection_id.clone(), payload).await.map(|outcome| {
                if let Some(user) = outcome.identity() {
                    tracing::Span::current().record("user_id", user.as_str());
                }
            }),
            ClientEvent::GetOnlineUsers => hub.request_online(connection_id.clone()).await.map(|_| ()),
        };
        if result.is_err() {
            warn!("presence hub unavailable, closing");
            break;
        }
    }

    // Peer-side endings stop the write task without a close frame of
    // our own; evicted or shut-down sessions already have one in flight.
    if !connection.is_terminated() {
        outbound.abort();
    }
    if !outbound.is_finished() && tokio::time::timeout(CLOSE_GRACE, &mut outbound).await.is_err() {
        outbound.abort();
    }

    let was_bound = hub.detach(connection_id.clone()).await.unwrap_or(false);
    info!(
        was_bound,
        dropped = connection.drop_count(),
        duration_secs = connection.connected_at.elapsed().as_secs(),
        "client disconnected"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_server_defaults() {
        let cfg = SessionConfig::default();
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(cfg.heartbeat_timeout, Duration::from_secs(90));
        assert_eq!(cfg.max_send_queue, 256);
    }

    #[test]
    fn superseded_close_code_is_application_range() {
        assert!((4000..5000).contains(&CLOSE_SUPERSEDED));
    }
}
