//! Push side of the client: one WebSocket session with bounded
//! reconnection, the online set, and a fan-out feed of new messages.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use parley_core::events::{ClientEvent, ServerEvent};
use parley_core::ids::UserId;
use parley_core::messages::Message;
use parley_core::presence::OnlineSet;

use crate::backoff::ReconnectPolicy;
use crate::error::ClientError;

/// Close code the server uses when a newer session for the same identity
/// takes over. Reconnecting would evict that newer session in turn.
const CLOSE_SUPERSEDED: u16 = 4000;

const FEED_CAPACITY: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    /// Transport dropped; waiting to retry. `attempt` is 1-based.
    Reconnecting { attempt: u32 },
    /// Closed for good: retries exhausted, superseded, or closed locally.
    Disconnected,
}

/// Cloneable fan-out of pushed `newMessage` events.
#[derive(Clone)]
pub struct PushFeed {
    tx: broadcast::Sender<Message>,
}

impl Default for PushFeed {
    fn default() -> Self {
        Self::new(FEED_CAPACITY)
    }
}

impl PushFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Deliver a pushed message to every live subscription.
    pub fn publish(&self, message: Message) -> usize {
        self.tx.send(message).unwrap_or(0)
    }

    /// Subscribe to messages exchanged with `peer`. Messages published
    /// before this call are not seen.
    pub fn subscribe(&self, peer: UserId) -> Subscription {
        Subscription {
            peer,
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Pushed messages filtered to one peer. Dropping it unsubscribes.
pub struct Subscription {
    peer: UserId,
    rx: broadcast::Receiver<Message>,
}

impl Subscription {
    pub fn peer(&self) -> &UserId {
        &self.peer
    }

    /// Next buffered message for this peer, without waiting.
    pub fn try_next(&mut self) -> Option<Message> {
        loop {
            match self.rx.try_recv() {
                Ok(msg) if msg.involves(&self.peer) => return Some(msg),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(peer = %self.peer, skipped, "push subscription lagged");
                }
                Err(_) => return None,
            }
        }
    }

    /// Wait for the next message for this peer. `None` once the feed is
    /// gone.
    pub async fn next(&mut self) -> Option<Message> {
        loop {
            match self.rx.recv().await {
                Ok(msg) if msg.involves(&self.peer) => return Some(msg),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(peer = %self.peer, skipped, "push subscription lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

enum Command {
    RequestOnline,
}

/// How one connected transport ended.
#[derive(Debug, PartialEq, Eq)]
enum SessionEnd {
    Dropped,
    Superseded,
    Closed,
}

/// A live push session bound to one identity.
///
/// Every (re)connection runs the bootstrap (`setup`) and requests the
/// online set. The transport handle is owned by a background task; this
/// value is passed explicitly to whoever needs it.
pub struct PushSession {
    user: UserId,
    online: watch::Receiver<OnlineSet>,
    state: watch::Receiver<ConnectionState>,
    feed: PushFeed,
    commands: mpsc::Sender<Command>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl PushSession {
    /// Start connecting to `ws_url` as `user`. Returns immediately; watch
    /// [`PushSession::state`] for progress.
    pub fn connect(ws_url: impl Into<String>, user: UserId, policy: ReconnectPolicy) -> Self {
        let (online_tx, online) = watch::channel(OnlineSet::new());
        let (state_tx, state) = watch::channel(ConnectionState::Connecting);
        let (commands, command_rx) = mpsc::channel(16);
        let feed = PushFeed::default();
        let shutdown = CancellationToken::new();

        let worker = Worker {
            url: ws_url.into(),
            user: user.clone(),
            policy,
            online: online_tx,
            state: state_tx,
            feed: feed.clone(),
            commands: command_rx,
            shutdown: shutdown.clone(),
        };
        let task = tokio::spawn(worker.run());

        Self {
            user,
            online,
            state,
            feed,
            commands,
            shutdown,
            task,
        }
    }

    pub fn user(&self) -> &UserId {
        &self.user
    }

    /// Online identities other than this session's own.
    pub fn online(&self) -> watch::Receiver<OnlineSet> {
        self.online.clone()
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn feed(&self) -> PushFeed {
        self.feed.clone()
    }

    /// Ask the server for the current online set.
    pub async fn request_online(&self) -> Result<(), ClientError> {
        self.commands
            .send(Command::RequestOnline)
            .await
            .map_err(|_| ClientError::Transport("push session closed".into()))
    }

    /// Wait until the session reaches `Connected` (or `Disconnected`).
    pub async fn wait_connected(&self, limit: Duration) -> Result<(), ClientError> {
        let mut state = self.state();
        let reached = tokio::time::timeout(
            limit,
            state.wait_for(|s| matches!(s, ConnectionState::Connected | ConnectionState::Disconnected)),
        )
        .await
        .map_err(|_| ClientError::Transport("timed out connecting".into()))?
        .map(|s| *s)
        .map_err(|_| ClientError::Transport("push session closed".into()))?;

        match reached {
            ConnectionState::Connected => Ok(()),
            _ => Err(ClientError::Transport("push session disconnected".into())),
        }
    }

    /// Close the transport and stop reconnecting.
    pub async fn close(self) {
        self.shutdown.cancel();
        let _ = self.task.await;
    }
}

struct Worker {
    url: String,
    user: UserId,
    policy: ReconnectPolicy,
    online: watch::Sender<OnlineSet>,
    state: watch::Sender<ConnectionState>,
    feed: PushFeed,
    commands: mpsc::Receiver<Command>,
    shutdown: CancellationToken,
}

impl Worker {
    #[instrument(skip_all, fields(user_id = %self.user))]
    async fn run(mut self) {
        let mut attempt = 0u32;

        loop {
            let connected = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                result = connect_async(self.url.as_str()) => result,
            };

            match connected {
                Ok((ws, _)) => {
                    attempt = 0;
                    self.state.send_replace(ConnectionState::Connected);
                    info!("push session connected");
                    match self.drive(ws).await {
                        SessionEnd::Closed => break,
                        SessionEnd::Superseded => {
                            info!("push session superseded by a newer login");
                            break;
                        }
                        SessionEnd::Dropped => warn!("push transport dropped"),
                    }
                }
                Err(e) => warn!(error = %e, attempt, "push connect failed"),
            }

            // The online set is stale until the next bootstrap completes.
            self.online.send_replace(OnlineSet::new());

            attempt += 1;
            if !self.policy.allows(attempt) {
                warn!(max_attempts = self.policy.max_attempts, "giving up reconnecting");
                break;
            }
            self.state.send_replace(ConnectionState::Reconnecting { attempt });
            let delay = self.policy.delay_for(attempt);
            debug!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting");
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.online.send_replace(OnlineSet::new());
        self.state.send_replace(ConnectionState::Disconnected);
    }

    async fn drive<S>(&mut self, ws: tokio_tungstenite::WebSocketStream<S>) -> SessionEnd
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let (mut tx, mut rx) = ws.split();

        let bootstrap = [
            ClientEvent::setup(&self.user).encode(),
            ClientEvent::GetOnlineUsers.encode(),
        ];
        for frame in bootstrap {
            if tx.send(WsMessage::text(frame)).await.is_err() {
                return SessionEnd::Dropped;
            }
        }

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    let _ = tx.send(WsMessage::Close(None)).await;
                    return SessionEnd::Closed;
                }
                cmd = self.commands.recv() => match cmd {
                    Some(Command::RequestOnline) => {
                        if tx.send(WsMessage::text(ClientEvent::GetOnlineUsers.encode())).await.is_err() {
                            return SessionEnd::Dropped;
                        }
                    }
                    // Every PushSession handle is gone.
                    None => {
                        let _ = tx.send(WsMessage::Close(None)).await;
                        return SessionEnd::Closed;
                    }
                },
                frame = rx.next() => {
                    let msg = match frame {
                        Some(Ok(msg)) => msg,
                        Some(Err(e)) => {
                            debug!(error = %e, "push transport error");
                            return SessionEnd::Dropped;
                        }
                        None => return SessionEnd::Dropped,
                    };
                    let decoded = match msg {
                        WsMessage::Text(text) => ServerEvent::decode(text.as_str()),
                        WsMessage::Binary(data) => match std::str::from_utf8(&data) {
                            Ok(text) => ServerEvent::decode(text),
                            Err(_) => continue,
                        },
                        WsMessage::Close(frame) => {
                            let code = frame.map(|f| u16::from(f.code));
                            debug!(?code, "server closed push session");
                            return if code == Some(CLOSE_SUPERSEDED) {
                                SessionEnd::Superseded
                            } else {
                                SessionEnd::Dropped
                            };
                        }
                        _ => continue,
                    };
                    match decoded {
                        Ok(ServerEvent::OnlineUsers(set)) => {
                            self.online.send_replace(set.without(&self.user));
                        }
                        Ok(ServerEvent::NewMessage(message)) => {
                            debug!(message_id = %message.id, "message pushed");
                            self.feed.publish(message);
                        }
                        Err(e) => warn!(error = %e, "ignoring malformed server frame"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::ids::MessageId;

    fn msg(id: &str, from: &str, to: &str) -> Message {
        Message {
            id: MessageId::from_raw(id),
            sender_id: UserId::from_raw(from),
            receiver_id: UserId::from_raw(to),
            text: Some("hi".into()),
            image: None,
            created_at: "2026-04-01T12:00:00Z".parse().unwrap(),
        }
    }

    #[test]
    fn subscription_filters_by_peer() {
        let feed = PushFeed::default();
        let mut sub = feed.subscribe(UserId::from_raw("bob"));

        feed.publish(msg("m1", "carol", "me"));
        feed.publish(msg("m2", "bob", "me"));
        feed.publish(msg("m3", "me", "bob"));

        assert_eq!(sub.try_next().unwrap().id.as_str(), "m2");
        assert_eq!(sub.try_next().unwrap().id.as_str(), "m3");
        assert!(sub.try_next().is_none());
    }

    #[test]
    fn subscription_sees_only_later_messages() {
        let feed = PushFeed::default();
        feed.publish(msg("early", "bob", "me"));
        let mut sub = feed.subscribe(UserId::from_raw("bob"));
        assert!(sub.try_next().is_none());
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let feed = PushFeed::default();
        let sub = feed.subscribe(UserId::from_raw("bob"));
        assert_eq!(feed.subscriber_count(), 1);
        drop(sub);
        assert_eq!(feed.subscriber_count(), 0);
        assert_eq!(feed.publish(msg("m1", "bob", "me")), 0);
    }

    #[test]
    fn lagged_subscription_recovers() {
        let feed = PushFeed::new(2);
        let mut sub = feed.subscribe(UserId::from_raw("bob"));
        for i in 0..5 {
            feed.publish(msg(&format!("m{i}"), "bob", "me"));
        }
        assert_eq!(sub.try_next().unwrap().id.as_str(), "m3");
        assert_eq!(sub.try_next().unwrap().id.as_str(), "m4");
    }

    #[tokio::test]
    async fn next_waits_for_matching_message() {
        let feed = PushFeed::default();
        let mut sub = feed.subscribe(UserId::from_raw("bob"));
        let publisher = feed.clone();
        tokio::spawn(async move {
            publisher.publish(msg("other", "carol", "me"));
            publisher.publish(msg("mine", "bob", "me"));
        });
        assert_eq!(sub.next().await.unwrap().id.as_str(), "mine");
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_server_gives_up_after_max_attempts() {
        let policy = ReconnectPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(20),
            jitter_factor: 0.0,
        };
        // Port 1 on localhost refuses connections.
        let session = PushSession::connect("ws://127.0.0.1:1/ws", UserId::from_raw("me"), policy);
        let mut state = session.state();
        let mut seen = Vec::new();
        loop {
            let current = *state.borrow_and_update();
            if seen.last() != Some(&current) {
                seen.push(current);
            }
            if current == ConnectionState::Disconnected {
                break;
            }
            if state.changed().await.is_err() {
                break;
            }
        }
        assert_eq!(seen.last(), Some(&ConnectionState::Disconnected));
        assert!(!seen.contains(&ConnectionState::Connected));
        assert!(session.wait_connected(Duration::from_secs(1)).await.is_err());
        session.close().await;
    }
}
