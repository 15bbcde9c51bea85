//! Merges the conversation snapshot with pushed messages for the selected
//! peer, and tracks the single in-flight send.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use parley_core::ids::UserId;
use parley_core::messages::{Message, MessageDraft};

use crate::api::ChatApi;
use crate::error::ClientError;
use crate::push::{ConnectionState, PushFeed, PushSession, Subscription};
use crate::view::ConversationView;

/// Pushes held back while a snapshot loads. Older ones are dropped past
/// this; the snapshot covers anything persisted before it was read.
const MAX_HELD: usize = 256;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReconcilerState {
    Idle,
    /// Snapshot fetch outstanding; pushes are held back until it lands.
    Loading { peer: UserId },
    Ready { peer: UserId },
    /// The push transport ended. The view is empty until
    /// [`Reconciler::resync`] reloads it on a live session.
    Offline { peer: UserId },
}

impl ReconcilerState {
    pub fn peer(&self) -> Option<&UserId> {
        match self {
            Self::Idle => None,
            Self::Loading { peer } | Self::Ready { peer } | Self::Offline { peer } => Some(peer),
        }
    }
}

/// Ticket for a snapshot fetch started by [`Reconciler::select`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotRequest {
    pub peer: UserId,
    generation: u64,
}

/// Ticket for a send started by [`Reconciler::begin_send`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SendRequest {
    pub peer: UserId,
    pub draft: MessageDraft,
    generation: u64,
}

fn is_down(state: ConnectionState) -> bool {
    matches!(
        state,
        ConnectionState::Reconnecting { .. } | ConnectionState::Disconnected
    )
}

/// Client-side view of one conversation.
///
/// The push subscription is opened when a peer is selected, before the
/// snapshot is requested, so a message pushed while the snapshot is in
/// flight is held back and merged once it lands. The view deduplicates by
/// id, so a message present in both shows once.
///
/// The reconciler follows the push session's connection state. When the
/// transport ends, pushes may have been missed, so the view is cleared and
/// the state goes `Offline`; [`Reconciler::resync`] fetches a fresh
/// snapshot once the session is connected again.
///
/// [`Reconciler::open`] and [`Reconciler::send`] hold `&mut self` across
/// the request. Callers that switch peers while a request is outstanding
/// use the ticket API and run the request themselves; stale tickets are
/// discarded.
pub struct Reconciler<A: ChatApi + ?Sized> {
    api: Arc<A>,
    feed: PushFeed,
    connection: watch::Receiver<ConnectionState>,
    /// Whether the last observed connection state was `Connected`.
    connected: bool,
    state: ReconcilerState,
    view: ConversationView,
    subscription: Option<Subscription>,
    /// Pushes taken off the subscription while loading.
    held: Vec<Message>,
    generation: u64,
    is_sending: bool,
}

impl<A: ChatApi + ?Sized> Reconciler<A> {
    pub fn new(api: Arc<A>, feed: PushFeed, mut connection: watch::Receiver<ConnectionState>) -> Self {
        let connected = *connection.borrow_and_update() == ConnectionState::Connected;
        Self {
            api,
            feed,
            connection,
            connected,
            state: ReconcilerState::Idle,
            view: ConversationView::new(),
            subscription: None,
            held: Vec::new(),
            generation: 0,
            is_sending: false,
        }
    }

    /// Reconciler fed by `session`'s pushes and connection state.
    pub fn for_session(api: Arc<A>, session: &PushSession) -> Self {
        Self::new(api, session.feed(), session.state())
    }

    /// Switch to `peer`. Drops the previous conversation's subscription and
    /// contents, subscribes to the new peer, and enters `Loading` (or
    /// `Offline` if the transport is down).
    pub fn select(&mut self, peer: UserId) -> SnapshotRequest {
        self.observe_connection();
        self.reset();
        let down = is_down(*self.connection.borrow()) || self.connection.has_changed().is_err();
        self.state = if down {
            ReconcilerState::Offline { peer: peer.clone() }
        } else {
            self.subscription = Some(self.feed.subscribe(peer.clone()));
            ReconcilerState::Loading { peer: peer.clone() }
        };
        debug!(peer = %peer, generation = self.generation, "conversation selected");
        SnapshotRequest {
            peer,
            generation: self.generation,
        }
    }

    /// Leave the current conversation.
    pub fn deselect(&mut self) {
        self.reset();
        self.state = ReconcilerState::Idle;
    }

    /// Drop the view, the subscription, and any outstanding tickets.
    fn reset(&mut self) {
        self.generation += 1;
        self.subscription = None;
        self.view.clear();
        self.held.clear();
        self.is_sending = false;
    }

    /// Pick up connection changes since the last look. An outage since
    /// then (even one already recovered from) takes a selected
    /// conversation `Offline`.
    fn observe_connection(&mut self) {
        // A closed channel means the session is gone for good.
        let closed = match self.connection.has_changed() {
            Ok(false) => return,
            Ok(true) => false,
            Err(_) => true,
        };
        let now = *self.connection.borrow_and_update();
        let was_connected = std::mem::replace(
            &mut self.connected,
            now == ConnectionState::Connected && !closed,
        );
        if !(was_connected || closed || is_down(now)) {
            return;
        }
        let peer = match &self.state {
            ReconcilerState::Loading { peer } | ReconcilerState::Ready { peer } => peer.clone(),
            _ => return,
        };
        info!(peer = %peer, connection = ?now, "push transport interrupted, clearing conversation");
        self.reset();
        self.state = ReconcilerState::Offline { peer };
    }

    /// Apply a fetched snapshot. Returns `Ok(false)` if the ticket is for a
    /// conversation that is no longer loading. On fetch failure the state
    /// stays `Loading`, held pushes are dropped, and the error is returned.
    pub fn apply_snapshot(
        &mut self,
        request: &SnapshotRequest,
        result: Result<Vec<Message>, ClientError>,
    ) -> Result<bool, ClientError> {
        self.observe_connection();
        if request.generation != self.generation || !self.is_loading() {
            debug!(peer = %request.peer, "discarding stale snapshot");
            return Ok(false);
        }
        let snapshot = match result {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.held.clear();
                return Err(e);
            }
        };
        self.view.replace(snapshot);
        for message in std::mem::take(&mut self.held) {
            self.view.insert(message);
        }
        self.state = ReconcilerState::Ready {
            peer: request.peer.clone(),
        };
        self.drain_pushes();
        debug!(peer = %request.peer, messages = self.view.len(), "conversation ready");
        Ok(true)
    }

    async fn load(&mut self, request: SnapshotRequest) -> Result<bool, ClientError> {
        let api = Arc::clone(&self.api);
        let result = api.fetch_conversation(&request.peer).await;
        self.apply_snapshot(&request, result)
    }

    /// Select `peer` and load its snapshot.
    pub async fn open(&mut self, peer: UserId) -> Result<(), ClientError> {
        let request = self.select(peer);
        if !self.is_loading() {
            return Err(ClientError::Transport("push session not connected".into()));
        }
        self.load(request).await.map(|_| ())
    }

    /// Reload an `Offline` conversation if the session is connected again.
    /// Returns whether a fresh snapshot was applied.
    pub async fn resync(&mut self) -> Result<bool, ClientError> {
        self.observe_connection();
        let ReconcilerState::Offline { peer } = &self.state else {
            return Ok(false);
        };
        if !self.connected {
            return Ok(false);
        }
        let peer = peer.clone();
        let request = self.select(peer);
        self.load(request).await
    }

    /// Merge every buffered push into the view. Returns how many were new.
    /// While loading, pushes stay buffered.
    pub fn drain_pushes(&mut self) -> usize {
        self.observe_connection();
        if !matches!(self.state, ReconcilerState::Ready { .. }) {
            return 0;
        }
        let Some(sub) = self.subscription.as_mut() else {
            return 0;
        };
        let mut added = 0;
        while let Some(message) = sub.try_next() {
            if self.view.insert(message) {
                added += 1;
            }
        }
        added
    }

    /// Wait for the next push for the selected peer and merge it. Returns
    /// whether the view grew. Fails once the transport ends.
    pub async fn wait_for_push(&mut self) -> Result<bool, ClientError> {
        enum Woke {
            Push(Option<Message>),
            Connection,
        }

        loop {
            self.observe_connection();
            if matches!(self.state, ReconcilerState::Offline { .. }) {
                return Err(ClientError::Transport("push transport interrupted".into()));
            }
            let Some(sub) = self.subscription.as_mut() else {
                return Err(ClientError::NoPeerSelected);
            };
            let woke = tokio::select! {
                message = sub.next() => Woke::Push(message),
                _ = self.connection.changed() => Woke::Connection,
            };
            let message = match woke {
                Woke::Connection => continue,
                Woke::Push(Some(message)) => message,
                Woke::Push(None) => return Err(ClientError::Transport("push feed closed".into())),
            };
            return match self.state {
                ReconcilerState::Ready { .. } => Ok(self.view.insert(message)),
                _ => {
                    self.hold(message);
                    Ok(false)
                }
            };
        }
    }

    fn hold(&mut self, message: Message) {
        if self.held.len() >= MAX_HELD {
            warn!(limit = MAX_HELD, "too many pushes held while loading, dropping oldest");
            self.held.remove(0);
        }
        self.held.push(message);
    }

    /// Start a send to the selected peer. At most one send is in flight.
    pub fn begin_send(&mut self, draft: MessageDraft) -> Result<SendRequest, ClientError> {
        self.observe_connection();
        let peer = self.state.peer().cloned().ok_or(ClientError::NoPeerSelected)?;
        if self.is_sending {
            return Err(ClientError::Busy);
        }
        self.is_sending = true;
        Ok(SendRequest {
            peer,
            draft,
            generation: self.generation,
        })
    }

    /// Finish a send. The stored message is appended only if its
    /// conversation is still selected; a failed send leaves the view as is.
    pub fn complete_send(
        &mut self,
        request: &SendRequest,
        result: Result<Message, ClientError>,
    ) -> Result<Option<Message>, ClientError> {
        if request.generation != self.generation {
            debug!(peer = %request.peer, "send finished after conversation changed");
            return result.map(|_| None);
        }
        self.is_sending = false;
        let message = result.inspect_err(|e| warn!(peer = %request.peer, error = %e, "send failed"))?;
        match self.state {
            ReconcilerState::Ready { .. } => {
                self.view.insert(message.clone());
            }
            ReconcilerState::Loading { .. } => self.hold(message.clone()),
            // Offline views are rebuilt from a snapshot that includes it.
            _ => {}
        }
        Ok(Some(message))
    }

    /// Send `draft` to the selected peer and append the stored message.
    pub async fn send(&mut self, draft: MessageDraft) -> Result<Message, ClientError> {
        let request = self.begin_send(draft)?;
        let api = Arc::clone(&self.api);
        let result = api.send_message(&request.peer, &request.draft).await;
        self.complete_send(&request, result)?
            .ok_or_else(|| ClientError::Transport("conversation changed during send".into()))
    }

    pub fn state(&self) -> &ReconcilerState {
        &self.state
    }

    pub fn view(&self) -> &ConversationView {
        &self.view
    }

    pub fn peer(&self) -> Option<&UserId> {
        self.state.peer()
    }

    pub fn is_sending(&self) -> bool {
        self.is_sending
    }

    pub fn is_loading(&self) -> bool {
        matches!(self.state, ReconcilerState::Loading { .. })
    }
}
