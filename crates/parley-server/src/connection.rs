//! Per-transport connection state.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::warn;

use parley_core::events::ServerEvent;
use parley_core::ids::ConnectionId;

/// One accepted WebSocket transport.
pub struct ClientConnection {
    pub id: ConnectionId,
    /// Send channel to the connection's WebSocket write task.
    tx: mpsc::Sender<Arc<String>>,
    /// Cancelled to force the transport closed (eviction or shutdown).
    terminate: CancellationToken,
    pub connected_at: Instant,
    is_alive: AtomicBool,
    last_seen: Mutex<Instant>,
    dropped_messages: AtomicU64,
}

impl ClientConnection {
    pub fn new(id: ConnectionId, tx: mpsc::Sender<Arc<String>>, terminate: CancellationToken) -> Self {
        let now = Instant::now();
        Self {
            id,
            tx,
            terminate,
            connected_at: now,
            is_alive: AtomicBool::new(true),
            last_seen: Mutex::new(now),
            dropped_messages: AtomicU64::new(0),
        }
    }

    /// Queue a frame for the write task.
    ///
    /// Never blocks: returns `false` if the queue is full or closed and
    /// counts the drop.
    pub fn send(&self, frame: Arc<String>) -> bool {
        if self.tx.try_send(frame).is_ok() {
            true
        } else {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    pub fn send_event(&self, event: &ServerEvent) -> bool {
        match event.encode() {
            Ok(json) => self.send(Arc::new(json)),
            Err(e) => {
                warn!(connection_id = %self.id, event = event.event_name(), error = %e, "failed to encode event");
                false
            }
        }
    }

    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Record inbound activity (pong or any frame).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_seen.lock() = Instant::now();
    }

    pub fn last_seen_elapsed(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    /// Check and reset the alive flag for heartbeat.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Force the transport closed. Idempotent.
    pub fn terminate(&self) {
        self.terminate.cancel();
    }

    pub fn is_terminated(&self) -> bool {
        self.terminate.is_cancelled()
    }

    pub fn terminated(&self) -> WaitForCancellationFuture<'_> {
        self.terminate.cancelled()
    }
}
