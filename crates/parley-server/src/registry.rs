//! Connection registry: the authoritative identity ↔ connection relation.
//!
//! The registry owns both directions of the binding relation and exposes
//! only point operations. It performs no I/O; callers (the presence hub)
//! act on the returned outcomes.

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::debug;

use parley_core::ids::{ConnectionId, UserId};
use parley_core::presence::OnlineSet;

/// Result of a [`ConnectionRegistry::bind`] call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BindOutcome {
    /// A different connection that was bound to the same identity and has
    /// been unbound. The caller must terminate it.
    pub evicted: Option<ConnectionId>,
    /// The identity this connection was bound to before, if it re-bootstrapped
    /// as someone else.
    pub replaced: Option<UserId>,
    /// Updated online set, or `None` when the relation did not change.
    pub online: Option<OnlineSet>,
}

impl BindOutcome {
    pub fn changed(&self) -> bool {
        self.online.is_some()
    }
}

#[derive(Default)]
struct Bindings {
    by_user: HashMap<UserId, ConnectionId>,
    by_connection: HashMap<ConnectionId, UserId>,
}

impl Bindings {
    fn online(&self) -> OnlineSet {
        self.by_user.keys().cloned().collect()
    }
}

/// At most one connection per identity, at most one identity per connection.
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: RwLock<Bindings>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `user` to `connection`. Newest connection wins.
    ///
    /// Any other connection bound to `user` is unbound first and reported in
    /// [`BindOutcome::evicted`]. If `connection` was already bound to a
    /// different identity, that binding is dropped as well.
    pub fn bind(&self, user: UserId, connection: ConnectionId) -> BindOutcome {
        let mut inner = self.inner.write();

        if inner.by_connection.get(&connection) == Some(&user) {
            return BindOutcome {
                evicted: None,
                replaced: None,
                online: None,
            };
        }

        let replaced = inner.by_connection.remove(&connection);
        if let Some(previous) = &replaced {
            inner.by_user.remove(previous);
        }

        let evicted = inner.by_user.remove(&user);
        if let Some(old) = &evicted {
            inner.by_connection.remove(old);
        }

        inner.by_user.insert(user.clone(), connection.clone());
        inner.by_connection.insert(connection.clone(), user.clone());

        debug!(
            user_id = %user,
            connection_id = %connection,
            evicted = ?evicted,
            replaced = ?replaced,
            "identity bound"
        );

        BindOutcome {
            evicted,
            replaced,
            online: Some(inner.online()),
        }
    }

    /// Remove the binding held by `connection`.
    ///
    /// Returns `None` when nothing was bound, so late or duplicate
    /// disconnects produce no broadcast.
    pub fn unbind(&self, connection: &ConnectionId) -> Option<OnlineSet> {
        let mut inner = self.inner.write();
        let user = inner.by_connection.remove(connection)?;
        inner.by_user.remove(&user);
        debug!(user_id = %user, connection_id = %connection, "identity unbound");
        Some(inner.online())
    }

    pub fn lookup(&self, user: &UserId) -> Option<ConnectionId> {
        self.inner.read().by_user.get(user).cloned()
    }

    pub fn identity_of(&self, connection: &ConnectionId) -> Option<UserId> {
        self.inner.read().by_connection.get(connection).cloned()
    }

    pub fn snapshot(&self) -> OnlineSet {
        self.inner.read().online()
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_user.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
