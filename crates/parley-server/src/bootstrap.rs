//! Session bootstrap: validating the `setup` payload and describing what a
//! setup did to the session.

use serde_json::Value;

use parley_core::errors::ProtocolError;
use parley_core::ids::{ConnectionId, UserId};

/// Interpret a `setup` payload as an identity.
///
/// Only a non-blank JSON string is accepted.
pub fn parse_setup(payload: &Value) -> Result<UserId, ProtocolError> {
    match payload {
        Value::String(s) => UserId::parse(s),
        other => Err(ProtocolError::IdentityNotString(json_kind(other))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Outcome of a `setup` on one connection.
///
/// `Unbound --setup(id)--> Bound(id)`; a second setup on a bound
/// connection is an implicit unbind-then-bind.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SetupOutcome {
    /// Unbound connection is now bound.
    Bound {
        user: UserId,
        evicted: Option<ConnectionId>,
    },
    /// Bound connection switched identity.
    Rebound {
        from: UserId,
        to: UserId,
        evicted: Option<ConnectionId>,
    },
    /// Already bound to this identity; nothing changed.
    Unchanged(UserId),
    /// Payload rejected; the connection keeps whatever binding it had.
    Rejected(ProtocolError),
    /// The connection is no longer open (evicted or closing).
    Closed,
}

impl SetupOutcome {
    pub fn evicted(&self) -> Option<&ConnectionId> {
        match self {
            Self::Bound { evicted, .. } | Self::Rebound { evicted, .. } => evicted.as_ref(),
            _ => None,
        }
    }

    pub fn is_bound(&self) -> bool {
        self.identity().is_some()
    }

    /// Identity the connection is bound to after this setup, if known.
    pub fn identity(&self) -> Option<&UserId> {
        match self {
            Self::Bound { user, .. } | Self::Unchanged(user) => Some(user),
            Self::Rebound { to, .. } => Some(to),
            Self::Rejected(_) | Self::Closed => None,
        }
    }
}
