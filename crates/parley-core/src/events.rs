//! Push-channel wire events.
//!
//! Every frame is a JSON object `{"event": <name>, "data": <payload>}`.

use serde::{Deserialize, Serialize};

use crate::errors::ProtocolError;
use crate::ids::UserId;
use crate::messages::Message;
use crate::presence::OnlineSet;

pub const SETUP: &str = "setup";
pub const GET_ONLINE_USERS: &str = "getOnlineUsers";
pub const NEW_MESSAGE: &str = "newMessage";

/// Events a client sends to the server.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    /// Bootstrap: bind this session to an identity. The payload is kept
    /// raw so malformed identities can be rejected without failing the
    /// whole frame.
    #[serde(rename = "setup")]
    Setup(serde_json::Value),
    #[serde(rename = "getOnlineUsers")]
    GetOnlineUsers,
}

#[derive(Deserialize)]
struct RawFrame {
    event: String,
    #[serde(default)]
    data: serde_json::Value,
}

impl ClientEvent {
    pub fn setup(user: &UserId) -> Self {
        Self::Setup(serde_json::Value::String(user.as_str().to_owned()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let frame: RawFrame =
            serde_json::from_str(text).map_err(|e| ProtocolError::MalformedFrame(e.to_string()))?;
        match frame.event.as_str() {
            SETUP => Ok(Self::Setup(frame.data)),
            GET_ONLINE_USERS => Ok(Self::GetOnlineUsers),
            other => Err(ProtocolError::MalformedFrame(format!("unknown event: {other}"))),
        }
    }

    pub fn decode_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(bytes).map_err(|_| ProtocolError::NotUtf8)?;
        Self::decode(text)
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Setup(_) => SETUP,
            Self::GetOnlineUsers => GET_ONLINE_USERS,
        }
    }
}

/// Events the server pushes to a client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    /// Full replacement of the receiver's online-set view.
    #[serde(rename = "getOnlineUsers")]
    OnlineUsers(OnlineSet),
    #[serde(rename = "newMessage")]
    NewMessage(Message),
}

impl ServerEvent {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::MalformedFrame(e.to_string()))
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            Self::OnlineUsers(_) => GET_ONLINE_USERS,
            Self::NewMessage(_) => NEW_MESSAGE,
        }
    }
}
