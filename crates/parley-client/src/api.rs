//! Request/response side of the client: profiles, snapshots, sending.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use parley_core::ids::UserId;
use parley_core::messages::{Message, MessageDraft};

use crate::error::ClientError;

/// Header carrying the caller's identity.
pub const USER_HEADER: &str = "x-user-id";

/// Another party as listed by the server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: UserId,
    pub full_name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub profile_pic: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope<T> {
    data: Option<T>,
    #[serde(default)]
    message: String,
}

/// Request/response operations the reconciler depends on.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Everyone except the caller.
    async fn list_users(&self) -> Result<Vec<Contact>, ClientError>;
    /// Both directions of the conversation with `peer`, oldest first.
    async fn fetch_conversation(&self, peer: &UserId) -> Result<Vec<Message>, ClientError>;
    /// Persist a message to `peer`. Returns the stored message.
    async fn send_message(&self, peer: &UserId, draft: &MessageDraft) -> Result<Message, ClientError>;
}

/// [`ChatApi`] over the server's REST surface.
#[derive(Clone)]
pub struct HttpChatApi {
    http: reqwest::Client,
    base_url: String,
    user: UserId,
}

impl HttpChatApi {
    pub fn new(base_url: impl Into<String>, user: UserId) -> Self {
        Self::with_client(reqwest::Client::new(), base_url, user)
    }

    pub fn with_client(http: reqwest::Client, base_url: impl Into<String>, user: UserId) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            user,
        }
    }

    pub fn user(&self) -> &UserId {
        &self.user
    }

    /// Register a profile. Needs no identity.
    pub async fn register(
        http: &reqwest::Client,
        base_url: &str,
        full_name: &str,
        email: &str,
    ) -> Result<Contact, ClientError> {
        let url = format!("{}/api/v1/users", base_url.trim_end_matches('/'));
        let resp = http
            .post(url)
            .json(&serde_json::json!({ "fullName": full_name, "email": email }))
            .send()
            .await?;
        decode(resp).await
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1{path}", self.base_url)
    }
}

async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, ClientError> {
    let status = resp.status();
    let bytes = resp.bytes().await?;
    let envelope: Envelope<T> = match serde_json::from_slice(&bytes) {
        Ok(env) => env,
        Err(_) if !status.is_success() => {
            return Err(ClientError::Api {
                status: status.as_u16(),
                message: String::from_utf8_lossy(&bytes).into_owned(),
            })
        }
        Err(e) => return Err(e.into()),
    };

    if !status.is_success() {
        return Err(ClientError::Api {
            status: status.as_u16(),
            message: envelope.message,
        });
    }
    envelope.data.ok_or_else(|| ClientError::Api {
        status: StatusCode::OK.as_u16(),
        message: "response missing data".into(),
    })
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn list_users(&self) -> Result<Vec<Contact>, ClientError> {
        let resp = self
            .http
            .get(self.url("/messages/users"))
            .header(USER_HEADER, self.user.as_str())
            .send()
            .await?;
        decode(resp).await
    }

    async fn fetch_conversation(&self, peer: &UserId) -> Result<Vec<Message>, ClientError> {
        debug!(user_id = %self.user, peer = %peer, "fetching conversation");
        let resp = self
            .http
            .get(self.url(&format!("/messages/{peer}")))
            .header(USER_HEADER, self.user.as_str())
            .send()
            .await?;
        decode(resp).await
    }

    async fn send_message(&self, peer: &UserId, draft: &MessageDraft) -> Result<Message, ClientError> {
        let resp = self
            .http
            .post(self.url(&format!("/messages/send/{peer}")))
            .header(USER_HEADER, self.user.as_str())
            .json(draft)
            .send()
            .await?;
        decode(resp).await
    }
}
