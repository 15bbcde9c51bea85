//! REST surface: profiles, conversation snapshots, and message sending.
//!
//! Every response uses the `{statusCode, data, message, success}` envelope.

use std::sync::LazyLock;

use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequestParts, Path, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use regex::Regex;
use serde::Serialize;
use tracing::{info, warn};

use parley_core::ids::UserId;
use parley_core::messages::{Message, MessageDraft};
use parley_store::{NewUser, StoreError, UserProfile};

use crate::relay::RelayOutcome;
use crate::server::AppState;

/// Header carrying the caller's identity.
pub const USER_HEADER: &str = "x-user-id";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse<T> {
    pub status_code: u16,
    pub data: T,
    pub message: String,
    pub success: bool,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn new(status: StatusCode, data: T, message: impl Into<String>) -> Self {
        Self {
            status_code: status.as_u16(),
            data,
            message: message.into(),
            success: status.as_u16() < 400,
        }
    }

    pub fn ok(data: T) -> Self {
        Self::new(StatusCode::OK, data, "Success")
    }

    pub fn created(data: T, message: impl Into<String>) -> Self {
        Self::new(StatusCode::CREATED, data, message)
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status_code).unwrap_or(StatusCode::OK);
        (status, Json(self)).into_response()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(m) => Self::NotFound(m),
            StoreError::Conflict(m) => Self::Conflict(m),
            other => {
                warn!(error = %other, "storage failure");
                Self::Internal("Internal server error".into())
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        Self::BadRequest(e.body_text())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    status_code: u16,
    data: Option<()>,
    message: String,
    success: bool,
    errors: Vec<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            status_code: status.as_u16(),
            data: None,
            message: self.to_string(),
            success: false,
            errors: Vec::new(),
        };
        (status, Json(body)).into_response()
    }
}

/// The authenticated caller, resolved from [`USER_HEADER`].
#[derive(Clone, Debug)]
pub struct CurrentUser(pub UserProfile);

impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ApiError::Unauthorized("Unauthorized - no identity provided".into()))?;

        match state.store.get_user(&UserId::from_raw(raw)) {
            Ok(profile) => Ok(Self(profile)),
            Err(StoreError::NotFound(_)) => Err(ApiError::Unauthorized("Unauthorized - unknown identity".into())),
            Err(e) => Err(e.into()),
        }
    }
}

static EMAIL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("valid email regex"));

pub fn is_valid_email(email: &str) -> bool {
    EMAIL.is_match(email)
}

/// `POST /api/v1/users`
pub async fn create_user(
    State(state): State<AppState>,
    body: Result<Json<NewUser>, JsonRejection>,
) -> Result<ApiResponse<UserProfile>, ApiError> {
    let Json(mut new) = body?;
    new.full_name = new.full_name.trim().to_string();
    new.email = new.email.trim().to_string();

    if new.full_name.is_empty() || new.email.is_empty() {
        return Err(ApiError::BadRequest("All fields are required".into()));
    }
    if !is_valid_email(&new.email) {
        return Err(ApiError::BadRequest("Please provide a valid email address".into()));
    }

    let profile = state.store.create_user(&new)?;
    info!(user_id = %profile.id, "user created");
    Ok(ApiResponse::created(profile, "User created successfully"))
}

/// `GET /api/v1/messages/users`
pub async fn list_users(
    State(state): State<AppState>,
    CurrentUser(me): CurrentUser,
) -> Result<ApiResponse<Vec<UserProfile>>, ApiError> {
    let users = state.store.list_users_excluding(&me.id)?;
    Ok(ApiResponse::ok(users))
}

/// `GET /api/v1/messages/{id}`
pub async fn fetch_conversation(
    State(state): State<AppState>,
    CurrentUser(me): CurrentUser,
    Path(peer): Path<String>,
) -> Result<ApiResponse<Vec<Message>>, ApiError> {
    let messages = state.store.fetch_conversation(&me.id, &UserId::from_raw(peer))?;
    Ok(ApiResponse::ok(messages))
}

/// `POST /api/v1/messages/send/{id}`
///
/// Persist, then relay. A persistence failure returns before the relay
/// runs.
pub async fn send_message(
    State(state): State<AppState>,
    CurrentUser(me): CurrentUser,
    Path(peer): Path<String>,
    body: Result<Json<MessageDraft>, JsonRejection>,
) -> Result<ApiResponse<Message>, ApiError> {
    let Json(draft) = body?;
    let draft = draft
        .validate()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let receiver = state
        .store
        .get_user(&UserId::from_raw(peer))
        .map_err(|e| match e {
            StoreError::NotFound(_) => ApiError::NotFound("Receiver not found".into()),
            other => other.into(),
        })?
        .id;

    let message = state.store.create_message(&me.id, &receiver, &draft)?;

    let outcome = state.relay.relay(&message);
    info!(
        message_id = %message.id,
        user_id = %me.id,
        receiver_id = %receiver,
        pushed = outcome == RelayOutcome::Delivered,
        "message sent"
    );
    Ok(ApiResponse::created(message, "Message sent"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::Request;
    use parley_core::ids::ConnectionId;
    use parley_core::ServerEvent;
    use parley_store::{ChatStore, Database, SqliteChatStore};
    use serde_json::{json, Value};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    use crate::config::ServerConfig;
    use crate::connection::ClientConnection;
    use crate::server::build_router;

    fn sqlite_state() -> AppState {
        let store = SqliteChatStore::new(Database::in_memory().unwrap());
        AppState::new(Arc::new(store), &ServerConfig::default(), CancellationToken::new())
    }

    async fn call(state: &AppState, req: Request<Body>) -> (StatusCode, Value) {
        let router = build_router(state.clone(), &ServerConfig::default());
        let resp = router.oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn get(uri: &str, user: Option<&UserId>) -> Request<Body> {
        let mut builder = Request::get(uri);
        if let Some(u) = user {
            builder = builder.header(USER_HEADER, u.as_str());
        }
        builder.body(Body::empty()).unwrap()
    }

    fn post(uri: &str, user: Option<&UserId>, body: Value) -> Request<Body> {
        let mut builder = Request::post(uri).header("content-type", "application/json");
        if let Some(u) = user {
            builder = builder.header(USER_HEADER, u.as_str());
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn register(state: &AppState, name: &str) -> UserId {
        let (status, body) = call(
            state,
            post(
                "/api/v1/users",
                None,
                json!({"fullName": name, "email": format!("{}@example.com", name.to_lowercase())}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        UserId::from_raw(body["data"]["id"].as_str().unwrap())
    }

    /// Attach a bound connection for `user` and return its outbound queue.
    fn go_online(state: &AppState, user: &UserId) -> mpsc::Receiver<Arc<String>> {
        let (tx, rx) = mpsc::channel(8);
        let id = ConnectionId::new();
        state
            .broadcaster
            .add(Arc::new(ClientConnection::new(id.clone(), tx, CancellationToken::new())));
        state.registry.bind(user.clone(), id);
        rx
    }

    #[test]
    fn email_validation() {
        assert!(is_valid_email("ada@example.com"));
        assert!(is_valid_email("a.b+c@mail.example.org"));
        assert!(!is_valid_email("ada@example"));
        assert!(!is_valid_email("ada example@x.com"));
        assert!(!is_valid_email("@example.com"));
        assert!(!is_valid_email("ada@.com"));
        assert!(!is_valid_email("ada@example."));
        assert!(!is_valid_email("a@b@c.com"));
        assert!(!is_valid_email("ada@example.com\n"));
        assert!(is_valid_email("ada@.b.c"));
    }

    #[tokio::test]
    async fn create_user_envelope() {
        let state = sqlite_state();
        let (status, body) = call(
            &state,
            post("/api/v1/users", None, json!({"fullName": "Ada", "email": "ada@example.com"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["statusCode"], 201);
        assert_eq!(body["success"], true);
        assert_eq!(body["message"], "User created successfully");
        assert_eq!(body["data"]["fullName"], "Ada");
    }

    #[tokio::test]
    async fn create_user_validation_errors() {
        let state = sqlite_state();
        let (status, body) = call(
            &state,
            post("/api/v1/users", None, json!({"fullName": " ", "email": "ada@example.com"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert_eq!(body["errors"], json!([]));

        let (status, _) = call(
            &state,
            post("/api/v1/users", None, json!({"fullName": "Ada", "email": "nope"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&state, post("/api/v1/users", None, json!({"fullName": "Ada"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn duplicate_email_is_conflict() {
        let state = sqlite_state();
        register(&state, "Ada").await;
        let (status, body) = call(
            &state,
            post("/api/v1/users", None, json!({"fullName": "Other", "email": "ada@example.com"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["statusCode"], 409);
    }

    #[tokio::test]
    async fn identity_header_required() {
        let state = sqlite_state();
        let (status, body) = call(&state, get("/api/v1/messages/users", None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["success"], false);

        let ghost = UserId::from_raw("user_ghost");
        let (status, _) = call(&state, get("/api/v1/messages/users", Some(&ghost))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn list_users_excludes_caller() {
        let state = sqlite_state();
        let ada = register(&state, "Ada").await;
        let bob = register(&state, "Bob").await;

        let (status, body) = call(&state, get("/api/v1/messages/users", Some(&ada))).await;
        assert_eq!(status, StatusCode::OK);
        let users = body["data"].as_array().unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0]["id"], bob.as_str());
    }

    #[tokio::test]
    async fn send_persists_and_relays_to_online_receiver() {
        let state = sqlite_state();
        let ada = register(&state, "Ada").await;
        let bob = register(&state, "Bob").await;
        let mut bob_rx = go_online(&state, &bob);

        let (status, body) = call(
            &state,
            post(&format!("/api/v1/messages/send/{bob}"), Some(&ada), json!({"text": "hi"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let sent: Message = serde_json::from_value(body["data"].clone()).unwrap();
        assert_eq!(sent.text.as_deref(), Some("hi"));
        assert_eq!(sent.sender_id, ada);

        let frame = bob_rx.try_recv().unwrap();
        assert_eq!(ServerEvent::decode(&frame).unwrap(), ServerEvent::NewMessage(sent.clone()));

        let (_, body) = call(&state, get(&format!("/api/v1/messages/{ada}"), Some(&bob))).await;
        let convo: Vec<Message> = serde_json::from_value(body["data"].clone()).unwrap();
        assert_eq!(convo, vec![sent]);
    }

    #[tokio::test]
    async fn send_to_offline_receiver_still_persists() {
        let state = sqlite_state();
        let ada = register(&state, "Ada").await;
        let bob = register(&state, "Bob").await;

        let (status, _) = call(
            &state,
            post(&format!("/api/v1/messages/send/{bob}"), Some(&ada), json!({"image": "https://cdn/x.png"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(state.store.fetch_conversation(&ada, &bob).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn send_rejects_empty_and_unknown_receiver() {
        let state = sqlite_state();
        let ada = register(&state, "Ada").await;
        let bob = register(&state, "Bob").await;

        let (status, _) = call(
            &state,
            post(&format!("/api/v1/messages/send/{bob}"), Some(&ada), json!({"text": "  "})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            &state,
            post("/api/v1/messages/send/user_nobody", Some(&ada), json!({"text": "hello"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    /// Store whose message writes always fail.
    struct FailingWrites(SqliteChatStore);

    impl ChatStore for FailingWrites {
        fn create_user(&self, new: &NewUser) -> Result<UserProfile, StoreError> {
            self.0.create_user(new)
        }
        fn get_user(&self, id: &UserId) -> Result<UserProfile, StoreError> {
            self.0.get_user(id)
        }
        fn list_users_excluding(&self, id: &UserId) -> Result<Vec<UserProfile>, StoreError> {
            self.0.list_users_excluding(id)
        }
        fn create_message(&self, _: &UserId, _: &UserId, _: &MessageDraft) -> Result<Message, StoreError> {
            Err(StoreError::Database("disk I/O error".into()))
        }
        fn fetch_conversation(&self, a: &UserId, b: &UserId) -> Result<Vec<Message>, StoreError> {
            self.0.fetch_conversation(a, b)
        }
    }

    #[tokio::test]
    async fn persistence_failure_is_500_and_not_relayed() {
        let store = FailingWrites(SqliteChatStore::new(Database::in_memory().unwrap()));
        let state = AppState::new(Arc::new(store), &ServerConfig::default(), CancellationToken::new());
        let ada = register(&state, "Ada").await;
        let bob = register(&state, "Bob").await;
        let mut bob_rx = go_online(&state, &bob);

        let (status, body) = call(
            &state,
            post(&format!("/api/v1/messages/send/{bob}"), Some(&ada), json!({"text": "hi"})),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["success"], false);
        assert!(bob_rx.try_recv().is_err());
    }
}
