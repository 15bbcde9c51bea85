use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::HeaderValue;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use parley_core::ids::ConnectionId;
use parley_store::ChatStore;

use crate::api;
use crate::config::ServerConfig;
use crate::hub::{HubHandle, PresenceHub};
use crate::presence::PresenceBroadcaster;
use crate::registry::ConnectionRegistry;
use crate::relay::MessageRelay;
use crate::session::{self, SessionConfig};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ChatStore>,
    pub registry: Arc<ConnectionRegistry>,
    pub broadcaster: Arc<PresenceBroadcaster>,
    pub relay: Arc<MessageRelay>,
    pub hub: HubHandle,
    pub session: SessionConfig,
    pub max_message_size: usize,
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Wire the presence components together and spawn the hub task,
    /// which runs until `shutdown` is cancelled.
    pub fn new(store: Arc<dyn ChatStore>, config: &ServerConfig, shutdown: CancellationToken) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let broadcaster = Arc::new(PresenceBroadcaster::new());
        let relay = Arc::new(MessageRelay::new(registry.clone(), broadcaster.clone()));
        let (hub, _task) = PresenceHub::spawn(registry.clone(), broadcaster.clone(), shutdown.clone());

        Self {
            store,
            registry,
            broadcaster,
            relay,
            hub,
            session: config.session(),
            max_message_size: config.max_message_size,
            shutdown,
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState, config: &ServerConfig) -> Router {
    let api = Router::new()
        .route("/users", post(api::create_user))
        .route("/messages/users", get(api::list_users))
        .route("/messages/{id}", get(api::fetch_conversation))
        .route("/messages/send/{id}", post(api::send_message));

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .nest("/api/v1", api)
        .with_state(state)
        .layer(cors_layer(config.cors_origin.as_deref()))
        .layer(TraceLayer::new_for_http())
}

fn cors_layer(origin: Option<&str>) -> CorsLayer {
    let Some(origin) = origin else {
        return CorsLayer::permissive();
    };
    match origin.parse::<HeaderValue>() {
        Ok(value) => CorsLayer::new()
            .allow_origin(value)
            .allow_methods(Any)
            .allow_headers(Any),
        Err(e) => {
            warn!(origin, error = %e, "invalid CORS origin, allowing any");
            CorsLayer::permissive()
        }
    }
}

/// Bind the listener and serve until the returned handle is shut down.
pub async fn start(config: ServerConfig, store: Arc<dyn ChatStore>) -> Result<ServerHandle, std::io::Error> {
    let shutdown = CancellationToken::new();
    let state = AppState::new(store, &config, shutdown.clone());
    let router = build_router(state.clone(), &config);

    let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;
    let addr = listener.local_addr()?;
    info!(%addr, "parley server started");

    let serve_token = shutdown.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(serve_token.cancelled_owned())
            .await;
        if let Err(e) = result {
            warn!(error = %e, "server stopped with error");
        }
    });

    Ok(ServerHandle {
        addr,
        state,
        shutdown,
        server,
    })
}

/// Handle returned by [`start`].
pub struct ServerHandle {
    pub addr: SocketAddr,
    state: AppState,
    shutdown: CancellationToken,
    server: JoinHandle<()>,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Close every session and stop accepting connections.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, self.server).await.is_err() {
            warn!("shutdown timed out after {SHUTDOWN_TIMEOUT:?}");
        }
        info!("parley server stopped");
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| {
            session::run_ws_session(
                socket,
                ConnectionId::new(),
                state.hub,
                state.session,
                state.shutdown,
            )
        })
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "online": state.registry.len(),
        "connections": state.broadcaster.connection_count(),
    }))
}
