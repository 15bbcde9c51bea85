//! Presence-and-delivery server: connection registry, presence hub,
//! message relay, WebSocket sessions, and the REST surface.

pub mod api;
pub mod bootstrap;
pub mod config;
pub mod connection;
pub mod hub;
pub mod presence;
pub mod registry;
pub mod relay;
pub mod server;
pub mod session;

pub use config::{load_config, ConfigError, ServerConfig};
pub use registry::ConnectionRegistry;
pub use relay::{MessageRelay, RelayOutcome};
pub use server::{build_router, start, AppState, ServerHandle};
