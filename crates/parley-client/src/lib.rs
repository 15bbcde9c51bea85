//! Client SDK for parley: REST calls, the push session, and the
//! per-conversation reconciler that merges the two.

pub mod api;
pub mod backoff;
pub mod error;
pub mod push;
pub mod reconciler;
pub mod view;

pub use api::{ChatApi, Contact, HttpChatApi};
pub use backoff::ReconnectPolicy;
pub use error::ClientError;
pub use push::{ConnectionState, PushFeed, PushSession, Subscription};
pub use reconciler::{Reconciler, ReconcilerState};
pub use view::ConversationView;
