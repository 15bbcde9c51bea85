//! Domain types shared by the parley server and client: identifiers,
//! messages, the online set, and the push-channel wire events.

pub mod errors;
pub mod events;
pub mod ids;
pub mod messages;
pub mod presence;

pub use errors::ProtocolError;
pub use events::{ClientEvent, ServerEvent};
pub use ids::{ConnectionId, MessageId, UserId};
pub use messages::{Message, MessageDraft};
pub use presence::OnlineSet;
