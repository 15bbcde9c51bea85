pub mod database;
pub mod error;
pub mod messages;
pub mod row_helpers;
pub mod schema;
pub mod store;
pub mod users;

pub use database::Database;
pub use error::StoreError;
pub use store::{ChatStore, SqliteChatStore};
pub use users::{NewUser, UserProfile};
