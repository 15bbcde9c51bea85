//! The durable system of record as seen by the server.

use parley_core::ids::UserId;
use parley_core::messages::{Message, MessageDraft};

use crate::database::Database;
use crate::error::StoreError;
use crate::messages::MessageRepo;
use crate::users::{NewUser, UserProfile, UserRepo};

/// Storage collaborator for users and messages.
///
/// Implementations must only return `Ok` from `create_message` once the
/// message is durable: the relay treats that as its precondition.
pub trait ChatStore: Send + Sync {
    fn create_user(&self, new: &NewUser) -> Result<UserProfile, StoreError>;
    fn get_user(&self, id: &UserId) -> Result<UserProfile, StoreError>;
    fn list_users_excluding(&self, id: &UserId) -> Result<Vec<UserProfile>, StoreError>;
    fn create_message(
        &self,
        sender: &UserId,
        receiver: &UserId,
        draft: &MessageDraft,
    ) -> Result<Message, StoreError>;
    fn fetch_conversation(&self, a: &UserId, b: &UserId) -> Result<Vec<Message>, StoreError>;
}

/// SQLite-backed [`ChatStore`].
pub struct SqliteChatStore {
    users: UserRepo,
    messages: MessageRepo,
}

impl SqliteChatStore {
    pub fn new(db: Database) -> Self {
        Self {
            users: UserRepo::new(db.clone()),
            messages: MessageRepo::new(db),
        }
    }
}

impl ChatStore for SqliteChatStore {
    fn create_user(&self, new: &NewUser) -> Result<UserProfile, StoreError> {
        self.users.create(new)
    }

    fn get_user(&self, id: &UserId) -> Result<UserProfile, StoreError> {
        self.users.get(id)
    }

    fn list_users_excluding(&self, id: &UserId) -> Result<Vec<UserProfile>, StoreError> {
        self.users.list_excluding(id)
    }

    fn create_message(
        &self,
        sender: &UserId,
        receiver: &UserId,
        draft: &MessageDraft,
    ) -> Result<Message, StoreError> {
        self.messages.create(sender, receiver, draft)
    }

    fn fetch_conversation(&self, a: &UserId, b: &UserId) -> Result<Vec<Message>, StoreError> {
        self.messages.conversation(a, b)
    }
}
