use std::collections::HashSet;

use parley_core::ids::MessageId;
use parley_core::messages::Message;

/// Messages of one conversation, ordered by `created_at` with ties in
/// arrival order. Never holds two messages with the same id.
#[derive(Clone, Debug, Default)]
pub struct ConversationView {
    messages: Vec<Message>,
    ids: HashSet<MessageId>,
}

impl ConversationView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole view with a fetched snapshot.
    pub fn replace(&mut self, snapshot: Vec<Message>) {
        self.clear();
        for message in snapshot {
            self.insert(message);
        }
    }

    /// Add a message unless its id is already present. Returns whether it
    /// was added.
    pub fn insert(&mut self, message: Message) -> bool {
        if !self.ids.insert(message.id.clone()) {
            return false;
        }
        let at = self
            .messages
            .partition_point(|m| m.created_at <= message.created_at);
        self.messages.insert(at, message);
        true
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.ids.contains(id)
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.ids.clear();
    }
}
