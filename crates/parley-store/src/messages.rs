use chrono::{DateTime, Utc};
use tracing::instrument;

use parley_core::ids::{MessageId, UserId};
use parley_core::messages::{Message, MessageDraft};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

pub struct MessageRepo {
    db: Database,
}

const COLUMNS: &str = "id, sender_id, receiver_id, text, image, created_at";

impl MessageRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Persist a message. Storage assigns the id and creation time.
    #[instrument(skip(self, draft), fields(sender_id = %sender, receiver_id = %receiver))]
    pub fn create(
        &self,
        sender: &UserId,
        receiver: &UserId,
        draft: &MessageDraft,
    ) -> Result<Message, StoreError> {
        let id = MessageId::new();
        // Stored with microsecond precision; truncate now so the returned
        // message equals what a later fetch yields.
        let now = Utc::now();
        let created_at = DateTime::<Utc>::from_timestamp_micros(now.timestamp_micros()).unwrap_or(now);

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (id, sender_id, receiver_id, text, image, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    id.as_str(),
                    sender.as_str(),
                    receiver.as_str(),
                    draft.text,
                    draft.image,
                    row_helpers::format_timestamp(&created_at),
                ],
            )?;

            Ok(Message {
                id,
                sender_id: sender.clone(),
                receiver_id: receiver.clone(),
                text: draft.text.clone(),
                image: draft.image.clone(),
                created_at,
            })
        })
    }

    /// Both directions of the conversation between `a` and `b`, oldest
    /// first; ties keep insertion order.
    #[instrument(skip(self), fields(user_a = %a, user_b = %b))]
    pub fn conversation(&self, a: &UserId, b: &UserId) -> Result<Vec<Message>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM messages
                 WHERE (sender_id = ?1 AND receiver_id = ?2)
                    OR (sender_id = ?2 AND receiver_id = ?1)
                 ORDER BY created_at ASC, rowid ASC"
            ))?;
            let mut rows = stmt.query([a.as_str(), b.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_message(row)?);
            }
            Ok(results)
        })
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<Message, StoreError> {
    let created_at: String = row_helpers::get(row, 5, "messages", "created_at")?;
    Ok(Message {
        id: MessageId::from_raw(row_helpers::get::<String>(row, 0, "messages", "id")?),
        sender_id: UserId::from_raw(row_helpers::get::<String>(row, 1, "messages", "sender_id")?),
        receiver_id: UserId::from_raw(row_helpers::get::<String>(row, 2, "messages", "receiver_id")?),
        text: row_helpers::get_opt(row, 3, "messages", "text")?,
        image: row_helpers::get_opt(row, 4, "messages", "image")?,
        created_at: row_helpers::parse_timestamp(&created_at, "messages", "created_at")?,
    })
}
