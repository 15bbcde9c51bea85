use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use parley_core::ids::UserId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Public profile of a registered party. Credentials live elsewhere.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: UserId,
    pub full_name: String,
    pub email: String,
    pub profile_pic: String,
    pub created_at: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewUser {
    pub full_name: String,
    pub email: String,
    #[serde(default)]
    pub profile_pic: Option<String>,
}

pub struct UserRepo {
    db: Database,
}

const COLUMNS: &str = "id, full_name, email, profile_pic, created_at";

impl UserRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Register a new profile. Email addresses are unique.
    #[instrument(skip(self, new), fields(email = %new.email))]
    pub fn create(&self, new: &NewUser) -> Result<UserProfile, StoreError> {
        let id = UserId::new();
        let now = row_helpers::format_timestamp(&Utc::now());
        let profile_pic = new.profile_pic.clone().unwrap_or_default();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, full_name, email, profile_pic, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![id.as_str(), new.full_name, new.email, profile_pic, now],
            )
            .map_err(|e| match StoreError::from(e) {
                StoreError::Conflict(_) => StoreError::Conflict(format!("email {} already exists", new.email)),
                other => other,
            })?;

            Ok(UserProfile {
                id,
                full_name: new.full_name.clone(),
                email: new.email.clone(),
                profile_pic,
                created_at: now,
            })
        })
    }

    #[instrument(skip(self), fields(user_id = %id))]
    pub fn get(&self, id: &UserId) -> Result<UserProfile, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM users WHERE id = ?1"))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_user(row),
                None => Err(StoreError::NotFound(format!("user {id}"))),
            }
        })
    }

    /// Everyone except `id`, ordered by display name.
    #[instrument(skip(self), fields(user_id = %id))]
    pub fn list_excluding(&self, id: &UserId) -> Result<Vec<UserProfile>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM users WHERE id != ?1 ORDER BY full_name, id"
            ))?;
            let mut rows = stmt.query([id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_user(row)?);
            }
            Ok(results)
        })
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> Result<UserProfile, StoreError> {
    Ok(UserProfile {
        id: UserId::from_raw(row_helpers::get::<String>(row, 0, "users", "id")?),
        full_name: row_helpers::get(row, 1, "users", "full_name")?,
        email: row_helpers::get(row, 2, "users", "email")?,
        profile_pic: row_helpers::get(row, 3, "users", "profile_pic")?,
        created_at: row_helpers::get(row, 4, "users", "created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> UserRepo {
        UserRepo::new(Database::in_memory().unwrap())
    }

    fn new_user(name: &str, email: &str) -> NewUser {
        NewUser {
            full_name: name.into(),
            email: email.into(),
            profile_pic: None,
        }
    }

    #[test]
    fn create_and_get() {
        let repo = repo();
        let created = repo.create(&new_user("Ada", "ada@example.com")).unwrap();
        assert!(created.id.as_str().starts_with("user_"));
        assert_eq!(created.profile_pic, "");

        let fetched = repo.get(&created.id).unwrap();
        assert_eq!(fetched, created);
    }

    #[test]
    fn duplicate_email_conflicts() {
        let repo = repo();
        repo.create(&new_user("Ada", "ada@example.com")).unwrap();
        let err = repo.create(&new_user("Ada Two", "ada@example.com")).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(m) if m.contains("ada@example.com")));
    }

    #[test]
    fn get_missing_is_not_found() {
        let err = repo().get(&UserId::from_raw("user_nobody")).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn list_excludes_caller_and_sorts_by_name() {
        let repo = repo();
        let zed = repo.create(&new_user("Zed", "zed@example.com")).unwrap();
        let bob = repo.create(&new_user("Bob", "bob@example.com")).unwrap();
        let me = repo.create(&new_user("Me", "me@example.com")).unwrap();

        let others = repo.list_excluding(&me.id).unwrap();
        let ids: Vec<_> = others.iter().map(|u| u.id.clone()).collect();
        assert_eq!(ids, vec![bob.id, zed.id]);
    }

    #[test]
    fn profile_serializes_camel_case() {
        let repo = repo();
        let mut new = new_user("Ada", "ada@example.com");
        new.profile_pic = Some("https://img/ada.png".into());
        let created = repo.create(&new).unwrap();
        let json = serde_json::to_value(&created).unwrap();
        assert_eq!(json["fullName"], "Ada");
        assert_eq!(json["profilePic"], "https://img/ada.png");
    }
}
