use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use uuid::Uuid;

use shared::domain::{ConversationId, MessageId, User, UserId, UserSummary};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct StoredConversation {
    pub id: ConversationId,
    pub name: Option<String>,
    pub is_group: bool,
    pub last_message_at: DateTime<Utc>,
    pub users: Vec<User>,
}

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender: UserSummary,
    pub body: Option<String>,
    pub image: Option<String>,
    pub created_at: DateTime<Utc>,
    pub seen: Vec<UserSummary>,
}

#[derive(Debug, Clone)]
pub struct NewMessage<'a> {
    pub body: Option<&'a str>,
    pub image: Option<&'a str>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    /// Upsert by email; the identity key is assigned once and survives
    /// display-field updates.
    pub async fn create_user(&self, email: &str, name: Option<&str>) -> Result<User> {
        let row = sqlx::query(
            "INSERT INTO users (id, email, name) VALUES (?1, ?2, ?3)
             ON CONFLICT(email) DO UPDATE SET name = COALESCE(excluded.name, users.name)
             RETURNING id, email, name, image",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(email)
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        Ok(user_from_row(&row))
    }

    pub async fn user_by_id(&self, user_id: &UserId) -> Result<Option<User>> {
        let row = sqlx::query("SELECT id, email, name, image FROM users WHERE id = ?1")
            .bind(&user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(user_from_row))
    }

    pub async fn user_by_email(&self, email: &str) -> Result<Option<User>> {
        let row = sqlx::query("SELECT id, email, name, image FROM users WHERE email = ?1")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(user_from_row))
    }

    /// Directory listing for the people picker, newest first, excluding the
    /// requesting user.
    pub async fn find_users(&self, excluding_email: &str) -> Result<Vec<User>> {
        let rows = sqlx::query(
            "SELECT id, email, name, image FROM users
             WHERE email != ?1 ORDER BY created_at DESC",
        )
        .bind(excluding_email)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(user_from_row).collect())
    }

    pub async fn insert_session(&self, user_id: &UserId) -> Result<String> {
        let token = Uuid::new_v4().to_string();
        sqlx::query("INSERT INTO sessions (token, user_id) VALUES (?1, ?2)")
            .bind(&token)
            .bind(&user_id.0)
            .execute(&self.pool)
            .await?;
        Ok(token)
    }

    pub async fn user_for_session(&self, token: &str) -> Result<Option<User>> {
        let row = sqlx::query(
            "SELECT u.id, u.email, u.name, u.image FROM sessions s
             JOIN users u ON u.id = s.user_id WHERE s.token = ?1",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(user_from_row))
    }

    pub async fn create_conversation(
        &self,
        name: Option<&str>,
        is_group: bool,
        member_ids: &[UserId],
    ) -> Result<StoredConversation> {
        let id = ConversationId::generate();
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO conversations (id, name, is_group, last_message_at)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(&id.0)
        .bind(name)
        .bind(is_group)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        for member in member_ids {
            sqlx::query(
                "INSERT OR IGNORE INTO conversation_members (conversation_id, user_id)
                 VALUES (?1, ?2)",
            )
            .bind(&id.0)
            .bind(&member.0)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        self.find_conversation(&id)
            .await?
            .context("conversation vanished after insert")
    }

    pub async fn find_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<StoredConversation>> {
        let row = sqlx::query(
            "SELECT id, name, is_group, last_message_at FROM conversations WHERE id = ?1",
        )
        .bind(&conversation_id.0)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(self.conversation_from_row(&row).await?))
    }

    /// Existing two-member direct conversation between the pair, if any.
    pub async fn find_one_to_one(
        &self,
        user_a: &UserId,
        user_b: &UserId,
    ) -> Result<Option<StoredConversation>> {
        let row = sqlx::query(
            "SELECT c.id, c.name, c.is_group, c.last_message_at FROM conversations c
             JOIN conversation_members m1 ON m1.conversation_id = c.id AND m1.user_id = ?1
             JOIN conversation_members m2 ON m2.conversation_id = c.id AND m2.user_id = ?2
             WHERE c.is_group = 0
               AND (SELECT COUNT(*) FROM conversation_members m
                    WHERE m.conversation_id = c.id) = 2
             LIMIT 1",
        )
        .bind(&user_a.0)
        .bind(&user_b.0)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(self.conversation_from_row(&row).await?))
    }

    /// Sidebar listing, most recent activity first.
    pub async fn conversations_for_user(&self, user_id: &UserId) -> Result<Vec<StoredConversation>> {
        let rows = sqlx::query(
            "SELECT c.id, c.name, c.is_group, c.last_message_at FROM conversations c
             JOIN conversation_members m ON m.conversation_id = c.id
             WHERE m.user_id = ?1
             ORDER BY c.last_message_at DESC",
        )
        .bind(&user_id.0)
        .fetch_all(&self.pool)
        .await?;
        let mut conversations = Vec::with_capacity(rows.len());
        for row in rows {
            conversations.push(self.conversation_from_row(&row).await?);
        }
        Ok(conversations)
    }

    pub async fn is_member(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
    ) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM conversation_members
             WHERE conversation_id = ?1 AND user_id = ?2",
        )
        .bind(&conversation_id.0)
        .bind(&user_id.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    pub async fn add_member(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
    ) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO conversation_members (conversation_id, user_id)
             VALUES (?1, ?2)",
        )
        .bind(&conversation_id.0)
        .bind(&user_id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn remove_member(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
    ) -> Result<()> {
        sqlx::query(
            "DELETE FROM conversation_members WHERE conversation_id = ?1 AND user_id = ?2",
        )
        .bind(&conversation_id.0)
        .bind(&user_id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Append a message and advance the conversation's recency key in one
    /// transaction. The sender starts in their own seen set.
    pub async fn append_message(
        &self,
        conversation_id: &ConversationId,
        sender_id: &UserId,
        message: NewMessage<'_>,
    ) -> Result<StoredMessage> {
        let id = MessageId::generate();
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO messages (id, conversation_id, sender_id, body, image, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(&id.0)
        .bind(&conversation_id.0)
        .bind(&sender_id.0)
        .bind(message.body)
        .bind(message.image)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT OR IGNORE INTO message_seen (message_id, user_id) VALUES (?1, ?2)",
        )
        .bind(&id.0)
        .bind(&sender_id.0)
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE conversations SET last_message_at = ?1 WHERE id = ?2")
            .bind(now)
            .bind(&conversation_id.0)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        self.find_message(&id)
            .await?
            .context("message vanished after insert")
    }

    pub async fn find_message(&self, message_id: &MessageId) -> Result<Option<StoredMessage>> {
        let row = sqlx::query(
            "SELECT id, conversation_id, sender_id, body, image, created_at
             FROM messages WHERE id = ?1",
        )
        .bind(&message_id.0)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(self.message_from_row(&row).await?))
    }

    /// Messages in creation order.
    pub async fn messages_for_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<StoredMessage>> {
        let rows = sqlx::query(
            "SELECT id, conversation_id, sender_id, body, image, created_at
             FROM messages WHERE conversation_id = ?1
             ORDER BY created_at ASC, rowid ASC",
        )
        .bind(&conversation_id.0)
        .fetch_all(&self.pool)
        .await?;
        let mut messages = Vec::with_capacity(rows.len());
        for row in rows {
            messages.push(self.message_from_row(&row).await?);
        }
        Ok(messages)
    }

    pub async fn last_message(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<StoredMessage>> {
        let row = sqlx::query(
            "SELECT id, conversation_id, sender_id, body, image, created_at
             FROM messages WHERE conversation_id = ?1
             ORDER BY created_at DESC, rowid DESC LIMIT 1",
        )
        .bind(&conversation_id.0)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(self.message_from_row(&row).await?))
    }

    /// Idempotent seen-set insert. Returns whether the viewer was newly
    /// added; the set never loses members.
    pub async fn mark_message_seen(
        &self,
        message_id: &MessageId,
        user_id: &UserId,
    ) -> Result<bool> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO message_seen (message_id, user_id) VALUES (?1, ?2)",
        )
        .bind(&message_id.0)
        .bind(&user_id.0)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Returns the number of conversations removed (0 when absent).
    pub async fn delete_conversation(&self, conversation_id: &ConversationId) -> Result<u64> {
        let result = sqlx::query("DELETE FROM conversations WHERE id = ?1")
            .bind(&conversation_id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn conversation_from_row(&self, row: &sqlx::sqlite::SqliteRow) -> Result<StoredConversation> {
        let id = ConversationId(row.get::<String, _>("id"));
        let users = self.members_of(&id).await?;
        Ok(StoredConversation {
            id,
            name: row.get::<Option<String>, _>("name"),
            is_group: row.get::<bool, _>("is_group"),
            last_message_at: row.get::<DateTime<Utc>, _>("last_message_at"),
            users,
        })
    }

    async fn members_of(&self, conversation_id: &ConversationId) -> Result<Vec<User>> {
        let rows = sqlx::query(
            "SELECT u.id, u.email, u.name, u.image FROM conversation_members m
             JOIN users u ON u.id = m.user_id
             WHERE m.conversation_id = ?1
             ORDER BY u.created_at ASC, u.id ASC",
        )
        .bind(&conversation_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(user_from_row).collect())
    }

    async fn message_from_row(&self, row: &sqlx::sqlite::SqliteRow) -> Result<StoredMessage> {
        let id = MessageId(row.get::<String, _>("id"));
        let sender_id = UserId(row.get::<String, _>("sender_id"));
        let sender = self
            .user_by_id(&sender_id)
            .await?
            .with_context(|| format!("sender {sender_id} missing for message {id}"))?;
        let seen = self.seen_by(&id).await?;
        Ok(StoredMessage {
            id,
            conversation_id: ConversationId(row.get::<String, _>("conversation_id")),
            sender: UserSummary::from(&sender),
            body: row.get::<Option<String>, _>("body"),
            image: row.get::<Option<String>, _>("image"),
            created_at: row.get::<DateTime<Utc>, _>("created_at"),
            seen,
        })
    }

    async fn seen_by(&self, message_id: &MessageId) -> Result<Vec<UserSummary>> {
        let rows = sqlx::query(
            "SELECT u.id, u.email, u.name FROM message_seen s
             JOIN users u ON u.id = s.user_id
             WHERE s.message_id = ?1
             ORDER BY u.created_at ASC, u.id ASC",
        )
        .bind(&message_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| UserSummary {
                id: UserId(row.get::<String, _>("id")),
                name: row.get::<Option<String>, _>("name"),
                email: row.get::<String, _>("email"),
            })
            .collect())
    }
}

fn user_from_row(row: &sqlx::sqlite::SqliteRow) -> User {
    User {
        id: UserId(row.get::<String, _>("id")),
        email: row.get::<String, _>("email"),
        name: row.get::<Option<String>, _>("name"),
        image: row.get::<Option<String>, _>("image"),
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;
    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
