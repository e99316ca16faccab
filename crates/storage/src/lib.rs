use std::{fs, path::Path, str::FromStr, time::Duration};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};

use shared::domain::{MediaId, MessageId, UserId};

/// Queries that outlive this window surface as errors, never hangs.
const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
    query_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct StoredUser {
    pub user_id: UserId,
    pub username: String,
}

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub message_id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub text: Option<String>,
    pub image_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StoredMedia {
    pub media_id: MediaId,
    pub owner_id: UserId,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        Self::with_query_timeout(database_url, DEFAULT_QUERY_TIMEOUT).await
    }

    pub async fn with_query_timeout(database_url: &str, query_timeout: Duration) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        let storage = Self {
            pool,
            query_timeout,
        };
        storage.init_schema().await?;
        Ok(storage)
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id       INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL UNIQUE
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure users table exists")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                sender_id   INTEGER NOT NULL REFERENCES users(id),
                receiver_id INTEGER NOT NULL REFERENCES users(id),
                text        TEXT,
                image_url   TEXT,
                created_at  TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure messages table exists")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_pair
             ON messages (sender_id, receiver_id, created_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS media (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                owner_id     INTEGER NOT NULL REFERENCES users(id),
                content_type TEXT,
                bytes        BLOB NOT NULL,
                created_at   TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure media table exists")?;

        Ok(())
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    async fn timed<T, F>(&self, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
    {
        match tokio::time::timeout(self.query_timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(anyhow!(
                "store query exceeded {}ms timeout",
                self.query_timeout.as_millis()
            )),
        }
    }

    pub async fn create_user(&self, username: &str) -> Result<UserId> {
        let username = username.trim();
        if username.is_empty() {
            return Err(anyhow!("username cannot be empty"));
        }
        let rec = self
            .timed(
                sqlx::query(
                    "INSERT INTO users (username) VALUES (?)
                     ON CONFLICT(username) DO UPDATE SET username=excluded.username
                     RETURNING id",
                )
                .bind(username)
                .fetch_one(&self.pool),
            )
            .await?;
        Ok(UserId(rec.get::<i64, _>(0)))
    }

    pub async fn find_user(&self, user_id: UserId) -> Result<Option<StoredUser>> {
        let row = self
            .timed(
                sqlx::query("SELECT id, username FROM users WHERE id = ?")
                    .bind(user_id.0)
                    .fetch_optional(&self.pool),
            )
            .await?;
        Ok(row.map(|r| StoredUser {
            user_id: UserId(r.get(0)),
            username: r.get(1),
        }))
    }

    /// Sidebar roster: everyone except the calling user.
    pub async fn list_users_except(&self, user_id: UserId) -> Result<Vec<StoredUser>> {
        let rows = self
            .timed(
                sqlx::query("SELECT id, username FROM users WHERE id != ? ORDER BY username")
                    .bind(user_id.0)
                    .fetch_all(&self.pool),
            )
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| StoredUser {
                user_id: UserId(r.get(0)),
                username: r.get(1),
            })
            .collect())
    }

    pub async fn insert_message(
        &self,
        sender_id: UserId,
        receiver_id: UserId,
        text: Option<&str>,
        image_url: Option<&str>,
    ) -> Result<StoredMessage> {
        let created_at = Utc::now();
        let rec = self
            .timed(
                sqlx::query(
                    "INSERT INTO messages (sender_id, receiver_id, text, image_url, created_at)
                     VALUES (?, ?, ?, ?, ?)
                     RETURNING id",
                )
                .bind(sender_id.0)
                .bind(receiver_id.0)
                .bind(text)
                .bind(image_url)
                .bind(created_at)
                .fetch_one(&self.pool),
            )
            .await?;
        Ok(StoredMessage {
            message_id: MessageId(rec.get::<i64, _>(0)),
            sender_id,
            receiver_id,
            text: text.map(str::to_owned),
            image_url: image_url.map(str::to_owned),
            created_at,
        })
    }

    pub async fn load_message(&self, message_id: MessageId) -> Result<Option<StoredMessage>> {
        let row = self
            .timed(
                sqlx::query(
                    "SELECT id, sender_id, receiver_id, text, image_url, created_at
                     FROM messages WHERE id = ?",
                )
                .bind(message_id.0)
                .fetch_optional(&self.pool),
            )
            .await?;
        Ok(row.map(message_from_row))
    }

    pub async fn delete_message(&self, message_id: MessageId) -> Result<bool> {
        let result = self
            .timed(
                sqlx::query("DELETE FROM messages WHERE id = ?")
                    .bind(message_id.0)
                    .execute(&self.pool),
            )
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Deletes one direction of a conversation: only messages the sender
    /// sent to the receiver. The other party's messages stay untouched.
    pub async fn delete_conversation(
        &self,
        sender_id: UserId,
        receiver_id: UserId,
    ) -> Result<u64> {
        let result = self
            .timed(
                sqlx::query("DELETE FROM messages WHERE sender_id = ? AND receiver_id = ?")
                    .bind(sender_id.0)
                    .bind(receiver_id.0)
                    .execute(&self.pool),
            )
            .await?;
        Ok(result.rows_affected())
    }

    /// Messages between the pair in ascending `created_at` order. With a
    /// cursor, strictly newer messages only; without one, the most recent
    /// `limit` (still returned ascending).
    pub async fn find_messages_between(
        &self,
        user_a: UserId,
        user_b: UserId,
        since: Option<DateTime<Utc>>,
        limit: Option<u32>,
    ) -> Result<Vec<StoredMessage>> {
        let rows = match (since, limit) {
            (Some(since), _) => {
                self.timed(
                    sqlx::query(
                        "SELECT id, sender_id, receiver_id, text, image_url, created_at
                         FROM messages
                         WHERE ((sender_id = ? AND receiver_id = ?)
                             OR (sender_id = ? AND receiver_id = ?))
                           AND created_at > ?
                         ORDER BY created_at ASC, id ASC",
                    )
                    .bind(user_a.0)
                    .bind(user_b.0)
                    .bind(user_b.0)
                    .bind(user_a.0)
                    .bind(since)
                    .fetch_all(&self.pool),
                )
                .await?
            }
            (None, Some(limit)) => {
                // Newest `limit` rows, flipped back to ascending below.
                let mut rows = self
                    .timed(
                        sqlx::query(
                            "SELECT id, sender_id, receiver_id, text, image_url, created_at
                             FROM messages
                             WHERE (sender_id = ? AND receiver_id = ?)
                                OR (sender_id = ? AND receiver_id = ?)
                             ORDER BY created_at DESC, id DESC
                             LIMIT ?",
                        )
                        .bind(user_a.0)
                        .bind(user_b.0)
                        .bind(user_b.0)
                        .bind(user_a.0)
                        .bind(i64::from(limit))
                        .fetch_all(&self.pool),
                    )
                    .await?;
                rows.reverse();
                rows
            }
            (None, None) => {
                self.timed(
                    sqlx::query(
                        "SELECT id, sender_id, receiver_id, text, image_url, created_at
                         FROM messages
                         WHERE (sender_id = ? AND receiver_id = ?)
                            OR (sender_id = ? AND receiver_id = ?)
                         ORDER BY created_at ASC, id ASC",
                    )
                    .bind(user_a.0)
                    .bind(user_b.0)
                    .bind(user_b.0)
                    .bind(user_a.0)
                    .fetch_all(&self.pool),
                )
                .await?
            }
        };
        Ok(rows.into_iter().map(message_from_row).collect())
    }

    pub async fn store_media(
        &self,
        owner_id: UserId,
        bytes: &[u8],
        content_type: Option<&str>,
    ) -> Result<MediaId> {
        let rec = self
            .timed(
                sqlx::query(
                    "INSERT INTO media (owner_id, content_type, bytes, created_at)
                     VALUES (?, ?, ?, ?)
                     RETURNING id",
                )
                .bind(owner_id.0)
                .bind(content_type)
                .bind(bytes)
                .bind(Utc::now())
                .fetch_one(&self.pool),
            )
            .await?;
        Ok(MediaId(rec.get::<i64, _>(0)))
    }

    pub async fn load_media(&self, media_id: MediaId) -> Result<Option<StoredMedia>> {
        let row = self
            .timed(
                sqlx::query("SELECT id, owner_id, content_type, bytes FROM media WHERE id = ?")
                    .bind(media_id.0)
                    .fetch_optional(&self.pool),
            )
            .await?;
        Ok(row.map(|r| StoredMedia {
            media_id: MediaId(r.get(0)),
            owner_id: UserId(r.get(1)),
            content_type: r.get(2),
            bytes: r.get(3),
        }))
    }
}

fn message_from_row(row: sqlx::sqlite::SqliteRow) -> StoredMessage {
    StoredMessage {
        message_id: MessageId(row.get(0)),
        sender_id: UserId(row.get(1)),
        receiver_id: UserId(row.get(2)),
        text: row.get(3),
        image_url: row.get(4),
        created_at: row.get(5),
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return Ok(());
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();
    if path.is_empty() {
        return Ok(());
    }

    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).with_context(|| {
                format!(
                    "failed to create parent directory '{}' for database url '{database_url}'",
                    parent.display()
                )
            })?;
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
