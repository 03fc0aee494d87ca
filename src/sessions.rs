//! Session and conversation store
//!
//! Sessions belong to exactly one user; message pairs are appended by the
//! query engine with strictly increasing timestamps, even when the wall
//! clock stalls. Messages are retained indefinitely; only the window handed
//! to the prompt builder is capped.

use crate::error::{Result, ServiceError};
use crate::llm::Role;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::Serialize;
use sqlx::{sqlite::SqlitePool, Row};
use tracing::{debug, info};
use utoipa::ToSchema;
use uuid::Uuid;

/// A conversation session
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// A stored message
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: String,
    pub session_id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

fn role_to_str(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::System => "system",
    }
}

fn role_from_str(raw: &str) -> Result<Role> {
    match raw {
        "user" => Ok(Role::User),
        "assistant" => Ok(Role::Assistant),
        "system" => Ok(Role::System),
        other => Err(ServiceError::Internal(format!(
            "unknown message role in store: {}",
            other
        ))),
    }
}

/// Microsecond precision keeps lexicographic and chronological order aligned
fn render_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ServiceError::Internal(format!("corrupt timestamp in store: {}", e)))
}

/// SQLite-backed session store
pub struct SessionStore {
    pool: SqlitePool,
}

impl SessionStore {
    /// Create tables and wrap the pool
    pub async fn initialize(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                last_activity TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                timestamp TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id, timestamp)",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_sessions_activity ON sessions(last_activity)",
        )
        .execute(&pool)
        .await?;

        info!("Session store initialized");
        Ok(Self { pool })
    }

    /// Create a session for the user
    pub async fn create_session(&self, user_id: &str) -> Result<Session> {
        self.create_session_with_id(user_id, &Uuid::new_v4().to_string())
            .await
    }

    async fn create_session_with_id(&self, user_id: &str, id: &str) -> Result<Session> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO sessions (id, user_id, created_at, last_activity) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(id)
        .bind(user_id)
        .bind(render_ts(now))
        .bind(render_ts(now))
        .execute(&self.pool)
        .await?;

        debug!("Created session {} for user {}", id, user_id);
        Ok(Session {
            id: id.to_string(),
            user_id: user_id.to_string(),
            created_at: now,
            last_activity: now,
        })
    }

    pub async fn get_session(&self, id: &str) -> Result<Option<Session>> {
        let row = sqlx::query("SELECT * FROM sessions WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| {
            let created_at: String = row.get("created_at");
            let last_activity: String = row.get("last_activity");
            Ok(Session {
                id: row.get("id"),
                user_id: row.get("user_id"),
                created_at: parse_ts(&created_at)?,
                last_activity: parse_ts(&last_activity)?,
            })
        })
        .transpose()
    }

    /// The session must exist and belong to the user; cross-user access is an
    /// authorization failure
    pub async fn ensure_owned(&self, session_id: &str, user_id: &str) -> Result<Session> {
        let session = self
            .get_session(session_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("session {}", session_id)))?;

        if session.user_id != user_id {
            return Err(ServiceError::Authorization(
                "session belongs to another user".to_string(),
            ));
        }
        Ok(session)
    }

    /// Resolve the session for a query: absent means create one, a fresh id
    /// creates it implicitly, an existing id must be owned by the caller.
    pub async fn ensure_session(
        &self,
        user_id: &str,
        session_id: Option<&str>,
    ) -> Result<Session> {
        match session_id {
            None => self.create_session(user_id).await,
            Some(id) => match self.get_session(id).await? {
                Some(session) => {
                    if session.user_id != user_id {
                        return Err(ServiceError::Authorization(
                            "session belongs to another user".to_string(),
                        ));
                    }
                    Ok(session)
                }
                None => {
                    if Uuid::parse_str(id).is_err() {
                        return Err(ServiceError::Validation(
                            "session_id must be a UUID".to_string(),
                        ));
                    }
                    self.create_session_with_id(user_id, id).await
                }
            },
        }
    }

    /// Append a user/assistant pair.
    ///
    /// The user message gets `ts` (pushed forward if the session already has
    /// a later message) and the assistant message a strictly greater
    /// timestamp, so per-session order is monotonic even when the clock is
    /// not. Both inserts and the activity touch commit together.
    pub async fn append_pair(
        &self,
        session_id: &str,
        user_text: &str,
        assistant_text: &str,
        ts: DateTime<Utc>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let last: Option<String> = sqlx::query(
            "SELECT MAX(timestamp) as last FROM messages WHERE session_id = ?1",
        )
        .bind(session_id)
        .fetch_one(&mut *tx)
        .await?
        .get("last");

        let mut user_ts = ts;
        if let Some(last) = last {
            let last_ts = parse_ts(&last)?;
            if user_ts <= last_ts {
                user_ts = last_ts + Duration::microseconds(1);
            }
        }
        let assistant_ts = user_ts + Duration::microseconds(1);

        sqlx::query(
            "INSERT INTO messages (id, session_id, role, content, timestamp) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(session_id)
        .bind(role_to_str(Role::User))
        .bind(user_text)
        .bind(render_ts(user_ts))
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO messages (id, session_id, role, content, timestamp) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(session_id)
        .bind(role_to_str(Role::Assistant))
        .bind(assistant_text)
        .bind(render_ts(assistant_ts))
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE sessions SET last_activity = ?1 WHERE id = ?2")
            .bind(render_ts(assistant_ts))
            .bind(session_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        debug!("Appended message pair to session {}", session_id);
        Ok(())
    }

    /// The most recent `limit` messages, returned oldest first
    pub async fn history(&self, session_id: &str, limit: usize) -> Result<Vec<StoredMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM (
                SELECT * FROM messages WHERE session_id = ?1
                ORDER BY timestamp DESC LIMIT ?2
            ) ORDER BY timestamp ASC
            "#,
        )
        .bind(session_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let role: String = row.get("role");
                let timestamp: String = row.get("timestamp");
                Ok(StoredMessage {
                    id: row.get("id"),
                    session_id: row.get("session_id"),
                    role: role_from_str(&role)?,
                    content: row.get("content"),
                    timestamp: parse_ts(&timestamp)?,
                })
            })
            .collect()
    }

    /// Refresh last_activity
    pub async fn touch(&self, session_id: &str) -> Result<()> {
        sqlx::query("UPDATE sessions SET last_activity = ?1 WHERE id = ?2")
            .bind(render_ts(Utc::now()))
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn count_sessions(&self) -> Result<usize> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM sessions")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("count") as usize)
    }

    pub async fn count_messages(&self) -> Result<usize> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM messages")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("count") as usize)
    }

    /// Delete sessions idle past the window, together with their messages.
    /// Returns the evicted session count.
    pub async fn evict_inactive(&self, window: Duration) -> Result<usize> {
        let cutoff = render_ts(Utc::now() - window);
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            DELETE FROM messages WHERE session_id IN
                (SELECT id FROM sessions WHERE last_activity < ?1)
            "#,
        )
        .bind(&cutoff)
        .execute(&mut *tx)
        .await?;

        let result = sqlx::query("DELETE FROM sessions WHERE last_activity < ?1")
            .bind(&cutoff)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        let evicted = result.rows_affected() as usize;
        if evicted > 0 {
            info!("Evicted {} inactive sessions", evicted);
        }
        Ok(evicted)
    }
}
