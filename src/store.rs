//! Record store for users and document records
//!
//! Sessions, messages, chunks, settings, activity and metrics each manage
//! their own tables; this module owns the two collections everything else
//! hangs off: user accounts and document records.

use crate::error::{Result, ServiceError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqlitePool, Row};
use tracing::{debug, info};
use utoipa::ToSchema;
use uuid::Uuid;

/// A user account row
#[derive(Debug, Clone)]
pub struct User {
    pub id: String,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub full_name: Option<String>,
    pub is_active: bool,
    pub is_admin: bool,
    pub must_reset: bool,
    pub reset_token: Option<String>,
    pub reset_token_issued_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
}

/// Public view of a user; never carries the hash or reset token
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UserView {
    pub id: String,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    pub is_active: bool,
    pub is_admin: bool,
    pub must_reset: bool,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_login: Option<DateTime<Utc>>,
}

impl From<&User> for UserView {
    fn from(user: &User) -> Self {
        Self {
            id: user.id.clone(),
            username: user.username.clone(),
            email: user.email.clone(),
            full_name: user.full_name.clone(),
            is_active: user.is_active,
            is_admin: user.is_admin,
            must_reset: user.must_reset,
            created_at: user.created_at,
            last_login: user.last_login,
        }
    }
}

/// Fields required to create a user
#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub full_name: Option<String>,
    pub is_admin: bool,
}

/// A document record; chunk storage lives in the vector index
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct DocumentRecord {
    pub id: String,
    pub filename: String,
    pub uploader_user_id: String,
    pub uploader_username: String,
    pub upload_time: DateTime<Utc>,
    pub file_type: String,
    pub chunk_count: usize,
    pub file_size_bytes: u64,
}

/// Filters for the admin user listing
#[derive(Debug, Clone, Default)]
pub struct UserFilter {
    pub search: Option<String>,
    pub is_active: Option<bool>,
    pub is_admin: Option<bool>,
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ServiceError::Internal(format!("corrupt timestamp in store: {}", e)))
}

fn parse_ts_opt(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_ts).transpose()
}

/// SQLite-backed record store
pub struct RecordStore {
    pool: SqlitePool,
}

impl RecordStore {
    /// Create tables and wrap the pool
    pub async fn initialize(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                username TEXT NOT NULL UNIQUE,
                email TEXT NOT NULL UNIQUE,
                password_hash TEXT NOT NULL,
                full_name TEXT,
                is_active INTEGER NOT NULL DEFAULT 1,
                is_admin INTEGER NOT NULL DEFAULT 0,
                must_reset INTEGER NOT NULL DEFAULT 0,
                reset_token TEXT,
                reset_token_issued_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                last_login TEXT
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                id TEXT PRIMARY KEY,
                filename TEXT NOT NULL,
                uploader_user_id TEXT NOT NULL,
                uploader_username TEXT NOT NULL,
                upload_time TEXT NOT NULL,
                file_type TEXT NOT NULL,
                chunk_count INTEGER NOT NULL,
                file_size_bytes INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        info!("Record store initialized");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn row_to_user(row: &sqlx::sqlite::SqliteRow) -> Result<User> {
        let created_at: String = row.get("created_at");
        let updated_at: String = row.get("updated_at");

        Ok(User {
            id: row.get("id"),
            username: row.get("username"),
            email: row.get("email"),
            password_hash: row.get("password_hash"),
            full_name: row.get("full_name"),
            is_active: row.get::<i64, _>("is_active") != 0,
            is_admin: row.get::<i64, _>("is_admin") != 0,
            must_reset: row.get::<i64, _>("must_reset") != 0,
            reset_token: row.get("reset_token"),
            reset_token_issued_at: parse_ts_opt(row.get("reset_token_issued_at"))?,
            created_at: parse_ts(&created_at)?,
            updated_at: parse_ts(&updated_at)?,
            last_login: parse_ts_opt(row.get("last_login"))?,
        })
    }

    /// Create a user; duplicate username or email is a conflict
    pub async fn create_user(&self, new_user: NewUser) -> Result<User> {
        let existing = sqlx::query("SELECT id FROM users WHERE username = ?1 OR email = ?2")
            .bind(&new_user.username)
            .bind(&new_user.email)
            .fetch_optional(&self.pool)
            .await?;
        if existing.is_some() {
            return Err(ServiceError::Conflict(
                "username or email already registered".to_string(),
            ));
        }

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO users
                (id, username, email, password_hash, full_name, is_active, is_admin,
                 must_reset, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, 0, ?7, ?8)
            "#,
        )
        .bind(&id)
        .bind(&new_user.username)
        .bind(&new_user.email)
        .bind(&new_user.password_hash)
        .bind(&new_user.full_name)
        .bind(new_user.is_admin as i64)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        debug!("Created user {} ({})", new_user.username, id);
        self.get_user(&id)
            .await?
            .ok_or_else(|| ServiceError::Internal("user vanished after insert".to_string()))
    }

    pub async fn get_user(&self, id: &str) -> Result<Option<User>> {
        let row = sqlx::query("SELECT * FROM users WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_user).transpose()
    }

    pub async fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
        let row = sqlx::query("SELECT * FROM users WHERE username = ?1")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_user).transpose()
    }

    pub async fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let row = sqlx::query("SELECT * FROM users WHERE email = ?1")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_user).transpose()
    }

    pub async fn any_admin_exists(&self) -> Result<bool> {
        let row = sqlx::query("SELECT EXISTS(SELECT 1 FROM users WHERE is_admin = 1) as present")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("present") != 0)
    }

    /// Update the password hash, optionally clearing the forced-reset flag
    pub async fn update_password(&self, user_id: &str, password_hash: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET password_hash = ?1, must_reset = 0, updated_at = ?2
            WHERE id = ?3
            "#,
        )
        .bind(password_hash)
        .bind(Utc::now().to_rfc3339())
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ServiceError::NotFound(format!("user {}", user_id)));
        }
        Ok(())
    }

    pub async fn set_last_login(&self, user_id: &str) -> Result<()> {
        sqlx::query("UPDATE users SET last_login = ?1 WHERE id = ?2")
            .bind(Utc::now().to_rfc3339())
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Persist a freshly minted reset token on the user
    pub async fn set_reset_token(&self, user_id: &str, token: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE users
            SET reset_token = ?1, reset_token_issued_at = ?2, updated_at = ?2
            WHERE id = ?3
            "#,
        )
        .bind(token)
        .bind(Utc::now().to_rfc3339())
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Single-use reset: one UPDATE keyed on the token value rewrites the
    /// hash and clears both reset fields, so a second attempt with the same
    /// token matches nothing.
    pub async fn consume_reset_token(&self, token: &str, password_hash: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET password_hash = ?1, reset_token = NULL, reset_token_issued_at = NULL,
                must_reset = 0, updated_at = ?2
            WHERE reset_token = ?3
            "#,
        )
        .bind(password_hash)
        .bind(Utc::now().to_rfc3339())
        .bind(token)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Flip the active flag inside an admin transaction
    pub async fn set_active_tx(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        user_id: &str,
        active: bool,
    ) -> Result<()> {
        let result = sqlx::query("UPDATE users SET is_active = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(active as i64)
            .bind(Utc::now().to_rfc3339())
            .bind(user_id)
            .execute(&mut **tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(ServiceError::NotFound(format!("user {}", user_id)));
        }
        Ok(())
    }

    /// Grant the admin role inside an admin transaction
    pub async fn set_admin_tx(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        user_id: &str,
        admin: bool,
    ) -> Result<()> {
        let result = sqlx::query("UPDATE users SET is_admin = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(admin as i64)
            .bind(Utc::now().to_rfc3339())
            .bind(user_id)
            .execute(&mut **tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(ServiceError::NotFound(format!("user {}", user_id)));
        }
        Ok(())
    }

    /// Force a temporary password inside an admin transaction
    pub async fn force_password_tx(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        user_id: &str,
        password_hash: &str,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET password_hash = ?1, must_reset = 1, reset_token = NULL,
                reset_token_issued_at = NULL, updated_at = ?2
            WHERE id = ?3
            "#,
        )
        .bind(password_hash)
        .bind(Utc::now().to_rfc3339())
        .bind(user_id)
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ServiceError::NotFound(format!("user {}", user_id)));
        }
        Ok(())
    }

    /// List users with filters and pagination; returns the page and the
    /// unpaginated total
    pub async fn list_users(
        &self,
        filter: &UserFilter,
        page: usize,
        per_page: usize,
    ) -> Result<(Vec<User>, usize)> {
        let mut conditions = Vec::new();
        let mut binds: Vec<String> = Vec::new();

        if let Some(search) = &filter.search {
            conditions.push("(username LIKE ? OR email LIKE ?)");
            let pattern = format!("%{}%", search);
            binds.push(pattern.clone());
            binds.push(pattern);
        }
        if let Some(active) = filter.is_active {
            conditions.push("is_active = ?");
            binds.push((active as i64).to_string());
        }
        if let Some(admin) = filter.is_admin {
            conditions.push("is_admin = ?");
            binds.push((admin as i64).to_string());
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let count_sql = format!("SELECT COUNT(*) as count FROM users {}", where_clause);
        let mut count_query = sqlx::query(&count_sql);
        for bind in &binds {
            count_query = count_query.bind(bind);
        }
        let total: i64 = count_query.fetch_one(&self.pool).await?.get("count");

        let page_sql = format!(
            "SELECT * FROM users {} ORDER BY created_at DESC LIMIT ? OFFSET ?",
            where_clause
        );
        let mut page_query = sqlx::query(&page_sql);
        for bind in &binds {
            page_query = page_query.bind(bind);
        }
        page_query = page_query
            .bind(per_page as i64)
            .bind(((page - 1) * per_page) as i64);

        let rows = page_query.fetch_all(&self.pool).await?;
        let users = rows
            .iter()
            .map(Self::row_to_user)
            .collect::<Result<Vec<_>>>()?;

        Ok((users, total as usize))
    }

    fn row_to_document(row: &sqlx::sqlite::SqliteRow) -> Result<DocumentRecord> {
        let upload_time: String = row.get("upload_time");
        Ok(DocumentRecord {
            id: row.get("id"),
            filename: row.get("filename"),
            uploader_user_id: row.get("uploader_user_id"),
            uploader_username: row.get("uploader_username"),
            upload_time: parse_ts(&upload_time)?,
            file_type: row.get("file_type"),
            chunk_count: row.get::<i64, _>("chunk_count") as usize,
            file_size_bytes: row.get::<i64, _>("file_size_bytes") as u64,
        })
    }

    pub async fn create_document(&self, record: &DocumentRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO documents
                (id, filename, uploader_user_id, uploader_username, upload_time,
                 file_type, chunk_count, file_size_bytes)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(&record.id)
        .bind(&record.filename)
        .bind(&record.uploader_user_id)
        .bind(&record.uploader_username)
        .bind(record.upload_time.to_rfc3339())
        .bind(&record.file_type)
        .bind(record.chunk_count as i64)
        .bind(record.file_size_bytes as i64)
        .execute(&self.pool)
        .await?;

        debug!("Created document record {}", record.id);
        Ok(())
    }

    pub async fn get_document(&self, id: &str) -> Result<Option<DocumentRecord>> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_document).transpose()
    }

    pub async fn list_documents(&self) -> Result<Vec<DocumentRecord>> {
        let rows = sqlx::query("SELECT * FROM documents ORDER BY upload_time DESC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_document).collect()
    }

    /// Delete a document record outside any admin transaction (ingest
    /// rollback path)
    pub async fn delete_document(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM documents WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete a document record inside an admin transaction
    pub async fn delete_document_tx(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        id: &str,
    ) -> Result<bool> {
        let result = sqlx::query("DELETE FROM documents WHERE id = ?1")
            .bind(id)
            .execute(&mut **tx)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
