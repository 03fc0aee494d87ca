//! Append-only activity log for admin actions
//!
//! Every admin mutation records exactly one entry, written in the same
//! transaction as its effect so the entry is visible iff the mutation
//! committed.

use crate::error::Result;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqlitePool, Row};
use std::sync::Mutex;
use tracing::info;
use utoipa::ToSchema;
use uuid::Uuid;

/// Outcome of the logged action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ActivityResult {
    Success,
    Failure,
}

impl ActivityResult {
    fn as_str(&self) -> &'static str {
        match self {
            ActivityResult::Success => "success",
            ActivityResult::Failure => "failure",
        }
    }

    fn from_str(raw: &str) -> Self {
        match raw {
            "failure" => ActivityResult::Failure,
            _ => ActivityResult::Success,
        }
    }
}

/// A recorded admin action
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ActivityEntry {
    pub id: String,
    pub admin_id: String,
    pub admin_username: String,
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    pub details: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_addr: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub result: ActivityResult,
}

/// Fields supplied by the caller when recording
#[derive(Debug, Clone)]
pub struct NewActivity {
    pub admin_id: String,
    pub admin_username: String,
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    pub details: serde_json::Value,
    pub client_addr: Option<String>,
    pub result: ActivityResult,
}

/// Filters for the audit listing
#[derive(Debug, Clone, Default)]
pub struct ActivityFilter {
    pub admin_id: Option<String>,
    pub action: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

pub struct ActivityLogger {
    pool: SqlitePool,
    /// Clamp for monotonic entry timestamps across concurrent writers
    last_ts: Mutex<DateTime<Utc>>,
}

impl ActivityLogger {
    pub async fn initialize(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS activity_log (
                id TEXT PRIMARY KEY,
                admin_id TEXT NOT NULL,
                admin_username TEXT NOT NULL,
                action TEXT NOT NULL,
                resource_type TEXT NOT NULL,
                resource_id TEXT NOT NULL,
                details TEXT NOT NULL DEFAULT '{}',
                client_addr TEXT,
                timestamp TEXT NOT NULL,
                result TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_activity_timestamp ON activity_log(timestamp)",
        )
        .execute(&pool)
        .await?;

        info!("Activity log initialized");
        Ok(Self {
            pool,
            last_ts: Mutex::new(DateTime::<Utc>::MIN_UTC),
        })
    }

    /// Next strictly increasing timestamp
    fn next_ts(&self) -> DateTime<Utc> {
        let mut guard = self.last_ts.lock().expect("activity clock poisoned");
        let mut now = Utc::now();
        if now <= *guard {
            now = *guard + Duration::microseconds(1);
        }
        *guard = now;
        now
    }

    /// Record inside the caller's transaction; the entry commits with the
    /// admin effect or not at all.
    pub async fn record_tx(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        entry: NewActivity,
    ) -> Result<ActivityEntry> {
        let id = Uuid::new_v4().to_string();
        let ts = self.next_ts();

        sqlx::query(
            r#"
            INSERT INTO activity_log
                (id, admin_id, admin_username, action, resource_type, resource_id,
                 details, client_addr, timestamp, result)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(&id)
        .bind(&entry.admin_id)
        .bind(&entry.admin_username)
        .bind(&entry.action)
        .bind(&entry.resource_type)
        .bind(&entry.resource_id)
        .bind(entry.details.to_string())
        .bind(&entry.client_addr)
        .bind(ts.to_rfc3339_opts(SecondsFormat::Micros, true))
        .bind(entry.result.as_str())
        .execute(&mut **tx)
        .await?;

        Ok(ActivityEntry {
            id,
            admin_id: entry.admin_id,
            admin_username: entry.admin_username,
            action: entry.action,
            resource_type: entry.resource_type,
            resource_id: entry.resource_id,
            details: entry.details,
            client_addr: entry.client_addr,
            timestamp: ts,
            result: entry.result,
        })
    }

    /// Record a standalone entry, e.g. a failed mutation whose effect never
    /// started a transaction
    pub async fn record(&self, entry: NewActivity) -> Result<ActivityEntry> {
        let mut tx = self.pool.begin().await?;
        let recorded = self.record_tx(&mut tx, entry).await?;
        tx.commit().await?;
        Ok(recorded)
    }

    fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> Result<ActivityEntry> {
        let timestamp: String = row.get("timestamp");
        let details: String = row.get("details");
        let result: String = row.get("result");

        Ok(ActivityEntry {
            id: row.get("id"),
            admin_id: row.get("admin_id"),
            admin_username: row.get("admin_username"),
            action: row.get("action"),
            resource_type: row.get("resource_type"),
            resource_id: row.get("resource_id"),
            details: serde_json::from_str(&details).unwrap_or(serde_json::Value::Null),
            client_addr: row.get("client_addr"),
            timestamp: DateTime::parse_from_rfc3339(&timestamp)
                .map_err(|e| {
                    crate::error::ServiceError::Internal(format!("corrupt timestamp: {}", e))
                })?
                .with_timezone(&Utc),
            result: ActivityResult::from_str(&result),
        })
    }

    /// Filtered listing, newest first, with the unpaginated total
    pub async fn list(
        &self,
        filter: &ActivityFilter,
        page: usize,
        per_page: usize,
    ) -> Result<(Vec<ActivityEntry>, usize)> {
        let mut conditions = Vec::new();
        let mut binds: Vec<String> = Vec::new();

        if let Some(admin_id) = &filter.admin_id {
            conditions.push("admin_id = ?");
            binds.push(admin_id.clone());
        }
        if let Some(action) = &filter.action {
            conditions.push("action = ?");
            binds.push(action.clone());
        }
        if let Some(since) = filter.since {
            conditions.push("timestamp >= ?");
            binds.push(since.to_rfc3339_opts(SecondsFormat::Micros, true));
        }
        if let Some(until) = filter.until {
            conditions.push("timestamp <= ?");
            binds.push(until.to_rfc3339_opts(SecondsFormat::Micros, true));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let count_sql = format!("SELECT COUNT(*) as count FROM activity_log {}", where_clause);
        let mut count_query = sqlx::query(&count_sql);
        for bind in &binds {
            count_query = count_query.bind(bind);
        }
        let total: i64 = count_query.fetch_one(&self.pool).await?.get("count");

        let page_sql = format!(
            "SELECT * FROM activity_log {} ORDER BY timestamp DESC LIMIT ? OFFSET ?",
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
        let entries = rows
            .iter()
            .map(Self::row_to_entry)
            .collect::<Result<Vec<_>>>()?;

        Ok((entries, total as usize))
    }

    /// Entries concerning a user: actions they performed as admin plus
    /// actions targeting their account
    pub async fn list_for_user(&self, user_id: &str, limit: usize) -> Result<Vec<ActivityEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM activity_log
            WHERE admin_id = ?1 OR (resource_type = 'user' AND resource_id = ?1)
            ORDER BY timestamp DESC LIMIT ?2
            "#,
        )
        .bind(user_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_entry).collect()
    }

    pub async fn count_for_action(&self, action: &str) -> Result<usize> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM activity_log WHERE action = ?1")
            .bind(action)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("count") as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_logger() -> ActivityLogger {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        ActivityLogger::initialize(pool).await.unwrap()
    }

    fn entry(action: &str, resource_id: &str) -> NewActivity {
        NewActivity {
            admin_id: "admin-1".to_string(),
            admin_username: "root".to_string(),
            action: action.to_string(),
            resource_type: "config".to_string(),
            resource_id: resource_id.to_string(),
            details: serde_json::json!({"old": 800, "new": 1000}),
            client_addr: Some("127.0.0.1".to_string()),
            result: ActivityResult::Success,
        }
    }

    #[tokio::test]
    async fn test_record_and_list() {
        let logger = test_logger().await;
        logger.record(entry("config_update", "chunk_size")).await.unwrap();
        logger.record(entry("config_update", "top_k")).await.unwrap();

        let (entries, total) = logger
            .list(&ActivityFilter::default(), 1, 50)
            .await
            .unwrap();
        assert_eq!(total, 2);
        // Newest first
        assert_eq!(entries[0].resource_id, "top_k");
        assert_eq!(entries[0].details["new"], 1000);
        assert_eq!(entries[0].result, ActivityResult::Success);
    }

    #[tokio::test]
    async fn test_entry_invisible_until_commit() {
        let logger = test_logger().await;

        let mut tx = logger.pool.begin().await.unwrap();
        logger
            .record_tx(&mut tx, entry("user_status", "u1"))
            .await
            .unwrap();
        tx.rollback().await.unwrap();

        let (entries, _) = logger
            .list(&ActivityFilter::default(), 1, 50)
            .await
            .unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn test_monotonic_timestamps() {
        let logger = test_logger().await;
        for i in 0..5 {
            logger
                .record(entry("config_update", &format!("setting{}", i)))
                .await
                .unwrap();
        }

        let (entries, _) = logger
            .list(&ActivityFilter::default(), 1, 50)
            .await
            .unwrap();
        // Listed newest first; timestamps strictly decrease down the page
        for pair in entries.windows(2) {
            assert!(pair[0].timestamp > pair[1].timestamp);
        }
    }

    #[tokio::test]
    async fn test_filter_by_action_and_range() {
        let logger = test_logger().await;
        logger.record(entry("config_update", "chunk_size")).await.unwrap();
        let mut other = entry("document_delete", "doc_1");
        other.admin_id = "admin-2".to_string();
        logger.record(other).await.unwrap();

        let filter = ActivityFilter {
            action: Some("document_delete".to_string()),
            ..Default::default()
        };
        let (entries, total) = logger.list(&filter, 1, 50).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(entries[0].action, "document_delete");

        let filter = ActivityFilter {
            until: Some(Utc::now() - Duration::days(1)),
            ..Default::default()
        };
        let (_, total) = logger.list(&filter, 1, 50).await.unwrap();
        assert_eq!(total, 0);
    }

    #[tokio::test]
    async fn test_list_for_user_includes_both_directions() {
        let logger = test_logger().await;

        // admin-1 acts on a config
        logger.record(entry("config_update", "top_k")).await.unwrap();

        // admin-2 acts on admin-1's account
        let mut on_user = entry("user_status", "admin-1");
        on_user.admin_id = "admin-2".to_string();
        on_user.resource_type = "user".to_string();
        logger.record(on_user).await.unwrap();

        let entries = logger.list_for_user("admin-1", 50).await.unwrap();
        assert_eq!(entries.len(), 2);
    }
}
