//! Request metrics collection
//!
//! Every handled request leaves one sample: endpoint, method, status and
//! latency, plus the user and error text when known. Samples back the admin
//! monitoring endpoints; retention is an operational concern, not enforced
//! here.

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{sqlite::SqlitePool, Row};
use tracing::info;
use utoipa::ToSchema;

/// One request sample
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct MetricSample {
    pub endpoint: String,
    pub method: String,
    pub status: u16,
    pub elapsed_ms: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-endpoint aggregate for the usage report
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct EndpointUsage {
    pub endpoint: String,
    pub method: String,
    pub requests: usize,
    pub avg_elapsed_ms: f64,
    pub errors: usize,
}

/// Filters for the request log listing
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    /// "error" restricts to failed requests; anything else means all
    pub severity: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

pub struct MetricsSink {
    pool: SqlitePool,
}

impl MetricsSink {
    pub async fn initialize(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS metrics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                endpoint TEXT NOT NULL,
                method TEXT NOT NULL,
                status INTEGER NOT NULL,
                elapsed_ms INTEGER NOT NULL,
                timestamp TEXT NOT NULL,
                user_id TEXT,
                error TEXT
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_metrics_timestamp ON metrics(timestamp)")
            .execute(&pool)
            .await?;

        info!("Metrics sink initialized");
        Ok(Self { pool })
    }

    pub async fn record(&self, sample: MetricSample) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO metrics (endpoint, method, status, elapsed_ms, timestamp, user_id, error)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&sample.endpoint)
        .bind(&sample.method)
        .bind(sample.status as i64)
        .bind(sample.elapsed_ms as i64)
        .bind(sample.timestamp.to_rfc3339())
        .bind(&sample.user_id)
        .bind(&sample.error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn row_to_sample(row: &sqlx::sqlite::SqliteRow) -> Result<MetricSample> {
        let timestamp: String = row.get("timestamp");
        Ok(MetricSample {
            endpoint: row.get("endpoint"),
            method: row.get("method"),
            status: row.get::<i64, _>("status") as u16,
            elapsed_ms: row.get::<i64, _>("elapsed_ms") as u64,
            timestamp: DateTime::parse_from_rfc3339(&timestamp)
                .map_err(|e| {
                    crate::error::ServiceError::Internal(format!("corrupt timestamp: {}", e))
                })?
                .with_timezone(&Utc),
            user_id: row.get("user_id"),
            error: row.get("error"),
        })
    }

    /// Per-endpoint usage over the trailing window
    pub async fn api_usage(&self, hours: i64) -> Result<Vec<EndpointUsage>> {
        let since = (Utc::now() - chrono::Duration::hours(hours)).to_rfc3339();
        let rows = sqlx::query(
            r#"
            SELECT endpoint, method,
                   COUNT(*) as requests,
                   AVG(elapsed_ms) as avg_ms,
                   SUM(CASE WHEN status >= 400 THEN 1 ELSE 0 END) as errors
            FROM metrics
            WHERE timestamp >= ?1
            GROUP BY endpoint, method
            ORDER BY requests DESC
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| EndpointUsage {
                endpoint: row.get("endpoint"),
                method: row.get("method"),
                requests: row.get::<i64, _>("requests") as usize,
                avg_elapsed_ms: row.get::<Option<f64>, _>("avg_ms").unwrap_or(0.0),
                errors: row.get::<i64, _>("errors") as usize,
            })
            .collect())
    }

    /// Request log with severity and date-range filters, newest first
    pub async fn logs(
        &self,
        filter: &LogFilter,
        page: usize,
        per_page: usize,
    ) -> Result<(Vec<MetricSample>, usize)> {
        let mut conditions = Vec::new();
        let mut binds: Vec<String> = Vec::new();

        if filter.severity.as_deref() == Some("error") {
            conditions.push("(status >= 400 OR error IS NOT NULL)");
        }
        if let Some(since) = filter.since {
            conditions.push("timestamp >= ?");
            binds.push(since.to_rfc3339());
        }
        if let Some(until) = filter.until {
            conditions.push("timestamp <= ?");
            binds.push(until.to_rfc3339());
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let count_sql = format!("SELECT COUNT(*) as count FROM metrics {}", where_clause);
        let mut count_query = sqlx::query(&count_sql);
        for bind in &binds {
            count_query = count_query.bind(bind);
        }
        let total: i64 = count_query.fetch_one(&self.pool).await?.get("count");

        let page_sql = format!(
            "SELECT * FROM metrics {} ORDER BY timestamp DESC, id DESC LIMIT ? OFFSET ?",
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
        let samples = rows
            .iter()
            .map(Self::row_to_sample)
            .collect::<Result<Vec<_>>>()?;

        Ok((samples, total as usize))
    }

    /// Totals for the system metrics endpoint
    pub async fn totals(&self, hours: i64) -> Result<(usize, usize, f64)> {
        let since = (Utc::now() - chrono::Duration::hours(hours)).to_rfc3339();
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) as requests,
                   SUM(CASE WHEN status >= 400 THEN 1 ELSE 0 END) as errors,
                   AVG(elapsed_ms) as avg_ms
            FROM metrics WHERE timestamp >= ?1
            "#,
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        Ok((
            row.get::<i64, _>("requests") as usize,
            row.get::<Option<i64>, _>("errors").unwrap_or(0) as usize,
            row.get::<Option<f64>, _>("avg_ms").unwrap_or(0.0),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_sink() -> MetricsSink {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        MetricsSink::initialize(pool).await.unwrap()
    }

    fn sample(endpoint: &str, status: u16, elapsed_ms: u64) -> MetricSample {
        MetricSample {
            endpoint: endpoint.to_string(),
            method: "POST".to_string(),
            status,
            elapsed_ms,
            timestamp: Utc::now(),
            user_id: Some("u1".to_string()),
            error: if status >= 400 {
                Some("boom".to_string())
            } else {
                None
            },
        }
    }

    #[tokio::test]
    async fn test_api_usage_aggregates() {
        let sink = test_sink().await;
        sink.record(sample("/api/v1/chat", 200, 120)).await.unwrap();
        sink.record(sample("/api/v1/chat", 200, 80)).await.unwrap();
        sink.record(sample("/api/v1/chat", 503, 40)).await.unwrap();
        sink.record(sample("/api/v1/health", 200, 2)).await.unwrap();

        let usage = sink.api_usage(1).await.unwrap();
        assert_eq!(usage.len(), 2);

        let chat = usage.iter().find(|u| u.endpoint == "/api/v1/chat").unwrap();
        assert_eq!(chat.requests, 3);
        assert_eq!(chat.errors, 1);
        assert!((chat.avg_elapsed_ms - 80.0).abs() < 1.0);
    }

    #[tokio::test]
    async fn test_logs_severity_filter() {
        let sink = test_sink().await;
        sink.record(sample("/api/v1/chat", 200, 10)).await.unwrap();
        sink.record(sample("/api/v1/chat", 500, 10)).await.unwrap();
        sink.record(sample("/api/v1/auth/login", 401, 5)).await.unwrap();

        let (all, total) = sink.logs(&LogFilter::default(), 1, 50).await.unwrap();
        assert_eq!(total, 3);
        assert_eq!(all.len(), 3);

        let filter = LogFilter {
            severity: Some("error".to_string()),
            ..Default::default()
        };
        let (errors, total) = sink.logs(&filter, 1, 50).await.unwrap();
        assert_eq!(total, 2);
        assert!(errors.iter().all(|s| s.status >= 400));
    }

    #[tokio::test]
    async fn test_logs_date_range() {
        let sink = test_sink().await;
        sink.record(sample("/api/v1/chat", 200, 10)).await.unwrap();

        let filter = LogFilter {
            until: Some(Utc::now() - chrono::Duration::hours(1)),
            ..Default::default()
        };
        let (_, total) = sink.logs(&filter, 1, 50).await.unwrap();
        assert_eq!(total, 0);
    }

    #[tokio::test]
    async fn test_totals() {
        let sink = test_sink().await;
        sink.record(sample("/api/v1/chat", 200, 100)).await.unwrap();
        sink.record(sample("/api/v1/chat", 500, 200)).await.unwrap();

        let (requests, errors, avg_ms) = sink.totals(24).await.unwrap();
        assert_eq!(requests, 2);
        assert_eq!(errors, 1);
        assert!((avg_ms - 150.0).abs() < 1.0);
    }
}
