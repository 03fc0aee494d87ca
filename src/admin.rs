//! Administrative services: user lifecycle, document oversight, monitoring,
//! analytics and dynamic configuration
//!
//! Every mutation here runs its effect and its activity entry in one
//! transaction, so the audit trail shows exactly the mutations that
//! committed.

use crate::activity::{ActivityEntry, ActivityFilter, ActivityLogger, ActivityResult, NewActivity};
use crate::auth::AuthService;
use crate::error::{Result, ServiceError};
use crate::index::{IndexStats, VectorIndex};
use crate::metrics::{EndpointUsage, LogFilter, MetricSample, MetricsSink};
use crate::sessions::SessionStore;
use crate::settings::{SettingsStore, SettingView};
use crate::store::{DocumentRecord, RecordStore, User, UserFilter, UserView};
use chrono::Utc;
use serde::Serialize;
use sqlx::Row;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;
use utoipa::ToSchema;

/// Identity and origin of the acting admin, threaded into every audit entry
#[derive(Debug, Clone)]
pub struct AdminContext {
    pub admin_id: String,
    pub admin_username: String,
    pub client_addr: Option<String>,
}

impl AdminContext {
    pub fn for_admin(user: &User, client_addr: Option<String>) -> Self {
        Self {
            admin_id: user.id.clone(),
            admin_username: user.username.clone(),
            client_addr,
        }
    }

    fn entry(
        &self,
        action: &str,
        resource_type: &str,
        resource_id: &str,
        details: serde_json::Value,
    ) -> NewActivity {
        NewActivity {
            admin_id: self.admin_id.clone(),
            admin_username: self.admin_username.clone(),
            action: action.to_string(),
            resource_type: resource_type.to_string(),
            resource_id: resource_id.to_string(),
            details,
            client_addr: self.client_addr.clone(),
            result: ActivityResult::Success,
        }
    }
}

/// System-wide counters for the monitoring endpoint
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SystemMetrics {
    pub total_users: usize,
    pub active_users: usize,
    pub total_documents: usize,
    pub total_chunks: usize,
    pub total_sessions: usize,
    pub total_messages: usize,
    pub requests_24h: usize,
    pub errors_24h: usize,
    pub avg_latency_ms_24h: f64,
}

/// Storage footprint summary
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct StorageStats {
    pub document_bytes: u64,
    pub document_count: usize,
    pub chunk_count: usize,
    pub message_count: usize,
    pub activity_entries: usize,
    pub metric_samples: usize,
}

/// A day bucket used across analytics responses
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct DailyCount {
    pub date: String,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct UserAnalytics {
    pub window_days: i64,
    pub total_users: usize,
    pub active_users: usize,
    pub new_registrations: usize,
    pub registrations_per_day: Vec<DailyCount>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SessionAnalytics {
    pub total_sessions: usize,
    pub total_messages: usize,
    pub avg_messages_per_session: f64,
    pub sessions_per_day: Vec<DailyCount>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct DocumentAnalytics {
    pub total_documents: usize,
    pub total_chunks: usize,
    pub documents_by_type: HashMap<String, usize>,
    pub uploads_per_day: Vec<DailyCount>,
}

/// Administrative operations facade
pub struct AdminService {
    store: Arc<RecordStore>,
    sessions: Arc<SessionStore>,
    index: Arc<dyn VectorIndex>,
    activity: Arc<ActivityLogger>,
    metrics: Arc<MetricsSink>,
    settings: Arc<SettingsStore>,
}

impl AdminService {
    pub fn new(
        store: Arc<RecordStore>,
        sessions: Arc<SessionStore>,
        index: Arc<dyn VectorIndex>,
        activity: Arc<ActivityLogger>,
        metrics: Arc<MetricsSink>,
        settings: Arc<SettingsStore>,
    ) -> Self {
        Self {
            store,
            sessions,
            index,
            activity,
            metrics,
            settings,
        }
    }

    // ----- users -----

    pub async fn list_users(
        &self,
        filter: &UserFilter,
        page: usize,
        per_page: usize,
    ) -> Result<(Vec<UserView>, usize)> {
        let (users, total) = self.store.list_users(filter, page, per_page).await?;
        Ok((users.iter().map(UserView::from).collect(), total))
    }

    pub async fn get_user(&self, user_id: &str) -> Result<UserView> {
        let user = self
            .store
            .get_user(user_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("user {}", user_id)))?;
        Ok(UserView::from(&user))
    }

    /// Flip a user's active flag; audited
    pub async fn set_user_status(
        &self,
        ctx: &AdminContext,
        user_id: &str,
        active: bool,
    ) -> Result<UserView> {
        if user_id == ctx.admin_id && !active {
            return Err(ServiceError::Validation(
                "admins cannot deactivate their own account".to_string(),
            ));
        }

        let before = self
            .store
            .get_user(user_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("user {}", user_id)))?;

        let mut tx = self.store.pool().begin().await?;
        self.store.set_active_tx(&mut tx, user_id, active).await?;
        self.activity
            .record_tx(
                &mut tx,
                ctx.entry(
                    "user_status_update",
                    "user",
                    user_id,
                    serde_json::json!({
                        "username": before.username,
                        "old": before.is_active,
                        "new": active,
                    }),
                ),
            )
            .await?;
        tx.commit().await?;

        info!(
            "Admin {} set user {} active={}",
            ctx.admin_username, before.username, active
        );
        self.get_user(user_id).await
    }

    /// Force-generate a temporary password; returned exactly once
    pub async fn force_reset_password(
        &self,
        ctx: &AdminContext,
        user_id: &str,
    ) -> Result<String> {
        let user = self
            .store
            .get_user(user_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("user {}", user_id)))?;

        let temp_password = AuthService::generate_temp_password();
        let hash = AuthService::hash_password(&temp_password)?;

        let mut tx = self.store.pool().begin().await?;
        self.store.force_password_tx(&mut tx, user_id, &hash).await?;
        self.activity
            .record_tx(
                &mut tx,
                ctx.entry(
                    "user_password_reset",
                    "user",
                    user_id,
                    serde_json::json!({
                        "username": user.username,
                        "must_reset": true,
                    }),
                ),
            )
            .await?;
        tx.commit().await?;

        info!(
            "Admin {} forced a password reset for {}",
            ctx.admin_username, user.username
        );
        Ok(temp_password)
    }

    /// Grant the admin role; audited
    pub async fn promote_user(&self, ctx: &AdminContext, user_id: &str) -> Result<UserView> {
        let user = self
            .store
            .get_user(user_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("user {}", user_id)))?;

        if user.is_admin {
            return Err(ServiceError::Validation(format!(
                "{} is already an admin",
                user.username
            )));
        }

        let mut tx = self.store.pool().begin().await?;
        self.store.set_admin_tx(&mut tx, user_id, true).await?;
        self.activity
            .record_tx(
                &mut tx,
                ctx.entry(
                    "user_promote",
                    "user",
                    user_id,
                    serde_json::json!({ "username": user.username }),
                ),
            )
            .await?;
        tx.commit().await?;

        info!("Admin {} promoted {}", ctx.admin_username, user.username);
        self.get_user(user_id).await
    }

    pub async fn user_activity(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<ActivityEntry>> {
        if self.store.get_user(user_id).await?.is_none() {
            return Err(ServiceError::NotFound(format!("user {}", user_id)));
        }
        self.activity.list_for_user(user_id, limit).await
    }

    // ----- documents -----

    pub async fn list_documents(&self) -> Result<Vec<DocumentRecord>> {
        self.store.list_documents().await
    }

    /// Delete a document's chunks, then its record and audit entry in one
    /// transaction.
    ///
    /// The index sweep runs first: if it fails, the record is untouched and
    /// the whole delete can be retried. The record deletion and the audit
    /// entry commit atomically once the chunks are gone.
    pub async fn delete_document(
        &self,
        ctx: &AdminContext,
        document_id: &str,
    ) -> Result<usize> {
        let record = self
            .store
            .get_document(document_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("document {}", document_id)))?;

        let removed = self.index.delete_by_document(document_id).await?;

        let mut tx = self.store.pool().begin().await?;
        self.store.delete_document_tx(&mut tx, document_id).await?;
        self.activity
            .record_tx(
                &mut tx,
                ctx.entry(
                    "document_delete",
                    "document",
                    document_id,
                    serde_json::json!({
                        "filename": record.filename,
                        "chunk_count": record.chunk_count,
                        "uploader": record.uploader_username,
                    }),
                ),
            )
            .await?;
        tx.commit().await?;

        info!(
            "Admin {} deleted document {} ({} chunks)",
            ctx.admin_username, document_id, removed
        );
        Ok(removed)
    }

    pub async fn document_stats(&self) -> Result<IndexStats> {
        self.index.stats().await
    }

    // ----- monitoring -----

    pub async fn system_metrics(&self) -> Result<SystemMetrics> {
        let pool = self.store.pool();

        let user_row =
            sqlx::query("SELECT COUNT(*) as total, SUM(is_active) as active FROM users")
                .fetch_one(pool)
                .await?;
        let doc_row = sqlx::query("SELECT COUNT(*) as count FROM documents")
            .fetch_one(pool)
            .await?;

        let index_stats = self.index.stats().await?;
        let (requests, errors, avg_latency) = self.metrics.totals(24).await?;

        Ok(SystemMetrics {
            total_users: user_row.get::<i64, _>("total") as usize,
            active_users: user_row.get::<Option<i64>, _>("active").unwrap_or(0) as usize,
            total_documents: doc_row.get::<i64, _>("count") as usize,
            total_chunks: index_stats.total_chunks,
            total_sessions: self.sessions.count_sessions().await?,
            total_messages: self.sessions.count_messages().await?,
            requests_24h: requests,
            errors_24h: errors,
            avg_latency_ms_24h: avg_latency,
        })
    }

    pub async fn storage_stats(&self) -> Result<StorageStats> {
        let pool = self.store.pool();

        let doc_row = sqlx::query(
            "SELECT COUNT(*) as count, COALESCE(SUM(file_size_bytes), 0) as bytes FROM documents",
        )
        .fetch_one(pool)
        .await?;
        let activity_row = sqlx::query("SELECT COUNT(*) as count FROM activity_log")
            .fetch_one(pool)
            .await?;
        let metrics_row = sqlx::query("SELECT COUNT(*) as count FROM metrics")
            .fetch_one(pool)
            .await?;

        let index_stats = self.index.stats().await?;

        Ok(StorageStats {
            document_bytes: doc_row.get::<i64, _>("bytes") as u64,
            document_count: doc_row.get::<i64, _>("count") as usize,
            chunk_count: index_stats.total_chunks,
            message_count: self.sessions.count_messages().await?,
            activity_entries: activity_row.get::<i64, _>("count") as usize,
            metric_samples: metrics_row.get::<i64, _>("count") as usize,
        })
    }

    pub async fn api_usage(&self, hours: i64) -> Result<Vec<EndpointUsage>> {
        if !(1..=168).contains(&hours) {
            return Err(ServiceError::Validation(
                "hours must be between 1 and 168".to_string(),
            ));
        }
        self.metrics.api_usage(hours).await
    }

    pub async fn logs(
        &self,
        filter: &LogFilter,
        page: usize,
        per_page: usize,
    ) -> Result<(Vec<MetricSample>, usize)> {
        self.metrics.logs(filter, page, per_page).await
    }

    pub async fn activity_log(
        &self,
        filter: &ActivityFilter,
        page: usize,
        per_page: usize,
    ) -> Result<(Vec<ActivityEntry>, usize)> {
        self.activity.list(filter, page, per_page).await
    }

    // ----- analytics -----

    pub async fn user_analytics(&self, days: i64) -> Result<UserAnalytics> {
        if !(1..=365).contains(&days) {
            return Err(ServiceError::Validation(
                "days must be between 1 and 365".to_string(),
            ));
        }

        let pool = self.store.pool();
        let cutoff = (Utc::now() - chrono::Duration::days(days)).to_rfc3339();

        let totals = sqlx::query(
            r#"
            SELECT COUNT(*) as total,
                   SUM(CASE WHEN last_login >= ?1 THEN 1 ELSE 0 END) as active,
                   SUM(CASE WHEN created_at >= ?1 THEN 1 ELSE 0 END) as new_users
            FROM users
            "#,
        )
        .bind(&cutoff)
        .fetch_one(pool)
        .await?;

        let per_day = sqlx::query(
            r#"
            SELECT substr(created_at, 1, 10) as day, COUNT(*) as count
            FROM users WHERE created_at >= ?1
            GROUP BY day ORDER BY day DESC
            "#,
        )
        .bind(&cutoff)
        .fetch_all(pool)
        .await?;

        Ok(UserAnalytics {
            window_days: days,
            total_users: totals.get::<i64, _>("total") as usize,
            active_users: totals.get::<Option<i64>, _>("active").unwrap_or(0) as usize,
            new_registrations: totals.get::<Option<i64>, _>("new_users").unwrap_or(0) as usize,
            registrations_per_day: per_day
                .iter()
                .map(|row| DailyCount {
                    date: row.get("day"),
                    count: row.get::<i64, _>("count") as usize,
                })
                .collect(),
        })
    }

    pub async fn session_analytics(&self) -> Result<SessionAnalytics> {
        let pool = self.store.pool();
        let total_sessions = self.sessions.count_sessions().await?;
        let total_messages = self.sessions.count_messages().await?;

        let cutoff = (Utc::now() - chrono::Duration::days(14)).to_rfc3339();
        let per_day = sqlx::query(
            r#"
            SELECT substr(created_at, 1, 10) as day, COUNT(*) as count
            FROM sessions WHERE created_at >= ?1
            GROUP BY day ORDER BY day DESC
            "#,
        )
        .bind(&cutoff)
        .fetch_all(pool)
        .await?;

        let avg = if total_sessions == 0 {
            0.0
        } else {
            total_messages as f64 / total_sessions as f64
        };

        Ok(SessionAnalytics {
            total_sessions,
            total_messages,
            avg_messages_per_session: avg,
            sessions_per_day: per_day
                .iter()
                .map(|row| DailyCount {
                    date: row.get("day"),
                    count: row.get::<i64, _>("count") as usize,
                })
                .collect(),
        })
    }

    pub async fn document_analytics(&self) -> Result<DocumentAnalytics> {
        let pool = self.store.pool();

        let totals = sqlx::query(
            "SELECT COUNT(*) as count, COALESCE(SUM(chunk_count), 0) as chunks FROM documents",
        )
        .fetch_one(pool)
        .await?;

        let by_type = sqlx::query(
            "SELECT file_type, COUNT(*) as count FROM documents GROUP BY file_type",
        )
        .fetch_all(pool)
        .await?;

        let cutoff = (Utc::now() - chrono::Duration::days(14)).to_rfc3339();
        let per_day = sqlx::query(
            r#"
            SELECT substr(upload_time, 1, 10) as day, COUNT(*) as count
            FROM documents WHERE upload_time >= ?1
            GROUP BY day ORDER BY day DESC
            "#,
        )
        .bind(&cutoff)
        .fetch_all(pool)
        .await?;

        Ok(DocumentAnalytics {
            total_documents: totals.get::<i64, _>("count") as usize,
            total_chunks: totals.get::<i64, _>("chunks") as usize,
            documents_by_type: by_type
                .iter()
                .map(|row| {
                    (
                        row.get::<String, _>("file_type"),
                        row.get::<i64, _>("count") as usize,
                    )
                })
                .collect(),
            uploads_per_day: per_day
                .iter()
                .map(|row| DailyCount {
                    date: row.get("day"),
                    count: row.get::<i64, _>("count") as usize,
                })
                .collect(),
        })
    }

    // ----- configuration -----

    pub async fn list_config(&self) -> Result<Vec<SettingView>> {
        self.settings.list().await
    }

    pub async fn get_config(&self, name: &str) -> Result<SettingView> {
        self.settings.get_view(name).await
    }

    /// Validate, persist and audit a config update. A repeated update with
    /// the same value is a no-op on the stored value but still emits an
    /// entry per call.
    pub async fn update_config(
        &self,
        ctx: &AdminContext,
        name: &str,
        value: &serde_json::Value,
    ) -> Result<SettingView> {
        let mut tx = self.store.pool().begin().await?;
        let update = self.settings.update_tx(&mut tx, name, value, &ctx.admin_username).await?;
        self.activity
            .record_tx(
                &mut tx,
                ctx.entry(
                    "config_update",
                    "config",
                    name,
                    serde_json::json!({
                        "old": update.old.to_json(),
                        "new": update.new.to_json(),
                    }),
                ),
            )
            .await?;
        tx.commit().await?;

        // Readers pick the new value up on their next snapshot
        self.settings.refresh().await?;

        info!(
            "Admin {} updated setting {}: {} -> {}",
            ctx.admin_username,
            name,
            update.old.render(),
            update.new.render()
        );
        self.settings.get_view(name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::SqliteVectorIndex;
    use crate::store::NewUser;
    use sqlx::sqlite::SqlitePool;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Harness {
        admin: AdminService,
        store: Arc<RecordStore>,
        activity: Arc<ActivityLogger>,
        index: Arc<SqliteVectorIndex>,
        settings: Arc<SettingsStore>,
    }

    async fn harness() -> Harness {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let store = Arc::new(RecordStore::initialize(pool.clone()).await.unwrap());
        let sessions = Arc::new(SessionStore::initialize(pool.clone()).await.unwrap());
        let index = Arc::new(SqliteVectorIndex::initialize(pool.clone()).await.unwrap());
        let activity = Arc::new(ActivityLogger::initialize(pool.clone()).await.unwrap());
        let metrics = Arc::new(MetricsSink::initialize(pool.clone()).await.unwrap());
        let settings = Arc::new(SettingsStore::initialize(pool).await.unwrap());

        let admin = AdminService::new(
            store.clone(),
            sessions,
            index.clone(),
            activity.clone(),
            metrics,
            settings.clone(),
        );

        Harness {
            admin,
            store,
            activity,
            index,
            settings,
        }
    }

    async fn seeded_user(store: &RecordStore, username: &str, admin: bool) -> User {
        store
            .create_user(NewUser {
                username: username.to_string(),
                email: format!("{}@example.com", username),
                password_hash: "$argon2id$fake".to_string(),
                full_name: None,
                is_admin: admin,
            })
            .await
            .unwrap()
    }

    fn ctx(admin: &User) -> AdminContext {
        AdminContext::for_admin(admin, Some("127.0.0.1".to_string()))
    }

    #[tokio::test]
    async fn test_status_update_emits_exactly_one_entry() {
        let h = harness().await;
        let root = seeded_user(&h.store, "root", true).await;
        let target = seeded_user(&h.store, "alice", false).await;

        let view = h
            .admin
            .set_user_status(&ctx(&root), &target.id, false)
            .await
            .unwrap();
        assert!(!view.is_active);

        let (entries, total) = h
            .activity
            .list(&ActivityFilter::default(), 1, 50)
            .await
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(entries[0].action, "user_status_update");
        assert_eq!(entries[0].resource_id, target.id);
        assert_eq!(entries[0].details["old"], true);
        assert_eq!(entries[0].details["new"], false);
        assert_eq!(entries[0].client_addr.as_deref(), Some("127.0.0.1"));
    }

    #[tokio::test]
    async fn test_failed_mutation_leaves_no_entry() {
        let h = harness().await;
        let root = seeded_user(&h.store, "root", true).await;

        let missing = h
            .admin
            .set_user_status(&ctx(&root), "no-such-user", false)
            .await;
        assert!(matches!(missing, Err(ServiceError::NotFound(_))));

        let (_, total) = h
            .activity
            .list(&ActivityFilter::default(), 1, 50)
            .await
            .unwrap();
        assert_eq!(total, 0);
    }

    #[tokio::test]
    async fn test_admin_cannot_deactivate_self() {
        let h = harness().await;
        let root = seeded_user(&h.store, "root", true).await;

        let result = h.admin.set_user_status(&ctx(&root), &root.id, false).await;
        assert!(matches!(result, Err(ServiceError::Validation(_))));
    }

    #[tokio::test]
    async fn test_force_reset_password_shape_and_flag() {
        let h = harness().await;
        let root = seeded_user(&h.store, "root", true).await;
        let target = seeded_user(&h.store, "alice", false).await;

        let temp = h
            .admin
            .force_reset_password(&ctx(&root), &target.id)
            .await
            .unwrap();
        assert_eq!(temp.len(), 12);
        assert!(temp.chars().any(|c| c.is_ascii_uppercase()));
        assert!(temp.chars().any(|c| c.is_ascii_lowercase()));
        assert!(temp.chars().any(|c| c.is_ascii_digit()));
        assert!(temp.chars().any(|c| !c.is_ascii_alphanumeric()));

        let reloaded = h.store.get_user(&target.id).await.unwrap().unwrap();
        assert!(reloaded.must_reset);
        assert!(AuthService::verify_password(&temp, &reloaded.password_hash));

        assert_eq!(
            h.activity.count_for_action("user_password_reset").await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_promotion_audited() {
        let h = harness().await;
        let root = seeded_user(&h.store, "root", true).await;
        let target = seeded_user(&h.store, "alice", false).await;

        let view = h.admin.promote_user(&ctx(&root), &target.id).await.unwrap();
        assert!(view.is_admin);

        let repeat = h.admin.promote_user(&ctx(&root), &target.id).await;
        assert!(matches!(repeat, Err(ServiceError::Validation(_))));

        assert_eq!(h.activity.count_for_action("user_promote").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_document_delete_removes_chunks_and_audits() {
        let h = harness().await;
        let root = seeded_user(&h.store, "root", true).await;

        let record = DocumentRecord {
            id: "doc_1".to_string(),
            filename: "q4.txt".to_string(),
            uploader_user_id: "u1".to_string(),
            uploader_username: "alice".to_string(),
            upload_time: Utc::now(),
            file_type: "txt".to_string(),
            chunk_count: 1,
            file_size_bytes: 100,
        };
        h.store.create_document(&record).await.unwrap();
        h.index
            .upsert(&[crate::index::ChunkRecord {
                id: "doc_1_chunk_0".to_string(),
                document_id: "doc_1".to_string(),
                chunk_index: 0,
                content: "body".to_string(),
                embedding: vec![1.0],
                metadata: crate::index::ChunkMetadata {
                    filename: "q4.txt".to_string(),
                    upload_time: Utc::now(),
                    file_type: "txt".to_string(),
                    file_size_bytes: 100,
                    uploader_user_id: "u1".to_string(),
                    uploader_username: "alice".to_string(),
                },
            }])
            .await
            .unwrap();

        let removed = h.admin.delete_document(&ctx(&root), "doc_1").await.unwrap();
        assert_eq!(removed, 1);
        assert!(h.store.get_document("doc_1").await.unwrap().is_none());
        assert!(h.index.is_empty().await.unwrap());
        assert_eq!(
            h.activity.count_for_action("document_delete").await.unwrap(),
            1
        );
    }

    /// Index wrapper whose delete can be toggled to fail
    struct FlakyIndex {
        inner: SqliteVectorIndex,
        fail_delete: AtomicBool,
    }

    #[async_trait::async_trait]
    impl VectorIndex for FlakyIndex {
        async fn upsert(&self, chunks: &[crate::index::ChunkRecord]) -> crate::error::Result<()> {
            self.inner.upsert(chunks).await
        }

        async fn search(
            &self,
            vector: &[f32],
            k: usize,
            min_score: f32,
        ) -> crate::error::Result<Vec<crate::index::ScoredChunk>> {
            self.inner.search(vector, k, min_score).await
        }

        async fn delete_by_document(&self, document_id: &str) -> crate::error::Result<usize> {
            if self.fail_delete.load(Ordering::SeqCst) {
                return Err(crate::error::IndexError::WriteFailed(
                    "index offline".to_string(),
                )
                .into());
            }
            self.inner.delete_by_document(document_id).await
        }

        async fn stats(&self) -> crate::error::Result<IndexStats> {
            self.inner.stats().await
        }

        async fn is_empty(&self) -> crate::error::Result<bool> {
            self.inner.is_empty().await
        }
    }

    #[tokio::test]
    async fn test_failed_chunk_sweep_keeps_record_and_is_retryable() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let store = Arc::new(RecordStore::initialize(pool.clone()).await.unwrap());
        let sessions = Arc::new(SessionStore::initialize(pool.clone()).await.unwrap());
        let activity = Arc::new(ActivityLogger::initialize(pool.clone()).await.unwrap());
        let metrics = Arc::new(MetricsSink::initialize(pool.clone()).await.unwrap());
        let settings = Arc::new(SettingsStore::initialize(pool.clone()).await.unwrap());
        let index = Arc::new(FlakyIndex {
            inner: SqliteVectorIndex::initialize(pool).await.unwrap(),
            fail_delete: AtomicBool::new(true),
        });

        let admin = AdminService::new(
            store.clone(),
            sessions,
            index.clone(),
            activity.clone(),
            metrics,
            settings,
        );
        let root = seeded_user(&store, "root", true).await;

        store
            .create_document(&DocumentRecord {
                id: "doc_1".to_string(),
                filename: "q4.txt".to_string(),
                uploader_user_id: "u1".to_string(),
                uploader_username: "alice".to_string(),
                upload_time: Utc::now(),
                file_type: "txt".to_string(),
                chunk_count: 1,
                file_size_bytes: 100,
            })
            .await
            .unwrap();
        index
            .upsert(&[crate::index::ChunkRecord {
                id: "doc_1_chunk_0".to_string(),
                document_id: "doc_1".to_string(),
                chunk_index: 0,
                content: "body".to_string(),
                embedding: vec![1.0],
                metadata: crate::index::ChunkMetadata {
                    filename: "q4.txt".to_string(),
                    upload_time: Utc::now(),
                    file_type: "txt".to_string(),
                    file_size_bytes: 100,
                    uploader_user_id: "u1".to_string(),
                    uploader_username: "alice".to_string(),
                },
            }])
            .await
            .unwrap();

        // Failed sweep: record and chunk survive together, nothing audited
        let failed = admin.delete_document(&ctx(&root), "doc_1").await;
        assert!(failed.is_err());
        assert!(store.get_document("doc_1").await.unwrap().is_some());
        assert!(!index.is_empty().await.unwrap());
        assert_eq!(
            activity.count_for_action("document_delete").await.unwrap(),
            0
        );

        // Index back up: the same delete goes through cleanly
        index.fail_delete.store(false, Ordering::SeqCst);
        let removed = admin.delete_document(&ctx(&root), "doc_1").await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.get_document("doc_1").await.unwrap().is_none());
        assert!(index.is_empty().await.unwrap());
        assert_eq!(
            activity.count_for_action("document_delete").await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_config_update_flow_and_audit_details() {
        let h = harness().await;
        let root = seeded_user(&h.store, "root", true).await;

        // Below the minimum: rejected, no entry
        let rejected = h
            .admin
            .update_config(&ctx(&root), "chunk_size", &serde_json::json!(50))
            .await;
        assert!(matches!(rejected, Err(ServiceError::Validation(_))));
        assert_eq!(h.activity.count_for_action("config_update").await.unwrap(), 0);

        // Valid update: persisted, snapshot refreshed, one entry with old/new
        let view = h
            .admin
            .update_config(&ctx(&root), "chunk_size", &serde_json::json!(1000))
            .await
            .unwrap();
        assert_eq!(view.value, serde_json::json!(1000));
        assert_eq!(h.settings.snapshot().chunk_size(), 1000);

        let (entries, total) = h
            .activity
            .list(&ActivityFilter::default(), 1, 50)
            .await
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(entries[0].action, "config_update");
        assert_eq!(entries[0].resource_id, "chunk_size");
        assert_eq!(entries[0].details["old"], 800);
        assert_eq!(entries[0].details["new"], 1000);
    }

    #[tokio::test]
    async fn test_repeated_config_update_logs_each_call() {
        let h = harness().await;
        let root = seeded_user(&h.store, "root", true).await;

        for _ in 0..2 {
            h.admin
                .update_config(&ctx(&root), "top_k", &serde_json::json!(7))
                .await
                .unwrap();
        }

        assert_eq!(h.settings.snapshot().top_k(), 7);
        // Same value twice: value unchanged, but one entry per call
        assert_eq!(h.activity.count_for_action("config_update").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_analytics_windows_validated() {
        let h = harness().await;

        assert!(matches!(
            h.admin.user_analytics(0).await,
            Err(ServiceError::Validation(_))
        ));
        assert!(matches!(
            h.admin.user_analytics(366).await,
            Err(ServiceError::Validation(_))
        ));
        assert!(matches!(
            h.admin.api_usage(169).await,
            Err(ServiceError::Validation(_))
        ));

        let analytics = h.admin.user_analytics(30).await.unwrap();
        assert_eq!(analytics.window_days, 30);
    }

    #[tokio::test]
    async fn test_system_metrics_counts() {
        let h = harness().await;
        seeded_user(&h.store, "root", true).await;
        seeded_user(&h.store, "alice", false).await;

        let metrics = h.admin.system_metrics().await.unwrap();
        assert_eq!(metrics.total_users, 2);
        assert_eq!(metrics.total_documents, 0);
        assert_eq!(metrics.total_chunks, 0);
    }
}
