//! Admin control plane handlers
//!
//! Every handler requires the admin role; every mutation threads the request
//! context into the audit entry written with its effect.

use crate::activity::{ActivityEntry, ActivityFilter};
use crate::admin::{
    AdminContext, DocumentAnalytics, SessionAnalytics, StorageStats, SystemMetrics, UserAnalytics,
};
use crate::api::{ApiError, ApiResult, AdminUser, AppState, Pagination, RequestContext};
use crate::error::ServiceError;
use crate::index::IndexStats;
use crate::metrics::{EndpointUsage, LogFilter, MetricSample};
use crate::settings::SettingView;
use crate::store::{DocumentRecord, UserFilter, UserView};
use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

fn admin_ctx(user: &crate::store::User, ctx: &RequestContext) -> AdminContext {
    AdminContext::for_admin(user, ctx.client_addr.clone())
}

/// Accepts RFC 3339 timestamps or plain dates
fn parse_date(raw: &str, end_of_day: bool) -> Result<DateTime<Utc>, ServiceError> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| ServiceError::Validation(format!("unparseable date '{}'", raw)))?;
    let time = if end_of_day {
        date.and_hms_opt(23, 59, 59)
    } else {
        date.and_hms_opt(0, 0, 0)
    };
    Ok(DateTime::from_naive_utc_and_offset(
        time.unwrap_or_else(|| date.and_hms_opt(0, 0, 0).unwrap_or_default()),
        Utc,
    ))
}

#[derive(Debug, Serialize)]
pub struct PagedResponse<T: Serialize> {
    pub items: Vec<T>,
    pub total: usize,
    pub page: usize,
    pub per_page: usize,
}

// ----- users -----

#[derive(Debug, Deserialize)]
pub struct UserListQuery {
    pub search: Option<String>,
    pub is_active: Option<bool>,
    pub is_admin: Option<bool>,
    pub page: Option<usize>,
    pub per_page: Option<usize>,
}

pub async fn list_users(
    State(state): State<AppState>,
    ctx: RequestContext,
    AdminUser(_admin): AdminUser,
    Query(query): Query<UserListQuery>,
) -> ApiResult<Json<PagedResponse<UserView>>> {
    let (page, per_page) = Pagination {
        page: query.page,
        per_page: query.per_page,
    }
    .clamp();
    let filter = UserFilter {
        search: query.search,
        is_active: query.is_active,
        is_admin: query.is_admin,
    };

    let (items, total) = state
        .admin
        .list_users(&filter, page, per_page)
        .await
        .map_err(|e| ApiError::with_ctx(e, &ctx))?;

    Ok(Json(PagedResponse {
        items,
        total,
        page,
        per_page,
    }))
}

pub async fn get_user(
    State(state): State<AppState>,
    ctx: RequestContext,
    AdminUser(_admin): AdminUser,
    Path(user_id): Path<String>,
) -> ApiResult<Json<UserView>> {
    let view = state
        .admin
        .get_user(&user_id)
        .await
        .map_err(|e| ApiError::with_ctx(e, &ctx))?;
    Ok(Json(view))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct StatusUpdateRequest {
    pub active: bool,
}

pub async fn set_user_status(
    State(state): State<AppState>,
    ctx: RequestContext,
    AdminUser(admin): AdminUser,
    Path(user_id): Path<String>,
    Json(request): Json<StatusUpdateRequest>,
) -> ApiResult<Json<UserView>> {
    let view = state
        .admin
        .set_user_status(&admin_ctx(&admin, &ctx), &user_id, request.active)
        .await
        .map_err(|e| ApiError::with_ctx(e, &ctx))?;
    Ok(Json(view))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ForceResetResponse {
    /// Returned exactly once; the user must change it at next login
    pub temporary_password: String,
    pub must_reset: bool,
}

pub async fn force_reset_password(
    State(state): State<AppState>,
    ctx: RequestContext,
    AdminUser(admin): AdminUser,
    Path(user_id): Path<String>,
) -> ApiResult<Json<ForceResetResponse>> {
    let temporary_password = state
        .admin
        .force_reset_password(&admin_ctx(&admin, &ctx), &user_id)
        .await
        .map_err(|e| ApiError::with_ctx(e, &ctx))?;

    Ok(Json(ForceResetResponse {
        temporary_password,
        must_reset: true,
    }))
}

pub async fn promote_user(
    State(state): State<AppState>,
    ctx: RequestContext,
    AdminUser(admin): AdminUser,
    Path(user_id): Path<String>,
) -> ApiResult<Json<UserView>> {
    let view = state
        .admin
        .promote_user(&admin_ctx(&admin, &ctx), &user_id)
        .await
        .map_err(|e| ApiError::with_ctx(e, &ctx))?;
    Ok(Json(view))
}

pub async fn user_activity(
    State(state): State<AppState>,
    ctx: RequestContext,
    AdminUser(_admin): AdminUser,
    Path(user_id): Path<String>,
) -> ApiResult<Json<Vec<ActivityEntry>>> {
    let entries = state
        .admin
        .user_activity(&user_id, 100)
        .await
        .map_err(|e| ApiError::with_ctx(e, &ctx))?;
    Ok(Json(entries))
}

// ----- documents -----

pub async fn list_documents(
    State(state): State<AppState>,
    ctx: RequestContext,
    AdminUser(_admin): AdminUser,
) -> ApiResult<Json<Vec<DocumentRecord>>> {
    let documents = state
        .admin
        .list_documents()
        .await
        .map_err(|e| ApiError::with_ctx(e, &ctx))?;
    Ok(Json(documents))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AdminDeleteResponse {
    pub success: bool,
    pub chunks_deleted: usize,
}

pub async fn delete_document(
    State(state): State<AppState>,
    ctx: RequestContext,
    AdminUser(admin): AdminUser,
    Path(document_id): Path<String>,
) -> ApiResult<Json<AdminDeleteResponse>> {
    let removed = state
        .admin
        .delete_document(&admin_ctx(&admin, &ctx), &document_id)
        .await
        .map_err(|e| ApiError::with_ctx(e, &ctx))?;

    Ok(Json(AdminDeleteResponse {
        success: true,
        chunks_deleted: removed,
    }))
}

pub async fn document_stats(
    State(state): State<AppState>,
    ctx: RequestContext,
    AdminUser(_admin): AdminUser,
) -> ApiResult<Json<IndexStats>> {
    let stats = state
        .admin
        .document_stats()
        .await
        .map_err(|e| ApiError::with_ctx(e, &ctx))?;
    Ok(Json(stats))
}

// ----- system -----

pub async fn system_health(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
) -> ApiResult<Json<serde_json::Value>> {
    let database = sqlx::query("SELECT 1")
        .fetch_one(state.store.pool())
        .await
        .is_ok();
    let index = state.index.stats().await.is_ok();

    Ok(Json(serde_json::json!({
        "status": if database && index { "ok" } else { "degraded" },
        "database": if database { "ok" } else { "down" },
        "vector_index": if index { "ok" } else { "down" },
        "timestamp": Utc::now(),
    })))
}

pub async fn system_metrics(
    State(state): State<AppState>,
    ctx: RequestContext,
    AdminUser(_admin): AdminUser,
) -> ApiResult<Json<SystemMetrics>> {
    let metrics = state
        .admin
        .system_metrics()
        .await
        .map_err(|e| ApiError::with_ctx(e, &ctx))?;
    Ok(Json(metrics))
}

pub async fn storage_stats(
    State(state): State<AppState>,
    ctx: RequestContext,
    AdminUser(_admin): AdminUser,
) -> ApiResult<Json<StorageStats>> {
    let stats = state
        .admin
        .storage_stats()
        .await
        .map_err(|e| ApiError::with_ctx(e, &ctx))?;
    Ok(Json(stats))
}

#[derive(Debug, Deserialize)]
pub struct ApiUsageQuery {
    pub hours: Option<i64>,
}

pub async fn api_usage(
    State(state): State<AppState>,
    ctx: RequestContext,
    AdminUser(_admin): AdminUser,
    Query(query): Query<ApiUsageQuery>,
) -> ApiResult<Json<Vec<EndpointUsage>>> {
    let usage = state
        .admin
        .api_usage(query.hours.unwrap_or(24))
        .await
        .map_err(|e| ApiError::with_ctx(e, &ctx))?;
    Ok(Json(usage))
}

#[derive(Debug, Deserialize)]
pub struct LogQuery {
    pub severity: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub page: Option<usize>,
    pub per_page: Option<usize>,
}

pub async fn system_logs(
    State(state): State<AppState>,
    ctx: RequestContext,
    AdminUser(_admin): AdminUser,
    Query(query): Query<LogQuery>,
) -> ApiResult<Json<PagedResponse<MetricSample>>> {
    let (page, per_page) = Pagination {
        page: query.page,
        per_page: query.per_page,
    }
    .clamp();

    let since = query
        .start_date
        .as_deref()
        .map(|raw| parse_date(raw, false))
        .transpose()
        .map_err(|e| ApiError::with_ctx(e, &ctx))?;
    let until = query
        .end_date
        .as_deref()
        .map(|raw| parse_date(raw, true))
        .transpose()
        .map_err(|e| ApiError::with_ctx(e, &ctx))?;

    let filter = LogFilter {
        severity: query.severity,
        since,
        until,
    };

    let (items, total) = state
        .admin
        .logs(&filter, page, per_page)
        .await
        .map_err(|e| ApiError::with_ctx(e, &ctx))?;

    Ok(Json(PagedResponse {
        items,
        total,
        page,
        per_page,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ActivityQuery {
    pub admin_id: Option<String>,
    pub action: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub page: Option<usize>,
    pub per_page: Option<usize>,
}

pub async fn activity_log(
    State(state): State<AppState>,
    ctx: RequestContext,
    AdminUser(_admin): AdminUser,
    Query(query): Query<ActivityQuery>,
) -> ApiResult<Json<PagedResponse<ActivityEntry>>> {
    let (page, per_page) = Pagination {
        page: query.page,
        per_page: query.per_page,
    }
    .clamp();

    let since = query
        .start_date
        .as_deref()
        .map(|raw| parse_date(raw, false))
        .transpose()
        .map_err(|e| ApiError::with_ctx(e, &ctx))?;
    let until = query
        .end_date
        .as_deref()
        .map(|raw| parse_date(raw, true))
        .transpose()
        .map_err(|e| ApiError::with_ctx(e, &ctx))?;

    let filter = ActivityFilter {
        admin_id: query.admin_id,
        action: query.action,
        since,
        until,
    };

    let (items, total) = state
        .admin
        .activity_log(&filter, page, per_page)
        .await
        .map_err(|e| ApiError::with_ctx(e, &ctx))?;

    Ok(Json(PagedResponse {
        items,
        total,
        page,
        per_page,
    }))
}

// ----- analytics -----

#[derive(Debug, Deserialize)]
pub struct AnalyticsQuery {
    pub days: Option<i64>,
}

pub async fn user_analytics(
    State(state): State<AppState>,
    ctx: RequestContext,
    AdminUser(_admin): AdminUser,
    Query(query): Query<AnalyticsQuery>,
) -> ApiResult<Json<UserAnalytics>> {
    let analytics = state
        .admin
        .user_analytics(query.days.unwrap_or(30))
        .await
        .map_err(|e| ApiError::with_ctx(e, &ctx))?;
    Ok(Json(analytics))
}

pub async fn session_analytics(
    State(state): State<AppState>,
    ctx: RequestContext,
    AdminUser(_admin): AdminUser,
) -> ApiResult<Json<SessionAnalytics>> {
    let analytics = state
        .admin
        .session_analytics()
        .await
        .map_err(|e| ApiError::with_ctx(e, &ctx))?;
    Ok(Json(analytics))
}

pub async fn document_analytics(
    State(state): State<AppState>,
    ctx: RequestContext,
    AdminUser(_admin): AdminUser,
) -> ApiResult<Json<DocumentAnalytics>> {
    let analytics = state
        .admin
        .document_analytics()
        .await
        .map_err(|e| ApiError::with_ctx(e, &ctx))?;
    Ok(Json(analytics))
}

// ----- configuration -----

pub async fn list_config(
    State(state): State<AppState>,
    ctx: RequestContext,
    AdminUser(_admin): AdminUser,
) -> ApiResult<Json<Vec<SettingView>>> {
    let settings = state
        .admin
        .list_config()
        .await
        .map_err(|e| ApiError::with_ctx(e, &ctx))?;
    Ok(Json(settings))
}

pub async fn get_config(
    State(state): State<AppState>,
    ctx: RequestContext,
    AdminUser(_admin): AdminUser,
    Path(name): Path<String>,
) -> ApiResult<Json<SettingView>> {
    let view = state
        .admin
        .get_config(&name)
        .await
        .map_err(|e| ApiError::with_ctx(e, &ctx))?;
    Ok(Json(view))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ConfigUpdateRequest {
    pub value: serde_json::Value,
}

pub async fn update_config(
    State(state): State<AppState>,
    ctx: RequestContext,
    AdminUser(admin): AdminUser,
    Path(name): Path<String>,
    Json(request): Json<ConfigUpdateRequest>,
) -> ApiResult<Json<SettingView>> {
    let view = state
        .admin
        .update_config(&admin_ctx(&admin, &ctx), &name, &request.value)
        .await
        .map_err(|e| ApiError::with_ctx(e, &ctx))?;
    Ok(Json(view))
}
