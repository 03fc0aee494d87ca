//! REST API surface
//!
//! Maps HTTP verbs onto the service components: auth, chat, documents and
//! the admin control plane. Handlers validate input, call the relevant
//! service and translate failures into the error envelope; a per-request
//! context (request id, client address) feeds logging, metrics and audit.

mod admin_routes;
mod auth_routes;
mod chat_routes;
mod document_routes;

use crate::activity::ActivityLogger;
use crate::admin::AdminService;
use crate::auth::AuthService;
use crate::config::ServiceConfig;
use crate::error::{Result, ServiceError};
use crate::index::{SqliteVectorIndex, VectorIndex};
use crate::ingest::IngestionPipeline;
use crate::llm::{ChatClient, EmbeddingClient, GeminiClient};
use crate::metrics::{MetricSample, MetricsSink};
use crate::rag::RagEngine;
use crate::sessions::SessionStore;
use crate::settings::SettingsStore;
use crate::store::{NewUser, RecordStore, User};
use axum::{
    extract::{ConnectInfo, DefaultBodyLimit, FromRequestParts, MatchedPath, Request, State},
    http::{header, request::Parts, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use utoipa::{OpenApi, ToSchema};

/// Generous static body cap; the precise, admin-tunable limit is enforced in
/// the upload handler
const UPLOAD_BODY_LIMIT: usize = 120_000_000;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServiceConfig>,
    pub store: Arc<RecordStore>,
    pub sessions: Arc<SessionStore>,
    pub index: Arc<dyn VectorIndex>,
    pub chat: Arc<dyn ChatClient>,
    pub embedder: Arc<dyn EmbeddingClient>,
    pub auth: Arc<AuthService>,
    pub activity: Arc<ActivityLogger>,
    pub settings: Arc<SettingsStore>,
    pub rag: Arc<RagEngine>,
    pub ingestion: Arc<IngestionPipeline>,
    pub admin: Arc<AdminService>,
    pub metrics: Arc<MetricsSink>,
}

impl AppState {
    /// Wire every component against one SQLite pool and the Gemini clients
    pub async fn new(config: ServiceConfig) -> Result<Self> {
        let pool = connect_database(&config).await?;
        let gemini = Arc::new(
            GeminiClient::new(config.gemini.clone()).map_err(ServiceError::Llm)?,
        );
        let chat: Arc<dyn ChatClient> = gemini.clone();
        let embedder: Arc<dyn EmbeddingClient> = gemini;

        Self::with_components(config, pool, chat, embedder).await
    }

    /// Assembly with injectable provider clients, used by tests
    pub async fn with_components(
        config: ServiceConfig,
        pool: SqlitePool,
        chat: Arc<dyn ChatClient>,
        embedder: Arc<dyn EmbeddingClient>,
    ) -> Result<Self> {
        let store = Arc::new(RecordStore::initialize(pool.clone()).await?);
        let sessions = Arc::new(SessionStore::initialize(pool.clone()).await?);
        let index: Arc<dyn VectorIndex> =
            Arc::new(SqliteVectorIndex::initialize(pool.clone()).await?);
        let activity = Arc::new(ActivityLogger::initialize(pool.clone()).await?);
        let metrics = Arc::new(MetricsSink::initialize(pool.clone()).await?);
        let settings = Arc::new(SettingsStore::initialize(pool).await?);

        let auth = Arc::new(AuthService::new(
            store.clone(),
            settings.clone(),
            &config.auth.jwt_secret,
            config.auth.reset_token_expire_minutes,
        ));

        let rag = Arc::new(RagEngine::new(
            chat.clone(),
            embedder.clone(),
            index.clone(),
            sessions.clone(),
            settings.clone(),
        ));

        let ingestion = Arc::new(IngestionPipeline::new(
            store.clone(),
            index.clone(),
            embedder.clone(),
            settings.clone(),
        ));

        let admin = Arc::new(AdminService::new(
            store.clone(),
            sessions.clone(),
            index.clone(),
            activity.clone(),
            metrics.clone(),
            settings.clone(),
        ));

        let state = Self {
            config: Arc::new(config),
            store,
            sessions,
            index,
            chat,
            embedder,
            auth,
            activity,
            settings,
            rag,
            ingestion,
            admin,
            metrics,
        };
        state.bootstrap_admin().await?;
        Ok(state)
    }

    /// Seed the configured admin account when no admin exists yet
    async fn bootstrap_admin(&self) -> Result<()> {
        let auth_config = &self.config.auth;
        let (Some(username), Some(password)) = (
            auth_config.bootstrap_admin_username.as_ref(),
            auth_config.bootstrap_admin_password.as_ref(),
        ) else {
            return Ok(());
        };

        if self.store.any_admin_exists().await? {
            return Ok(());
        }

        let email = auth_config
            .bootstrap_admin_email
            .clone()
            .unwrap_or_else(|| format!("{}@localhost", username));

        self.store
            .create_user(NewUser {
                username: username.clone(),
                email,
                password_hash: AuthService::hash_password(password)?,
                full_name: None,
                is_admin: true,
            })
            .await?;

        info!("Bootstrapped admin account '{}'", username);
        Ok(())
    }
}

/// Create the SQLite pool, ensuring the database directory and file exist
async fn connect_database(config: &ServiceConfig) -> Result<SqlitePool> {
    let database_url = &config.database.url;

    if let Some(db_path) = database_url.strip_prefix("sqlite:") {
        let db_path = db_path.split('?').next().unwrap_or(db_path);
        if db_path != ":memory:" {
            if let Some(parent) = std::path::Path::new(db_path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }
    }

    let database_url = if database_url.contains('?') {
        if database_url.contains("mode=") {
            database_url.clone()
        } else {
            format!("{}&mode=rwc", database_url)
        }
    } else {
        format!("{}?mode=rwc", database_url)
    };

    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&database_url)
        .await?;
    Ok(pool)
}

/// Per-request context threaded into logs, metrics and audit entries
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub client_addr: Option<String>,
}

/// Error envelope for every failed response
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<ErrorDetails>,
    pub timestamp: chrono::DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// Marker carried on error responses so the metrics middleware can log the
/// message without reparsing the body
#[derive(Debug, Clone)]
struct ErrorText(String);

/// API error: a service error plus the request context it occurred in
#[derive(Debug)]
pub struct ApiError {
    error: ServiceError,
    request_id: Option<String>,
}

impl ApiError {
    pub fn with_ctx(error: ServiceError, ctx: &RequestContext) -> Self {
        Self {
            error,
            request_id: Some(ctx.request_id.clone()),
        }
    }
}

impl From<ServiceError> for ApiError {
    fn from(error: ServiceError) -> Self {
        Self {
            error,
            request_id: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.error.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let message = self.error.to_string();

        if status.is_server_error() {
            error!("{} ({:?})", message, self.request_id);
        } else {
            warn!("{} ({:?})", message, self.request_id);
        }

        let body = ErrorResponse {
            error: self.error.category().to_string(),
            message: message.clone(),
            details: Some(ErrorDetails {
                request_id: self.request_id,
            }),
            timestamp: Utc::now(),
        };

        let mut response = (status, Json(body)).into_response();
        response.extensions_mut().insert(ErrorText(message));
        response
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

fn bearer_token(parts: &Parts) -> std::result::Result<&str, ApiError> {
    parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(|| {
            ApiError::from(ServiceError::Authentication(
                "missing bearer token".to_string(),
            ))
        })
}

/// Authenticated user; rejects accounts flagged for a forced password change
pub struct AuthUser(pub User);

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> std::result::Result<Self, Self::Rejection> {
        let token = bearer_token(parts)?;
        let user = state.auth.verify_token(token).await?;

        if user.must_reset {
            return Err(ApiError::from(ServiceError::Authorization(
                "password change required before continuing".to_string(),
            )));
        }
        Ok(AuthUser(user))
    }
}

/// Authenticated user, forced-reset allowed; used by the endpoints a flagged
/// user needs to complete the change
pub struct AuthUserAllowReset(pub User);

impl FromRequestParts<AppState> for AuthUserAllowReset {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> std::result::Result<Self, Self::Rejection> {
        let token = bearer_token(parts)?;
        let user = state.auth.verify_token(token).await?;
        Ok(AuthUserAllowReset(user))
    }
}

/// Authenticated admin
pub struct AdminUser(pub User);

impl FromRequestParts<AppState> for AdminUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> std::result::Result<Self, Self::Rejection> {
        let AuthUser(user) = AuthUser::from_request_parts(parts, state).await?;
        AuthService::require_admin(&user)?;
        Ok(AdminUser(user))
    }
}

/// Request context extractor; the context middleware always installs one
impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> std::result::Result<Self, Self::Rejection> {
        parts.extensions.get::<RequestContext>().cloned().ok_or_else(|| {
            ApiError::from(ServiceError::Internal(
                "request context missing".to_string(),
            ))
        })
    }
}

/// Install the request context from the generated request id and peer address
async fn request_context(mut request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let client_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string());

    request.extensions_mut().insert(RequestContext {
        request_id: request_id.clone(),
        client_addr,
    });

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

/// Record one metrics sample per handled request
async fn track_metrics(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let started = Instant::now();
    let method = request.method().to_string();
    let endpoint = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());

    // Best-effort attribution without a second store lookup
    let user_id = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .and_then(|token| state.auth.peek_subject(token));

    let response = next.run(request).await;

    let sample = MetricSample {
        endpoint,
        method,
        status: response.status().as_u16(),
        elapsed_ms: started.elapsed().as_millis() as u64,
        timestamp: Utc::now(),
        user_id,
        error: response.extensions().get::<ErrorText>().map(|e| e.0.clone()),
    };

    let sink = state.metrics.clone();
    tokio::spawn(async move {
        if let Err(e) = sink.record(sample).await {
            warn!("Failed to record metric sample: {}", e);
        }
    });

    response
}

/// Pagination query parameters, clamped to 10-100 per page
#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct Pagination {
    pub page: Option<usize>,
    pub per_page: Option<usize>,
}

impl Pagination {
    pub fn clamp(&self) -> (usize, usize) {
        let page = self.page.unwrap_or(1).max(1);
        let per_page = self.per_page.unwrap_or(20).clamp(10, 100);
        (page, per_page)
    }
}

/// Health report with per-component status
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub components: HealthComponents,
    pub timestamp: chrono::DateTime<Utc>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthComponents {
    pub database: String,
    pub vector_index: String,
    pub chat_provider: String,
    pub embedding_provider: String,
}

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/api/v1/health",
    tag = "health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse),
        (status = 503, description = "A required component is down", body = HealthResponse)
    )
)]
async fn health_handler(State(state): State<AppState>) -> Response {
    let database = match sqlx::query("SELECT 1").fetch_one(state.store.pool()).await {
        Ok(_) => "ok",
        Err(_) => "down",
    };
    let vector_index = match state.index.stats().await {
        Ok(_) => "ok",
        Err(_) => "down",
    };
    let provider = if state.config.gemini.api_key.is_empty() {
        "unconfigured"
    } else {
        "configured"
    };

    let healthy = database == "ok" && vector_index == "ok";
    let body = HealthResponse {
        status: if healthy { "ok" } else { "degraded" }.to_string(),
        version: crate::VERSION.to_string(),
        components: HealthComponents {
            database: database.to_string(),
            vector_index: vector_index.to_string(),
            chat_provider: provider.to_string(),
            embedding_provider: provider.to_string(),
        },
        timestamp: Utc::now(),
    };

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body)).into_response()
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        health_handler,
        auth_routes::register_handler,
        auth_routes::login_handler,
        auth_routes::forgot_password_handler,
        auth_routes::reset_password_handler,
        auth_routes::me_handler,
        auth_routes::change_password_handler,
        chat_routes::chat_handler,
        document_routes::upload_handler,
        document_routes::list_handler,
        document_routes::delete_handler,
        document_routes::stats_handler,
    ),
    components(schemas(
        ErrorResponse,
        ErrorDetails,
        HealthResponse,
        HealthComponents,
        auth_routes::RegisterRequest,
        auth_routes::LoginRequest,
        auth_routes::LoginResponse,
        auth_routes::ForgotPasswordRequest,
        auth_routes::ForgotPasswordResponse,
        auth_routes::ResetPasswordRequest,
        auth_routes::ChangePasswordRequest,
        auth_routes::SimpleResponse,
        chat_routes::ChatRequest,
        chat_routes::ChatResponse,
        document_routes::UploadResponse,
        document_routes::DeleteResponse,
        document_routes::DocumentListResponse,
        crate::rag::Source,
        crate::store::UserView,
        crate::store::DocumentRecord,
    )),
    tags(
        (name = "health", description = "Service health"),
        (name = "auth", description = "Registration, login and password flows"),
        (name = "chat", description = "Retrieval-augmented question answering"),
        (name = "documents", description = "Document ingestion and oversight")
    ),
    info(
        title = "Finrag API",
        version = "0.3.0",
        description = "Multi-tenant RAG service for financial question answering"
    )
)]
struct ApiDoc;

async fn openapi_spec_handler() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let admin_routes = Router::new()
        .route("/users", get(admin_routes::list_users))
        .route("/users/{id}", get(admin_routes::get_user))
        .route("/users/{id}/status", post(admin_routes::set_user_status))
        .route(
            "/users/{id}/reset-password",
            post(admin_routes::force_reset_password),
        )
        .route("/users/{id}/promote", post(admin_routes::promote_user))
        .route("/users/{id}/activity", get(admin_routes::user_activity))
        .route("/documents", get(admin_routes::list_documents))
        .route("/documents/{id}", delete(admin_routes::delete_document))
        .route("/documents/stats", get(admin_routes::document_stats))
        .route("/system/health", get(admin_routes::system_health))
        .route("/system/metrics", get(admin_routes::system_metrics))
        .route("/system/storage", get(admin_routes::storage_stats))
        .route("/system/api-usage", get(admin_routes::api_usage))
        .route("/system/logs", get(admin_routes::system_logs))
        .route("/system/activity", get(admin_routes::activity_log))
        .route("/analytics/users", get(admin_routes::user_analytics))
        .route("/analytics/sessions", get(admin_routes::session_analytics))
        .route(
            "/analytics/documents",
            get(admin_routes::document_analytics),
        )
        .route("/config", get(admin_routes::list_config))
        .route("/config/{name}", get(admin_routes::get_config))
        .route("/config/{name}", put(admin_routes::update_config));

    Router::new()
        .route("/api/v1/health", get(health_handler))
        // Auth
        .route("/api/v1/auth/register", post(auth_routes::register_handler))
        .route("/api/v1/auth/login", post(auth_routes::login_handler))
        .route(
            "/api/v1/auth/forgot-password",
            post(auth_routes::forgot_password_handler),
        )
        .route(
            "/api/v1/auth/reset-password",
            post(auth_routes::reset_password_handler),
        )
        .route("/api/v1/auth/me", get(auth_routes::me_handler))
        .route(
            "/api/v1/auth/change-password",
            post(auth_routes::change_password_handler),
        )
        // Chat
        .route("/api/v1/chat", post(chat_routes::chat_handler))
        // Documents
        .route(
            "/api/v1/documents/upload",
            post(document_routes::upload_handler)
                .layer(DefaultBodyLimit::max(UPLOAD_BODY_LIMIT)),
        )
        .route("/api/v1/documents", get(document_routes::list_handler))
        .route("/api/v1/documents/stats", get(document_routes::stats_handler))
        .route(
            "/api/v1/documents/{id}",
            delete(document_routes::delete_handler),
        )
        // Admin control plane
        .nest("/api/v1/admin", admin_routes)
        // OpenAPI
        .route("/api-docs/openapi.json", get(openapi_spec_handler))
        .merge(
            utoipa_swagger_ui::SwaggerUi::new("/swagger-ui")
                .url("/api-docs/openapi.json", ApiDoc::openapi()),
        )
        // Runs after routing, so the matched path is available to metrics
        .route_layer(
            ServiceBuilder::new()
                .layer(middleware::from_fn(request_context))
                .layer(middleware::from_fn_with_state(
                    state.clone(),
                    track_metrics,
                )),
        )
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

/// Start the API server
pub async fn start_server(state: AppState, host: &str, port: u16) -> Result<()> {
    let addr = format!("{}:{}", host, port);
    info!("Starting API server on {}", addr);

    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| ServiceError::Internal(format!("failed to bind to {}: {}", addr, e)))?;

    info!("API server listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .map_err(|e| ServiceError::Internal(format!("server error: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pagination_clamp() {
        let p = Pagination {
            page: None,
            per_page: None,
        };
        assert_eq!(p.clamp(), (1, 20));

        let p = Pagination {
            page: Some(0),
            per_page: Some(5),
        };
        assert_eq!(p.clamp(), (1, 10));

        let p = Pagination {
            page: Some(3),
            per_page: Some(500),
        };
        assert_eq!(p.clamp(), (3, 100));
    }

    #[test]
    fn test_error_envelope_shape() {
        let api_error = ApiError {
            error: ServiceError::NotFound("document doc_1".to_string()),
            request_id: Some("req-1".to_string()),
        };
        let response = api_error.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(response.extensions().get::<ErrorText>().is_some());
    }
}
