//! Document upload, listing, deletion and statistics handlers

use crate::api::{ApiError, ApiResult, AppState, AuthUser, RequestContext};
use crate::error::ServiceError;
use crate::index::IndexStats;
use crate::store::DocumentRecord;
use axum::{
    extract::{Multipart, Path, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;

#[derive(Debug, Serialize, ToSchema)]
pub struct UploadResponse {
    pub document_id: String,
    pub filename: String,
    pub chunks_created: usize,
    pub upload_date: DateTime<Utc>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct DeleteResponse {
    pub success: bool,
    pub chunks_deleted: usize,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct DocumentListResponse {
    pub documents: Vec<DocumentRecord>,
    pub total: usize,
}

/// Upload a document for ingestion (multipart, field name `file`)
#[utoipa::path(
    post,
    path = "/api/v1/documents/upload",
    tag = "documents",
    security(("bearer" = [])),
    responses(
        (status = 201, description = "Document ingested", body = UploadResponse),
        (status = 413, description = "File exceeds the size limit", body = super::ErrorResponse),
        (status = 400, description = "Unsupported type or unreadable file", body = super::ErrorResponse),
        (status = 503, description = "Embedding provider unavailable", body = super::ErrorResponse)
    )
)]
pub async fn upload_handler(
    State(state): State<AppState>,
    ctx: RequestContext,
    AuthUser(user): AuthUser,
    mut multipart: Multipart,
) -> ApiResult<(StatusCode, Json<UploadResponse>)> {
    let mut upload: Option<(String, Vec<u8>)> = None;

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        ApiError::with_ctx(
            ServiceError::Validation(format!("malformed multipart body: {}", e)),
            &ctx,
        )
    })? {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field
            .file_name()
            .map(str::to_string)
            .ok_or_else(|| {
                ApiError::with_ctx(
                    ServiceError::Validation("file field is missing a filename".to_string()),
                    &ctx,
                )
            })?;
        let bytes = field.bytes().await.map_err(|e| {
            ApiError::with_ctx(
                ServiceError::Validation(format!("failed to read upload: {}", e)),
                &ctx,
            )
        })?;
        upload = Some((filename, bytes.to_vec()));
        break;
    }

    let (filename, bytes) = upload.ok_or_else(|| {
        ApiError::with_ctx(
            ServiceError::Validation("multipart body must contain a 'file' field".to_string()),
            &ctx,
        )
    })?;

    let outcome = state
        .ingestion
        .ingest(&user, &filename, &bytes)
        .await
        .map_err(|e| ApiError::with_ctx(e, &ctx))?;

    Ok((
        StatusCode::CREATED,
        Json(UploadResponse {
            document_id: outcome.document_id,
            filename: outcome.filename,
            chunks_created: outcome.chunks_created,
            upload_date: outcome.upload_date,
        }),
    ))
}

/// List document records
#[utoipa::path(
    get,
    path = "/api/v1/documents",
    tag = "documents",
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Document list", body = DocumentListResponse)
    )
)]
pub async fn list_handler(
    State(state): State<AppState>,
    ctx: RequestContext,
    AuthUser(_user): AuthUser,
) -> ApiResult<Json<DocumentListResponse>> {
    let documents = state
        .store
        .list_documents()
        .await
        .map_err(|e| ApiError::with_ctx(e, &ctx))?;

    let total = documents.len();
    Ok(Json(DocumentListResponse { documents, total }))
}

/// Delete a document and its chunks
#[utoipa::path(
    delete,
    path = "/api/v1/documents/{id}",
    tag = "documents",
    security(("bearer" = [])),
    params(("id" = String, Path, description = "Document id")),
    responses(
        (status = 200, description = "Document deleted", body = DeleteResponse),
        (status = 404, description = "Unknown document", body = super::ErrorResponse)
    )
)]
pub async fn delete_handler(
    State(state): State<AppState>,
    ctx: RequestContext,
    AuthUser(_user): AuthUser,
    Path(document_id): Path<String>,
) -> ApiResult<Json<DeleteResponse>> {
    let removed = state
        .ingestion
        .delete_document(&document_id)
        .await
        .map_err(|e| ApiError::with_ctx(e, &ctx))?;

    Ok(Json(DeleteResponse {
        success: true,
        chunks_deleted: removed,
    }))
}

/// Index statistics
#[utoipa::path(
    get,
    path = "/api/v1/documents/stats",
    tag = "documents",
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Index statistics", body = Object)
    )
)]
pub async fn stats_handler(
    State(state): State<AppState>,
    ctx: RequestContext,
    AuthUser(_user): AuthUser,
) -> ApiResult<Json<IndexStats>> {
    let stats = state
        .index
        .stats()
        .await
        .map_err(|e| ApiError::with_ctx(e, &ctx))?;
    Ok(Json(stats))
}
