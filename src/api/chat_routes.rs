//! Retrieval-augmented chat handler

use crate::api::{ApiError, ApiResult, AppState, AuthUser, RequestContext};
use crate::error::ServiceError;
use crate::rag::Source;
use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use tracing::debug;
use utoipa::ToSchema;

#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct ChatRequest {
    /// The question, 1-2000 characters
    #[schema(example = "What was the Q4 revenue?")]
    pub query: String,
    /// Existing session to continue; omitted means a new session
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ChatResponse {
    pub response: String,
    pub sources: Vec<Source>,
    pub session_id: String,
}

/// Answer a question against the indexed documents
#[utoipa::path(
    post,
    path = "/api/v1/chat",
    tag = "chat",
    security(("bearer" = [])),
    request_body = ChatRequest,
    responses(
        (status = 200, description = "Answer with sources", body = ChatResponse),
        (status = 400, description = "Query out of bounds", body = super::ErrorResponse),
        (status = 401, description = "Missing or invalid token", body = super::ErrorResponse),
        (status = 403, description = "Session owned by another user", body = super::ErrorResponse),
        (status = 503, description = "Generation failed after retries", body = super::ErrorResponse)
    )
)]
pub async fn chat_handler(
    State(state): State<AppState>,
    ctx: RequestContext,
    AuthUser(user): AuthUser,
    Json(request): Json<ChatRequest>,
) -> ApiResult<Json<ChatResponse>> {
    let query = request.query.trim();
    if query.is_empty() || query.chars().count() > 2000 {
        return Err(ApiError::with_ctx(
            ServiceError::Validation("query must be between 1 and 2000 characters".to_string()),
            &ctx,
        ));
    }

    debug!("Chat query from {} ({} chars)", user.username, query.len());

    let outcome = state
        .rag
        .query(&user, query, request.session_id.as_deref())
        .await
        .map_err(|e| ApiError::with_ctx(e, &ctx))?;

    Ok(Json(ChatResponse {
        response: outcome.answer,
        sources: outcome.sources,
        session_id: outcome.session_id,
    }))
}
