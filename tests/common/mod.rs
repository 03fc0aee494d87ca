//! Shared helpers for the API integration tests

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use finrag::api::{create_router, AppState};
use finrag::config::ServiceConfig;
use finrag::error::LlmError;
use finrag::llm::{
    ChatClient, EmbeddingClient, EmbeddingResponse, GenerationOptions, GenerationResponse,
    Message, Role,
};
use finrag::REFUSAL_PREFIX;
use sqlx::sqlite::SqlitePool;
use std::sync::Arc;
use tower::ServiceExt;

/// Chat fake: refuses out-of-domain questions on the no-context path,
/// otherwise answers; grounded answers echo a marker so tests can tell the
/// paths apart.
pub struct ScriptedChat;

#[async_trait]
impl ChatClient for ScriptedChat {
    async fn generate(
        &self,
        messages: &[Message],
        options: &GenerationOptions,
    ) -> Result<GenerationResponse, LlmError> {
        let system = messages
            .iter()
            .find(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .unwrap_or("");
        let query = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("");

        let text = if system.contains("No documents are available") {
            if query.to_lowercase().contains("weather") {
                format!(
                    "{}. Please ask me something about finance, markets, or your financial documents.",
                    REFUSAL_PREFIX
                )
            } else {
                "Compound interest is interest earned on both the principal and \
                 previously accumulated interest."
                    .to_string()
            }
        } else {
            "Based on the uploaded documents, Q4 revenue was $2.5M, up 15% from Q3.".to_string()
        };

        Ok(GenerationResponse {
            text,
            tokens_used: Some(12),
            model: options.model.clone(),
            finish_reason: Some("stop".to_string()),
        })
    }
}

/// Embedder fake: revenue-flavored text maps onto one axis, everything else
/// onto the other, so retrieval behavior is deterministic.
pub struct ScriptedEmbedder;

#[async_trait]
impl EmbeddingClient for ScriptedEmbedder {
    async fn embed(&self, text: &str, model: &str) -> Result<EmbeddingResponse, LlmError> {
        let embedding = if text.to_lowercase().contains("revenue") {
            vec![1.0, 0.0]
        } else {
            vec![0.0, 1.0]
        };
        Ok(EmbeddingResponse {
            embedding,
            model: model.to_string(),
        })
    }
}

pub fn test_config() -> ServiceConfig {
    let mut config = ServiceConfig::default();
    config.server.debug = true;
    config.auth.jwt_secret = "integration-test-secret-0123456789".to_string();
    config.auth.bootstrap_admin_username = Some("root".to_string());
    config.auth.bootstrap_admin_password = Some("Rootpass1!".to_string());
    config.auth.bootstrap_admin_email = Some("root@example.com".to_string());
    config.gemini.api_key = "test-key".to_string();
    config
}

pub async fn test_app() -> Router {
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    let state = AppState::with_components(
        test_config(),
        pool,
        Arc::new(ScriptedChat),
        Arc::new(ScriptedEmbedder),
    )
    .await
    .unwrap();
    create_router(state)
}

pub async fn request(
    app: &Router,
    method: &str,
    uri: &str,
    token: Option<&str>,
    body: Option<serde_json::Value>,
) -> (StatusCode, serde_json::Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }

    let request = match body {
        Some(json) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
    };
    (status, json)
}

/// Multipart upload of a single file field
pub async fn upload(
    app: &Router,
    token: &str,
    filename: &str,
    bytes: &[u8],
) -> (StatusCode, serde_json::Value) {
    let boundary = "test-boundary-7f93a1";
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
    body.extend_from_slice(
        format!(
            "Content-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\n",
            filename
        )
        .as_bytes(),
    );
    body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());

    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/documents/upload")
        .header(header::AUTHORIZATION, format!("Bearer {}", token))
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", boundary),
        )
        .body(Body::from(body))
        .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, json)
}

pub async fn register_and_login(app: &Router, username: &str, password: &str) -> String {
    let (status, _) = request(
        app,
        "POST",
        "/api/v1/auth/register",
        None,
        Some(serde_json::json!({
            "username": username,
            "email": format!("{}@example.com", username),
            "password": password,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    login(app, username, password).await
}

pub async fn login(app: &Router, username: &str, password: &str) -> String {
    let (status, body) = request(
        app,
        "POST",
        "/api/v1/auth/login",
        None,
        Some(serde_json::json!({
            "username": username,
            "password": password,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "login failed: {}", body);
    body["access_token"].as_str().unwrap().to_string()
}
