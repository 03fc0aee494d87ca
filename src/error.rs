//! Error handling for the RAG service

use thiserror::Error;

/// Result type alias for the service
pub type Result<T> = std::result::Result<T, ServiceError>;

/// Main error type for the service
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Authorization error: {0}")]
    Authorization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Upstream failure: {0}")]
    Upstream(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors related to chat-completion and embedding providers
#[derive(Error, Debug)]
pub enum LlmError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Generation failed: {0}")]
    GenerationFailed(String),

    #[error("Embedding failed: {0}")]
    EmbeddingFailed(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Provider rejected credentials")]
    Unauthorized,

    #[error("Rate limited by provider")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("Provider unavailable: status {status}")]
    Unavailable { status: u16, body: String },

    #[error("Timeout: operation took too long")]
    Timeout,
}

/// Errors related to the vector index
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Invalid embedding dimension: expected {expected}, got {actual}")]
    InvalidDimension { expected: usize, actual: usize },

    #[error("Search failed: {0}")]
    SearchFailed(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),
}

impl LlmError {
    /// Transient provider errors are worth retrying; request-shaped and
    /// credential errors are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmError::Timeout
                | LlmError::ConnectionFailed(_)
                | LlmError::RateLimited { .. }
                | LlmError::Unavailable { .. }
        )
    }
}

impl ServiceError {
    /// Check if the error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            ServiceError::Llm(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Get error category for logging/metrics
    pub fn category(&self) -> &'static str {
        match self {
            ServiceError::Validation(_) => "validation",
            ServiceError::Authentication(_) => "authentication",
            ServiceError::Authorization(_) => "authorization",
            ServiceError::NotFound(_) => "not_found",
            ServiceError::Conflict(_) => "conflict",
            ServiceError::PayloadTooLarge(_) => "payload_too_large",
            ServiceError::Llm(_) => "llm",
            ServiceError::Index(_) => "index",
            ServiceError::Upstream(_) => "upstream",
            ServiceError::Database(_) => "database",
            ServiceError::Io(_) => "io",
            ServiceError::Serialization(_) => "serialization",
            ServiceError::Config(_) => "config",
            ServiceError::Internal(_) => "internal",
        }
    }

    /// HTTP status for the response taxonomy
    pub fn status_code(&self) -> u16 {
        match self {
            ServiceError::Validation(_) => 400,
            ServiceError::Authentication(_) => 401,
            ServiceError::Authorization(_) => 403,
            ServiceError::NotFound(_) => 404,
            ServiceError::Conflict(_) => 400,
            ServiceError::PayloadTooLarge(_) => 413,
            ServiceError::Llm(_) | ServiceError::Index(_) | ServiceError::Upstream(_) => 503,
            ServiceError::Serialization(_) => 400,
            _ => 500,
        }
    }
}
