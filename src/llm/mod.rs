//! Chat-completion and embedding provider contracts

pub mod gemini;

pub use gemini::GeminiClient;

use crate::error::LlmError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// Message role in a conversation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A message in a conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

/// Per-call generation parameters, resolved from the settings snapshot
#[derive(Debug, Clone)]
pub struct GenerationOptions {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Response from text generation
#[derive(Debug, Clone)]
pub struct GenerationResponse {
    pub text: String,
    pub tokens_used: Option<u32>,
    pub model: String,
    pub finish_reason: Option<String>,
}

/// Embedding response
#[derive(Debug, Clone)]
pub struct EmbeddingResponse {
    pub embedding: Vec<f32>,
    pub model: String,
}

/// Trait for chat completion
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Complete a conversation into a bounded answer
    async fn generate(
        &self,
        messages: &[Message],
        options: &GenerationOptions,
    ) -> Result<GenerationResponse, LlmError>;
}

/// Trait for text embedding
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// Embed a single text
    async fn embed(&self, text: &str, model: &str) -> Result<EmbeddingResponse, LlmError>;

    /// Embed a batch of texts.
    ///
    /// The default implementation falls back to sequential single-text
    /// embeds for providers without a batch entry point.
    async fn embed_batch(
        &self,
        texts: &[String],
        model: &str,
    ) -> Result<Vec<Vec<f32>>, LlmError> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text, model).await?.embedding);
        }
        Ok(out)
    }
}

/// Maximum retries after the first generation attempt
pub const MAX_GENERATION_RETRIES: u32 = 2;

/// Generate with bounded retry on transient provider errors.
///
/// Backoff is 1s then 2s; a provider-supplied retry-after wins when longer.
pub async fn generate_with_retry(
    client: &dyn ChatClient,
    messages: &[Message],
    options: &GenerationOptions,
) -> Result<GenerationResponse, LlmError> {
    let mut attempt = 0;
    loop {
        match client.generate(messages, options).await {
            Ok(response) => return Ok(response),
            Err(e) if e.is_retryable() && attempt < MAX_GENERATION_RETRIES => {
                let mut backoff = Duration::from_secs(1 << attempt);
                if let LlmError::RateLimited {
                    retry_after_secs: Some(secs),
                } = &e
                {
                    backoff = backoff.max(Duration::from_secs(*secs));
                }
                attempt += 1;
                warn!(
                    "Generation attempt {} failed ({}), retrying in {:?}",
                    attempt, e, backoff
                );
                tokio::time::sleep(backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Helper function to create a system message
pub fn system_message(content: impl Into<String>) -> Message {
    Message {
        role: Role::System,
        content: content.into(),
    }
}

/// Helper function to create a user message
pub fn user_message(content: impl Into<String>) -> Message {
    Message {
        role: Role::User,
        content: content.into(),
    }
}

/// Helper function to create an assistant message
pub fn assistant_message(content: impl Into<String>) -> Message {
    Message {
        role: Role::Assistant,
        content: content.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    mockall::mock! {
        Chat {}

        #[async_trait]
        impl ChatClient for Chat {
            async fn generate(
                &self,
                messages: &[Message],
                options: &GenerationOptions,
            ) -> Result<GenerationResponse, LlmError>;
        }
    }

    #[test]
    fn test_message_creation() {
        let system_msg = system_message("You are a financial assistant");
        assert_eq!(system_msg.role, Role::System);

        let user_msg = user_message("What is compound interest?");
        assert_eq!(user_msg.role, Role::User);
        assert_eq!(user_msg.content, "What is compound interest?");
    }

    #[test]
    fn test_role_lowercase_serialization() {
        assert_eq!(serde_json::to_string(&Role::System).unwrap(), "\"system\"");
        assert_eq!(serde_json::to_string(&Role::User).unwrap(), "\"user\"");
        assert_eq!(
            serde_json::to_string(&Role::Assistant).unwrap(),
            "\"assistant\""
        );
    }

    struct FlakyClient {
        calls: AtomicU32,
        fail_times: u32,
        error: fn() -> LlmError,
    }

    #[async_trait]
    impl ChatClient for FlakyClient {
        async fn generate(
            &self,
            _messages: &[Message],
            options: &GenerationOptions,
        ) -> Result<GenerationResponse, LlmError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_times {
                Err((self.error)())
            } else {
                Ok(GenerationResponse {
                    text: "ok".to_string(),
                    tokens_used: Some(3),
                    model: options.model.clone(),
                    finish_reason: Some("stop".to_string()),
                })
            }
        }
    }

    fn options() -> GenerationOptions {
        GenerationOptions {
            model: "test-model".to_string(),
            temperature: 0.7,
            max_tokens: 128,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_from_transient_errors() {
        let client = FlakyClient {
            calls: AtomicU32::new(0),
            fail_times: 2,
            error: || LlmError::Timeout,
        };

        let response = generate_with_retry(&client, &[user_message("hi")], &options())
            .await
            .unwrap();
        assert_eq!(response.text, "ok");
        assert_eq!(client.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up_after_two_retries() {
        let client = FlakyClient {
            calls: AtomicU32::new(0),
            fail_times: 10,
            error: || LlmError::ConnectionFailed("refused".to_string()),
        };

        let result = generate_with_retry(&client, &[user_message("hi")], &options()).await;
        assert!(result.is_err());
        // one initial attempt plus two retries
        assert_eq!(client.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_immediately() {
        let client = FlakyClient {
            calls: AtomicU32::new(0),
            fail_times: 10,
            error: || LlmError::InvalidRequest("bad payload".to_string()),
        };

        let result = generate_with_retry(&client, &[user_message("hi")], &options()).await;
        assert!(result.is_err());
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_mock_chat_client() {
        let mut mock = MockChat::new();
        mock.expect_generate().times(1).returning(|_, options| {
            Ok(GenerationResponse {
                text: "Hello! How can I help with your finances?".to_string(),
                tokens_used: Some(9),
                model: options.model.clone(),
                finish_reason: Some("stop".to_string()),
            })
        });

        let response = mock
            .generate(&[user_message("Hello")], &options())
            .await
            .unwrap();
        assert_eq!(response.tokens_used, Some(9));
    }

    #[tokio::test]
    async fn test_default_batch_embedding_falls_back_sequentially() {
        struct SingleOnly;

        #[async_trait]
        impl EmbeddingClient for SingleOnly {
            async fn embed(
                &self,
                text: &str,
                model: &str,
            ) -> Result<EmbeddingResponse, LlmError> {
                Ok(EmbeddingResponse {
                    embedding: vec![text.len() as f32],
                    model: model.to_string(),
                })
            }
        }

        let texts = vec!["a".to_string(), "bbb".to_string()];
        let vectors = SingleOnly.embed_batch(&texts, "m").await.unwrap();
        assert_eq!(vectors, vec![vec![1.0], vec![3.0]]);
    }
}
