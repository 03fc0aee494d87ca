//! Google Gemini provider implementation

use crate::config::GeminiConfig;
use crate::error::LlmError;
use crate::llm::{
    ChatClient, EmbeddingClient, EmbeddingResponse, GenerationOptions, GenerationResponse,
    Message, Role,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, info};

/// Gemini caps batch embedding requests at 100 texts
const EMBED_BATCH_LIMIT: usize = 100;

/// Gemini message format
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub parts: Vec<GeminiPart>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiPart {
    pub text: String,
}

impl From<&Message> for GeminiContent {
    fn from(msg: &Message) -> Self {
        Self {
            role: Some(match msg.role {
                Role::User => "user".to_string(),
                Role::Assistant => "model".to_string(),
                // System messages ride along as user turns
                Role::System => "user".to_string(),
            }),
            parts: vec![GeminiPart {
                text: msg.content.clone(),
            }],
        }
    }
}

/// Gemini generate request
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiRequest {
    pub contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GeminiGenerationConfig>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiGenerationConfig {
    pub temperature: f32,
    pub max_output_tokens: u32,
}

/// Gemini generate response
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    #[serde(default)]
    pub usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub content: GeminiContent,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    #[serde(default)]
    pub total_token_count: u32,
}

/// Gemini embedding request
#[derive(Debug, Serialize)]
pub struct GeminiEmbedRequest {
    pub content: GeminiContent,
}

#[derive(Debug, Serialize)]
pub struct GeminiBatchEmbedRequest {
    pub requests: Vec<GeminiBatchEmbedEntry>,
}

#[derive(Debug, Serialize)]
pub struct GeminiBatchEmbedEntry {
    pub model: String,
    pub content: GeminiContent,
}

/// Gemini embedding responses
#[derive(Debug, Deserialize)]
pub struct GeminiEmbedResponse {
    pub embedding: EmbeddingData,
}

#[derive(Debug, Deserialize)]
pub struct GeminiBatchEmbedResponse {
    pub embeddings: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
pub struct EmbeddingData {
    pub values: Vec<f32>,
}

/// Google Gemini client for chat completion and embeddings
pub struct GeminiClient {
    client: reqwest::Client,
    config: GeminiConfig,
}

impl GeminiClient {
    /// Create a new Gemini client
    pub fn new(config: GeminiConfig) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| LlmError::ConnectionFailed(e.to_string()))?;

        Ok(Self { client, config })
    }

    fn model_url(&self, model: &str, verb: &str) -> String {
        format!(
            "{}/models/{}:{}?key={}",
            self.config.base_url.trim_end_matches('/'),
            model,
            verb,
            self.config.api_key
        )
    }

    /// Map a non-success provider status onto the error taxonomy
    fn classify_status(status: u16, retry_after: Option<u64>, body: String) -> LlmError {
        match status {
            400 => LlmError::InvalidRequest(body),
            401 | 403 => LlmError::Unauthorized,
            429 => LlmError::RateLimited {
                retry_after_secs: retry_after,
            },
            s if s >= 500 => LlmError::Unavailable { status: s, body },
            _ => LlmError::GenerationFailed(body),
        }
    }

    async fn post_json<Req: Serialize, Resp: for<'de> Deserialize<'de>>(
        &self,
        url: &str,
        request: &Req,
    ) -> Result<Resp, LlmError> {
        let response = timeout(
            Duration::from_secs(self.config.timeout_secs),
            self.client.post(url).json(request).send(),
        )
        .await
        .map_err(|_| LlmError::Timeout)?
        .map_err(|e| LlmError::ConnectionFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            error!("Gemini API error ({}): {}", status, body);
            return Err(Self::classify_status(status.as_u16(), retry_after, body));
        }

        response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl ChatClient for GeminiClient {
    async fn generate(
        &self,
        messages: &[Message],
        options: &GenerationOptions,
    ) -> Result<GenerationResponse, LlmError> {
        debug!(
            "Generating with Gemini model {} using {} messages",
            options.model,
            messages.len()
        );

        let contents: Vec<GeminiContent> = messages.iter().map(GeminiContent::from).collect();
        if contents.is_empty() {
            return Err(LlmError::InvalidRequest("No messages to send".to_string()));
        }

        let request = GeminiRequest {
            contents,
            generation_config: Some(GeminiGenerationConfig {
                temperature: options.temperature,
                max_output_tokens: options.max_tokens,
            }),
        };

        let url = self.model_url(&options.model, "generateContent");
        let response: GeminiResponse = self.post_json(&url, &request).await?;

        let candidate = response
            .candidates
            .first()
            .ok_or_else(|| LlmError::InvalidResponse("No candidates in response".to_string()))?;

        let text = candidate
            .content
            .parts
            .iter()
            .map(|p| p.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        if text.trim().is_empty() {
            return Err(LlmError::InvalidResponse(
                "Empty candidate text".to_string(),
            ));
        }

        let tokens_used = response.usage_metadata.map(|u| u.total_token_count);
        info!(
            "Generated {} tokens with {}",
            tokens_used.unwrap_or(0),
            options.model
        );

        Ok(GenerationResponse {
            text,
            tokens_used,
            model: options.model.clone(),
            finish_reason: candidate.finish_reason.clone(),
        })
    }
}

#[async_trait]
impl EmbeddingClient for GeminiClient {
    async fn embed(&self, text: &str, model: &str) -> Result<EmbeddingResponse, LlmError> {
        debug!("Embedding text of length {} with {}", text.len(), model);

        let request = GeminiEmbedRequest {
            content: GeminiContent {
                role: None,
                parts: vec![GeminiPart {
                    text: text.to_string(),
                }],
            },
        };

        let url = self.model_url(model, "embedContent");
        let response: GeminiEmbedResponse = self
            .post_json(&url, &request)
            .await
            .map_err(|e| match e {
                LlmError::GenerationFailed(msg) => LlmError::EmbeddingFailed(msg),
                other => other,
            })?;

        Ok(EmbeddingResponse {
            embedding: response.embedding.values,
            model: model.to_string(),
        })
    }

    async fn embed_batch(
        &self,
        texts: &[String],
        model: &str,
    ) -> Result<Vec<Vec<f32>>, LlmError> {
        debug!("Batch-embedding {} texts with {}", texts.len(), model);

        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(EMBED_BATCH_LIMIT) {
            let request = GeminiBatchEmbedRequest {
                requests: batch
                    .iter()
                    .map(|text| GeminiBatchEmbedEntry {
                        model: format!("models/{}", model),
                        content: GeminiContent {
                            role: None,
                            parts: vec![GeminiPart { text: text.clone() }],
                        },
                    })
                    .collect(),
            };

            let url = self.model_url(model, "batchEmbedContents");
            let response: GeminiBatchEmbedResponse = self.post_json(&url, &request).await?;

            if response.embeddings.len() != batch.len() {
                return Err(LlmError::InvalidResponse(format!(
                    "batch embed returned {} vectors for {} texts",
                    response.embeddings.len(),
                    batch.len()
                )));
            }
            out.extend(response.embeddings.into_iter().map(|e| e.values));
        }

        info!("Embedded {} texts with {}", out.len(), model);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::user_message;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(base_url: String) -> GeminiConfig {
        GeminiConfig {
            api_key: "test-key".to_string(),
            base_url,
            timeout_secs: 5,
        }
    }

    fn options() -> GenerationOptions {
        GenerationOptions {
            model: "gemini-2.5-flash".to_string(),
            temperature: 0.7,
            max_tokens: 256,
        }
    }

    #[test]
    fn test_message_conversion() {
        let msg = user_message("Hello");
        let content = GeminiContent::from(&msg);
        assert_eq!(content.role.as_deref(), Some("user"));
        assert_eq!(content.parts[0].text, "Hello");

        let assistant = Message {
            role: Role::Assistant,
            content: "Hi".to_string(),
        };
        assert_eq!(
            GeminiContent::from(&assistant).role.as_deref(),
            Some("model")
        );
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            GeminiClient::classify_status(400, None, String::new()),
            LlmError::InvalidRequest(_)
        ));
        assert!(matches!(
            GeminiClient::classify_status(401, None, String::new()),
            LlmError::Unauthorized
        ));
        assert!(matches!(
            GeminiClient::classify_status(429, Some(7), String::new()),
            LlmError::RateLimited {
                retry_after_secs: Some(7)
            }
        ));
        assert!(matches!(
            GeminiClient::classify_status(503, None, String::new()),
            LlmError::Unavailable { status: 503, .. }
        ));
    }

    #[tokio::test]
    async fn test_generate_happy_path() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/gemini-2.5-flash:generateContent"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "candidates": [{
                    "content": {"role": "model", "parts": [{"text": "Compound interest is..."}]},
                    "finishReason": "STOP"
                }],
                "usageMetadata": {"totalTokenCount": 42}
            })))
            .mount(&server)
            .await;

        let client = GeminiClient::new(test_config(server.uri())).unwrap();
        let response = client
            .generate(&[user_message("What is compound interest?")], &options())
            .await
            .unwrap();

        assert_eq!(response.text, "Compound interest is...");
        assert_eq!(response.tokens_used, Some(42));
        assert_eq!(response.finish_reason.as_deref(), Some("STOP"));
    }

    #[tokio::test]
    async fn test_generate_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("retry-after", "3")
                    .set_body_string("quota exceeded"),
            )
            .mount(&server)
            .await;

        let client = GeminiClient::new(test_config(server.uri())).unwrap();
        let err = client
            .generate(&[user_message("hi")], &options())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            LlmError::RateLimited {
                retry_after_secs: Some(3)
            }
        ));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_batch_embed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/text-embedding-004:batchEmbedContents"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "embeddings": [
                    {"values": [0.1, 0.2]},
                    {"values": [0.3, 0.4]}
                ]
            })))
            .mount(&server)
            .await;

        let client = GeminiClient::new(test_config(server.uri())).unwrap();
        let texts = vec!["first".to_string(), "second".to_string()];
        let vectors = client
            .embed_batch(&texts, "text-embedding-004")
            .await
            .unwrap();

        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[0], vec![0.1, 0.2]);
    }

    #[tokio::test]
    async fn test_batch_embed_count_mismatch_is_invalid_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "embeddings": [{"values": [0.1]}]
            })))
            .mount(&server)
            .await;

        let client = GeminiClient::new(test_config(server.uri())).unwrap();
        let texts = vec!["first".to_string(), "second".to_string()];
        let err = client
            .embed_batch(&texts, "text-embedding-004")
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::InvalidResponse(_)));
    }
}
