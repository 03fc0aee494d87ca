//! Retrieval-augmented query engine
//!
//! Given an authenticated user, a question and an optional session, the
//! engine retrieves relevant chunks, assembles a prompt from system
//! instructions, retrieved context, bounded history and the query, and
//! drives the chat model with bounded retry. When no useful retrieval is
//! available it falls back to a single combined classify-and-respond call.

use crate::error::{Result, ServiceError};
use crate::index::{ScoredChunk, VectorIndex};
use crate::llm::{
    generate_with_retry, system_message, user_message, ChatClient, EmbeddingClient,
    GenerationOptions, Message, Role,
};
use crate::sessions::{SessionStore, StoredMessage};
use crate::settings::SettingsStore;
use crate::store::User;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use utoipa::ToSchema;

/// Canned opening of the out-of-domain refusal
pub const REFUSAL_PREFIX: &str =
    "I'm a financial assistant specialized in finance-related topics";

/// Transport bound on source excerpt length
const SOURCE_EXCERPT_CHARS: usize = 200;

const SYSTEM_INSTRUCTIONS: &str = "\
You are a knowledgeable financial assistant. Answer the user's question using \
the retrieved document excerpts below. Ground every figure and claim in the \
excerpts; when they do not contain the answer, say so plainly instead of \
guessing. Keep answers concise and professional.";

const NO_CONTEXT_INSTRUCTIONS: &str = "\
You are a knowledgeable financial assistant. No documents are available for \
this question, so work in two steps. First decide whether the question is \
within the financial domain: finance, investing, markets, accounting, \
banking, budgeting, taxes or the economy. If it is, answer it from your \
general financial knowledge, noting that no uploaded documents informed the \
answer. If it is not about finance, reply with exactly this sentence and \
nothing else: \"I'm a financial assistant specialized in finance-related \
topics. Please ask me something about finance, markets, or your financial \
documents.\"";

/// A cited source in the response
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct Source {
    pub document_id: String,
    pub filename: String,
    pub chunk_text: String,
    pub relevance_score: f32,
}

/// Engine result: the answer plus its provenance
#[derive(Debug, Clone)]
pub struct QueryOutcome {
    pub answer: String,
    pub sources: Vec<Source>,
    pub session_id: String,
}

/// The query engine
pub struct RagEngine {
    chat: Arc<dyn ChatClient>,
    embedder: Arc<dyn EmbeddingClient>,
    index: Arc<dyn VectorIndex>,
    sessions: Arc<SessionStore>,
    settings: Arc<SettingsStore>,
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    text.chars().take(max_chars).collect()
}

impl RagEngine {
    pub fn new(
        chat: Arc<dyn ChatClient>,
        embedder: Arc<dyn EmbeddingClient>,
        index: Arc<dyn VectorIndex>,
        sessions: Arc<SessionStore>,
        settings: Arc<SettingsStore>,
    ) -> Self {
        Self {
            chat,
            embedder,
            index,
            sessions,
            settings,
        }
    }

    /// Answer a query for the user, creating or validating the session
    pub async fn query(
        &self,
        user: &User,
        query: &str,
        session_id: Option<&str>,
    ) -> Result<QueryOutcome> {
        let query = query.trim();
        if query.is_empty() || query.chars().count() > 2000 {
            return Err(ServiceError::Validation(
                "query must be between 1 and 2000 characters".to_string(),
            ));
        }

        // One snapshot per query; concurrent config updates apply to the next
        let snapshot = self.settings.snapshot();
        let options = GenerationOptions {
            model: snapshot.chat_model(),
            temperature: snapshot.temperature(),
            max_tokens: snapshot.max_tokens(),
        };

        let session = self.sessions.ensure_session(&user.id, session_id).await?;
        let window = snapshot.max_conversation_turns() * 2;
        let history = self.sessions.history(&session.id, window).await?;

        // Fast path: nothing indexed, skip embedding and retrieval entirely
        match self.index.is_empty().await {
            Ok(true) => {
                debug!("Index empty, taking no-context path");
                return self
                    .no_context(&session.id, query, &history, &options)
                    .await;
            }
            Ok(false) => {}
            Err(e) => {
                warn!("is_empty probe failed, degrading to no-context: {}", e);
                return self
                    .no_context(&session.id, query, &history, &options)
                    .await;
            }
        }

        let query_vector = match self
            .embedder
            .embed(query, &snapshot.embedding_model())
            .await
        {
            Ok(response) => response.embedding,
            Err(e) => {
                warn!("Query embedding failed, degrading to no-context: {}", e);
                return self
                    .no_context(&session.id, query, &history, &options)
                    .await;
            }
        };

        let hits = match self
            .index
            .search(
                &query_vector,
                snapshot.top_k(),
                snapshot.similarity_threshold(),
            )
            .await
        {
            Ok(hits) => hits,
            Err(e) => {
                warn!("Search failed, degrading to no-context: {}", e);
                Vec::new()
            }
        };

        if hits.is_empty() {
            debug!("No hits above threshold, taking no-context path");
            return self
                .no_context(&session.id, query, &history, &options)
                .await;
        }

        let messages = build_prompt(&hits, &history, query);
        let answer = generate_with_retry(self.chat.as_ref(), &messages, &options)
            .await
            .map_err(ServiceError::Llm)?;

        self.sessions
            .append_pair(&session.id, query, &answer.text, Utc::now())
            .await?;

        let sources = hits
            .iter()
            .map(|hit| Source {
                document_id: hit.document_id.clone(),
                filename: hit.metadata.filename.clone(),
                chunk_text: truncate_chars(&hit.content, SOURCE_EXCERPT_CHARS),
                relevance_score: hit.score,
            })
            .collect();

        info!(
            "Answered query in session {} with {} sources",
            session.id,
            hits.len()
        );

        Ok(QueryOutcome {
            answer: answer.text,
            sources,
            session_id: session.id,
        })
    }

    /// One combined classify-and-respond call; the domain decision lives in
    /// the prompt, not in code. The exchange persists like a normal pair.
    async fn no_context(
        &self,
        session_id: &str,
        query: &str,
        history: &[StoredMessage],
        options: &GenerationOptions,
    ) -> Result<QueryOutcome> {
        let mut messages = vec![system_message(NO_CONTEXT_INSTRUCTIONS)];
        messages.extend(history_messages(history));
        messages.push(user_message(query));

        let answer = generate_with_retry(self.chat.as_ref(), &messages, options)
            .await
            .map_err(ServiceError::Llm)?;

        self.sessions
            .append_pair(session_id, query, &answer.text, Utc::now())
            .await?;

        Ok(QueryOutcome {
            answer: answer.text,
            sources: Vec::new(),
            session_id: session_id.to_string(),
        })
    }
}

fn history_messages(history: &[StoredMessage]) -> Vec<Message> {
    history
        .iter()
        .map(|m| Message {
            role: m.role,
            content: m.content.clone(),
        })
        .collect()
}

/// Assemble the prompt: system instructions, retrieved documents annotated
/// with their filenames, role-tagged history oldest first, then the query.
/// Absent regions are omitted rather than emitted empty.
fn build_prompt(hits: &[ScoredChunk], history: &[StoredMessage], query: &str) -> Vec<Message> {
    let mut context = String::from("Retrieved documents:\n");
    for hit in hits {
        context.push_str(&format!("[{}]\n{}\n\n", hit.metadata.filename, hit.content));
    }

    if !history.is_empty() {
        context.push_str("Conversation history:\n");
        for message in history {
            let tag = match message.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
                Role::System => "System",
            };
            context.push_str(&format!("{}: {}\n", tag, message.content));
        }
        context.push('\n');
    }

    context.push_str(&format!("Question: {}", query));

    vec![system_message(SYSTEM_INSTRUCTIONS), user_message(context)]
}
