//! Finrag
//!
//! A multi-tenant retrieval-augmented generation service for financial
//! question answering:
//! - document ingestion (PDF/DOCX/TXT) with overlap chunking and batch
//!   embedding into a cosine-similarity vector index
//! - a query engine that interleaves retrieved context with conversation
//!   history and drives a Gemini chat model with bounded retry
//! - bearer-token auth with an admin control plane whose every mutation is
//!   written to an append-only activity log
//!
//! # Example
//!
//! ```rust,no_run
//! use finrag::api::{start_server, AppState};
//! use finrag::config::ServiceConfig;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ServiceConfig::from_file("config.toml")?;
//!     config.validate()?;
//!
//!     let state = AppState::new(config.clone()).await?;
//!     start_server(state, &config.server.host, config.server.port).await?;
//!     Ok(())
//! }
//! ```

pub mod activity;
pub mod admin;
pub mod api;
pub mod auth;
pub mod chunker;
pub mod config;
pub mod error;
pub mod extract;
pub mod index;
pub mod ingest;
pub mod llm;
pub mod metrics;
pub mod rag;
pub mod sessions;
pub mod settings;
pub mod store;

// Re-export main types
pub use activity::{ActivityEntry, ActivityLogger, ActivityResult};
pub use admin::{AdminContext, AdminService};
pub use auth::AuthService;
pub use chunker::TextSplitter;
pub use config::ServiceConfig;
pub use error::{IndexError, LlmError, Result, ServiceError};
pub use extract::FileKind;
pub use index::{ChunkMetadata, ChunkRecord, ScoredChunk, SqliteVectorIndex, VectorIndex};
pub use ingest::{IngestOutcome, IngestionPipeline};
pub use llm::{ChatClient, EmbeddingClient, GeminiClient, Message, Role};
pub use metrics::MetricsSink;
pub use rag::{QueryOutcome, RagEngine, Source, REFUSAL_PREFIX};
pub use sessions::SessionStore;
pub use settings::{SettingValue, SettingsStore};
pub use store::{DocumentRecord, RecordStore, User, UserView};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
