//! Document ingestion pipeline
//!
//! Extract, chunk, embed and index an upload as one logical operation. From
//! the caller's viewpoint ingest is all-or-nothing: if any stage fails after
//! chunks were written, the partial document is deleted again before the
//! error is returned.

use crate::chunker::TextSplitter;
use crate::error::{Result, ServiceError};
use crate::extract::{extract_text, FileKind};
use crate::index::{ChunkMetadata, ChunkRecord, VectorIndex};
use crate::llm::EmbeddingClient;
use crate::settings::SettingsStore;
use crate::store::{DocumentRecord, RecordStore, User};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info};
use utoipa::ToSchema;

/// Result of a successful ingest
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct IngestOutcome {
    pub document_id: String,
    pub filename: String,
    pub chunks_created: usize,
    pub upload_date: DateTime<Utc>,
}

/// Orchestrates extraction, chunking, embedding and indexing
pub struct IngestionPipeline {
    store: Arc<RecordStore>,
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn EmbeddingClient>,
    settings: Arc<SettingsStore>,
}

/// Unique, time-derived document id
fn generate_document_id(upload_time: DateTime<Utc>) -> String {
    format!(
        "doc_{}_{:04x}",
        upload_time.timestamp_millis(),
        rand::random::<u16>()
    )
}

impl IngestionPipeline {
    pub fn new(
        store: Arc<RecordStore>,
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn EmbeddingClient>,
        settings: Arc<SettingsStore>,
    ) -> Self {
        Self {
            store,
            index,
            embedder,
            settings,
        }
    }

    /// Ingest an upload for the given user
    pub async fn ingest(
        &self,
        uploader: &User,
        filename: &str,
        bytes: &[u8],
    ) -> Result<IngestOutcome> {
        let snapshot = self.settings.snapshot();

        let kind = FileKind::from_filename(filename).ok_or_else(|| {
            ServiceError::Validation(format!(
                "unsupported file type for '{}'; expected pdf, docx or txt",
                filename
            ))
        })?;

        let max_bytes = snapshot.max_file_size_bytes();
        if bytes.len() > max_bytes {
            return Err(ServiceError::PayloadTooLarge(format!(
                "file is {} bytes, limit is {}",
                bytes.len(),
                max_bytes
            )));
        }

        let text = extract_text(kind, bytes)?;
        if text.trim().is_empty() {
            return Err(ServiceError::Validation(
                "document contains no extractable text".to_string(),
            ));
        }

        let splitter = TextSplitter::new(snapshot.chunk_size(), snapshot.chunk_overlap());
        let chunks = splitter.split(&text);
        if chunks.is_empty() {
            return Err(ServiceError::Validation(
                "document produced no chunks".to_string(),
            ));
        }

        let upload_time = Utc::now();
        let document_id = generate_document_id(upload_time);

        // Embedding failure leaves no partial state: nothing is written yet
        let embeddings = self
            .embedder
            .embed_batch(&chunks, &snapshot.embedding_model())
            .await
            .map_err(ServiceError::Llm)?;

        if embeddings.len() != chunks.len() {
            return Err(ServiceError::Upstream(format!(
                "embedding count mismatch: {} chunks, {} vectors",
                chunks.len(),
                embeddings.len()
            )));
        }

        let metadata = ChunkMetadata {
            filename: filename.to_string(),
            upload_time,
            file_type: kind.as_str().to_string(),
            file_size_bytes: bytes.len() as u64,
            uploader_user_id: uploader.id.clone(),
            uploader_username: uploader.username.clone(),
        };

        let records: Vec<ChunkRecord> = chunks
            .iter()
            .zip(embeddings)
            .enumerate()
            .map(|(i, (content, embedding))| ChunkRecord {
                id: format!("{}_chunk_{}", document_id, i),
                document_id: document_id.clone(),
                chunk_index: i,
                content: content.clone(),
                embedding,
                metadata: metadata.clone(),
            })
            .collect();

        self.index.upsert(&records).await?;

        let record = DocumentRecord {
            id: document_id.clone(),
            filename: filename.to_string(),
            uploader_user_id: uploader.id.clone(),
            uploader_username: uploader.username.clone(),
            upload_time,
            file_type: kind.as_str().to_string(),
            chunk_count: records.len(),
            file_size_bytes: bytes.len() as u64,
        };

        if let Err(e) = self.store.create_document(&record).await {
            // Roll the index write back so no orphan chunks remain
            if let Err(cleanup) = self.index.delete_by_document(&document_id).await {
                error!(
                    "Rollback of document {} failed after record write error: {}",
                    document_id, cleanup
                );
            }
            return Err(e);
        }

        info!(
            "Ingested {} as {} ({} chunks, {} bytes)",
            filename,
            document_id,
            records.len(),
            bytes.len()
        );

        Ok(IngestOutcome {
            document_id,
            filename: filename.to_string(),
            chunks_created: records.len(),
            upload_date: upload_time,
        })
    }

    /// Remove a document and its chunks, returning the removed chunk count
    pub async fn delete_document(&self, document_id: &str) -> Result<usize> {
        if self.store.get_document(document_id).await?.is_none() {
            return Err(ServiceError::NotFound(format!(
                "document {}",
                document_id
            )));
        }

        let removed = self.index.delete_by_document(document_id).await?;
        self.store.delete_document(document_id).await?;

        info!("Deleted document {} ({} chunks)", document_id, removed);
        Ok(removed)
    }
}
