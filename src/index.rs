//! Vector index for document chunks
//!
//! Chunks live in SQLite alongside the record store; similarity search is a
//! brute-force cosine scan, which is adequate at the corpus sizes this
//! service handles. The `is_empty` answer is cached briefly so the query hot
//! path can skip retrieval without touching storage on every request.

use crate::error::{IndexError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqlitePool, Row};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How long an is-empty answer stays fresh
const EMPTY_HINT_TTL: Duration = Duration::from_secs(30);

/// Per-chunk metadata fixed at ingest time
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkMetadata {
    pub filename: String,
    pub upload_time: DateTime<Utc>,
    pub file_type: String,
    pub file_size_bytes: u64,
    pub uploader_user_id: String,
    pub uploader_username: String,
}

/// A chunk ready for indexing
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub id: String,
    pub document_id: String,
    pub chunk_index: usize,
    pub content: String,
    pub embedding: Vec<f32>,
    pub metadata: ChunkMetadata,
}

/// A search hit
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub content: String,
    pub metadata: ChunkMetadata,
    pub score: f32,
}

/// Index statistics for the stats endpoints
#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub total_chunks: usize,
    pub unique_documents: usize,
    pub chunks_by_type: HashMap<String, usize>,
    /// Documents uploaded per day, most recent first, last 7 days
    pub recent_uploads: Vec<DailyUploads>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DailyUploads {
    pub date: String,
    pub documents: usize,
}

/// Vector index operations
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Add a chunk batch in one logical write
    async fn upsert(&self, chunks: &[ChunkRecord]) -> Result<()>;

    /// Cosine top-k with a score floor. `k` is an upper bound, hits are
    /// ordered score-descending with ties broken by chunk id.
    async fn search(&self, vector: &[f32], k: usize, min_score: f32)
        -> Result<Vec<ScoredChunk>>;

    /// Remove every chunk of a document, returning the removed count
    async fn delete_by_document(&self, document_id: &str) -> Result<usize>;

    /// Aggregate statistics
    async fn stats(&self) -> Result<IndexStats>;

    /// Whether the index holds any chunks; may be answered from a short-lived
    /// cache, so treat a positive as a hint
    async fn is_empty(&self) -> Result<bool>;
}

/// SQLite-backed vector index
pub struct SqliteVectorIndex {
    pool: SqlitePool,
    empty_hint: RwLock<Option<(bool, Instant)>>,
}

impl SqliteVectorIndex {
    /// Create the chunks table and wrap the pool
    pub async fn initialize(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chunks (
                id TEXT PRIMARY KEY,
                document_id TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                content TEXT NOT NULL,
                embedding BLOB NOT NULL,
                file_type TEXT NOT NULL,
                upload_time TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}'
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_document ON chunks(document_id)")
            .execute(&pool)
            .await?;

        info!("Vector index initialized");
        Ok(Self {
            pool,
            empty_hint: RwLock::new(None),
        })
    }

    /// Calculate cosine similarity between two vectors
    pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
        if a.len() != b.len() || a.is_empty() {
            return 0.0;
        }

        let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
        let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

        if norm_a == 0.0 || norm_b == 0.0 {
            return 0.0;
        }

        dot_product / (norm_a * norm_b)
    }

    /// Serialize embedding for storage
    pub fn serialize_embedding(embedding: &[f32]) -> Vec<u8> {
        embedding
            .iter()
            .flat_map(|f| f.to_le_bytes().to_vec())
            .collect()
    }

    /// Deserialize embedding from storage
    pub fn deserialize_embedding(data: &[u8]) -> Vec<f32> {
        data.chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect()
    }

    fn invalidate_empty_hint(&self) {
        let mut guard = self.empty_hint.write().expect("empty hint lock poisoned");
        *guard = None;
    }
}

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    async fn upsert(&self, chunks: &[ChunkRecord]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for chunk in chunks {
            let metadata_json = serde_json::to_string(&chunk.metadata)?;
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO chunks
                    (id, document_id, chunk_index, content, embedding, file_type,
                     upload_time, metadata)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
            )
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(chunk.chunk_index as i64)
            .bind(&chunk.content)
            .bind(Self::serialize_embedding(&chunk.embedding))
            .bind(&chunk.metadata.file_type)
            .bind(chunk.metadata.upload_time.to_rfc3339())
            .bind(&metadata_json)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        self.invalidate_empty_hint();

        debug!("Upserted {} chunks", chunks.len());
        Ok(())
    }

    async fn search(
        &self,
        vector: &[f32],
        k: usize,
        min_score: f32,
    ) -> Result<Vec<ScoredChunk>> {
        if vector.is_empty() {
            return Err(IndexError::InvalidDimension {
                expected: 1,
                actual: 0,
            }
            .into());
        }

        let rows = sqlx::query("SELECT id, document_id, content, embedding, metadata FROM chunks")
            .fetch_all(&self.pool)
            .await?;

        let mut results = Vec::new();
        for row in rows {
            let embedding_blob: Vec<u8> = row.get("embedding");
            let embedding = Self::deserialize_embedding(&embedding_blob);

            // Similarity clamped into [0,1] so thresholds compose
            let score = Self::cosine_similarity(vector, &embedding).max(0.0);
            if score < min_score {
                continue;
            }

            let metadata_json: String = row.get("metadata");
            let metadata: ChunkMetadata = match serde_json::from_str(&metadata_json) {
                Ok(m) => m,
                Err(e) => {
                    warn!("Skipping chunk with unreadable metadata: {}", e);
                    continue;
                }
            };

            results.push(ScoredChunk {
                chunk_id: row.get("id"),
                document_id: row.get("document_id"),
                content: row.get("content"),
                metadata,
                score,
            });
        }

        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        results.truncate(k);

        debug!(
            "Found {} chunks above threshold {}",
            results.len(),
            min_score
        );
        Ok(results)
    }

    async fn delete_by_document(&self, document_id: &str) -> Result<usize> {
        let result = sqlx::query("DELETE FROM chunks WHERE document_id = ?1")
            .bind(document_id)
            .execute(&self.pool)
            .await?;

        self.invalidate_empty_hint();

        let removed = result.rows_affected() as usize;
        debug!("Deleted {} chunks for document {}", removed, document_id);
        Ok(removed)
    }

    async fn stats(&self) -> Result<IndexStats> {
        let row = sqlx::query(
            "SELECT COUNT(*) as total, COUNT(DISTINCT document_id) as docs FROM chunks",
        )
        .fetch_one(&self.pool)
        .await?;
        let total_chunks: i64 = row.get("total");
        let unique_documents: i64 = row.get("docs");

        let type_rows = sqlx::query(
            "SELECT file_type, COUNT(*) as count FROM chunks GROUP BY file_type",
        )
        .fetch_all(&self.pool)
        .await?;
        let chunks_by_type = type_rows
            .iter()
            .map(|r| (r.get::<String, _>("file_type"), r.get::<i64, _>("count") as usize))
            .collect();

        let week_ago = (Utc::now() - chrono::Duration::days(7)).to_rfc3339();
        let upload_rows = sqlx::query(
            r#"
            SELECT substr(upload_time, 1, 10) as day,
                   COUNT(DISTINCT document_id) as documents
            FROM chunks
            WHERE upload_time >= ?1
            GROUP BY day
            ORDER BY day DESC
            "#,
        )
        .bind(week_ago)
        .fetch_all(&self.pool)
        .await?;
        let recent_uploads = upload_rows
            .iter()
            .map(|r| DailyUploads {
                date: r.get("day"),
                documents: r.get::<i64, _>("documents") as usize,
            })
            .collect();

        Ok(IndexStats {
            total_chunks: total_chunks as usize,
            unique_documents: unique_documents as usize,
            chunks_by_type,
            recent_uploads,
        })
    }

    async fn is_empty(&self) -> Result<bool> {
        {
            let guard = self.empty_hint.read().expect("empty hint lock poisoned");
            if let Some((empty, at)) = *guard {
                if at.elapsed() < EMPTY_HINT_TTL {
                    return Ok(empty);
                }
            }
        }

        let row = sqlx::query("SELECT EXISTS(SELECT 1 FROM chunks) as present")
            .fetch_one(&self.pool)
            .await?;
        let empty = row.get::<i64, _>("present") == 0;

        let mut guard = self.empty_hint.write().expect("empty hint lock poisoned");
        *guard = Some((empty, Instant::now()));
        Ok(empty)
    }
}
