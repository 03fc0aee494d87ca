//! Runtime settings registry
//!
//! Admin-tunable settings persisted in the record store. Each setting is a
//! tagged value with declared type, bounds and category; updates validate
//! against the definition before anything is written. Readers take a cheap
//! snapshot so an in-flight query keeps the values it started with.

use crate::error::{Result, ServiceError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqlitePool, Row};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};
use utoipa::ToSchema;

/// A typed setting value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

impl SettingValue {
    pub fn data_type(&self) -> &'static str {
        match self {
            SettingValue::Int(_) => "int",
            SettingValue::Float(_) => "float",
            SettingValue::Bool(_) => "bool",
            SettingValue::Str(_) => "string",
        }
    }

    /// Storage encoding for the settings table
    pub fn render(&self) -> String {
        match self {
            SettingValue::Int(v) => v.to_string(),
            SettingValue::Float(v) => v.to_string(),
            SettingValue::Bool(v) => v.to_string(),
            SettingValue::Str(v) => v.clone(),
        }
    }

    /// Parse a stored string back into a typed value
    pub fn parse(data_type: &str, raw: &str) -> Result<Self> {
        match data_type {
            "int" => raw
                .parse::<i64>()
                .map(SettingValue::Int)
                .map_err(|e| ServiceError::Config(format!("bad int setting: {}", e))),
            "float" => raw
                .parse::<f64>()
                .map(SettingValue::Float)
                .map_err(|e| ServiceError::Config(format!("bad float setting: {}", e))),
            "bool" => raw
                .parse::<bool>()
                .map(SettingValue::Bool)
                .map_err(|e| ServiceError::Config(format!("bad bool setting: {}", e))),
            "string" => Ok(SettingValue::Str(raw.to_string())),
            other => Err(ServiceError::Config(format!(
                "unknown setting data type: {}",
                other
            ))),
        }
    }

    /// Coerce a JSON request value into the declared type.
    ///
    /// An integer JSON number is accepted for a float setting; nothing else
    /// crosses types.
    pub fn from_json(data_type: &str, value: &serde_json::Value) -> Result<Self> {
        match data_type {
            "int" => value
                .as_i64()
                .map(SettingValue::Int)
                .ok_or_else(|| ServiceError::Validation("expected an integer value".to_string())),
            "float" => value
                .as_f64()
                .map(SettingValue::Float)
                .ok_or_else(|| ServiceError::Validation("expected a numeric value".to_string())),
            "bool" => value
                .as_bool()
                .map(SettingValue::Bool)
                .ok_or_else(|| ServiceError::Validation("expected a boolean value".to_string())),
            "string" => value
                .as_str()
                .map(|s| SettingValue::Str(s.to_string()))
                .ok_or_else(|| ServiceError::Validation("expected a string value".to_string())),
            other => Err(ServiceError::Config(format!(
                "unknown setting data type: {}",
                other
            ))),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            SettingValue::Int(v) => serde_json::json!(v),
            SettingValue::Float(v) => serde_json::json!(v),
            SettingValue::Bool(v) => serde_json::json!(v),
            SettingValue::Str(v) => serde_json::json!(v),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SettingValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SettingValue::Float(v) => Some(*v),
            SettingValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SettingValue::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SettingValue::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

/// Definition of a setting: type, default, bounds, placement
#[derive(Debug, Clone)]
pub struct SettingDef {
    pub name: &'static str,
    pub default: SettingValue,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub max_length: Option<usize>,
    pub category: &'static str,
    pub description: &'static str,
}

impl SettingDef {
    /// Check a candidate value against type and range constraints
    pub fn validate(&self, value: &SettingValue) -> Result<()> {
        if value.data_type() != self.default.data_type() {
            return Err(ServiceError::Validation(format!(
                "setting '{}' expects {}, got {}",
                self.name,
                self.default.data_type(),
                value.data_type()
            )));
        }

        match value {
            SettingValue::Int(v) => {
                let v = *v as f64;
                if let Some(min) = self.min {
                    if v < min {
                        return Err(ServiceError::Validation(format!(
                            "setting '{}' must be >= {}",
                            self.name, min
                        )));
                    }
                }
                if let Some(max) = self.max {
                    if v > max {
                        return Err(ServiceError::Validation(format!(
                            "setting '{}' must be <= {}",
                            self.name, max
                        )));
                    }
                }
            }
            SettingValue::Float(v) => {
                if !v.is_finite() {
                    return Err(ServiceError::Validation(format!(
                        "setting '{}' must be finite",
                        self.name
                    )));
                }
                if let Some(min) = self.min {
                    if *v < min {
                        return Err(ServiceError::Validation(format!(
                            "setting '{}' must be >= {}",
                            self.name, min
                        )));
                    }
                }
                if let Some(max) = self.max {
                    if *v > max {
                        return Err(ServiceError::Validation(format!(
                            "setting '{}' must be <= {}",
                            self.name, max
                        )));
                    }
                }
            }
            SettingValue::Str(v) => {
                if v.is_empty() {
                    return Err(ServiceError::Validation(format!(
                        "setting '{}' cannot be empty",
                        self.name
                    )));
                }
                if let Some(max_len) = self.max_length {
                    if v.len() > max_len {
                        return Err(ServiceError::Validation(format!(
                            "setting '{}' must be at most {} characters",
                            self.name, max_len
                        )));
                    }
                }
            }
            SettingValue::Bool(_) => {}
        }

        Ok(())
    }
}

/// The built-in settings catalog
pub fn builtin_settings() -> Vec<SettingDef> {
    vec![
        SettingDef {
            name: "chunk_size",
            default: SettingValue::Int(800),
            min: Some(100.0),
            max: Some(4000.0),
            max_length: None,
            category: "ingestion",
            description: "Target chunk length in characters for document splitting",
        },
        SettingDef {
            name: "chunk_overlap",
            default: SettingValue::Int(150),
            min: Some(0.0),
            max: Some(500.0),
            max_length: None,
            category: "ingestion",
            description: "Characters shared between consecutive chunks",
        },
        SettingDef {
            name: "max_file_size_mb",
            default: SettingValue::Int(10),
            min: Some(1.0),
            max: Some(100.0),
            max_length: None,
            category: "ingestion",
            description: "Upload size ceiling in megabytes",
        },
        SettingDef {
            name: "top_k",
            default: SettingValue::Int(5),
            min: Some(1.0),
            max: Some(20.0),
            max_length: None,
            category: "retrieval",
            description: "Upper bound on retrieved chunks per query",
        },
        SettingDef {
            name: "similarity_threshold",
            default: SettingValue::Float(0.7),
            min: Some(0.0),
            max: Some(1.0),
            max_length: None,
            category: "retrieval",
            description: "Minimum cosine similarity for a chunk to count as a hit",
        },
        SettingDef {
            name: "max_conversation_turns",
            default: SettingValue::Int(10),
            min: Some(1.0),
            max: Some(50.0),
            max_length: None,
            category: "retrieval",
            description: "Conversation turns included in the prompt window",
        },
        SettingDef {
            name: "chat_model",
            default: SettingValue::Str("gemini-2.5-flash".to_string()),
            min: None,
            max: None,
            max_length: Some(100),
            category: "generation",
            description: "Chat completion model name",
        },
        SettingDef {
            name: "embedding_model",
            default: SettingValue::Str("text-embedding-004".to_string()),
            min: None,
            max: None,
            max_length: Some(100),
            category: "generation",
            description: "Embedding model name",
        },
        SettingDef {
            name: "gemini_temperature",
            default: SettingValue::Float(0.7),
            min: Some(0.0),
            max: Some(2.0),
            max_length: None,
            category: "generation",
            description: "Sampling temperature for chat completion",
        },
        SettingDef {
            name: "gemini_max_tokens",
            default: SettingValue::Int(2048),
            min: Some(1.0),
            max: Some(8192.0),
            max_length: None,
            category: "generation",
            description: "Maximum output tokens per generation",
        },
        SettingDef {
            name: "access_token_expire_minutes",
            default: SettingValue::Int(30),
            min: Some(5.0),
            max: Some(1440.0),
            max_length: None,
            category: "auth",
            description: "Bearer token lifetime in minutes",
        },
        SettingDef {
            name: "rate_limit_per_minute",
            default: SettingValue::Int(60),
            min: Some(1.0),
            max: Some(1000.0),
            max_length: None,
            category: "limits",
            description: "Requests per user per minute advertised to clients",
        },
    ]
}

/// Serializable view of a setting for the admin API
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SettingView {
    pub name: String,
    pub value: serde_json::Value,
    pub default_value: serde_json::Value,
    pub data_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    pub category: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<String>,
}

/// Outcome of an update: old and new values for the audit trail
#[derive(Debug, Clone)]
pub struct SettingUpdate {
    pub name: String,
    pub old: SettingValue,
    pub new: SettingValue,
}

/// Immutable snapshot of every current value
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    values: HashMap<String, SettingValue>,
}

impl Snapshot {
    pub fn get(&self, name: &str) -> Option<&SettingValue> {
        self.values.get(name)
    }

    fn int(&self, name: &str, fallback: i64) -> i64 {
        self.values.get(name).and_then(|v| v.as_i64()).unwrap_or(fallback)
    }

    fn float(&self, name: &str, fallback: f64) -> f64 {
        self.values.get(name).and_then(|v| v.as_f64()).unwrap_or(fallback)
    }

    fn string(&self, name: &str, fallback: &str) -> String {
        self.values
            .get(name)
            .and_then(|v| v.as_str())
            .unwrap_or(fallback)
            .to_string()
    }

    pub fn chunk_size(&self) -> usize {
        self.int("chunk_size", 800).max(1) as usize
    }

    pub fn chunk_overlap(&self) -> usize {
        self.int("chunk_overlap", 150).max(0) as usize
    }

    pub fn max_file_size_bytes(&self) -> usize {
        self.int("max_file_size_mb", 10).max(1) as usize * 1_000_000
    }

    pub fn top_k(&self) -> usize {
        self.int("top_k", 5).clamp(1, 20) as usize
    }

    pub fn similarity_threshold(&self) -> f32 {
        self.float("similarity_threshold", 0.7) as f32
    }

    pub fn max_conversation_turns(&self) -> usize {
        self.int("max_conversation_turns", 10).max(1) as usize
    }

    pub fn chat_model(&self) -> String {
        self.string("chat_model", "gemini-2.5-flash")
    }

    pub fn embedding_model(&self) -> String {
        self.string("embedding_model", "text-embedding-004")
    }

    pub fn temperature(&self) -> f32 {
        self.float("gemini_temperature", 0.7) as f32
    }

    pub fn max_tokens(&self) -> u32 {
        self.int("gemini_max_tokens", 2048).max(1) as u32
    }

    pub fn access_token_expire_minutes(&self) -> i64 {
        self.int("access_token_expire_minutes", 30).max(1)
    }
}

/// SQLite-backed settings store with an in-process snapshot
pub struct SettingsStore {
    pool: SqlitePool,
    defs: HashMap<&'static str, SettingDef>,
    snapshot: RwLock<Arc<Snapshot>>,
}

impl SettingsStore {
    /// Create the table, seed missing rows and load the first snapshot
    pub async fn initialize(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS settings (
                name TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                default_value TEXT NOT NULL,
                data_type TEXT NOT NULL,
                min_value REAL,
                max_value REAL,
                max_length INTEGER,
                category TEXT NOT NULL,
                description TEXT NOT NULL,
                updated_at TEXT,
                updated_by TEXT
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let defs: HashMap<&'static str, SettingDef> = builtin_settings()
            .into_iter()
            .map(|d| (d.name, d))
            .collect();

        for def in defs.values() {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO settings
                    (name, value, default_value, data_type, min_value, max_value,
                     max_length, category, description)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
            )
            .bind(def.name)
            .bind(def.default.render())
            .bind(def.default.render())
            .bind(def.default.data_type())
            .bind(def.min)
            .bind(def.max)
            .bind(def.max_length.map(|v| v as i64))
            .bind(def.category)
            .bind(def.description)
            .execute(&pool)
            .await?;
        }

        let store = Self {
            pool,
            defs,
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
        };
        store.refresh().await?;
        info!("Settings registry initialized with {} settings", store.defs.len());
        Ok(store)
    }

    pub fn definition(&self, name: &str) -> Option<&SettingDef> {
        self.defs.get(name)
    }

    /// Current snapshot; the Arc keeps it stable for the caller's lifetime
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot
            .read()
            .expect("settings snapshot lock poisoned")
            .clone()
    }

    /// Reload the snapshot from storage
    pub async fn refresh(&self) -> Result<()> {
        let rows = sqlx::query("SELECT name, value, data_type FROM settings")
            .fetch_all(&self.pool)
            .await?;

        let mut values = HashMap::new();
        for row in rows {
            let name: String = row.get("name");
            let raw: String = row.get("value");
            let data_type: String = row.get("data_type");
            values.insert(name, SettingValue::parse(&data_type, &raw)?);
        }

        let mut guard = self
            .snapshot
            .write()
            .expect("settings snapshot lock poisoned");
        *guard = Arc::new(Snapshot { values });
        debug!("Settings snapshot refreshed");
        Ok(())
    }

    /// List every setting as an API view
    pub async fn list(&self) -> Result<Vec<SettingView>> {
        let rows = sqlx::query("SELECT * FROM settings ORDER BY category, name")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_view).collect()
    }

    /// One setting by name
    pub async fn get_view(&self, name: &str) -> Result<SettingView> {
        let row = sqlx::query("SELECT * FROM settings WHERE name = ?1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("setting '{}'", name)))?;
        Self::row_to_view(&row)
    }

    fn row_to_view(row: &sqlx::sqlite::SqliteRow) -> Result<SettingView> {
        let data_type: String = row.get("data_type");
        let raw: String = row.get("value");
        let raw_default: String = row.get("default_value");
        let updated_at: Option<String> = row.get("updated_at");

        Ok(SettingView {
            name: row.get("name"),
            value: SettingValue::parse(&data_type, &raw)?.to_json(),
            default_value: SettingValue::parse(&data_type, &raw_default)?.to_json(),
            data_type,
            min: row.get("min_value"),
            max: row.get("max_value"),
            category: row.get("category"),
            description: row.get("description"),
            updated_at: updated_at
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|dt| dt.with_timezone(&Utc)),
            updated_by: row.get("updated_by"),
        })
    }

    /// Validate and persist a new value inside the given transaction.
    ///
    /// The write stays invisible until the caller commits; the snapshot must
    /// be refreshed after commit via [`SettingsStore::refresh`].
    pub async fn update_tx(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        name: &str,
        value: &serde_json::Value,
        updated_by: &str,
    ) -> Result<SettingUpdate> {
        let def = self
            .defs
            .get(name)
            .ok_or_else(|| ServiceError::NotFound(format!("setting '{}'", name)))?;

        let candidate = SettingValue::from_json(def.default.data_type(), value)?;
        def.validate(&candidate)?;

        let row = sqlx::query("SELECT value, data_type FROM settings WHERE name = ?1")
            .bind(name)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("setting '{}'", name)))?;
        let raw: String = row.get("value");
        let data_type: String = row.get("data_type");
        let old = SettingValue::parse(&data_type, &raw)?;

        sqlx::query(
            "UPDATE settings SET value = ?1, updated_at = ?2, updated_by = ?3 WHERE name = ?4",
        )
        .bind(candidate.render())
        .bind(Utc::now().to_rfc3339())
        .bind(updated_by)
        .bind(name)
        .execute(&mut **tx)
        .await?;

        Ok(SettingUpdate {
            name: name.to_string(),
            old,
            new: candidate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> SettingsStore {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        SettingsStore::initialize(pool).await.unwrap()
    }

    #[tokio::test]
    async fn test_seeded_defaults() {
        let store = test_store().await;
        let snap = store.snapshot();

        assert_eq!(snap.chunk_size(), 800);
        assert_eq!(snap.top_k(), 5);
        assert!((snap.similarity_threshold() - 0.7).abs() < 1e-6);
        assert_eq!(snap.chat_model(), "gemini-2.5-flash");
    }

    #[tokio::test]
    async fn test_update_persists_and_refreshes() {
        let store = test_store().await;

        let mut tx = store.pool.begin().await.unwrap();
        let update = store
            .update_tx(&mut tx, "chunk_size", &serde_json::json!(1000), "admin")
            .await
            .unwrap();
        tx.commit().await.unwrap();
        store.refresh().await.unwrap();

        assert_eq!(update.old, SettingValue::Int(800));
        assert_eq!(update.new, SettingValue::Int(1000));
        assert_eq!(store.snapshot().chunk_size(), 1000);

        let view = store.get_view("chunk_size").await.unwrap();
        assert_eq!(view.value, serde_json::json!(1000));
        assert_eq!(view.default_value, serde_json::json!(800));
        assert_eq!(view.updated_by.as_deref(), Some("admin"));
    }

    #[tokio::test]
    async fn test_update_below_min_rejected() {
        let store = test_store().await;

        let mut tx = store.pool.begin().await.unwrap();
        let result = store
            .update_tx(&mut tx, "chunk_size", &serde_json::json!(50), "admin")
            .await;
        assert!(matches!(result, Err(ServiceError::Validation(_))));
        tx.rollback().await.unwrap();

        // Nothing persisted
        assert_eq!(store.snapshot().chunk_size(), 800);
    }

    #[tokio::test]
    async fn test_update_wrong_type_rejected() {
        let store = test_store().await;

        let mut tx = store.pool.begin().await.unwrap();
        let result = store
            .update_tx(&mut tx, "chunk_size", &serde_json::json!("big"), "admin")
            .await;
        assert!(matches!(result, Err(ServiceError::Validation(_))));
    }

    #[tokio::test]
    async fn test_unknown_setting_not_found() {
        let store = test_store().await;

        let mut tx = store.pool.begin().await.unwrap();
        let result = store
            .update_tx(&mut tx, "nonexistent", &serde_json::json!(1), "admin")
            .await;
        assert!(matches!(result, Err(ServiceError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_string_setting_max_length() {
        let store = test_store().await;

        let long = "x".repeat(200);
        let mut tx = store.pool.begin().await.unwrap();
        let result = store
            .update_tx(&mut tx, "chat_model", &serde_json::json!(long), "admin")
            .await;
        assert!(matches!(result, Err(ServiceError::Validation(_))));
    }

    #[tokio::test]
    async fn test_snapshot_isolated_from_later_updates() {
        let store = test_store().await;
        let before = store.snapshot();

        let mut tx = store.pool.begin().await.unwrap();
        store
            .update_tx(&mut tx, "top_k", &serde_json::json!(9), "admin")
            .await
            .unwrap();
        tx.commit().await.unwrap();
        store.refresh().await.unwrap();

        // The earlier snapshot keeps its values
        assert_eq!(before.top_k(), 5);
        assert_eq!(store.snapshot().top_k(), 9);
    }

    #[test]
    fn test_value_json_coercion() {
        let v = SettingValue::from_json("float", &serde_json::json!(1)).unwrap();
        assert_eq!(v, SettingValue::Float(1.0));

        assert!(SettingValue::from_json("int", &serde_json::json!(1.5)).is_err());
        assert!(SettingValue::from_json("bool", &serde_json::json!("yes")).is_err());
    }

    #[test]
    fn test_value_render_parse_roundtrip() {
        for v in [
            SettingValue::Int(42),
            SettingValue::Float(0.25),
            SettingValue::Bool(true),
            SettingValue::Str("model-name".to_string()),
        ] {
            let parsed = SettingValue::parse(v.data_type(), &v.render()).unwrap();
            assert_eq!(parsed, v);
        }
    }
}
