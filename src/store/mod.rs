//! SQLite-backed persistence for trained models and the embedding corpus.

pub mod embeddings;
pub mod models;

use std::path::Path;

use rusqlite::Connection;
use thiserror::Error;

pub use embeddings::{EmbeddingRecord, EmbeddingStore};
pub use models::{ModelEntry, ModelStore, StoredModel};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("model {0} not found")]
    NotFound(String),
    #[error("stored model {name} is incompatible: {reason}")]
    Incompatible { name: String, reason: String },
    #[error("embedding dimension mismatch: corpus uses {expected}, record has {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("invalid embedding: {0}")]
    InvalidEmbedding(String),
}

fn open_connection(path: &Path) -> Result<Connection, StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let conn = Connection::open(path)?;
    conn.execute_batch(
        "
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        PRAGMA temp_store=MEMORY;
        ",
    )?;
    Ok(conn)
}
