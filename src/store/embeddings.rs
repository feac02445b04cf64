use std::collections::BTreeMap;
use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{open_connection, StoreError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub text: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub embedding: Vec<f32>,
}

/// Append-only embedding corpus. Every record shares the dimension of the first one saved.
pub struct EmbeddingStore {
    conn: Connection,
}

impl EmbeddingStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = open_connection(path)?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS embeddings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                text TEXT NOT NULL,
                metadata TEXT NOT NULL,
                dim INTEGER NOT NULL,
                embedding BLOB NOT NULL,
                created_at_ms INTEGER NOT NULL
            );
            ",
        )?;
        Ok(Self { conn })
    }

    pub fn dimension(&self) -> Result<Option<usize>, StoreError> {
        let dim: Option<i64> = self
            .conn
            .query_row("SELECT dim FROM embeddings ORDER BY id ASC LIMIT 1", [], |row| row.get(0))
            .optional()?;
        Ok(dim.map(|d| d as usize))
    }

    pub fn len(&self) -> Result<usize, StoreError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM embeddings", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    /// Appends one record and returns its id.
    pub fn save(&self, record: &EmbeddingRecord) -> Result<i64, StoreError> {
        validate_embedding(&record.embedding)?;
        if let Some(expected) = self.dimension()? {
            if expected != record.embedding.len() {
                return Err(StoreError::DimensionMismatch {
                    expected,
                    actual: record.embedding.len(),
                });
            }
        }

        let metadata = serde_json::to_string(&record.metadata)?;
        self.conn.execute(
            "
            INSERT INTO embeddings (text, metadata, dim, embedding, created_at_ms)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ",
            params![
                record.text,
                metadata,
                record.embedding.len() as i64,
                encode_vector(&record.embedding),
                chrono::Utc::now().timestamp_millis(),
            ],
        )?;
        let id = self.conn.last_insert_rowid();

        info!(
            component = "store",
            event = "store.embedding.saved",
            id = id,
            dim = record.embedding.len(),
            text_len = record.text.len()
        );
        Ok(id)
    }

    /// Every record in insertion order.
    pub fn load_all(&self) -> Result<Vec<EmbeddingRecord>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT text, metadata, embedding FROM embeddings ORDER BY id ASC")?;
        let raw = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        raw.into_iter()
            .map(|(text, metadata, blob)| {
                Ok::<_, StoreError>(EmbeddingRecord {
                    text,
                    metadata: serde_json::from_str(&metadata)?,
                    embedding: decode_vector(&blob)?,
                })
            })
            .collect()
    }

    /// Appends records from a JSON array of `{text, metadata, embedding}` objects.
    pub fn import_json(&self, path: &Path) -> Result<usize, StoreError> {
        let bytes = std::fs::read(path)?;
        let records: Vec<EmbeddingRecord> = serde_json::from_slice(&bytes)?;
        let tx = self.conn.unchecked_transaction()?;
        for record in &records {
            self.save(record)?;
        }
        tx.commit()?;
        Ok(records.len())
    }
}

fn validate_embedding(embedding: &[f32]) -> Result<(), StoreError> {
    if embedding.is_empty() {
        return Err(StoreError::InvalidEmbedding("embedding is empty".to_string()));
    }
    if embedding.iter().any(|v| !v.is_finite()) {
        return Err(StoreError::InvalidEmbedding(
            "embedding has non-finite components".to_string(),
        ));
    }
    Ok(())
}

fn encode_vector(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_vector(blob: &[u8]) -> Result<Vec<f32>, StoreError> {
    if blob.len() % 4 != 0 {
        return Err(StoreError::InvalidEmbedding(format!(
            "stored blob of {} bytes is not a f32 vector",
            blob.len()
        )));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(text: &str, embedding: Vec<f32>) -> EmbeddingRecord {
        EmbeddingRecord {
            text: text.to_string(),
            metadata: BTreeMap::new(),
            embedding,
        }
    }

    #[test]
    fn vectors_survive_blob_encoding() {
        let values = vec![0.5f32, -1.25, 3.0e-7];
        assert_eq!(decode_vector(&encode_vector(&values)).unwrap(), values);
        assert!(decode_vector(&[0, 1, 2]).is_err());
    }

    #[test]
    fn rejects_dimension_drift_and_empty_vectors() {
        let store = EmbeddingStore::open_in_memory().unwrap();
        store.save(&record("a", vec![1.0, 0.0])).unwrap();

        assert!(matches!(
            store.save(&record("b", vec![1.0, 0.0, 0.0])),
            Err(StoreError::DimensionMismatch {
                expected: 2,
                actual: 3
            })
        ));
        assert!(matches!(
            store.save(&record("c", vec![])),
            Err(StoreError::InvalidEmbedding(_))
        ));
        assert_eq!(store.len().unwrap(), 1);
    }
}
