use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{open_connection, StoreError};

/// Trained models keyed by name, stored as JSON payloads.
pub struct ModelStore {
    conn: Connection,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredModel<M> {
    pub name: String,
    pub kind: String,
    pub schema_fingerprint: String,
    pub saved_at_ms: i64,
    pub model: M,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelEntry {
    pub name: String,
    pub kind: String,
    pub schema_fingerprint: String,
    pub saved_at_ms: i64,
    pub payload_bytes: u64,
}

impl ModelStore {
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
            CREATE TABLE IF NOT EXISTS models (
                name TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                schema_fingerprint TEXT NOT NULL,
                saved_at_ms INTEGER NOT NULL,
                payload TEXT NOT NULL
            );
            ",
        )?;
        Ok(Self { conn })
    }

    /// Replaces any model previously saved under `name`.
    pub fn save<M: Serialize>(
        &self,
        name: &str,
        kind: &str,
        schema_fingerprint: &str,
        model: &M,
    ) -> Result<(), StoreError> {
        let payload = serde_json::to_string(model)?;
        let saved_at_ms = chrono::Utc::now().timestamp_millis();
        self.conn.execute(
            "
            INSERT INTO models (name, kind, schema_fingerprint, saved_at_ms, payload)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(name) DO UPDATE SET
                kind = excluded.kind,
                schema_fingerprint = excluded.schema_fingerprint,
                saved_at_ms = excluded.saved_at_ms,
                payload = excluded.payload
            ",
            params![name, kind, schema_fingerprint, saved_at_ms, payload],
        )?;

        info!(
            component = "store",
            event = "store.model.saved",
            name = name,
            kind = kind,
            payload_bytes = payload.len()
        );
        Ok(())
    }

    pub fn load<M: DeserializeOwned>(&self, name: &str) -> Result<StoredModel<M>, StoreError> {
        let row = self
            .conn
            .query_row(
                "
                SELECT kind, schema_fingerprint, saved_at_ms, payload
                FROM models
                WHERE name = ?1
                ",
                params![name],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;

        let Some((kind, schema_fingerprint, saved_at_ms, payload)) = row else {
            return Err(StoreError::NotFound(name.to_string()));
        };
        let model = serde_json::from_str(&payload).map_err(|err| StoreError::Incompatible {
            name: name.to_string(),
            reason: err.to_string(),
        })?;

        Ok(StoredModel {
            name: name.to_string(),
            kind,
            schema_fingerprint,
            saved_at_ms,
            model,
        })
    }

    pub fn contains(&self, name: &str) -> Result<bool, StoreError> {
        let found: Option<i64> = self
            .conn
            .query_row("SELECT 1 FROM models WHERE name = ?1", params![name], |row| row.get(0))
            .optional()?;
        Ok(found.is_some())
    }

    pub fn list(&self) -> Result<Vec<ModelEntry>, StoreError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT name, kind, schema_fingerprint, saved_at_ms, length(payload)
            FROM models
            ORDER BY name ASC
            ",
        )?;
        let entries = stmt
            .query_map([], |row| {
                Ok(ModelEntry {
                    name: row.get(0)?,
                    kind: row.get(1)?,
                    schema_fingerprint: row.get(2)?,
                    saved_at_ms: row.get(3)?,
                    payload_bytes: row.get::<_, i64>(4)? as u64,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }
}
