//! SQLite-backed memory store

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{Connection, params};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::memory::{MemoryRecord, MemoryStore, rank};

/// Rows scanned per query, newest first
const SCAN_LIMIT: i64 = 5000;

/// SQLite memory store (thread-safe via Arc<Mutex>)
pub struct SqliteMemory {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteMemory {
    /// Open or create the database at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }
        let conn = Connection::open(path.as_ref()).context("Failed to open SQLite database")?;
        info!("Initializing memory database at {:?}", path.as_ref());
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS memories (
                id TEXT PRIMARY KEY,
                collection TEXT NOT NULL,
                content TEXT NOT NULL,
                metadata TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )
        .context("Failed to create memories table")?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_memories_collection ON memories(collection, created_at)",
            [],
        )
        .context("Failed to create memories index")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Number of documents in a collection
    pub async fn count(&self, collection: &str) -> Result<usize> {
        let conn = Arc::clone(&self.conn);
        let collection = collection.to_owned();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(|poisoned| {
                warn!("Database mutex was poisoned, recovering");
                poisoned.into_inner()
            });
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM memories WHERE collection = ?1",
                params![&collection],
                |row| row.get(0),
            )?;
            Ok(n as usize)
        })
        .await
        .context("spawn_blocking task panicked")?
    }
}

#[async_trait]
impl MemoryStore for SqliteMemory {
    async fn store_in(
        &self,
        collection: &str,
        content: &str,
        metadata: Map<String, Value>,
    ) -> Result<String> {
        let conn = Arc::clone(&self.conn);
        let record = MemoryRecord::new(collection, content, metadata);
        let metadata_json =
            serde_json::to_string(&record.metadata).context("Failed to serialize metadata")?;

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(|poisoned| {
                warn!("Database mutex was poisoned, recovering");
                poisoned.into_inner()
            });
            conn.execute(
                "INSERT INTO memories (id, collection, content, metadata, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    &record.id,
                    &record.collection,
                    &record.content,
                    metadata_json,
                    record.created_at.to_rfc3339(),
                ],
            )?;
            debug!("Stored memory {} in {}", record.id, record.collection);
            Ok(record.id)
        })
        .await
        .context("spawn_blocking task panicked")?
    }

    async fn query_typed(
        &self,
        collection: &str,
        query: &str,
        n: usize,
        type_filter: Option<&str>,
    ) -> Result<Vec<MemoryRecord>> {
        let conn = Arc::clone(&self.conn);
        let collection = collection.to_owned();
        let type_filter = type_filter.map(str::to_owned);

        let candidates = tokio::task::spawn_blocking(move || -> Result<Vec<MemoryRecord>> {
            let conn = conn.lock().unwrap_or_else(|poisoned| {
                warn!("Database mutex was poisoned, recovering");
                poisoned.into_inner()
            });
            let mut stmt = conn.prepare(
                "SELECT id, collection, content, metadata, created_at
                 FROM memories
                 WHERE collection = ?1
                   AND (?3 IS NULL OR json_extract(metadata, '$.type') = ?3)
                 ORDER BY created_at DESC, rowid DESC
                 LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![&collection, SCAN_LIMIT, &type_filter], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                })?
                .filter_map(|row| match row {
                    Ok((id, collection, content, metadata, created_at)) => {
                        let metadata = serde_json::from_str(&metadata).unwrap_or_else(|e| {
                            warn!("Memory {} has unreadable metadata: {}", id, e);
                            Map::new()
                        });
                        Some(MemoryRecord {
                            id,
                            collection,
                            content,
                            metadata,
                            created_at: created_at.parse().unwrap_or_else(|_| Utc::now()),
                            score: 0.0,
                        })
                    }
                    Err(e) => {
                        warn!("Skipping unreadable memory row: {}", e);
                        None
                    }
                })
                .collect();
            Ok(rows)
        })
        .await
        .context("spawn_blocking task panicked")??;

        Ok(rank(query, candidates, n))
    }
}
