//! Memory store trait, scoring and the in-memory implementation

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Mutex;

/// Collection used by `store` / `get_similar`
pub const DEFAULT_COLLECTION: &str = "memories";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryRecord {
    pub id: String,
    pub collection: String,
    pub content: String,
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    /// Relevance to the query that produced this record, 0.0 to 1.0
    #[serde(default)]
    pub score: f64,
}

impl MemoryRecord {
    pub fn new(collection: &str, content: &str, metadata: Map<String, Value>) -> Self {
        Self {
            id: format!("{}_{}", collection, uuid::Uuid::new_v4()),
            collection: collection.to_string(),
            content: content.to_string(),
            metadata,
            created_at: Utc::now(),
            score: 0.0,
        }
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }
}

fn terms(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Fraction of distinct query terms that appear in `content`
pub fn keyword_score(query: &str, content: &str) -> f64 {
    let wanted = terms(query);
    if wanted.is_empty() {
        return 0.0;
    }
    let have = terms(content);
    let hits = wanted.iter().filter(|t| have.contains(*t)).count();
    hits as f64 / wanted.len() as f64
}

/// Score `candidates` (newest first) against `query` and keep the best `n`.
/// An empty query returns the newest `n` records.
pub(crate) fn rank(query: &str, candidates: Vec<MemoryRecord>, n: usize) -> Vec<MemoryRecord> {
    let n = n.max(1);
    if query.trim().is_empty() {
        return candidates.into_iter().take(n).collect();
    }
    let mut scored: Vec<MemoryRecord> = candidates
        .into_iter()
        .filter_map(|mut record| {
            record.score = keyword_score(query, &record.content);
            (record.score > 0.0).then_some(record)
        })
        .collect();
    // Stable sort keeps newest-first among equal scores
    scored.sort_by(|a, b| b.score.total_cmp(&a.score));
    scored.truncate(n);
    scored
}

#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Add a document to a named collection, returning its id
    async fn store_in(
        &self,
        collection: &str,
        content: &str,
        metadata: Map<String, Value>,
    ) -> Result<String>;

    /// Most relevant documents of a collection for `query`, restricted to
    /// records whose metadata `type` equals `type_filter` when one is given
    async fn query_typed(
        &self,
        collection: &str,
        query: &str,
        n: usize,
        type_filter: Option<&str>,
    ) -> Result<Vec<MemoryRecord>>;

    async fn query(&self, collection: &str, query: &str, n: usize) -> Result<Vec<MemoryRecord>> {
        self.query_typed(collection, query, n, None).await
    }

    async fn store(&self, content: &str, metadata: Map<String, Value>) -> Result<String> {
        self.store_in(DEFAULT_COLLECTION, content, metadata).await
    }

    async fn get_similar(
        &self,
        query: &str,
        n: usize,
        type_filter: Option<&str>,
    ) -> Result<Vec<MemoryRecord>> {
        self.query_typed(DEFAULT_COLLECTION, query, n, type_filter).await
    }
}

/// Process-local store
#[derive(Debug, Default)]
pub struct InMemoryStore {
    records: Mutex<Vec<MemoryRecord>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    async fn store_in(
        &self,
        collection: &str,
        content: &str,
        metadata: Map<String, Value>,
    ) -> Result<String> {
        let record = MemoryRecord::new(collection, content, metadata);
        let id = record.id.clone();
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record);
        Ok(id)
    }

    async fn query_typed(
        &self,
        collection: &str,
        query: &str,
        n: usize,
        type_filter: Option<&str>,
    ) -> Result<Vec<MemoryRecord>> {
        let candidates: Vec<MemoryRecord> = self
            .records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .rev()
            .filter(|r| r.collection == collection)
            .filter(|r| type_filter.is_none_or(|t| r.metadata_str("type") == Some(t)))
            .cloned()
            .collect();
        Ok(rank(query, candidates, n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta(kind: &str) -> Map<String, Value> {
        let mut m = Map::new();
        m.insert("type".into(), json!(kind));
        m
    }

    #[test]
    fn test_keyword_score() {
        assert_eq!(keyword_score("rss feed", "Parsing an RSS feed"), 1.0);
        assert_eq!(keyword_score("rss docker", "rss only"), 0.5);
        assert_eq!(keyword_score("", "anything"), 0.0);
    }

    #[tokio::test]
    async fn test_store_and_query() {
        let store = InMemoryStore::new();
        store.store("agent ran in local runtime", meta("agent_execution")).await.unwrap();
        store.store("telegram message delivered", meta("message")).await.unwrap();
        store.store_in("n8n_docs", "cron node schedules workflows", Map::new()).await.unwrap();
        assert_eq!(store.len(), 3);

        let hits = store.get_similar("local runtime", 5, None).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].content.contains("local"));

        let docs = store.query("n8n_docs", "cron", 5).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].collection, "n8n_docs");
    }

    #[tokio::test]
    async fn test_type_filter() {
        let store = InMemoryStore::new();
        store.store("agent one success", meta("agent_execution")).await.unwrap();
        store.store("agent two note", meta("note")).await.unwrap();

        let hits = store.get_similar("agent", 5, Some("agent_execution")).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].metadata_str("type"), Some("agent_execution"));

        assert!(store.get_similar("agent", 5, Some("execution")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_type_filter_not_crowded_out() {
        let store = InMemoryStore::new();
        store.store("agent ok", meta("agent_execution")).await.unwrap();
        store.store("agent ok again", meta("agent_execution")).await.unwrap();
        for i in 0..10 {
            store.store(&format!("agent run note {}", i), meta("note")).await.unwrap();
        }

        let hits = store.get_similar("agent run", 2, Some("agent_execution")).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|r| r.metadata_str("type") == Some("agent_execution")));
    }

    #[tokio::test]
    async fn test_empty_query_returns_newest() {
        let store = InMemoryStore::new();
        store.store("first", Map::new()).await.unwrap();
        store.store("second", Map::new()).await.unwrap();
        let hits = store.query(DEFAULT_COLLECTION, "", 1).await.unwrap();
        assert_eq!(hits[0].content, "second");
    }
}
