//! cradle-memory - document memory for agents
//!
//! This crate provides:
//! - The `MemoryStore` trait (store, similarity lookup, named collections)
//! - `SqliteMemory`, a SQLite-backed store
//! - `InMemoryStore` for tests and ephemeral runs
//!
//! Similarity is keyword overlap, not embeddings.

pub mod memory;
pub mod sqlite;

pub use memory::{DEFAULT_COLLECTION, InMemoryStore, MemoryRecord, MemoryStore, keyword_score};
pub use sqlite::SqliteMemory;
