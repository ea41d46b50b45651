// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Namespaced long-term memory with hybrid recall.
//!
//! Entries live in SQLite keyed by colon-hierarchical keys
//! (`u:<channel>:<user>:<subkey>`, `global:<subkey>`).  Recall merges a
//! BM25 full-text pass (FTS5) with a cosine-similarity pass over stored
//! embedding vectors; weights are configurable and default to 0.7 vector /
//! 0.3 keyword.  When no embedding provider is configured the store
//! degrades to keyword-only without losing data.

mod cache;
mod embedding;
mod error;
mod store;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use cache::EmbeddingCache;
pub use embedding::{EmbeddingProvider, HttpEmbeddingProvider, MockEmbeddingProvider};
pub use error::MemoryError;
pub use store::SqliteMemoryStore;

/// A single stored memory.  Recall results are read-only copies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub key: String,
    pub content: String,
    pub metadata: Option<serde_json::Value>,
    /// Fixed-width vector when an embedding provider was configured at store
    /// time; `None` for keyword-only entries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One recall hit with its merged score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecallResult {
    pub entry: MemoryEntry,
    pub score: f64,
}

/// Options for [`MemoryBackend::recall`].
#[derive(Debug, Clone, Default)]
pub struct RecallOptions {
    pub limit: Option<usize>,
    pub min_score: Option<f64>,
    /// Strict namespace scope: every result's key starts with this prefix.
    pub key_prefix: Option<String>,
    /// Metadata key-value equality filter.
    pub filter: Option<serde_json::Map<String, serde_json::Value>>,
}

/// The memory backend contract used by tools and the gateway.
#[async_trait]
pub trait MemoryBackend: Send + Sync {
    /// Upsert an entry.  Storing under an existing key replaces content and
    /// metadata and refreshes `updated_at`.
    async fn store(
        &self,
        key: &str,
        content: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<(), MemoryError>;

    async fn recall(
        &self,
        query: &str,
        opts: &RecallOptions,
    ) -> Result<Vec<RecallResult>, MemoryError>;

    /// Returns whether the key existed.
    async fn forget(&self, key: &str) -> Result<bool, MemoryError>;

    async fn list(&self, prefix: Option<&str>) -> Result<Vec<MemoryEntry>, MemoryError>;

    /// Rebuild the full-text index and recompute missing embeddings in
    /// batches.  Entries untouched by a partial failure stay queryable.
    async fn reindex(&self) -> Result<(), MemoryError>;

    async fn close(&self) -> Result<(), MemoryError>;
}
