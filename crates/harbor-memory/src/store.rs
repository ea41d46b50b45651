// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! SQLite-backed memory store.
//!
//! One table of entries, an FTS5 index over `content` kept in sync by
//! triggers (so deleting an entry removes its index row in the same
//! transaction), and an embedding BLOB column scored by cosine similarity
//! in-process.  SQLite's own locking provides single-writer semantics per
//! key; the connection sits behind a mutex and every critical section is
//! short — embedding calls happen outside the lock.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use tracing::{debug, warn};

use harbor_config::MemoryConfig;

use crate::cache::{bytes_to_f32_vec, f32_vec_to_bytes, EmbeddingCache};
use crate::{
    EmbeddingProvider, MemoryBackend, MemoryEntry, MemoryError, RecallOptions, RecallResult,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS memories (
    key         TEXT PRIMARY KEY,
    content     TEXT NOT NULL,
    metadata    TEXT,
    embedding   BLOB,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);
CREATE VIRTUAL TABLE IF NOT EXISTS memories_fts USING fts5(
    content,
    content='memories',
    content_rowid='rowid'
);
CREATE TRIGGER IF NOT EXISTS memories_ai AFTER INSERT ON memories BEGIN
    INSERT INTO memories_fts(rowid, content) VALUES (new.rowid, new.content);
END;
CREATE TRIGGER IF NOT EXISTS memories_ad AFTER DELETE ON memories BEGIN
    INSERT INTO memories_fts(memories_fts, rowid, content)
    VALUES ('delete', old.rowid, old.content);
END;
CREATE TRIGGER IF NOT EXISTS memories_au AFTER UPDATE ON memories BEGIN
    INSERT INTO memories_fts(memories_fts, rowid, content)
    VALUES ('delete', old.rowid, old.content);
    INSERT INTO memories_fts(rowid, content) VALUES (new.rowid, new.content);
END;
CREATE TABLE IF NOT EXISTS embedding_cache (
    hash       TEXT PRIMARY KEY,
    vector     BLOB NOT NULL,
    last_used  TEXT NOT NULL
);
";

pub struct SqliteMemoryStore {
    conn: Mutex<Option<Connection>>,
    vector_weight: f64,
    keyword_weight: f64,
    cache: EmbeddingCache,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
}

impl SqliteMemoryStore {
    pub fn open(
        cfg: &MemoryConfig,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
    ) -> Result<Self, MemoryError> {
        let path = match &cfg.db_path {
            Some(p) => p.clone(),
            None => default_db_path(),
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| MemoryError::Db(e.to_string()))?;
        }
        let conn = Connection::open(&path)?;
        conn.execute_batch(SCHEMA)?;
        debug!(path = %path.display(), "memory store opened");
        Ok(Self {
            conn: Mutex::new(Some(conn)),
            vector_weight: cfg.vector_weight,
            keyword_weight: cfg.keyword_weight,
            cache: EmbeddingCache::new(cfg.embedding_cache_size),
            embedder,
        })
    }

    /// In-memory store for tests and ephemeral deployments.
    pub fn open_in_memory(
        cfg: &MemoryConfig,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
    ) -> Result<Self, MemoryError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(Some(conn)),
            vector_weight: cfg.vector_weight,
            keyword_weight: cfg.keyword_weight,
            cache: EmbeddingCache::new(cfg.embedding_cache_size),
            embedder,
        })
    }

    /// Compute (or fetch from cache) the embedding for `content`.
    /// Failure degrades gracefully: the entry is stored without a vector.
    async fn embed_for_store(&self, content: &str) -> Option<Vec<f32>> {
        let embedder = self.embedder.as_ref()?;

        {
            let guard = self.conn.lock().unwrap();
            let conn = guard.as_ref()?;
            if let Some(v) = self.cache.get(conn, content) {
                return Some(v);
            }
        }

        match embedder.embed(content).await {
            Ok(v) => {
                let guard = self.conn.lock().unwrap();
                if let Some(conn) = guard.as_ref() {
                    if let Err(e) = self.cache.put(conn, content, &v) {
                        warn!("embedding cache write failed: {e}");
                    }
                }
                Some(v)
            }
            Err(e) => {
                warn!("embedding failed, storing entry without vector: {e}");
                None
            }
        }
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, MemoryError>,
    ) -> Result<T, MemoryError> {
        let guard = self.conn.lock().unwrap();
        match guard.as_ref() {
            Some(conn) => f(conn),
            None => Err(MemoryError::Closed),
        }
    }
}

#[async_trait]
impl MemoryBackend for SqliteMemoryStore {
    async fn store(
        &self,
        key: &str,
        content: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<(), MemoryError> {
        let embedding = self.embed_for_store(content).await;
        let now = Utc::now().to_rfc3339();
        let meta_text = metadata.map(|m| m.to_string());
        let blob = embedding.as_deref().map(f32_vec_to_bytes);

        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO memories (key, content, metadata, embedding, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                 ON CONFLICT(key) DO UPDATE SET
                     content = ?2, metadata = ?3, embedding = ?4, updated_at = ?5",
                params![key, content, meta_text, blob, now],
            )?;
            Ok(())
        })
    }

    async fn recall(
        &self,
        query: &str,
        opts: &RecallOptions,
    ) -> Result<Vec<RecallResult>, MemoryError> {
        let limit = opts.limit.unwrap_or(10);
        // Fetch extra from each leg so the merged ranking has headroom.
        let fetch = (limit * 3).max(16);

        let query_vec = match &self.embedder {
            Some(embedder) => match embedder.embed(query).await {
                Ok(v) => Some(v),
                Err(e) => {
                    warn!("query embedding failed, keyword-only recall: {e}");
                    None
                }
            },
            None => None,
        };

        self.with_conn(|conn| {
            let keyword_hits = keyword_search(conn, query, opts.key_prefix.as_deref(), fetch)?;
            let vector_hits = match &query_vec {
                Some(qv) => vector_search(conn, qv, opts.key_prefix.as_deref(), fetch)?,
                None => Vec::new(),
            };

            let mut merged: std::collections::HashMap<String, (Option<f64>, Option<f64>, MemoryEntry)> =
                std::collections::HashMap::new();
            for (entry, score) in keyword_hits {
                merged.insert(entry.key.clone(), (Some(score), None, entry));
            }
            for (entry, score) in vector_hits {
                merged
                    .entry(entry.key.clone())
                    .and_modify(|slot| slot.1 = Some(score))
                    .or_insert((None, Some(score), entry));
            }

            let mut results: Vec<RecallResult> = merged
                .into_values()
                .map(|(kw, vec, entry)| RecallResult {
                    entry,
                    score: kw.unwrap_or(0.0) * self.keyword_weight
                        + vec.unwrap_or(0.0) * self.vector_weight,
                })
                .filter(|r| opts.min_score.map(|m| r.score >= m).unwrap_or(true))
                .filter(|r| metadata_matches(&r.entry, opts.filter.as_ref()))
                .collect();

            results.sort_by(|a, b| {
                b.score
                    .partial_cmp(&a.score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            results.truncate(limit);
            Ok(results)
        })
    }

    async fn forget(&self, key: &str) -> Result<bool, MemoryError> {
        self.with_conn(|conn| {
            let n = conn.execute("DELETE FROM memories WHERE key = ?1", params![key])?;
            Ok(n > 0)
        })
    }

    async fn list(&self, prefix: Option<&str>) -> Result<Vec<MemoryEntry>, MemoryError> {
        self.with_conn(|conn| {
            let mut out = Vec::new();
            match prefix {
                Some(p) => {
                    let mut stmt = conn.prepare(
                        "SELECT key, content, metadata, embedding, created_at, updated_at
                         FROM memories WHERE key >= ?1 AND key < ?1 || x'ffff' ORDER BY key",
                    )?;
                    let rows = stmt.query_map(params![p], row_to_entry)?;
                    for row in rows {
                        out.push(row?);
                    }
                }
                None => {
                    let mut stmt = conn.prepare(
                        "SELECT key, content, metadata, embedding, created_at, updated_at
                         FROM memories ORDER BY key",
                    )?;
                    let rows = stmt.query_map([], row_to_entry)?;
                    for row in rows {
                        out.push(row?);
                    }
                }
            }
            Ok(out)
        })
    }

    async fn reindex(&self) -> Result<(), MemoryError> {
        self.with_conn(|conn| {
            conn.execute("INSERT INTO memories_fts(memories_fts) VALUES ('rebuild')", [])?;
            Ok(())
        })?;

        // Recompute missing embeddings in batches; a failing batch leaves
        // the remaining entries queryable as they were.
        if self.embedder.is_some() {
            loop {
                let batch: Vec<(String, String)> = self.with_conn(|conn| {
                    let mut stmt = conn.prepare(
                        "SELECT key, content FROM memories WHERE embedding IS NULL LIMIT 16",
                    )?;
                    let rows = stmt
                        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                        .collect::<Result<Vec<_>, _>>()?;
                    Ok(rows)
                })?;
                if batch.is_empty() {
                    break;
                }
                for (key, content) in batch {
                    match self.embed_for_store(&content).await {
                        Some(v) => {
                            self.with_conn(|conn| {
                                conn.execute(
                                    "UPDATE memories SET embedding = ?1 WHERE key = ?2",
                                    params![f32_vec_to_bytes(&v), key],
                                )?;
                                Ok(())
                            })?;
                        }
                        // Still no vector available; stop rather than spin.
                        None => return Ok(()),
                    }
                }
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), MemoryError> {
        let mut guard = self.conn.lock().unwrap();
        guard.take();
        Ok(())
    }
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("harbor")
        .join("memory.db")
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryEntry> {
    let meta_text: Option<String> = row.get(2)?;
    let blob: Option<Vec<u8>> = row.get(3)?;
    let created: String = row.get(4)?;
    let updated: String = row.get(5)?;
    Ok(MemoryEntry {
        key: row.get(0)?,
        content: row.get(1)?,
        metadata: meta_text.and_then(|t| serde_json::from_str(&t).ok()),
        embedding: blob.map(|b| bytes_to_f32_vec(&b)),
        created_at: parse_ts(&created),
        updated_at: parse_ts(&updated),
    })
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// BM25 keyword search.  Scores are min-max normalised to [0,1].
fn keyword_search(
    conn: &Connection,
    query: &str,
    key_prefix: Option<&str>,
    fetch: usize,
) -> Result<Vec<(MemoryEntry, f64)>, MemoryError> {
    let match_expr = fts_query(query);
    if match_expr.is_empty() {
        return Ok(Vec::new());
    }

    let sql = "SELECT m.key, m.content, m.metadata, m.embedding, m.created_at, m.updated_at,
                      bm25(memories_fts) AS rank
               FROM memories_fts
               JOIN memories m ON m.rowid = memories_fts.rowid
               WHERE memories_fts MATCH ?1
               ORDER BY rank LIMIT ?2";
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params![match_expr, fetch as i64], |row| {
        let entry = row_to_entry(row)?;
        let rank: f64 = row.get(6)?;
        Ok((entry, rank))
    })?;

    let mut hits: Vec<(MemoryEntry, f64)> = Vec::new();
    for row in rows {
        let (entry, rank) = row?;
        if let Some(prefix) = key_prefix {
            if !entry.key.starts_with(prefix) {
                continue;
            }
        }
        // bm25() is lower-is-better; flip so larger means more relevant.
        hits.push((entry, -rank));
    }

    // Min-max normalise into [0,1] so the merge weights mean something.
    // When every hit scores the same (including a sole hit), all get full
    // weight rather than normalising to zero.
    if !hits.is_empty() {
        let max = hits.iter().map(|(_, s)| *s).fold(f64::MIN, f64::max);
        let min = hits.iter().map(|(_, s)| *s).fold(f64::MAX, f64::min);
        if (max - min).abs() < 1e-12 {
            for (_, s) in &mut hits {
                *s = 1.0;
            }
        } else {
            for (_, s) in &mut hits {
                *s = (*s - min) / (max - min);
            }
        }
    }
    Ok(hits)
}

/// Quote each whitespace token so user text cannot inject FTS5 operators;
/// OR-join for recall-friendly matching.
fn fts_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|tok| format!("\"{}\"", tok.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" OR ")
}

/// Cosine-similarity scan over entries that carry an embedding.
fn vector_search(
    conn: &Connection,
    query_vec: &[f32],
    key_prefix: Option<&str>,
    fetch: usize,
) -> Result<Vec<(MemoryEntry, f64)>, MemoryError> {
    let (sql, use_prefix) = match key_prefix {
        Some(_) => (
            "SELECT key, content, metadata, embedding, created_at, updated_at
             FROM memories
             WHERE embedding IS NOT NULL AND key >= ?1 AND key < ?1 || x'ffff'",
            true,
        ),
        None => (
            "SELECT key, content, metadata, embedding, created_at, updated_at
             FROM memories WHERE embedding IS NOT NULL",
            false,
        ),
    };
    let mut stmt = conn.prepare(sql)?;
    let mut hits: Vec<(MemoryEntry, f64)> = Vec::new();
    let mut push_row = |entry: MemoryEntry| {
        if let Some(v) = &entry.embedding {
            let score = cosine_similarity(query_vec, v);
            hits.push((entry, score));
        }
    };
    if use_prefix {
        let rows = stmt.query_map(params![key_prefix.unwrap()], row_to_entry)?;
        for row in rows {
            push_row(row?);
        }
    } else {
        let rows = stmt.query_map([], row_to_entry)?;
        for row in rows {
            push_row(row?);
        }
    }

    hits.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    hits.truncate(fetch);
    Ok(hits)
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += (*x as f64) * (*y as f64);
        norm_a += (*x as f64) * (*x as f64);
        norm_b += (*y as f64) * (*y as f64);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

fn metadata_matches(
    entry: &MemoryEntry,
    filter: Option<&serde_json::Map<String, serde_json::Value>>,
) -> bool {
    let Some(filter) = filter else { return true };
    if filter.is_empty() {
        return true;
    }
    let Some(serde_json::Value::Object(meta)) = &entry.metadata else {
        return false;
    };
    filter.iter().all(|(k, v)| meta.get(k) == Some(v))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MockEmbeddingProvider;

    fn store_with_embedder() -> SqliteMemoryStore {
        SqliteMemoryStore::open_in_memory(
            &MemoryConfig::default(),
            Some(Arc::new(MockEmbeddingProvider::default())),
        )
        .unwrap()
    }

    fn keyword_only_store() -> SqliteMemoryStore {
        SqliteMemoryStore::open_in_memory(&MemoryConfig::default(), None).unwrap()
    }

    #[tokio::test]
    async fn store_and_recall_by_keyword() {
        let s = keyword_only_store();
        s.store("global:greeting", "the user likes cheerful greetings", None)
            .await
            .unwrap();
        let results = s
            .recall("cheerful greetings", &RecallOptions::default())
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].entry.key, "global:greeting");
    }

    #[tokio::test]
    async fn upsert_replaces_content() {
        let s = keyword_only_store();
        s.store("k", "first version", None).await.unwrap();
        s.store("k", "second version", None).await.unwrap();
        let all = s.list(None).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].content, "second version");
    }

    #[tokio::test]
    async fn forget_removes_entry_and_index_row() {
        let s = keyword_only_store();
        s.store("k", "unique sesquipedalian content", None).await.unwrap();
        assert!(s.forget("k").await.unwrap());
        assert!(!s.forget("k").await.unwrap());
        let results = s
            .recall("sesquipedalian", &RecallOptions::default())
            .await
            .unwrap();
        assert!(results.is_empty(), "FTS row must be gone after delete");
    }

    #[tokio::test]
    async fn namespace_isolation() {
        let s = store_with_embedder();
        s.store("u:telegram:1:pref", "dark", None).await.unwrap();
        s.store("u:discord:2:pref", "light", None).await.unwrap();

        let tg = s
            .recall(
                "dark",
                &RecallOptions {
                    key_prefix: Some("u:telegram:1:".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(tg.len(), 1);
        assert_eq!(tg[0].entry.key, "u:telegram:1:pref");

        let dc = s
            .recall(
                "dark",
                &RecallOptions {
                    key_prefix: Some("u:discord:2:".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(dc.iter().all(|r| r.entry.content != "dark"));
    }

    #[tokio::test]
    async fn prefixed_recall_is_subset_of_unprefixed() {
        let s = store_with_embedder();
        s.store("u:a:1:x", "rust programming notes", None).await.unwrap();
        s.store("u:b:2:x", "rust cooking recipes", None).await.unwrap();

        let all = s.recall("rust", &RecallOptions::default()).await.unwrap();
        let scoped = s
            .recall(
                "rust",
                &RecallOptions {
                    key_prefix: Some("u:a:".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let all_keys: Vec<&str> = all.iter().map(|r| r.entry.key.as_str()).collect();
        for r in &scoped {
            assert!(all_keys.contains(&r.entry.key.as_str()));
            assert!(r.entry.key.starts_with("u:a:"));
        }
    }

    #[tokio::test]
    async fn metadata_filter_restricts_results() {
        let s = keyword_only_store();
        s.store(
            "a",
            "meeting notes from standup",
            Some(serde_json::json!({"kind": "notes"})),
        )
        .await
        .unwrap();
        s.store(
            "b",
            "meeting agenda for standup",
            Some(serde_json::json!({"kind": "agenda"})),
        )
        .await
        .unwrap();

        let mut filter = serde_json::Map::new();
        filter.insert("kind".into(), serde_json::json!("notes"));
        let results = s
            .recall(
                "standup meeting",
                &RecallOptions {
                    filter: Some(filter),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].entry.key, "a");
    }

    #[tokio::test]
    async fn min_score_drops_weak_hits() {
        let s = keyword_only_store();
        s.store("a", "alpha beta gamma", None).await.unwrap();
        let results = s
            .recall(
                "alpha",
                &RecallOptions {
                    min_score: Some(10.0),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn limit_caps_result_count() {
        let s = keyword_only_store();
        for i in 0..20 {
            s.store(&format!("k{i}"), "repeated filler text", None)
                .await
                .unwrap();
        }
        let results = s
            .recall(
                "filler",
                &RecallOptions {
                    limit: Some(5),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(results.len(), 5);
    }

    #[tokio::test]
    async fn list_with_prefix() {
        let s = keyword_only_store();
        s.store("u:tg:1:a", "x", None).await.unwrap();
        s.store("u:tg:1:b", "y", None).await.unwrap();
        s.store("global:c", "z", None).await.unwrap();
        let scoped = s.list(Some("u:tg:1:")).await.unwrap();
        assert_eq!(scoped.len(), 2);
        let all = s.list(None).await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn close_makes_operations_fail() {
        let s = keyword_only_store();
        s.close().await.unwrap();
        let err = s.store("k", "v", None).await.unwrap_err();
        assert!(matches!(err, MemoryError::Closed));
    }

    #[tokio::test]
    async fn entries_with_embedder_carry_vectors() {
        let s = store_with_embedder();
        s.store("k", "vectorised content", None).await.unwrap();
        let all = s.list(None).await.unwrap();
        assert!(all[0].embedding.is_some());
    }

    #[tokio::test]
    async fn reindex_backfills_missing_embeddings() {
        // Store keyword-only first, then reopen the data with an embedder.
        let s = store_with_embedder();
        s.with_conn(|conn| {
            conn.execute(
                "INSERT INTO memories (key, content, metadata, embedding, created_at, updated_at)
                 VALUES ('old', 'pre-embedding entry', NULL, NULL, ?1, ?1)",
                params![Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
        .unwrap();

        s.reindex().await.unwrap();
        let all = s.list(None).await.unwrap();
        let old = all.iter().find(|e| e.key == "old").unwrap();
        assert!(old.embedding.is_some());
    }

    #[test]
    fn cosine_similarity_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-9);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-9);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn fts_query_quotes_operators() {
        let q = fts_query(r#"NEAR "quoted" AND"#);
        assert!(q.contains("\"NEAR\""));
        assert!(q.contains("\"\"\"quoted\"\"\""));
    }
}
