// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Content-hash keyed embedding cache.
//!
//! Two layers: an in-memory LRU for the hot set and a SQLite table so cache
//! entries survive restarts.  The disk layer is pruned to `max_size` rows by
//! least-recent use.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;
use rusqlite::{params, Connection};
use sha2::{Digest, Sha256};

use crate::MemoryError;

pub struct EmbeddingCache {
    hot: Mutex<LruCache<String, Vec<f32>>>,
    max_size: usize,
}

impl EmbeddingCache {
    pub fn new(max_size: usize) -> Self {
        let cap = NonZeroUsize::new(max_size.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            hot: Mutex::new(LruCache::new(cap)),
            max_size,
        }
    }

    pub fn content_hash(content: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Look up a vector by content, falling back to the persistent table.
    pub fn get(&self, conn: &Connection, content: &str) -> Option<Vec<f32>> {
        let hash = Self::content_hash(content);
        if let Some(v) = self.hot.lock().unwrap().get(&hash) {
            return Some(v.clone());
        }
        let blob: Option<Vec<u8>> = conn
            .query_row(
                "SELECT vector FROM embedding_cache WHERE hash = ?1",
                params![hash],
                |row| row.get(0),
            )
            .ok();
        let vector = blob.map(|b| bytes_to_f32_vec(&b))?;
        let _ = conn.execute(
            "UPDATE embedding_cache SET last_used = datetime('now') WHERE hash = ?1",
            params![hash],
        );
        self.hot.lock().unwrap().put(hash, vector.clone());
        Some(vector)
    }

    /// Insert a vector and prune the persistent table past `max_size`.
    pub fn put(
        &self,
        conn: &Connection,
        content: &str,
        vector: &[f32],
    ) -> Result<(), MemoryError> {
        let hash = Self::content_hash(content);
        conn.execute(
            "INSERT INTO embedding_cache (hash, vector, last_used)
             VALUES (?1, ?2, datetime('now'))
             ON CONFLICT(hash) DO UPDATE SET vector = ?2, last_used = datetime('now')",
            params![hash, f32_vec_to_bytes(vector)],
        )?;
        conn.execute(
            "DELETE FROM embedding_cache WHERE hash IN (
                 SELECT hash FROM embedding_cache
                 ORDER BY last_used DESC LIMIT -1 OFFSET ?1
             )",
            params![self.max_size as i64],
        )?;
        self.hot.lock().unwrap().put(hash, vector.to_vec());
        Ok(())
    }
}

/// Little-endian f32 packing for BLOB columns.
pub fn f32_vec_to_bytes(v: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(v.len() * 4);
    for f in v {
        out.extend_from_slice(&f.to_le_bytes());
    }
    out
}

pub fn bytes_to_f32_vec(b: &[u8]) -> Vec<f32> {
    b.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}
