// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("memory backend is closed")]
    Closed,
    #[error("database error: {0}")]
    Db(String),
    #[error("embedding failed: {0}")]
    Embedding(String),
    #[error("index corrupt: {0}")]
    Corrupt(String),
}

impl From<rusqlite::Error> for MemoryError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Db(e.to_string())
    }
}
