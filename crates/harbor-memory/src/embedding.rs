// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::json;

use crate::MemoryError;

/// Computes a fixed-width vector for a piece of text.
///
/// A failing provider never loses data: the store keeps the entry without a
/// vector and recall degrades to keyword-only for it.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, MemoryError>;
}

/// OpenAI-compatible `/embeddings` endpoint client.
pub struct HttpEmbeddingProvider {
    url: String,
    model: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpEmbeddingProvider {
    pub fn new(url: impl Into<String>, model: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            url: url.into(),
            model: model.into(),
            api_key,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, MemoryError> {
        let mut req = self.client.post(&self.url).json(&json!({
            "model": self.model,
            "input": text,
        }));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| MemoryError::Embedding(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(MemoryError::Embedding(format!(
                "embedding endpoint returned {}",
                resp.status()
            )));
        }
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| MemoryError::Embedding(e.to_string()))?;
        let vec = body["data"][0]["embedding"]
            .as_array()
            .ok_or_else(|| MemoryError::Embedding("missing embedding array".into()))?
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        Ok(vec)
    }
}

/// Deterministic test embedder: buckets character trigrams into a small
/// fixed-width vector.  Similar strings land near each other, which is all
/// the hybrid-recall tests need — no network, no model.
pub struct MockEmbeddingProvider {
    pub dims: usize,
}

impl Default for MockEmbeddingProvider {
    fn default() -> Self {
        Self { dims: 64 }
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, MemoryError> {
        let mut v = vec![0.0f32; self.dims];
        let lower = text.to_lowercase();
        let chars: Vec<char> = lower.chars().collect();
        for window in chars.windows(3) {
            let mut h: u64 = 1469598103934665603;
            for c in window {
                h ^= *c as u64;
                h = h.wrapping_mul(1099511628211);
            }
            v[(h % self.dims as u64) as usize] += 1.0;
        }
        // L2-normalise so cosine similarity is a plain dot product.
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        Ok(v)
    }
}
