// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-context session notes on disk: one JSON file per active context key
//! under the notes directory, written whole on every update.  These are
//! summaries for operators, not durable conversation history.  Malformed
//! files are skipped silently on load.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

const MAX_ACTIVITY_ENTRIES: usize = 3;
const MAX_ACTIVITY_CHARS: usize = 200;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionNote {
    pub context_key: String,
    pub channel_id: String,
    pub user_id: String,
    /// The user's current request, as last understood.
    pub request: String,
    pub request_at: DateTime<Utc>,
    /// Up to three recent-activity strings, each at most 200 characters.
    pub recent_activity: Vec<String>,
}

impl SessionNote {
    pub fn new(
        context_key: impl Into<String>,
        channel_id: impl Into<String>,
        user_id: impl Into<String>,
        request: impl Into<String>,
    ) -> Self {
        Self {
            context_key: context_key.into(),
            channel_id: channel_id.into(),
            user_id: user_id.into(),
            request: request.into(),
            request_at: Utc::now(),
            recent_activity: Vec::new(),
        }
    }

    /// Push an activity line, trimming to the caps.
    pub fn record_activity(&mut self, activity: &str) {
        let mut line = activity.to_string();
        if line.chars().count() > MAX_ACTIVITY_CHARS {
            line = line.chars().take(MAX_ACTIVITY_CHARS).collect();
        }
        self.recent_activity.push(line);
        while self.recent_activity.len() > MAX_ACTIVITY_ENTRIES {
            self.recent_activity.remove(0);
        }
    }
}

pub struct NotesStore {
    dir: PathBuf,
}

impl NotesStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn path_for(&self, context_key: &str) -> PathBuf {
        // Context keys contain ':'; keep filenames portable.
        let name = context_key.replace([':', '/'], "_");
        self.dir.join(format!("{name}.json"))
    }

    /// Full-file replace (upsert).
    pub fn save(&self, note: &SessionNote) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let text = serde_json::to_string_pretty(note)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(self.path_for(&note.context_key), text)
    }

    pub fn load(&self, context_key: &str) -> Option<SessionNote> {
        let text = std::fs::read_to_string(self.path_for(context_key)).ok()?;
        serde_json::from_str(&text).ok()
    }

    /// Load everything present; malformed files are skipped silently.
    pub fn load_all(&self) -> Vec<SessionNote> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut notes = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Ok(text) = std::fs::read_to_string(&path) else {
                continue;
            };
            match serde_json::from_str::<SessionNote>(&text) {
                Ok(note) => notes.push(note),
                Err(_) => debug!(path = %path.display(), "skipping malformed session note"),
            }
        }
        notes.sort_by(|a, b| a.context_key.cmp(&b.context_key));
        notes
    }

    pub fn remove(&self, context_key: &str) -> std::io::Result<()> {
        let path = self.path_for(context_key);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
