// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Session manager: the registry of live sessions keyed by context key
//! (`channelId:userId[:groupId]`).  Creates on demand, refreshes activity,
//! ends with a grace period, and evicts idle sessions in a background
//! sweep.  Eviction cancels the session's root token first, so an
//! in-flight run observes the abort before the session disappears.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use harbor_config::SessionConfig;

use crate::notes::NotesStore;
use crate::session::{Session, SessionConfigState, SessionState};

/// Stable routing identity for a conversation.
pub fn context_key(channel_id: &str, user_id: &str, group_id: Option<&str>) -> String {
    match group_id {
        Some(g) => format!("{channel_id}:{user_id}:{g}"),
        None => format!("{channel_id}:{user_id}"),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub context_key: String,
    pub channel_id: String,
    pub user_id: String,
    pub status: SessionState,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

pub struct SessionManager {
    cfg: SessionConfig,
    sessions: RwLock<HashMap<String, Arc<Mutex<Session>>>>,
    notes: Option<NotesStore>,
}

impl SessionManager {
    pub fn new(cfg: SessionConfig) -> Arc<Self> {
        let notes = cfg.notes_dir.as_ref().map(|dir| NotesStore::new(dir.clone()));
        Arc::new(Self {
            cfg,
            sessions: RwLock::new(HashMap::new()),
            notes,
        })
    }

    /// Resolve or create the session for a context key.  The factory runs
    /// only on creation.
    pub fn get_or_create(
        &self,
        key: &str,
        factory: impl FnOnce() -> SessionConfigState,
    ) -> Arc<Mutex<Session>> {
        if let Some(existing) = self.sessions.read().unwrap().get(key) {
            return existing.clone();
        }

        let mut sessions = self.sessions.write().unwrap();
        // Double-checked: another caller may have won the race.
        if let Some(existing) = sessions.get(key) {
            return existing.clone();
        }

        let (channel_id, user_id) = split_key(key);
        let session = Session::new(channel_id, user_id, factory());
        info!(key = %key, session = %session.id, "session created");
        let session = Arc::new(Mutex::new(session));
        sessions.insert(key.to_string(), session.clone());
        session
    }

    pub fn get(&self, key: &str) -> Option<Arc<Mutex<Session>>> {
        self.sessions.read().unwrap().get(key).cloned()
    }

    /// Find a session by its id rather than its context key (control plane).
    pub fn find_by_session_id(&self, session_id: &str) -> Option<(String, Arc<Mutex<Session>>)> {
        self.sessions
            .read()
            .unwrap()
            .iter()
            .find(|(_, s)| s.lock().unwrap().id == session_id)
            .map(|(k, s)| (k.clone(), s.clone()))
    }

    pub fn list(&self) -> Vec<SessionSummary> {
        let mut out: Vec<SessionSummary> = self
            .sessions
            .read()
            .unwrap()
            .iter()
            .map(|(key, session)| {
                let s = session.lock().unwrap();
                SessionSummary {
                    session_id: s.id.clone(),
                    context_key: key.clone(),
                    channel_id: s.channel_id.clone(),
                    user_id: s.user_id.clone(),
                    status: s.state(),
                    created_at: s.created_at,
                    last_active_at: s.last_active_at,
                }
            })
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }

    pub fn touch(&self, key: &str) {
        if let Some(session) = self.get(key) {
            session.lock().unwrap().touch();
        }
    }

    /// Transition the session to completed and remove it after the grace
    /// period.  Unknown keys are a no-op returning false.
    pub fn end(self: &Arc<Self>, key: &str) -> bool {
        let Some(session) = self.get(key) else {
            return false;
        };
        {
            let mut s = session.lock().unwrap();
            if !s.state().is_terminal() {
                // Sessions never activated end directly as completed too;
                // route through activate so the transition stays legal.
                let _ = s.activate();
                let _ = s.complete();
            }
        }
        if let Some(notes) = &self.notes {
            let _ = notes.remove(key);
        }

        let manager = self.clone();
        let key = key.to_string();
        let grace = Duration::from_secs(self.cfg.end_grace_secs);
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            manager.remove(&key);
        });
        true
    }

    fn remove(&self, key: &str) {
        if self.sessions.write().unwrap().remove(key).is_some() {
            debug!(key = %key, "session removed from registry");
        }
    }

    /// One eviction pass: end every non-terminal session idle past the TTL.
    /// Cancel-then-evict: the root token fires before the registry entry
    /// goes away.
    pub fn evict_idle(self: &Arc<Self>) -> usize {
        let ttl = chrono::Duration::seconds(self.cfg.idle_ttl_secs as i64);
        let now = Utc::now();

        let stale: Vec<String> = self
            .sessions
            .read()
            .unwrap()
            .iter()
            .filter(|(_, session)| {
                let s = session.lock().unwrap();
                !s.state().is_terminal() && now - s.last_active_at > ttl
            })
            .map(|(k, _)| k.clone())
            .collect();

        for key in &stale {
            if let Some(session) = self.get(key) {
                session.lock().unwrap().cancel.cancel();
            }
            info!(key = %key, "evicting idle session");
            self.end(key);
        }
        stale.len()
    }

    /// Spawn the background eviction sweep.
    pub fn spawn_eviction_sweep(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        let interval = Duration::from_secs(self.cfg.sweep_interval_secs);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let evicted = manager.evict_idle();
                if evicted > 0 {
                    debug!(evicted, "eviction sweep finished");
                }
            }
        })
    }

    pub fn notes(&self) -> Option<&NotesStore> {
        self.notes.as_ref()
    }
}

fn split_key(key: &str) -> (String, String) {
    let mut parts = key.splitn(2, ':');
    let channel = parts.next().unwrap_or("unknown").to_string();
    let user = parts.next().unwrap_or("unknown").to_string();
    (channel, user)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use harbor_config::AutonomyLevel;

    fn config_state() -> SessionConfigState {
        SessionConfigState {
            model: "m".into(),
            provider: "mock".into(),
            autonomy: AutonomyLevel::Supervised,
            system_prompt: None,
        }
    }

    fn manager_with(cfg: SessionConfig) -> Arc<SessionManager> {
        SessionManager::new(cfg)
    }

    fn fast_cfg() -> SessionConfig {
        SessionConfig {
            idle_ttl_secs: 0,
            sweep_interval_secs: 1,
            end_grace_secs: 0,
            notes_dir: None,
            system_prompt: None,
        }
    }

    #[test]
    fn context_key_formats() {
        assert_eq!(context_key("telegram", "42", None), "telegram:42");
        assert_eq!(context_key("discord", "7", Some("g1")), "discord:7:g1");
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent_per_key() {
        let m = manager_with(SessionConfig::default());
        let a = m.get_or_create("terminal:1", config_state);
        let b = m.get_or_create("terminal:1", config_state);
        let a_id = a.lock().unwrap().id.clone();
        let b_id = b.lock().unwrap().id.clone();
        assert_eq!(a_id, b_id);
        assert_eq!(m.list().len(), 1);
    }

    #[tokio::test]
    async fn distinct_keys_get_distinct_sessions() {
        let m = manager_with(SessionConfig::default());
        let a = m.get_or_create("terminal:1", config_state);
        let b = m.get_or_create("terminal:2", config_state);
        assert_ne!(a.lock().unwrap().id, b.lock().unwrap().id);
    }

    #[tokio::test]
    async fn list_reports_channel_and_user() {
        let m = manager_with(SessionConfig::default());
        m.get_or_create("webhook:alice", config_state);
        let list = m.list();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].channel_id, "webhook");
        assert_eq!(list[0].user_id, "alice");
        assert_eq!(list[0].status, SessionState::Created);
    }

    #[tokio::test]
    async fn end_completes_and_removes_after_grace() {
        let m = manager_with(fast_cfg());
        let session = m.get_or_create("t:1", config_state);
        session.lock().unwrap().activate().unwrap();

        assert!(m.end("t:1"));
        assert_eq!(
            session.lock().unwrap().state(),
            SessionState::Completed
        );
        // Grace is zero; give the removal task a moment.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(m.get("t:1").is_none());
    }

    #[tokio::test]
    async fn end_unknown_key_is_false() {
        let m = manager_with(SessionConfig::default());
        assert!(!m.end("ghost:1"));
    }

    #[tokio::test]
    async fn touch_refreshes_last_active() {
        let m = manager_with(SessionConfig::default());
        let session = m.get_or_create("t:1", config_state);
        let before = session.lock().unwrap().last_active_at;
        tokio::time::sleep(Duration::from_millis(10)).await;
        m.touch("t:1");
        assert!(session.lock().unwrap().last_active_at > before);
    }

    #[tokio::test]
    async fn eviction_cancels_then_ends_idle_sessions() {
        let m = manager_with(fast_cfg());
        let session = m.get_or_create("t:1", config_state);
        session.lock().unwrap().activate().unwrap();
        let token = session.lock().unwrap().cancel.clone();

        let evicted = m.evict_idle();
        assert_eq!(evicted, 1);
        assert!(token.is_cancelled(), "eviction must cancel the run first");
        assert!(session.lock().unwrap().state().is_terminal());
    }

    #[tokio::test]
    async fn eviction_skips_fresh_sessions() {
        let cfg = SessionConfig {
            idle_ttl_secs: 3600,
            ..fast_cfg()
        };
        let m = manager_with(cfg);
        m.get_or_create("t:1", config_state);
        assert_eq!(m.evict_idle(), 0);
    }

    #[tokio::test]
    async fn find_by_session_id_resolves_key() {
        let m = manager_with(SessionConfig::default());
        let session = m.get_or_create("t:9", config_state);
        let id = session.lock().unwrap().id.clone();
        let (key, found) = m.find_by_session_id(&id).unwrap();
        assert_eq!(key, "t:9");
        assert_eq!(found.lock().unwrap().id, id);
        assert!(m.find_by_session_id("nope").is_none());
    }
}
