// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Health monitoring and restart supervision for long-running children
//! (session manager, worker pool, channels).
//!
//! The monitor tracks heartbeats: a child that misses `missed_threshold`
//! consecutive intervals is marked unhealthy and an event is emitted; a
//! later heartbeat restores it.  The supervisor layers restart policy on
//! top — exponential backoff capped at a maximum, and a restarts-per-window
//! budget so a crash-looping child cannot spin the process.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use harbor_config::SupervisorConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    Healthy { child: String },
    Unhealthy { child: String, missed: u32 },
    Crashed { child: String },
    Restarted { child: String },
}

#[derive(Debug, Clone)]
pub struct ChildHealth {
    pub last_heartbeat: DateTime<Utc>,
    pub missed_count: u32,
    pub healthy: bool,
    pub crash_history: Vec<DateTime<Utc>>,
}

impl ChildHealth {
    fn new() -> Self {
        Self {
            last_heartbeat: Utc::now(),
            missed_count: 0,
            healthy: true,
            crash_history: Vec::new(),
        }
    }
}

pub struct HealthMonitor {
    heartbeat_interval: Duration,
    missed_threshold: u32,
    children: Mutex<HashMap<String, ChildHealth>>,
    events: broadcast::Sender<SupervisorEvent>,
}

impl HealthMonitor {
    pub fn new(cfg: &SupervisorConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            heartbeat_interval: Duration::from_millis(cfg.heartbeat_interval_ms),
            missed_threshold: cfg.missed_threshold,
            children: Mutex::new(HashMap::new()),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    pub fn register(&self, child: &str) {
        self.children
            .lock()
            .unwrap()
            .insert(child.to_string(), ChildHealth::new());
        info!(child = %child, "child registered with health monitor");
    }

    pub fn deregister(&self, child: &str) {
        self.children.lock().unwrap().remove(child);
    }

    /// Record a heartbeat.  A beat while unhealthy restores health.
    pub fn heartbeat(&self, child: &str) {
        let mut children = self.children.lock().unwrap();
        let Some(health) = children.get_mut(child) else {
            return;
        };
        health.last_heartbeat = Utc::now();
        health.missed_count = 0;
        if !health.healthy {
            health.healthy = true;
            info!(child = %child, "child recovered");
            let _ = self.events.send(SupervisorEvent::Healthy {
                child: child.to_string(),
            });
        }
    }

    /// Record a crash.  Tolerates unregistered children so process exits
    /// racing deregistration still get recorded.
    pub fn record_crash(&self, child: &str) {
        let mut children = self.children.lock().unwrap();
        let health = children
            .entry(child.to_string())
            .or_insert_with(ChildHealth::new);
        health.crash_history.push(Utc::now());
        health.healthy = false;
        warn!(child = %child, crashes = health.crash_history.len(), "child crashed");
        let _ = self.events.send(SupervisorEvent::Crashed {
            child: child.to_string(),
        });
    }

    /// Record a successful restart: health and counters reset.
    pub fn record_restart(&self, child: &str) {
        let mut children = self.children.lock().unwrap();
        let health = children
            .entry(child.to_string())
            .or_insert_with(ChildHealth::new);
        health.healthy = true;
        health.missed_count = 0;
        health.last_heartbeat = Utc::now();
        let _ = self.events.send(SupervisorEvent::Restarted {
            child: child.to_string(),
        });
    }

    pub fn get_child_health(&self, child: &str) -> Option<ChildHealth> {
        self.children.lock().unwrap().get(child).cloned()
    }

    /// AND of all registered children's health flags.
    pub fn overall_health(&self) -> bool {
        self.children.lock().unwrap().values().all(|h| h.healthy)
    }

    /// One pass of the check loop: children silent for more than one
    /// interval gain a missed count; crossing the threshold while healthy
    /// marks them unhealthy.
    pub fn check_once(&self) {
        let interval =
            chrono::Duration::from_std(self.heartbeat_interval).unwrap_or(chrono::Duration::zero());
        let now = Utc::now();
        let mut children = self.children.lock().unwrap();
        for (name, health) in children.iter_mut() {
            if now - health.last_heartbeat > interval {
                health.missed_count += 1;
                if health.missed_count >= self.missed_threshold && health.healthy {
                    health.healthy = false;
                    warn!(child = %name, missed = health.missed_count, "child unhealthy");
                    let _ = self.events.send(SupervisorEvent::Unhealthy {
                        child: name.clone(),
                        missed: health.missed_count,
                    });
                }
            }
        }
    }

    /// Spawn the periodic check loop.
    pub fn spawn_check_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(monitor.heartbeat_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                monitor.check_once();
            }
        })
    }
}

// ─── Supervisor ───────────────────────────────────────────────────────────────

pub type RestartFn =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> + Send + Sync>;

struct Supervised {
    restart: RestartFn,
    consecutive_crashes: u32,
    restarts: Vec<DateTime<Utc>>,
}

pub struct Supervisor {
    cfg: SupervisorConfig,
    monitor: Arc<HealthMonitor>,
    children: Mutex<HashMap<String, Supervised>>,
}

impl Supervisor {
    pub fn new(cfg: SupervisorConfig, monitor: Arc<HealthMonitor>) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            monitor,
            children: Mutex::new(HashMap::new()),
        })
    }

    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    /// Put a child under supervision.  `restart` is invoked after each
    /// crash, within the crash-loop budget.
    pub fn supervise(&self, child: &str, restart: RestartFn) {
        self.monitor.register(child);
        self.children.lock().unwrap().insert(
            child.to_string(),
            Supervised {
                restart,
                consecutive_crashes: 0,
                restarts: Vec::new(),
            },
        );
    }

    /// Exponential backoff for the given consecutive-crash count, capped.
    fn backoff(&self, consecutive_crashes: u32) -> Duration {
        let base = self.cfg.backoff_initial_ms;
        let exp = base.saturating_mul(2u64.saturating_pow(consecutive_crashes));
        Duration::from_millis(exp.min(self.cfg.backoff_max_ms))
    }

    /// Handle one crash: record it, check the restarts-per-window budget,
    /// back off, restart.  Returns whether a restart happened.
    pub async fn on_crash(self: &Arc<Self>, child: &str) -> bool {
        self.monitor.record_crash(child);

        let (delay, over_budget) = {
            let mut children = self.children.lock().unwrap();
            let Some(entry) = children.get_mut(child) else {
                warn!(child = %child, "crash for unsupervised child");
                return false;
            };
            let window = chrono::Duration::seconds(self.cfg.restart_window_secs as i64);
            let now = Utc::now();
            entry.restarts.retain(|t| now - *t < window);
            let over = entry.restarts.len() as u32 >= self.cfg.max_restarts_per_window;
            let delay = self.backoff(entry.consecutive_crashes);
            entry.consecutive_crashes += 1;
            (delay, over)
        };

        if over_budget {
            error!(
                child = %child,
                window_secs = self.cfg.restart_window_secs,
                "restart budget exhausted; leaving child down"
            );
            return false;
        }

        info!(child = %child, delay_ms = delay.as_millis() as u64, "restarting after backoff");
        tokio::time::sleep(delay).await;

        let restart = {
            let children = self.children.lock().unwrap();
            children.get(child).map(|e| e.restart.clone())
        };
        let Some(restart) = restart else { return false };

        match restart().await {
            Ok(()) => {
                let mut children = self.children.lock().unwrap();
                if let Some(entry) = children.get_mut(child) {
                    entry.restarts.push(Utc::now());
                    entry.consecutive_crashes = 0;
                }
                self.monitor.record_restart(child);
                true
            }
            Err(e) => {
                error!(child = %child, "restart failed: {e}");
                false
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
