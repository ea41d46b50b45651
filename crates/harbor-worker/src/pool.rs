// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use harbor_config::WorkerConfig;
use harbor_tools::ProgressUpdate;

use crate::protocol::{ParentMessage, TaskResult, WorkerMessage, WorkerTask};
use crate::WorkerError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub total_tasks: u64,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub queued_tasks: u64,
}

/// The pool contract.  [`WorkerPool`] runs tasks on subprocesses;
/// [`InlineFallbackExecutor`] keeps the same shape without any child.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(
        &self,
        task: WorkerTask,
        cancel: Option<CancellationToken>,
        progress: Option<mpsc::Sender<ProgressUpdate>>,
    ) -> Result<TaskResult, WorkerError>;

    fn stats(&self) -> PoolStats;

    /// Wait for in-flight tasks up to the grace period, then force-terminate.
    /// Tasks submitted afterwards are rejected.
    async fn shutdown(&self) -> Result<(), WorkerError>;
}

#[derive(Default)]
struct StatCounters {
    total: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    queued: AtomicU64,
    active: AtomicU64,
}

impl StatCounters {
    fn snapshot(&self) -> PoolStats {
        PoolStats {
            total_tasks: self.total.load(Ordering::Relaxed),
            completed_tasks: self.completed.load(Ordering::Relaxed),
            failed_tasks: self.failed.load(Ordering::Relaxed),
            queued_tasks: self.queued.load(Ordering::Relaxed),
        }
    }
}

// ─── Subprocess pool ──────────────────────────────────────────────────────────

/// One live worker subprocess.  A worker runs at most one task at a time,
/// so the handle owns both pipe halves directly.
struct WorkerHandle {
    child: Child,
    stdin: ChildStdin,
    stdout: FramedRead<ChildStdout, LinesCodec>,
}

pub struct WorkerPool {
    cfg: WorkerConfig,
    /// Idle workers, bounded at pool_size; `execute` blocks on this.
    idle_tx: mpsc::Sender<WorkerHandle>,
    idle_rx: Mutex<mpsc::Receiver<WorkerHandle>>,
    /// Workers spawned so far; lazily grown up to pool_size.
    spawned: AtomicU64,
    next_task_id: AtomicU64,
    shutting_down: AtomicBool,
    stats: StatCounters,
    /// Children handed out mid-task, reachable for force-kill at shutdown.
    all_pids: Mutex<HashMap<u64, u32>>,
}

impl WorkerPool {
    pub fn new(cfg: WorkerConfig) -> Arc<Self> {
        let (idle_tx, idle_rx) = mpsc::channel(cfg.pool_size.max(1));
        Arc::new(Self {
            cfg,
            idle_tx,
            idle_rx: Mutex::new(idle_rx),
            spawned: AtomicU64::new(0),
            next_task_id: AtomicU64::new(1),
            shutting_down: AtomicBool::new(false),
            stats: StatCounters::default(),
            all_pids: Mutex::new(HashMap::new()),
        })
    }

    async fn spawn_worker(&self) -> Result<WorkerHandle, WorkerError> {
        let binary = self
            .cfg
            .worker_binary
            .as_ref()
            .ok_or_else(|| WorkerError::Spawn("no worker binary configured".into()))?;

        let mut child = Command::new(binary)
            .arg("worker")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| WorkerError::Spawn(format!("{}: {e}", binary.display())))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| WorkerError::Spawn("worker stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| WorkerError::Spawn("worker stdout unavailable".into()))?;

        info!(pid = child.id(), "worker spawned");
        Ok(WorkerHandle {
            stdin,
            stdout: FramedRead::new(stdout, LinesCodec::new()),
            child,
        })
    }

    /// Get an idle worker, spawning a new one while below pool_size.
    async fn acquire(&self) -> Result<WorkerHandle, WorkerError> {
        // Fast path: an idle worker is waiting.
        {
            let mut rx = self.idle_rx.lock().await;
            if let Ok(handle) = rx.try_recv() {
                return Ok(handle);
            }
        }
        let spawned = self.spawned.load(Ordering::SeqCst);
        if (spawned as usize) < self.cfg.pool_size {
            self.spawned.fetch_add(1, Ordering::SeqCst);
            return self.spawn_worker().await;
        }
        // Pool is at capacity; wait for a worker to come back.
        let mut rx = self.idle_rx.lock().await;
        rx.recv().await.ok_or(WorkerError::ShuttingDown)
    }

    async fn release(&self, handle: WorkerHandle) {
        if self.shutting_down.load(Ordering::SeqCst) {
            let mut h = handle;
            let _ = h.child.kill().await;
            return;
        }
        if self.idle_tx.send(handle).await.is_err() {
            warn!("idle queue closed; dropping worker");
        }
    }

    /// Drive one task on one worker: write the execute message, then pump
    /// worker messages until result/error, forwarding progress and
    /// translating an abort into a cancel message.
    async fn run_on_worker(
        &self,
        handle: &mut WorkerHandle,
        task_id: u64,
        task: WorkerTask,
        cancel: Option<CancellationToken>,
        progress: Option<mpsc::Sender<ProgressUpdate>>,
    ) -> Result<TaskResult, WorkerError> {
        let msg = ParentMessage::Execute { task_id, task };
        let mut line = serde_json::to_string(&msg)
            .map_err(|e| WorkerError::Protocol(format!("encode: {e}")))?;
        line.push('\n');
        handle
            .stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| WorkerError::WorkerDied(format!("write: {e}")))?;
        handle
            .stdin
            .flush()
            .await
            .map_err(|e| WorkerError::WorkerDied(format!("flush: {e}")))?;

        let mut cancel_sent = false;
        loop {
            // FramedRead::next is cancellation-safe, so racing it against
            // the abort token cannot lose a partial line.
            let next_line = match &cancel {
                Some(token) if !cancel_sent => {
                    tokio::select! {
                        line = handle.stdout.next() => line,
                        _ = token.cancelled() => {
                            // Propagate the abort; the worker answers with an
                            // error result for this task id.
                            debug!(task_id, "forwarding cancellation to worker");
                            let cancel_msg = ParentMessage::Cancel { task_id };
                            let mut l = serde_json::to_string(&cancel_msg)
                                .map_err(|e| WorkerError::Protocol(e.to_string()))?;
                            l.push('\n');
                            handle
                                .stdin
                                .write_all(l.as_bytes())
                                .await
                                .map_err(|e| WorkerError::WorkerDied(format!("write: {e}")))?;
                            cancel_sent = true;
                            continue;
                        }
                    }
                }
                _ => handle.stdout.next().await,
            };

            let line = match next_line {
                Some(Ok(l)) => l,
                Some(Err(e)) => return Err(WorkerError::WorkerDied(format!("read: {e}"))),
                None => return Err(WorkerError::WorkerDied("worker closed stdout".into())),
            };

            let parsed: WorkerMessage = match serde_json::from_str(line.trim()) {
                Ok(m) => m,
                Err(e) => {
                    warn!("unparseable worker line: {e}");
                    continue;
                }
            };
            match parsed {
                WorkerMessage::Progress { task_id: id, message } if id == task_id => {
                    if let Some(tx) = &progress {
                        let _ = tx.try_send(ProgressUpdate::progress(message));
                    }
                }
                WorkerMessage::Result { task_id: id, result } if id == task_id => {
                    return Ok(result);
                }
                WorkerMessage::Error { task_id: id, message } if id == task_id => {
                    return Ok(TaskResult {
                        success: false,
                        output: String::new(),
                        error: Some(message),
                        metadata: None,
                    });
                }
                other => debug!("message for another task ignored: {other:?}"),
            }
        }
    }
}

#[async_trait]
impl TaskExecutor for WorkerPool {
    async fn execute(
        &self,
        task: WorkerTask,
        cancel: Option<CancellationToken>,
        progress: Option<mpsc::Sender<ProgressUpdate>>,
    ) -> Result<TaskResult, WorkerError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(WorkerError::ShuttingDown);
        }
        // A pre-aborted token rejects synchronously and does not count.
        if let Some(token) = &cancel {
            if token.is_cancelled() {
                return Err(WorkerError::Cancelled);
            }
        }

        self.stats.queued.fetch_add(1, Ordering::Relaxed);
        let acquire_result = self.acquire().await;
        self.stats.queued.fetch_sub(1, Ordering::Relaxed);
        let mut handle = acquire_result?;

        self.stats.total.fetch_add(1, Ordering::Relaxed);
        self.stats.active.fetch_add(1, Ordering::Relaxed);
        let task_id = self.next_task_id.fetch_add(1, Ordering::Relaxed);

        {
            let mut pids = self.all_pids.lock().await;
            if let Some(pid) = handle.child.id() {
                pids.insert(task_id, pid);
            }
        }

        let result = self
            .run_on_worker(&mut handle, task_id, task, cancel, progress)
            .await;

        self.stats.active.fetch_sub(1, Ordering::Relaxed);
        self.all_pids.lock().await.remove(&task_id);

        match &result {
            Ok(r) if r.success => {
                self.stats.completed.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
            }
        }

        match result {
            Ok(r) => {
                self.release(handle).await;
                Ok(r)
            }
            Err(e) => {
                // The worker is in an unknown state; kill it rather than
                // reusing it for the next task.
                let _ = handle.child.kill().await;
                self.spawned.fetch_sub(1, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    fn stats(&self) -> PoolStats {
        self.stats.snapshot()
    }

    async fn shutdown(&self) -> Result<(), WorkerError> {
        self.shutting_down.store(true, Ordering::SeqCst);
        info!("worker pool shutting down");

        let grace = Duration::from_secs(self.cfg.shutdown_grace_secs);
        let deadline = tokio::time::Instant::now() + grace;
        while self.stats.active.load(Ordering::Relaxed) > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!("shutdown grace elapsed; force-terminating workers");
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        // Drain and kill idle workers.
        let mut rx = self.idle_rx.lock().await;
        while let Ok(mut handle) = rx.try_recv() {
            let _ = handle.child.kill().await;
        }
        Ok(())
    }
}

// ─── Inline fallback ──────────────────────────────────────────────────────────

/// Pool-shaped executor used when no worker binary is configured.  It
/// refuses every task with a clear error, while honouring the same
/// shutdown and pre-abort semantics as the real pool.
#[derive(Default)]
pub struct InlineFallbackExecutor {
    shutting_down: AtomicBool,
    stats: StatCounters,
}

impl InlineFallbackExecutor {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskExecutor for InlineFallbackExecutor {
    async fn execute(
        &self,
        task: WorkerTask,
        cancel: Option<CancellationToken>,
        _progress: Option<mpsc::Sender<ProgressUpdate>>,
    ) -> Result<TaskResult, WorkerError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(WorkerError::ShuttingDown);
        }
        if let Some(token) = &cancel {
            if token.is_cancelled() {
                return Err(WorkerError::Cancelled);
            }
        }
        self.stats.total.fetch_add(1, Ordering::Relaxed);
        self.stats.failed.fetch_add(1, Ordering::Relaxed);
        Ok(TaskResult {
            success: false,
            output: String::new(),
            error: Some(format!(
                "no tool registry available in inline fallback (tool '{}')",
                task.tool
            )),
            metadata: None,
        })
    }

    fn stats(&self) -> PoolStats {
        self.stats.snapshot()
    }

    async fn shutdown(&self) -> Result<(), WorkerError> {
        self.shutting_down.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task() -> WorkerTask {
        WorkerTask {
            tool: "bash".into(),
            args: json!({"command": "echo hi"}),
            context: crate::protocol::TaskContext {
                session_id: "s1".into(),
                cwd: "/tmp".into(),
            },
        }
    }

    #[tokio::test]
    async fn inline_fallback_refuses_with_clear_error() {
        let exec = InlineFallbackExecutor::new();
        let result = exec.execute(task(), None, None).await.unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("no tool registry"));
        let stats = exec.stats();
        assert_eq!(stats.total_tasks, 1);
        assert_eq!(stats.failed_tasks, 1);
    }

    #[tokio::test]
    async fn submit_after_shutdown_rejects() {
        let exec = InlineFallbackExecutor::new();
        exec.shutdown().await.unwrap();
        let err = exec.execute(task(), None, None).await.unwrap_err();
        assert!(matches!(err, WorkerError::ShuttingDown));
        assert_eq!(exec.stats().total_tasks, 0);
    }

    #[tokio::test]
    async fn pre_aborted_token_rejects_without_counting() {
        let exec = InlineFallbackExecutor::new();
        let token = CancellationToken::new();
        token.cancel();
        let err = exec.execute(task(), Some(token), None).await.unwrap_err();
        assert!(matches!(err, WorkerError::Cancelled));
        assert_eq!(exec.stats().total_tasks, 0);
    }

    #[tokio::test]
    async fn shutdown_completes_with_no_tasks() {
        let exec = InlineFallbackExecutor::new();
        exec.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn pool_without_binary_fails_to_spawn() {
        let pool = WorkerPool::new(WorkerConfig {
            pool_size: 1,
            worker_binary: None,
            shutdown_grace_secs: 1,
        });
        let err = pool.execute(task(), None, None).await.unwrap_err();
        assert!(matches!(err, WorkerError::Spawn(_)));
    }

    #[tokio::test]
    async fn pool_shutdown_rejects_new_tasks() {
        let pool = WorkerPool::new(WorkerConfig {
            pool_size: 1,
            worker_binary: None,
            shutdown_grace_secs: 1,
        });
        pool.shutdown().await.unwrap();
        let err = pool.execute(task(), None, None).await.unwrap_err();
        assert!(matches!(err, WorkerError::ShuttingDown));
    }

    #[tokio::test]
    async fn pool_pre_aborted_token_rejects_synchronously() {
        let pool = WorkerPool::new(WorkerConfig {
            pool_size: 1,
            worker_binary: None,
            shutdown_grace_secs: 1,
        });
        let token = CancellationToken::new();
        token.cancel();
        let err = pool.execute(task(), Some(token), None).await.unwrap_err();
        assert!(matches!(err, WorkerError::Cancelled));
        assert_eq!(pool.stats().total_tasks, 0);
    }
}
