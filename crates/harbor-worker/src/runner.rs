// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Worker-side task loop: reads [`ParentMessage`]s from stdin, runs tools
//! from its own registry, and writes [`WorkerMessage`]s to stdout.
//!
//! The security policy is rebuilt here from the minimal task context with
//! autonomy `full` — the parent already made the gating decision before
//! dispatching.  Tasks run concurrently so a `cancel` message can land
//! while its task is in flight.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use harbor_config::SecurityConfig;
use harbor_security::SecurityPolicy;
use harbor_tools::{ProgressUpdate, ToolCall, ToolContext, ToolRegistry};

use crate::protocol::{ParentMessage, TaskResult, WorkerMessage, WorkerTask};

type Writer = Arc<Mutex<tokio::io::Stdout>>;

async fn write_message(writer: &Writer, msg: &WorkerMessage) {
    if let Ok(mut line) = serde_json::to_string(msg) {
        line.push('\n');
        let mut out = writer.lock().await;
        let _ = out.write_all(line.as_bytes()).await;
        let _ = out.flush().await;
    }
}

fn build_context(task: &WorkerTask, cancel: CancellationToken) -> ToolContext {
    let security = SecurityConfig {
        workspace_root: task.context.cwd.clone(),
        autonomy: harbor_config::AutonomyLevel::Full,
        ..SecurityConfig::default()
    };
    let policy = Arc::new(SecurityPolicy::new(&security));
    ToolContext::new(&task.context.session_id, &task.context.cwd, policy).with_cancel(cancel)
}

/// Run the worker loop until stdin closes or a `shutdown` message arrives.
pub async fn run_worker(registry: Arc<ToolRegistry>) -> anyhow::Result<()> {
    info!("worker started");
    let writer: Writer = Arc::new(Mutex::new(tokio::io::stdout()));
    let mut lines = FramedRead::new(tokio::io::stdin(), LinesCodec::new());

    let mut running: HashMap<u64, CancellationToken> = HashMap::new();

    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                warn!("stdin read error: {e}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let msg: ParentMessage = match serde_json::from_str(line.trim()) {
            Ok(m) => m,
            Err(e) => {
                warn!("unparseable parent message: {e}");
                continue;
            }
        };

        match msg {
            ParentMessage::Execute { task_id, task } => {
                let cancel = CancellationToken::new();
                running.insert(task_id, cancel.clone());

                let registry = registry.clone();
                let writer = writer.clone();
                tokio::spawn(async move {
                    let (progress_tx, mut progress_rx) =
                        mpsc::channel::<ProgressUpdate>(32);
                    let ctx = build_context(&task, cancel).with_progress(progress_tx);

                    // Forward progress while the tool runs.
                    let progress_writer = writer.clone();
                    let forwarder = tokio::spawn(async move {
                        while let Some(update) = progress_rx.recv().await {
                            write_message(
                                &progress_writer,
                                &WorkerMessage::Progress {
                                    task_id,
                                    message: update.message,
                                },
                            )
                            .await;
                        }
                    });

                    let call = ToolCall {
                        id: format!("worker-{task_id}"),
                        name: task.tool.clone(),
                        args: task.args.clone(),
                    };
                    let output = registry.execute(&call, &ctx).await;
                    drop(ctx); // closes the progress sender
                    let _ = forwarder.await;

                    let result = TaskResult {
                        success: !output.is_error,
                        output: if output.is_error {
                            String::new()
                        } else {
                            output.content.clone()
                        },
                        error: output.is_error.then_some(output.content),
                        metadata: output.metadata,
                    };
                    write_message(&writer, &WorkerMessage::Result { task_id, result }).await;
                });
            }
            ParentMessage::Cancel { task_id } => {
                if let Some(token) = running.remove(&task_id) {
                    info!(task_id, "cancelling task");
                    token.cancel();
                } else {
                    warn!(task_id, "cancel for unknown task");
                }
            }
            ParentMessage::Shutdown => {
                info!("worker shutdown requested");
                break;
            }
        }

        // Forget tokens for tasks that already finished; ids are unique so
        // stale entries only cost memory, but keep the map tidy.
        running.retain(|_, token| !token.is_cancelled());
    }

    info!("worker stopped");
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
