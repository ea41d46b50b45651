// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! MCP transports.
//!
//! **Stdio**: the server is a child process speaking newline-delimited
//! JSON-RPC on stdin/stdout.  A reader task routes responses to pending
//! requests by numeric id; process exit rejects everything still pending.
//!
//! **HTTP**: each request is one POST with a single JSON response.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::types::{JsonRpcRequest, JsonRpcResponse, McpError};

type PendingMap = Arc<Mutex<Option<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>>;

pub enum McpTransport {
    Stdio(StdioTransport),
    Http(HttpTransport),
}

impl McpTransport {
    pub async fn send_request(
        &self,
        req: JsonRpcRequest,
        timeout: Duration,
    ) -> Result<JsonRpcResponse, McpError> {
        match self {
            Self::Stdio(t) => t.send_request(req, timeout).await,
            Self::Http(t) => t.send_request(req, timeout).await,
        }
    }

    pub async fn send_notification(&self, req: JsonRpcRequest) -> Result<(), McpError> {
        match self {
            Self::Stdio(t) => t.send_notification(req).await,
            Self::Http(t) => t.send_notification(req).await,
        }
    }

    pub async fn shutdown(&self) {
        if let Self::Stdio(t) = self {
            t.shutdown().await;
        }
    }
}

// ─── Stdio ────────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct StdioTransport {
    stdin: tokio::sync::Mutex<ChildStdin>,
    child: tokio::sync::Mutex<Child>,
    pending: PendingMap,
}

impl StdioTransport {
    pub async fn spawn(
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<Self, McpError> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| McpError::Transport(format!("spawn {command}: {e}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::Transport("child stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::Transport("child stdout unavailable".into()))?;

        let pending: PendingMap = Arc::new(Mutex::new(Some(HashMap::new())));

        // Reader task: one JSON object per line.  Requests from the server
        // and notifications are ignored; responses are routed by id.
        let pending_reader = pending.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str::<JsonRpcResponse>(trimmed) {
                    Ok(resp) => {
                        let Some(id) = resp.id else {
                            debug!("mcp server notification ignored");
                            continue;
                        };
                        let sender = {
                            let mut guard = pending_reader.lock().unwrap();
                            guard.as_mut().and_then(|map| map.remove(&id))
                        };
                        match sender {
                            Some(tx) => {
                                let _ = tx.send(resp);
                            }
                            None => warn!(id, "mcp response for unknown request id"),
                        }
                    }
                    Err(e) => warn!("unparseable mcp line: {e}"),
                }
            }
            // EOF: the server died.  Taking the map drops every pending
            // sender, which rejects all outstanding requests at once.
            debug!("mcp stdio reader finished; rejecting pending requests");
            pending_reader.lock().unwrap().take();
        });

        Ok(Self {
            stdin: tokio::sync::Mutex::new(stdin),
            child: tokio::sync::Mutex::new(child),
            pending,
        })
    }

    async fn write_line(&self, req: &JsonRpcRequest) -> Result<(), McpError> {
        let mut line = serde_json::to_string(req)
            .map_err(|e| McpError::Protocol(format!("encode: {e}")))?;
        line.push('\n');
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| McpError::Transport(format!("write: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| McpError::Transport(format!("flush: {e}")))
    }

    pub async fn send_request(
        &self,
        req: JsonRpcRequest,
        timeout: Duration,
    ) -> Result<JsonRpcResponse, McpError> {
        let id = req.id.ok_or_else(|| {
            McpError::Protocol("send_request needs a request id".into())
        })?;

        let (tx, rx) = oneshot::channel();
        {
            let mut guard = self.pending.lock().unwrap();
            match guard.as_mut() {
                Some(map) => {
                    map.insert(id, tx);
                }
                None => return Err(McpError::Closed),
            }
        }

        if let Err(e) = self.write_line(&req).await {
            let mut guard = self.pending.lock().unwrap();
            if let Some(map) = guard.as_mut() {
                map.remove(&id);
            }
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(resp)) => Ok(resp),
            // Sender dropped: transport died while we were waiting.
            Ok(Err(_)) => Err(McpError::Closed),
            Err(_) => {
                let mut guard = self.pending.lock().unwrap();
                if let Some(map) = guard.as_mut() {
                    map.remove(&id);
                }
                Err(McpError::Timeout)
            }
        }
    }

    pub async fn send_notification(&self, req: JsonRpcRequest) -> Result<(), McpError> {
        self.write_line(&req).await
    }

    pub async fn is_alive(&self) -> bool {
        let mut child = self.child.lock().await;
        matches!(child.try_wait(), Ok(None))
    }

    pub async fn shutdown(&self) {
        let mut child = self.child.lock().await;
        let _ = child.kill().await;
    }
}

// ─── HTTP ─────────────────────────────────────────────────────────────────────

pub struct HttpTransport {
    url: String,
    headers: HashMap<String, String>,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(url: impl Into<String>, headers: HashMap<String, String>) -> Self {
        Self {
            url: url.into(),
            headers,
            client: reqwest::Client::new(),
        }
    }

    pub async fn send_request(
        &self,
        req: JsonRpcRequest,
        timeout: Duration,
    ) -> Result<JsonRpcResponse, McpError> {
        let mut http = self.client.post(&self.url).json(&req).timeout(timeout);
        for (k, v) in &self.headers {
            http = http.header(k.as_str(), v.as_str());
        }
        let resp = http.send().await.map_err(|e| {
            if e.is_timeout() {
                McpError::Timeout
            } else {
                McpError::Transport(e.to_string())
            }
        })?;
        if !resp.status().is_success() {
            return Err(McpError::Transport(format!(
                "http status {}",
                resp.status()
            )));
        }
        resp.json::<JsonRpcResponse>()
            .await
            .map_err(|e| McpError::Protocol(format!("decode: {e}")))
    }

    pub async fn send_notification(&self, req: JsonRpcRequest) -> Result<(), McpError> {
        let mut http = self.client.post(&self.url).json(&req);
        for (k, v) in &self.headers {
            http = http.header(k.as_str(), v.as_str());
        }
        http.send()
            .await
            .map_err(|e| McpError::Transport(e.to_string()))?;
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // The stdio tests use `cat`: it echoes each request line back verbatim,
    // which is a valid JSON-RPC response carrying the same id.

    #[tokio::test]
    async fn stdio_request_round_trips_through_cat() {
        let t = StdioTransport::spawn("cat", &[], &HashMap::new())
            .await
            .unwrap();
        let req = JsonRpcRequest::new(1, "ping", Some(serde_json::json!({"result": {}})));
        // `cat` echoes the request; it parses as a response with id 1.
        let resp = t
            .send_request(req, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(resp.id, Some(1));
        t.shutdown().await;
    }

    #[tokio::test]
    async fn stdio_timeout_when_no_response() {
        // `sleep` consumes stdin and never answers.
        let t = StdioTransport::spawn("sleep", &["5".to_string()], &HashMap::new())
            .await
            .unwrap();
        let req = JsonRpcRequest::new(1, "ping", None);
        let err = t
            .send_request(req, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Timeout | McpError::Transport(_)));
        t.shutdown().await;
    }

    #[tokio::test]
    async fn stdio_process_exit_rejects_pending() {
        // `true` exits immediately; the pending request must be rejected,
        // not left hanging until the timeout.
        let t = StdioTransport::spawn("true", &[], &HashMap::new())
            .await
            .unwrap();
        // Give the child a moment to exit and the reader to observe EOF.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let req = JsonRpcRequest::new(1, "ping", None);
        let err = t
            .send_request(req, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Closed | McpError::Transport(_)));
    }

    #[tokio::test]
    async fn spawn_failure_is_a_transport_error() {
        let err = StdioTransport::spawn("/no/such/binary_xyzzy", &[], &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Transport(_)));
    }

    #[tokio::test]
    async fn stdio_is_alive_tracks_child() {
        let t = StdioTransport::spawn("cat", &[], &HashMap::new())
            .await
            .unwrap();
        assert!(t.is_alive().await);
        t.shutdown().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!t.is_alive().await);
    }
}
