// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `bool::default()`
/// (i.e. `false`), so fields that should be enabled unless explicitly
/// disabled need a named function.
fn default_true() -> bool {
    true
}

/// Startup-only configuration failure.  The process refuses to start when
/// validation fails; the message names the offending field and value.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("configuration file error: {0}")]
    Io(String),
}

/// How much the agent may do without asking the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AutonomyLevel {
    /// Reads run automatically; writes and executes require confirmation.
    Readonly,
    /// Reads and writes run automatically; executes require confirmation.
    #[default]
    Supervised,
    /// Everything runs automatically.
    Full,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub sessions: SessionConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    /// Named MCP servers the `mcp_client` tool may connect to.
    #[serde(default)]
    pub mcp_servers: HashMap<String, McpServerConfig>,
}

impl Config {
    /// Validate invariants that serde cannot express.  Called once at
    /// startup; any error is fatal.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.provider.model.is_empty() {
            return Err(ConfigError::Invalid {
                field: "provider.model",
                reason: "no model specified".into(),
            });
        }
        if self.memory.vector_weight + self.memory.keyword_weight <= 0.0 {
            return Err(ConfigError::Invalid {
                field: "memory",
                reason: "vector_weight + keyword_weight must be positive".into(),
            });
        }
        if self.worker.pool_size == 0 {
            return Err(ConfigError::Invalid {
                field: "worker.pool_size",
                reason: "pool size must be at least 1".into(),
            });
        }
        if self.supervisor.missed_threshold == 0 {
            return Err(ConfigError::Invalid {
                field: "supervisor.missed_threshold",
                reason: "missed threshold must be at least 1".into(),
            });
        }
        if self.engine.canvas_node_cap == 0 {
            return Err(ConfigError::Invalid {
                field: "engine.canvas_node_cap",
                reason: "canvas node cap must be at least 1".into(),
            });
        }
        Ok(())
    }
}

// ─── Provider ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider kind: "openai_compat" | "mock".
    pub kind: String,
    /// Model name forwarded to the provider API.
    pub model: String,
    /// Environment variable that holds the API key (read at runtime).
    pub api_key_env: Option<String>,
    /// Explicit API key; prefer api_key_env in config files to avoid secrets
    /// in version-controlled files.
    pub api_key: Option<String>,
    /// Base URL override.  Useful for local proxies or OpenAI-compatible servers.
    pub base_url: Option<String>,
    /// Per-request timeout in seconds.
    #[serde(default = "default_provider_timeout")]
    pub request_timeout_secs: u64,
    /// Maximum retry attempts for retryable failures (429, 5xx, transport).
    #[serde(default = "default_provider_retries")]
    pub max_retries: u32,
}

fn default_provider_timeout() -> u64 {
    120
}
fn default_provider_retries() -> u32 {
    3
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: "openai_compat".into(),
            model: "gpt-4o".into(),
            api_key_env: None,
            api_key: None,
            base_url: None,
            request_timeout_secs: default_provider_timeout(),
            max_retries: default_provider_retries(),
        }
    }
}

// ─── Security ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Root directory the agent may touch.  Everything outside is denied.
    #[serde(default = "default_workspace")]
    pub workspace_root: PathBuf,
    /// Extra blocked paths on top of the built-in system set.
    #[serde(default)]
    pub blocked_paths: Vec<PathBuf>,
    /// Programs the `bash` tool may run (leading argv element).
    #[serde(default = "default_command_allowlist")]
    pub command_allowlist: Vec<String>,
    /// Allow shell metacharacters (`;`, `&&`, `|`, `$(…)`) in commands.
    /// Off by default; turning it on is an explicit operator decision.
    #[serde(default)]
    pub allow_shell_metachars: bool,
    /// Resolve symlinks and re-check the real path against the workspace.
    #[serde(default = "default_true")]
    pub enforce_symlinks: bool,
    #[serde(default)]
    pub autonomy: AutonomyLevel,
    /// Extra secret-redaction regexes applied by `sanitize_output`.
    #[serde(default)]
    pub redact_patterns: Vec<String>,
    /// Path of the encrypted secrets file.
    pub secrets_file: Option<PathBuf>,
    /// Hosts the `web_fetch` tool must never contact.
    #[serde(default)]
    pub blocked_hosts: Vec<String>,
}

fn default_workspace() -> PathBuf {
    PathBuf::from(".")
}

fn default_command_allowlist() -> Vec<String> {
    ["ls", "cat", "head", "tail", "grep", "find", "wc", "echo", "git", "rg"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            workspace_root: default_workspace(),
            blocked_paths: Vec::new(),
            command_allowlist: default_command_allowlist(),
            allow_shell_metachars: false,
            enforce_symlinks: true,
            autonomy: AutonomyLevel::default(),
            redact_patterns: Vec::new(),
            secrets_file: None,
            blocked_hosts: Vec::new(),
        }
    }
}

// ─── Memory ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// SQLite database path.  `None` selects the per-user data directory.
    pub db_path: Option<PathBuf>,
    #[serde(default = "default_vector_weight")]
    pub vector_weight: f64,
    #[serde(default = "default_keyword_weight")]
    pub keyword_weight: f64,
    /// Embedding cache entries kept before LRU pruning.
    #[serde(default = "default_embedding_cache_size")]
    pub embedding_cache_size: usize,
    /// Embedding backend: "none" or an OpenAI-compatible embeddings URL.
    #[serde(default)]
    pub embedding_url: Option<String>,
    #[serde(default)]
    pub embedding_model: Option<String>,
}

fn default_vector_weight() -> f64 {
    0.7
}
fn default_keyword_weight() -> f64 {
    0.3
}
fn default_embedding_cache_size() -> usize {
    4096
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            vector_weight: default_vector_weight(),
            keyword_weight: default_keyword_weight(),
            embedding_cache_size: default_embedding_cache_size(),
            embedding_url: None,
            embedding_model: None,
        }
    }
}

// ─── Tools ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Per-tool execution timeout in seconds.
    #[serde(default = "default_tool_timeout")]
    pub timeout_secs: u64,
    /// Directory holding named skill instruction files for `load_skill`.
    pub skills_dir: Option<PathBuf>,
    /// Search backend URL for `web_search` (None disables the tool).
    pub search_url: Option<String>,
}

fn default_tool_timeout() -> u64 {
    120
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_tool_timeout(),
            skills_dir: None,
            search_url: None,
        }
    }
}

// ─── Worker pool ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of reusable worker subprocesses.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Path of the worker binary.  `None` selects the inline fallback which
    /// refuses all work (useful for tests and single-process deployments).
    pub worker_binary: Option<PathBuf>,
    /// How long shutdown waits for in-flight tasks before force-terminating.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

fn default_pool_size() -> usize {
    2
}
fn default_shutdown_grace() -> u64 {
    10
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            worker_binary: None,
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

// ─── Sessions ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Idle TTL after which a session is ended by the eviction sweep.
    #[serde(default = "default_idle_ttl")]
    pub idle_ttl_secs: u64,
    /// Sweep interval for the background eviction task.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Grace period between `end` and registry removal.
    #[serde(default = "default_end_grace")]
    pub end_grace_secs: u64,
    /// Directory for per-context session note files.  `None` disables notes.
    pub notes_dir: Option<PathBuf>,
    /// Default system prompt for new sessions.
    pub system_prompt: Option<String>,
}

fn default_idle_ttl() -> u64 {
    1800
}
fn default_sweep_interval() -> u64 {
    60
}
fn default_end_grace() -> u64 {
    5
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_ttl_secs: default_idle_ttl(),
            sweep_interval_secs: default_sweep_interval(),
            end_grace_secs: default_end_grace(),
            notes_dir: None,
            system_prompt: None,
        }
    }
}

// ─── Supervisor ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_missed_threshold")]
    pub missed_threshold: u32,
    /// Initial restart backoff; doubles per consecutive crash.
    #[serde(default = "default_backoff_initial")]
    pub backoff_initial_ms: u64,
    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,
    /// Crash-loop budget: restarts allowed within the rolling window.
    #[serde(default = "default_max_restarts")]
    pub max_restarts_per_window: u32,
    #[serde(default = "default_restart_window")]
    pub restart_window_secs: u64,
}

fn default_heartbeat_interval() -> u64 {
    5000
}
fn default_missed_threshold() -> u32 {
    3
}
fn default_backoff_initial() -> u64 {
    500
}
fn default_backoff_max() -> u64 {
    30_000
}
fn default_max_restarts() -> u32 {
    5
}
fn default_restart_window() -> u64 {
    300
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval(),
            missed_threshold: default_missed_threshold(),
            backoff_initial_ms: default_backoff_initial(),
            backoff_max_ms: default_backoff_max(),
            max_restarts_per_window: default_max_restarts(),
            restart_window_secs: default_restart_window(),
        }
    }
}

// ─── Channels ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelsConfig {
    #[serde(default)]
    pub terminal: Option<TerminalChannelConfig>,
    #[serde(default)]
    pub webhook: Option<WebhookChannelConfig>,
    #[serde(default)]
    pub canvas: Option<CanvasChannelConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TerminalChannelConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookChannelConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Outbound send endpoint of the chat platform.
    pub send_url: Option<String>,
    /// Shared secret for inbound signature verification.
    pub signing_secret: Option<String>,
    /// The bot's own user id; messages from it are dropped.
    pub bot_user_id: Option<String>,
    /// Platform message length limit used by the splitter.
    #[serde(default = "default_message_limit")]
    pub message_limit: usize,
    /// DM policy: "open" | "allowlist" | "pairing".
    #[serde(default = "default_dm_policy")]
    pub dm_policy: String,
    #[serde(default)]
    pub allowed_users: Vec<String>,
}

fn default_message_limit() -> usize {
    4096
}
fn default_dm_policy() -> String {
    "open".into()
}

impl Default for WebhookChannelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            send_url: None,
            signing_secret: None,
            bot_user_id: None,
            message_limit: default_message_limit(),
            dm_policy: default_dm_policy(),
            allowed_users: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanvasChannelConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Optional bearer token required as `?token=` on the WebSocket upgrade.
    pub auth_token: Option<String>,
}

impl Default for CanvasChannelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auth_token: None,
        }
    }
}

// ─── HTTP control plane ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "127.0.0.1:8450".into()
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

// ─── Engine ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum provider→tool rounds per run before the loop stops.
    #[serde(default = "default_max_rounds")]
    pub max_tool_rounds: u32,
    /// Maximum canvas nodes per session.
    #[serde(default = "default_canvas_cap")]
    pub canvas_node_cap: usize,
}

fn default_max_rounds() -> u32 {
    24
}
fn default_canvas_cap() -> usize {
    200
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: default_max_rounds(),
            canvas_node_cap: default_canvas_cap(),
        }
    }
}

// ─── MCP servers ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    /// "stdio" | "http".
    #[serde(default = "default_mcp_transport")]
    pub transport: String,
    /// Command + args for stdio transport.
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Endpoint URL for http transport.
    #[serde(default)]
    pub url: String,
    /// Per-request timeout in seconds.
    #[serde(default = "default_mcp_timeout")]
    pub request_timeout_secs: u64,
}

fn default_mcp_transport() -> String {
    "stdio".into()
}
fn default_mcp_timeout() -> u64 {
    30
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn empty_model_is_rejected() {
        let mut cfg = Config::default();
        cfg.provider.model = String::new();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("no model specified"));
    }

    #[test]
    fn zero_weights_are_rejected() {
        let mut cfg = Config::default();
        cfg.memory.vector_weight = 0.0;
        cfg.memory.keyword_weight = 0.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_pool_size_is_rejected() {
        let mut cfg = Config::default();
        cfg.worker.pool_size = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn autonomy_deserialises_lowercase() {
        let lvl: AutonomyLevel = serde_yaml::from_str("readonly").unwrap();
        assert_eq!(lvl, AutonomyLevel::Readonly);
        let lvl: AutonomyLevel = serde_yaml::from_str("full").unwrap();
        assert_eq!(lvl, AutonomyLevel::Full);
    }

    #[test]
    fn default_autonomy_is_supervised() {
        assert_eq!(AutonomyLevel::default(), AutonomyLevel::Supervised);
    }

    #[test]
    fn memory_weights_default_to_spec_values() {
        let m = MemoryConfig::default();
        assert_eq!(m.vector_weight, 0.7);
        assert_eq!(m.keyword_weight, 0.3);
    }

    #[test]
    fn config_round_trips_through_yaml() {
        let cfg = Config::default();
        let yaml = serde_yaml::to_string(&cfg).unwrap();
        let back: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.provider.model, cfg.provider.model);
        assert_eq!(back.security.command_allowlist, cfg.security.command_allowlist);
    }
}
