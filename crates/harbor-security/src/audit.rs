// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Configuration auditor.  Runs a fixed battery of checks against the
//! security configuration and reports ordered findings.  Exposed through
//! `harbor audit` so operators can sanity-check a deployment before
//! pointing channels at it.

use std::path::Path;

use serde::{Deserialize, Serialize};

use harbor_config::{AutonomyLevel, SecurityConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditFinding {
    pub id: &'static str,
    pub name: &'static str,
    pub severity: AuditSeverity,
    pub message: String,
}

/// Commands whose presence on the allowlist deserves a second look.
const DANGEROUS_COMMANDS: &[&str] = &["rm", "dd", "mkfs", "shutdown", "reboot", "chmod", "chown", "sudo"];

/// Directories that make a terrible workspace root.
const DANGEROUS_WORKSPACES: &[&str] = &["/", "/etc", "/root", "/usr", "/var", "/home"];

pub struct SecurityAuditor;

impl SecurityAuditor {
    /// Run the full battery.  Findings come back in a fixed order so the
    /// CLI output is stable across runs.
    pub fn run(cfg: &SecurityConfig) -> Vec<AuditFinding> {
        let mut findings = Vec::new();

        // 1. Workspace exists
        if !cfg.workspace_root.exists() {
            findings.push(AuditFinding {
                id: "workspace_missing",
                name: "Workspace root exists",
                severity: AuditSeverity::Critical,
                message: format!("workspace root {} does not exist", cfg.workspace_root.display()),
            });
        } else {
            findings.push(AuditFinding {
                id: "workspace_ok",
                name: "Workspace root exists",
                severity: AuditSeverity::Info,
                message: format!("workspace root is {}", cfg.workspace_root.display()),
            });
        }

        // 2. Workspace is not a dangerous system directory
        let ws = cfg
            .workspace_root
            .canonicalize()
            .unwrap_or_else(|_| cfg.workspace_root.clone());
        if DANGEROUS_WORKSPACES.iter().any(|d| ws == Path::new(d)) {
            findings.push(AuditFinding {
                id: "workspace_dangerous",
                name: "Workspace root location",
                severity: AuditSeverity::Critical,
                message: format!("workspace root {} is a system directory", ws.display()),
            });
        }

        // 3. Autonomy level
        let (sev, msg) = match cfg.autonomy {
            AutonomyLevel::Full => (
                AuditSeverity::Warning,
                "autonomy is 'full': no action will ever ask for confirmation".to_string(),
            ),
            AutonomyLevel::Supervised => (
                AuditSeverity::Info,
                "autonomy is 'supervised': executes require confirmation".to_string(),
            ),
            AutonomyLevel::Readonly => (
                AuditSeverity::Info,
                "autonomy is 'readonly': writes and executes require confirmation".to_string(),
            ),
        };
        findings.push(AuditFinding {
            id: "autonomy_level",
            name: "Autonomy level",
            severity: sev,
            message: msg,
        });

        // 4. Blocked paths configured
        findings.push(AuditFinding {
            id: "blocked_paths",
            name: "Extra blocked paths",
            severity: AuditSeverity::Info,
            message: format!("{} extra blocked path(s) configured", cfg.blocked_paths.len()),
        });

        // 5. Command allowlist size
        if cfg.command_allowlist.is_empty() {
            findings.push(AuditFinding {
                id: "allowlist_empty",
                name: "Command allowlist",
                severity: AuditSeverity::Warning,
                message: "command allowlist is empty: the bash tool can run nothing".into(),
            });
        } else {
            findings.push(AuditFinding {
                id: "allowlist_size",
                name: "Command allowlist",
                severity: AuditSeverity::Info,
                message: format!("{} command(s) allowlisted", cfg.command_allowlist.len()),
            });
        }

        // 6. Secrets file permissions
        if let Some(path) = &cfg.secrets_file {
            findings.push(check_secrets_permissions(path));
        }

        // 7. Dangerous commands on the allowlist
        let dangerous: Vec<&str> = cfg
            .command_allowlist
            .iter()
            .filter(|c| DANGEROUS_COMMANDS.contains(&c.as_str()))
            .map(String::as_str)
            .collect();
        if !dangerous.is_empty() {
            findings.push(AuditFinding {
                id: "dangerous_commands",
                name: "Dangerous allowlisted commands",
                severity: AuditSeverity::Warning,
                message: format!("allowlist contains: {}", dangerous.join(", ")),
            });
        }

        findings
    }
}

#[cfg(unix)]
fn check_secrets_permissions(path: &Path) -> AuditFinding {
    use std::os::unix::fs::PermissionsExt;
    match std::fs::metadata(path) {
        Ok(meta) => {
            let mode = meta.permissions().mode() & 0o777;
            if mode == 0o600 {
                AuditFinding {
                    id: "secrets_permissions",
                    name: "Secrets file permissions",
                    severity: AuditSeverity::Info,
                    message: "secrets file is owner-only (0600)".into(),
                }
            } else {
                AuditFinding {
                    id: "secrets_permissions",
                    name: "Secrets file permissions",
                    severity: AuditSeverity::Critical,
                    message: format!("secrets file mode is {mode:o}, expected 600"),
                }
            }
        }
        Err(_) => AuditFinding {
            id: "secrets_missing",
            name: "Secrets file permissions",
            severity: AuditSeverity::Info,
            message: "secrets file not created yet".into(),
        },
    }
}

#[cfg(not(unix))]
fn check_secrets_permissions(_path: &Path) -> AuditFinding {
    AuditFinding {
        id: "secrets_permissions",
        name: "Secrets file permissions",
        severity: AuditSeverity::Info,
        message: "permission check not supported on this platform".into(),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use harbor_config::SecurityConfig;

    #[test]
    fn missing_workspace_is_critical() {
        let cfg = SecurityConfig {
            workspace_root: "/tmp/harbor_no_such_dir_xyzzy".into(),
            ..SecurityConfig::default()
        };
        let findings = SecurityAuditor::run(&cfg);
        let f = findings.iter().find(|f| f.id == "workspace_missing").unwrap();
        assert_eq!(f.severity, AuditSeverity::Critical);
    }

    #[test]
    fn full_autonomy_is_flagged() {
        let dir = tempfile::TempDir::new().unwrap();
        let cfg = SecurityConfig {
            workspace_root: dir.path().to_path_buf(),
            autonomy: AutonomyLevel::Full,
            ..SecurityConfig::default()
        };
        let findings = SecurityAuditor::run(&cfg);
        let f = findings.iter().find(|f| f.id == "autonomy_level").unwrap();
        assert_eq!(f.severity, AuditSeverity::Warning);
    }

    #[test]
    fn dangerous_allowlist_entries_are_flagged() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut cfg = SecurityConfig {
            workspace_root: dir.path().to_path_buf(),
            ..SecurityConfig::default()
        };
        cfg.command_allowlist.push("rm".into());
        let findings = SecurityAuditor::run(&cfg);
        let f = findings.iter().find(|f| f.id == "dangerous_commands").unwrap();
        assert!(f.message.contains("rm"));
    }

    #[test]
    fn empty_allowlist_is_warning() {
        let dir = tempfile::TempDir::new().unwrap();
        let cfg = SecurityConfig {
            workspace_root: dir.path().to_path_buf(),
            command_allowlist: vec![],
            ..SecurityConfig::default()
        };
        let findings = SecurityAuditor::run(&cfg);
        assert!(findings.iter().any(|f| f.id == "allowlist_empty"));
    }

    #[cfg(unix)]
    #[test]
    fn loose_secrets_permissions_are_critical() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::TempDir::new().unwrap();
        let secrets = dir.path().join("secrets.enc");
        std::fs::write(&secrets, "x").unwrap();
        std::fs::set_permissions(&secrets, std::fs::Permissions::from_mode(0o644)).unwrap();
        let cfg = SecurityConfig {
            workspace_root: dir.path().to_path_buf(),
            secrets_file: Some(secrets),
            ..SecurityConfig::default()
        };
        let findings = SecurityAuditor::run(&cfg);
        let f = findings.iter().find(|f| f.id == "secrets_permissions").unwrap();
        assert_eq!(f.severity, AuditSeverity::Critical);
    }

    #[test]
    fn findings_are_ordered_and_stable() {
        let dir = tempfile::TempDir::new().unwrap();
        let cfg = SecurityConfig {
            workspace_root: dir.path().to_path_buf(),
            ..SecurityConfig::default()
        };
        let a = SecurityAuditor::run(&cfg);
        let b = SecurityAuditor::run(&cfg);
        let ids_a: Vec<_> = a.iter().map(|f| f.id).collect();
        let ids_b: Vec<_> = b.iter().map(|f| f.id).collect();
        assert_eq!(ids_a, ids_b);
    }
}
