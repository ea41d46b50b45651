// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

/// A refused operation.  Never retried; the message carries the categorical
/// reason but not the full offending path or argv so that security decisions
/// do not leak sensitive detail back into the conversation.
#[derive(Debug, thiserror::Error)]
pub enum SecurityError {
    #[error("path contains a null byte")]
    NullByte,
    #[error("path is inside a blocked location")]
    PathBlocked { blocked_root: PathBuf },
    #[error("path escapes the workspace root")]
    PathEscape,
    #[error("symlink target escapes the workspace root")]
    SymlinkEscape,
    #[error("command '{program}' is not on the allowlist")]
    CommandNotAllowed { program: String },
    #[error("command arguments contain shell metacharacters")]
    ShellMetachar,
    #[error("secret store: {0}")]
    Secret(String),
}

impl SecurityError {
    /// Stable machine code for the control plane and audit logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NullByte => "null_byte",
            Self::PathBlocked { .. } => "path_blocked",
            Self::PathEscape => "path_escape",
            Self::SymlinkEscape => "symlink_escape",
            Self::CommandNotAllowed { .. } => "command_not_allowed",
            Self::ShellMetachar => "shell_metachar",
            Self::Secret(_) => "secret_store",
        }
    }
}
