// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! In-process recursive pattern search.
//!
//! Walks the tree under `path`, skipping vendored directories and files
//! with known-binary extensions, and scans line by line.  Files above the
//! size cap are skipped silently.  Results stop at the match cap with an
//! explicit truncation notice.

use async_trait::async_trait;
use regex::RegexBuilder;
use serde_json::{json, Value};
use tracing::debug;
use walkdir::WalkDir;

use harbor_security::PathOp;

use crate::context::ToolContext;
use crate::tool::{Tool, ToolCall, ToolOutput};

const MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;
const MAX_RESULTS: usize = 500;

const BINARY_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "webp", "bmp", "ico", "pdf", "zip", "tar", "gz", "bz2", "xz",
    "7z", "so", "dylib", "dll", "exe", "o", "a", "class", "jar", "wasm", "woff", "woff2", "ttf",
    "mp3", "mp4", "avi", "mov", "sqlite", "db",
];

const VENDORED_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    "target",
    "vendor",
    "dist",
    "build",
    ".venv",
    "__pycache__",
];

pub struct GrepTool;

#[async_trait]
impl Tool for GrepTool {
    fn name(&self) -> &str {
        "grep"
    }

    fn description(&self) -> &str {
        "Regex search across files.\n\
         pattern: full regex. path: file or directory (default cwd).\n\
         include: glob filter, brace groups supported ('*.{rs,toml}').\n\
         output_mode: content (default, path:line:text) | files_with_matches | count.\n\
         case_sensitive: true by default. Binary files, vendored directories, \
         and files over 10 MB are skipped."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern":        { "type": "string", "description": "Regular expression to search for" },
                "path":           { "type": "string", "description": "File or directory to search (default: cwd)" },
                "include":        { "type": "string", "description": "Glob filter, e.g. '*.rs' or '**/*.{ts,tsx}'" },
                "case_sensitive": { "type": "boolean", "description": "Case-sensitive search (default true)" },
                "output_mode": {
                    "type": "string",
                    "enum": ["content", "files_with_matches", "count"],
                    "description": "Output format (default content)"
                }
            },
            "required": ["pattern"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolOutput {
        let pattern = call
            .args
            .get("pattern")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let raw_path = call.args.get("path").and_then(|v| v.as_str()).unwrap_or(".");
        let include = call.args.get("include").and_then(|v| v.as_str());
        let case_sensitive = call
            .args
            .get("case_sensitive")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);
        let output_mode = call
            .args
            .get("output_mode")
            .and_then(|v| v.as_str())
            .unwrap_or("content");

        let root = {
            let joined = if std::path::Path::new(raw_path).is_absolute() {
                std::path::PathBuf::from(raw_path)
            } else {
                ctx.cwd.join(raw_path)
            };
            match ctx.security.validate_path(&joined, PathOp::Read) {
                Ok(p) => p,
                Err(e) => {
                    return ToolOutput::err(&call.id, format!("security violation: {e}"))
                        .with_metadata(json!({ "security_code": e.code() }))
                }
            }
        };

        let re = match RegexBuilder::new(pattern)
            .case_insensitive(!case_sensitive)
            .build()
        {
            Ok(re) => re,
            Err(e) => return ToolOutput::err(&call.id, format!("invalid pattern: {e}")),
        };

        let include_matchers: Option<Vec<glob::Matcher>> = include.map(|g| {
            expand_braces(g)
                .into_iter()
                .map(|p| glob::Matcher::new(&p))
                .collect()
        });

        debug!(pattern = %pattern, root = %root.display(), mode = %output_mode, "grep");

        let mut matches: Vec<(String, usize, String)> = Vec::new();
        let mut truncated = false;

        'walk: for entry in WalkDir::new(&root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| !is_vendored(e))
            .filter_map(|e| e.ok())
        {
            if ctx.cancel.is_cancelled() {
                return ToolOutput::err(&call.id, "cancelled");
            }
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if is_binary_ext(path) {
                continue;
            }
            if let Some(matchers) = &include_matchers {
                let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
                let rel = path.strip_prefix(&root).unwrap_or(path).to_string_lossy();
                if !matchers.iter().any(|m| m.matches(&name) || m.matches(&rel)) {
                    continue;
                }
            }
            // Oversized files are skipped silently.
            if entry.metadata().map(|m| m.len()).unwrap_or(0) > MAX_FILE_SIZE {
                continue;
            }

            let Ok(text) = std::fs::read_to_string(path) else {
                continue; // not valid UTF-8; treat as binary
            };
            let display = path
                .strip_prefix(&root)
                .unwrap_or(path)
                .to_string_lossy()
                .to_string();
            let display = if display.is_empty() {
                path.to_string_lossy().to_string()
            } else {
                display
            };

            for (lineno, line) in text.lines().enumerate() {
                if re.is_match(line) {
                    if matches.len() >= MAX_RESULTS {
                        truncated = true;
                        break 'walk;
                    }
                    matches.push((display.clone(), lineno + 1, line.to_string()));
                }
            }
        }

        let mut out = match output_mode {
            "files_with_matches" => {
                let mut files: Vec<&String> = matches.iter().map(|(f, _, _)| f).collect();
                files.dedup();
                files
                    .iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join("\n")
            }
            "count" => {
                let mut counts: std::collections::BTreeMap<&str, usize> = Default::default();
                for (f, _, _) in &matches {
                    *counts.entry(f.as_str()).or_default() += 1;
                }
                counts
                    .iter()
                    .map(|(f, n)| format!("{f}: {n}"))
                    .collect::<Vec<_>>()
                    .join("\n")
            }
            _ => matches
                .iter()
                .map(|(f, n, l)| format!("{f}:{n}:{l}"))
                .collect::<Vec<_>>()
                .join("\n"),
        };

        if truncated {
            out.push_str(&format!(
                "\n...[results truncated at {MAX_RESULTS} matches — narrow the pattern or path]"
            ));
        }

        if out.trim().is_empty() {
            ToolOutput::ok(&call.id, "(no matches)")
        } else {
            ToolOutput::ok(&call.id, out)
        }
    }
}

fn is_vendored(entry: &walkdir::DirEntry) -> bool {
    entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .map(|n| VENDORED_DIRS.contains(&n))
            .unwrap_or(false)
}

fn is_binary_ext(path: &std::path::Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| BINARY_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Expand one level of `{a,b,c}` brace groups into separate globs.
/// `*.{rs,toml}` → `["*.rs", "*.toml"]`.  Nested braces expand recursively.
pub fn expand_braces(glob: &str) -> Vec<String> {
    let Some(open) = glob.find('{') else {
        return vec![glob.to_string()];
    };
    let Some(close) = glob[open..].find('}').map(|i| i + open) else {
        return vec![glob.to_string()];
    };
    let prefix = &glob[..open];
    let suffix = &glob[close + 1..];
    let mut out = Vec::new();
    for alt in glob[open + 1..close].split(',') {
        let candidate = format!("{prefix}{alt}{suffix}");
        out.extend(expand_braces(&candidate));
    }
    out
}

/// Small glob matcher: `*` matches any run (including `/` so `**/` prefixes
/// behave), `?` matches one character, everything else is literal.
mod glob {
    pub struct Matcher {
        re: regex::Regex,
    }

    impl Matcher {
        pub fn new(pattern: &str) -> Self {
            let mut re = String::from("^");
            for ch in pattern.chars() {
                match ch {
                    '*' => re.push_str(".*"),
                    '?' => re.push('.'),
                    c => re.push_str(&regex::escape(&c.to_string())),
                }
            }
            re.push('$');
            let re = regex::Regex::new(&re)
                .unwrap_or_else(|_| regex::Regex::new("^$").unwrap());
            Self { re }
        }

        pub fn matches(&self, text: &str) -> bool {
            self.re.is_match(text)
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
