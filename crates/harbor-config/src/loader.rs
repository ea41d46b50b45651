// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Layered YAML configuration loading.
//!
//! Precedence, lowest to highest: system (`/etc/harbor`), the user's XDG
//! config directory, the working directory, then an explicit `--config`
//! path or the `HARBOR_CONFIG` environment variable.  Higher layers
//! overlay lower ones key by key; scalars from the higher layer win.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde_yaml::Value;
use tracing::debug;

use crate::Config;

const ENV_OVERRIDE: &str = "HARBOR_CONFIG";

/// Load and validate the effective configuration.
///
/// `explicit` is the CLI-supplied path; unlike discovered layers it must
/// exist, so a typo'd `--config` fails loudly instead of silently running
/// on defaults.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let mut layers: Vec<PathBuf> = discovered_layers().into_iter().filter(|p| p.is_file()).collect();

    if let Some(p) = explicit {
        layers.push(p.to_path_buf());
    } else if let Ok(env_path) = std::env::var(ENV_OVERRIDE) {
        let p = PathBuf::from(env_path);
        if p.is_file() {
            layers.push(p);
        }
    }

    let mut effective = Value::Null;
    for path in &layers {
        debug!(path = %path.display(), "applying config layer");
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let layer: Value = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        effective = overlay(effective, layer);
    }

    let config = match effective {
        Value::Null => Config::default(),
        merged => serde_yaml::from_value(merged)
            .context("configuration does not match the expected schema")?,
    };
    config.validate()?;
    Ok(config)
}

/// Candidate layer files, lowest precedence first.  Missing files are
/// skipped; only the explicit `--config` path is required to exist.
fn discovered_layers() -> Vec<PathBuf> {
    let mut candidates = vec![PathBuf::from("/etc/harbor/harbor.yaml")];
    if let Some(xdg) = dirs::config_dir() {
        candidates.push(xdg.join("harbor/harbor.yaml"));
    }
    candidates.push(PathBuf::from("harbor.yaml"));
    candidates
}

/// Overlay `top` onto `base`.  Mappings merge recursively; any other
/// combination of values is replaced wholesale by `top`.
fn overlay(base: Value, top: Value) -> Value {
    match (base, top) {
        (Value::Mapping(mut under), Value::Mapping(over)) => {
            for (key, value) in over {
                let merged = match under.remove(&key) {
                    Some(existing) => overlay(existing, value),
                    None => value,
                };
                under.insert(key, merged);
            }
            Value::Mapping(under)
        }
        (_, top) => top,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
