// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// harbor — a multi-channel AI agent gateway.
#[derive(Parser, Debug)]
#[command(name = "harbor", version, about)]
pub struct Cli {
    /// Path to an explicit config file (merged over the discovered layers).
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Verbose logging to stderr (equivalent to RUST_LOG=debug).
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the gateway: channels, sessions, control plane, canvas socket.
    Start,

    /// Run as a worker child process (reads tasks from stdin).
    ///
    /// Spawned by the worker pool; not intended for interactive use.
    Worker,

    /// Run the security configuration audit and print findings.
    Audit {
        /// Emit findings as JSON instead of text.
        #[arg(long)]
        json: bool,
    },

    /// Manage the encrypted secret store.
    ///
    /// The passphrase is read from HARBOR_SECRETS_PASSPHRASE.
    Secret {
        #[command(subcommand)]
        command: SecretCommands,
    },

    /// Print the merged configuration and exit.
    ShowConfig,
}

#[derive(Subcommand, Debug)]
pub enum SecretCommands {
    /// Store a named secret.
    Set { name: String, value: String },
    /// Print a secret's value.
    Get { name: String },
    /// Delete a secret.
    Delete { name: String },
    /// List secret names (never values).
    List,
}
