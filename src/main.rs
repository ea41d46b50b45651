// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands, SecretCommands};
use harbor_tools::create_default;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Worker mode speaks newline-delimited JSON on stdout; every log line
    // must go to stderr in every mode so the protocol stream stays clean.
    init_logging(cli.verbose);

    match cli.command.unwrap_or(Commands::Start) {
        Commands::Start => {
            let config = harbor_config::load(cli.config.as_deref())?;
            harbor_gateway::run(config).await
        }

        Commands::Worker => {
            let config = harbor_config::load(cli.config.as_deref())?;
            let registry = Arc::new(create_default(&config.tools));
            harbor_worker::runner::run_worker(registry).await
        }

        Commands::Audit { json } => {
            let config = harbor_config::load(cli.config.as_deref())?;
            let findings = harbor_security::SecurityAuditor::run(&config.security);
            if json {
                println!("{}", serde_json::to_string_pretty(&findings)?);
            } else {
                for f in &findings {
                    println!("[{:?}] {} — {}", f.severity, f.name, f.message);
                }
            }
            Ok(())
        }

        Commands::Secret { command } => {
            let config = harbor_config::load(cli.config.as_deref())?;
            let path = config
                .security
                .secrets_file
                .clone()
                .context("security.secrets_file is not configured")?;
            let passphrase = std::env::var("HARBOR_SECRETS_PASSPHRASE")
                .context("HARBOR_SECRETS_PASSPHRASE is not set")?;
            let mut store = harbor_security::SecretStore::open(&path, &passphrase)?;
            match command {
                SecretCommands::Set { name, value } => {
                    store.set(&name, &value)?;
                    println!("stored '{name}'");
                }
                SecretCommands::Get { name } => match store.get(&name) {
                    Some(value) => println!("{value}"),
                    None => anyhow::bail!("no secret named '{name}'"),
                },
                SecretCommands::Delete { name } => {
                    if store.delete(&name)? {
                        println!("deleted '{name}'");
                    } else {
                        anyhow::bail!("no secret named '{name}'");
                    }
                }
                SecretCommands::List => {
                    for name in store.list_names() {
                        println!("{name}");
                    }
                }
            }
            Ok(())
        }

        Commands::ShowConfig => {
            let config = harbor_config::load(cli.config.as_deref())?;
            println!("{}", serde_yaml::to_string(&config)?);
            Ok(())
        }
    }
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}
