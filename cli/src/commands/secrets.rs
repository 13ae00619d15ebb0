// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Secret management commands
//!
//! Commands: ensure, retire

use anyhow::Result;
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;
use tracing::error;

use fleetcrypt_core::application::secret_lifecycle::Retirement;
use fleetcrypt_core::domain::config::EncryptionConfigManifest;

use super::load_request;
use crate::embedded::EmbeddedRuntime;

#[derive(Subcommand)]
pub enum SecretsCommand {
    /// Create, revive or reuse each host's secret without touching the hosts
    Ensure {
        /// Request file naming the hosts and secret descriptor
        #[arg(short, long, value_name = "FILE")]
        request: PathBuf,
    },

    /// Schedule deletion of each host's vault secret after the grace
    /// period, or delete its passphrase object
    Retire {
        /// Request file naming the hosts and secret descriptor
        #[arg(short, long, value_name = "FILE")]
        request: PathBuf,
    },
}

pub async fn handle_command(command: SecretsCommand, config: EncryptionConfigManifest) -> Result<()> {
    match command {
        SecretsCommand::Ensure { request } => ensure(request, config).await,
        SecretsCommand::Retire { request } => retire(request, config).await,
    }
}

async fn ensure(request: PathBuf, config: EncryptionConfigManifest) -> Result<()> {
    let request = load_request(&request)?;
    let runtime = EmbeddedRuntime::new(config)?;
    let secrets = runtime.orchestrator().secrets();
    let force = runtime.config().spec.secrets.force_new_version || request.options.force_new_secret_version;

    let mut failed = 0;
    for host in &request.hosts {
        match secrets.ensure_secret(host, &request.descriptor, force).await {
            Ok(key) => println!("  {} {:<40} {}", "✓".green(), host.as_str(), key.describe()),
            Err(err) => {
                error!(host = %host, "Ensuring the secret failed: {}", err);
                println!("  {} {:<40} {}", "✗".red(), host.as_str(), err);
                println!("      resolution: {}", err.resolution());
                failed += 1;
            }
        }
    }
    summarize(failed, request.hosts.len())
}

async fn retire(request: PathBuf, config: EncryptionConfigManifest) -> Result<()> {
    let request = load_request(&request)?;
    let runtime = EmbeddedRuntime::new(config)?;
    let secrets = runtime.orchestrator().secrets();

    let mut failed = 0;
    for host in &request.hosts {
        match secrets.retire_secret(host, &request.descriptor).await {
            Ok(Some(Retirement::Scheduled(at))) => println!(
                "  {} {:<40} deletion scheduled for {}",
                "✓".green(),
                host.as_str(),
                at.to_rfc3339()
            ),
            Ok(Some(Retirement::Deleted)) => {
                println!("  {} {:<40} passphrase object deleted", "✓".green(), host.as_str())
            }
            Ok(None) => println!("  {} {:<40} no live secret", "-".dimmed(), host.as_str()),
            Err(err) => {
                error!(host = %host, "Retiring the secret failed: {}", err);
                println!("  {} {:<40} {}", "✗".red(), host.as_str(), err);
                println!("      resolution: {}", err.resolution());
                failed += 1;
            }
        }
    }
    summarize(failed, request.hosts.len())
}

fn summarize(failed: usize, total: usize) -> Result<()> {
    if failed > 0 {
        anyhow::bail!("{} of {} hosts failed", failed, total);
    }
    println!("{}", format!("✓ {} host(s) done", total).green());
    Ok(())
}
