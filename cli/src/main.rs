// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # fleetcrypt
//!
//! Encrypts the data volumes of a VM fleet in place and rotates their
//! passphrases.
//!
//! ## Commands
//!
//! - `fleetcrypt encrypt --request FILE [--watch] [--report FILE]`
//! - `fleetcrypt rotate --request FILE`
//! - `fleetcrypt secrets ensure|retire --request FILE`
//! - `fleetcrypt config show|validate|generate`

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use fleetcrypt::commands::{self, ConfigCommand, EncryptArgs, RotateArgs, SecretsCommand};
use fleetcrypt_core::domain::config::{EncryptionConfigManifest, LoggingConfig};

/// Fleet volume encryption
#[derive(Parser)]
#[command(name = "fleetcrypt")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(
        short,
        long,
        global = true,
        env = "FLEETCRYPT_CONFIG_PATH",
        value_name = "FILE"
    )]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); defaults to the config
    #[arg(long, global = true, env = "FLEETCRYPT_LOG_LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Encrypt a mount point on every host of a request
    #[command(name = "encrypt")]
    Encrypt(EncryptArgs),

    /// Rotate the passphrase of an encrypted mount point
    #[command(name = "rotate")]
    Rotate(RotateArgs),

    /// Manage the hosts' vault secrets
    #[command(name = "secrets")]
    Secrets {
        #[command(subcommand)]
        command: SecretsCommand,
    },

    /// Configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // The config commands report a broken file themselves.
    let loaded = EncryptionConfigManifest::load_or_default(cli.config.clone());
    let logging = loaded
        .as_ref()
        .map(|c| c.spec.observability.logging.clone())
        .unwrap_or_default();
    init_logging(cli.log_level.as_deref(), &logging)?;

    match cli.command {
        Commands::Config { command } => commands::config::handle_command(command, cli.config).await,
        Commands::Encrypt(args) => commands::encrypt::execute(args, loaded?).await,
        Commands::Rotate(args) => commands::rotate::execute(args, loaded?).await,
        Commands::Secrets { command } => commands::secrets::handle_command(command, loaded?).await,
    }
}

/// Initialize tracing subscriber for logging
fn init_logging(level_override: Option<&str>, logging: &LoggingConfig) -> Result<()> {
    let level = level_override.unwrap_or(&logging.level);
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr);

    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.compact().init();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_encrypt() {
        let cli = Cli::try_parse_from([
            "fleetcrypt",
            "--log-level",
            "debug",
            "encrypt",
            "--request",
            "fleet.yaml",
            "--watch",
        ])
        .unwrap();
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        match cli.command {
            Commands::Encrypt(args) => {
                assert_eq!(args.request, PathBuf::from("fleet.yaml"));
                assert!(args.watch);
                assert!(args.report.is_none());
            }
            _ => panic!("expected encrypt"),
        }
    }
}
