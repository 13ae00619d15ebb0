// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use fleetcrypt_core::domain::config::{EncryptionConfigManifest, KeyApiMode};

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Generate a configuration file with every default spelled out
    Generate {
        /// Output path
        #[arg(short, long, default_value = "./fleetcrypt-config.yaml")]
        output: PathBuf,
    },
}

pub async fn handle_command(command: ConfigCommand, config_override: Option<PathBuf>) -> Result<()> {
    match command {
        ConfigCommand::Show { paths } => show(config_override, paths).await,
        ConfigCommand::Validate { file } => validate(file.or(config_override)).await,
        ConfigCommand::Generate { output } => generate(output).await,
    }
}

async fn show(config_override: Option<PathBuf>, show_paths: bool) -> Result<()> {
    let config = EncryptionConfigManifest::load_or_default(config_override.clone())
        .context("Failed to load configuration")?;

    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        if let Some(path) = &config_override {
            println!("  1. --config flag: {}", path.display());
        } else {
            println!("  1. --config flag: {}", "(not set)".dimmed());
        }
        println!(
            "  2. FLEETCRYPT_CONFIG_PATH: {}",
            std::env::var("FLEETCRYPT_CONFIG_PATH")
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. ./fleetcrypt-config.yaml");
        println!("  4. ~/.fleetcrypt/config.yaml");
        println!("  5. /etc/fleetcrypt/config.yaml");
        println!();
    }

    println!("{} {}", "Current configuration:".bold(), config.metadata.name);
    println!();

    let spec = &config.spec;
    println!("{}", "Fleet:".bold());
    println!("  Parallel hosts: {}", spec.fleet.max_parallel_hosts);
    println!("  Host timeout: {:?}", spec.fleet.host_timeout);
    println!();

    println!("{}", "Remote:".bold());
    println!("  User: {}", spec.remote.user);
    println!("  Command timeout: {:?}", spec.remote.command_timeout);
    if let Some(identity) = &spec.remote.identity_file {
        println!("  Identity file: {}", identity.display());
    }
    println!();

    println!("{}", "Retry policies:".bold());
    for (name, policy) in [
        ("boot_wait", &spec.retry.boot_wait),
        ("encrypt", &spec.retry.encrypt),
        ("key_change", &spec.retry.key_change),
        ("vault_wait", &spec.retry.vault_wait),
        ("vault_read", &spec.retry.vault_read),
    ] {
        println!("  {:<12} {} x {:?}", name, policy.attempts, policy.interval);
    }
    println!();

    println!("{}", "Key fetcher:".bold());
    match &spec.keyapi.mode {
        KeyApiMode::Remote => println!("  Mode: remote"),
        KeyApiMode::LocalDevelopment { passphrase_file } => println!(
            "  Mode: {} ({})",
            "local development".yellow(),
            passphrase_file
        ),
    }
    println!("  Remote dir: {}", spec.keyapi.remote_dir);
    println!("  Fetch log: {}", spec.keyapi.fetch_log);
    println!();

    println!("{}", "Vault:".bold());
    println!("  Endpoint: {}", spec.vault.endpoint);
    println!("  Token variable: {}", spec.vault.token_env);
    println!("  Concurrent calls: {}", spec.vault.max_concurrent_calls);
    println!("  Deletion grace: {} days", spec.vault.deletion_grace_days);
    println!();

    println!("{}", "Object store:".bold());
    println!("  Endpoint: {}", spec.object_store.endpoint);
    println!("  Token variable: {}", spec.object_store.token_env);
    println!();

    Ok(())
}

async fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config = EncryptionConfigManifest::load_or_default(config_path)
        .context("Failed to load configuration")?;

    config
        .validate()
        .context("Configuration validation failed")?;

    println!("{}", "✓ Configuration is valid".green());

    Ok(())
}

async fn generate(output: PathBuf) -> Result<()> {
    EncryptionConfigManifest::default()
        .to_yaml_file(&output)
        .with_context(|| format!("Failed to write config to {:?}", output))?;

    println!(
        "{}",
        format!("✓ Configuration generated: {}", output.display()).green()
    );

    Ok(())
}
