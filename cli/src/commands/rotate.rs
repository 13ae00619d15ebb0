// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Passphrase rotation command

use anyhow::Result;
use clap::Args;
use colored::Colorize;
use std::path::PathBuf;

use fleetcrypt_core::domain::config::EncryptionConfigManifest;
use fleetcrypt_core::domain::encryption::{FleetReport, RotationResult};

use super::{load_request, write_report};
use crate::embedded::EmbeddedRuntime;

#[derive(Args)]
pub struct RotateArgs {
    /// Request file naming the hosts, mount point and secret descriptor
    #[arg(short, long, value_name = "FILE")]
    pub request: PathBuf,

    /// Print rollbacks as they happen
    #[arg(short, long)]
    pub watch: bool,

    /// Write the JSON rotation report to this file
    #[arg(long, value_name = "FILE")]
    pub report: Option<PathBuf>,
}

pub async fn execute(args: RotateArgs, config: EncryptionConfigManifest) -> Result<()> {
    let request = load_request(&args.request)?;
    let runtime = EmbeddedRuntime::new(config)?;

    println!(
        "Rotating the passphrase of {} on {} host(s)",
        request.mount_point.bold(),
        request.hosts.len()
    );
    let watcher = args.watch.then(|| runtime.watch());
    let outcome = runtime.orchestrator().rotate_fleet(&request).await;
    if let Some(watcher) = watcher {
        watcher.abort();
    }

    let (report, failure) = match outcome {
        Ok(report) => (report, None),
        Err(failure) => {
            let summary = failure.to_string();
            (failure.report, Some(summary))
        }
    };

    print_report(&report);
    if let Some(path) = &args.report {
        write_report(path, &report)?;
        println!("Report written to {}", path.display());
    }

    match failure {
        Some(summary) => anyhow::bail!(summary),
        None => {
            println!("{}", "✓ Rotation complete".green());
            Ok(())
        }
    }
}

fn print_report(report: &FleetReport<RotationResult>) {
    println!();
    for result in report.results.values() {
        if result.success {
            println!("  {} {}", "✓".green(), result.host.as_str().bold());
        } else {
            println!("  {} {}", "✗".red(), result.host.as_str().bold());
        }
        println!("      {}", result.comment);
    }
    println!();
    println!(
        "{} succeeded, {} failed",
        report.succeeded_count(),
        report.failed_count()
    );
}
