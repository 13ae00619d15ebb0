// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Fleet encryption command

use anyhow::Result;
use clap::Args;
use colored::Colorize;
use std::path::PathBuf;

use fleetcrypt_core::domain::config::EncryptionConfigManifest;
use fleetcrypt_core::domain::encryption::{FleetReport, WorkflowResult, WorkflowStatus};

use super::{load_request, write_report};
use crate::embedded::EmbeddedRuntime;

#[derive(Args)]
pub struct EncryptArgs {
    /// Request file naming the hosts, mount point and secret descriptor
    #[arg(short, long, value_name = "FILE")]
    pub request: PathBuf,

    /// Print every workflow transition as it happens
    #[arg(short, long)]
    pub watch: bool,

    /// Write the JSON fleet report to this file
    #[arg(long, value_name = "FILE")]
    pub report: Option<PathBuf>,
}

pub async fn execute(args: EncryptArgs, config: EncryptionConfigManifest) -> Result<()> {
    let request = load_request(&args.request)?;
    let runtime = EmbeddedRuntime::new(config)?;

    println!(
        "Encrypting {} on {} host(s)",
        request.mount_point.bold(),
        request.hosts.len()
    );
    let watcher = args.watch.then(|| runtime.watch());
    let outcome = runtime.orchestrator().encrypt_fleet(&request).await;
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
            println!("{}", "✓ Fleet encryption complete".green());
            Ok(())
        }
    }
}

fn print_report(report: &FleetReport<WorkflowResult>) {
    println!();
    println!("{} {}", "Run".bold(), report.run_id);
    for result in report.results.values() {
        let status = match result.status {
            WorkflowStatus::Success => "✓ encrypted".green(),
            WorkflowStatus::SkippedAlreadyEncrypted => "- already encrypted".dimmed(),
            WorkflowStatus::Failed => "✗ failed".red(),
        };
        println!(
            "  {:<40} {:<24} {:>8.1?}",
            result.host.as_str(),
            status,
            result.elapsed
        );
        if let Some(error) = &result.error {
            println!("      {}", error.red());
        }
        if let Some(resolution) = &result.resolution {
            println!("      resolution: {}", resolution);
        }
    }
    println!();
    println!(
        "{} succeeded, {} failed",
        report.succeeded_count(),
        report.failed_count()
    );
}
