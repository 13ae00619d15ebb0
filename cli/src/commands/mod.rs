// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for the fleetcrypt CLI

pub mod config;
pub mod encrypt;
pub mod rotate;
pub mod secrets;

pub use self::config::ConfigCommand;
pub use self::encrypt::EncryptArgs;
pub use self::rotate::RotateArgs;
pub use self::secrets::SecretsCommand;

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::Path;

use fleetcrypt_core::application::fleet::EncryptionRequest;

/// Read and validate a request file.
pub fn load_request(path: &Path) -> Result<EncryptionRequest> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read request: {:?}", path))?;
    EncryptionRequest::from_yaml_str(&content)
        .with_context(|| format!("Invalid request file: {:?}", path))
}

/// Write `report` as pretty JSON.
pub fn write_report<T: Serialize>(path: &Path, report: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(report).context("Failed to serialize report")?;
    std::fs::write(path, json).with_context(|| format!("Failed to write report to {:?}", path))
}
