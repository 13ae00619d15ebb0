// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Vault Infrastructure Module
//!
//! Concrete implementations of the [`VaultClient`] trait.

pub mod http;
pub mod memory;

pub use http::HttpVaultClient;
pub use memory::{InMemoryVaultClient, VaultFaults};

use std::sync::Arc;

use crate::domain::config::VaultConfig;
use crate::domain::vault::{VaultClient, VaultError};

/// Vault backend selection
#[derive(Debug, Clone)]
pub enum VaultBackend {
    /// The secret service's REST API (production)
    Http(VaultConfig),

    /// In-process vault for dry runs and tests
    InMemory,
}

/// Factory function to create a vault client from configuration
pub fn create_vault_client(backend: VaultBackend) -> Result<Arc<dyn VaultClient>, VaultError> {
    match backend {
        VaultBackend::Http(config) => Ok(Arc::new(HttpVaultClient::new(&config)?)),
        VaultBackend::InMemory => Ok(Arc::new(InMemoryVaultClient::new())),
    }
}
