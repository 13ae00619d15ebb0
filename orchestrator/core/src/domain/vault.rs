// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Vault Client Trait - Anti-Corruption Layer for the secret service
//!
//! Mirrors the operations the secret service exposes for a single secret:
//! list, get, create, update, version listing and the two-phase deletion
//! lifecycle. Implementations decide how to talk to the service; the
//! lifecycle manager decides when.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::domain::secret::{
    Passphrase, RemoteSecretDescriptor, SecretId, SecretSummary, SecretVersion, VersionStage,
};

/// Compartment and vault a secret lives in.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VaultTarget {
    pub compartment_id: String,
    pub vault_id: String,
}

impl From<&RemoteSecretDescriptor> for VaultTarget {
    fn from(descriptor: &RemoteSecretDescriptor) -> Self {
        Self {
            compartment_id: descriptor.compartment_id.clone(),
            vault_id: descriptor.vault_id.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreateSecretRequest {
    pub target: VaultTarget,
    pub name: String,
    pub key_id: String,
    pub content: Passphrase,
    pub tags: BTreeMap<String, String>,
}

/// Either new content (creates a version) or a version to promote.
#[derive(Debug, Clone, Default)]
pub struct UpdateSecretRequest {
    pub content: Option<Passphrase>,
    pub current_version_number: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionSelector {
    Stage(VersionStage),
    Number(u64),
}

#[derive(Debug, Clone)]
pub struct SecretBundle {
    pub version_number: u64,
    pub stages: Vec<VersionStage>,
    pub content: Passphrase,
}

#[async_trait]
pub trait VaultClient: Send + Sync {
    /// Secrets in `target`, optionally filtered by exact name.
    async fn list_secrets(
        &self,
        target: &VaultTarget,
        name: Option<&str>,
    ) -> Result<Vec<SecretSummary>, VaultError>;

    async fn get_secret(&self, id: &SecretId) -> Result<SecretSummary, VaultError>;

    async fn list_versions(&self, id: &SecretId) -> Result<Vec<SecretVersion>, VaultError>;

    async fn read_version(
        &self,
        id: &SecretId,
        selector: VersionSelector,
    ) -> Result<SecretBundle, VaultError>;

    async fn create_secret(&self, request: CreateSecretRequest)
        -> Result<SecretSummary, VaultError>;

    async fn update_secret(
        &self,
        id: &SecretId,
        request: UpdateSecretRequest,
    ) -> Result<SecretSummary, VaultError>;

    async fn schedule_deletion(&self, id: &SecretId, at: DateTime<Utc>) -> Result<(), VaultError>;

    async fn cancel_deletion(&self, id: &SecretId) -> Result<(), VaultError>;

    async fn schedule_version_deletion(
        &self,
        id: &SecretId,
        version_number: u64,
        at: DateTime<Utc>,
    ) -> Result<(), VaultError>;
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VaultError {
    #[error("secret not found: {0}")]
    NotFound(String),

    #[error("vault network error: {0}")]
    Network(String),

    #[error("vault request timed out: {0}")]
    Timeout(String),

    #[error("vault rejected the request (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("unexpected vault response: {0}")]
    InvalidResponse(String),

    #[error("secret {id} did not reach {expected} (last state {actual})")]
    StateNotReached {
        id: String,
        expected: String,
        actual: String,
    },
}

impl VaultError {
    /// Transport-level failures a read may be retried on.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout(_))
    }
}
