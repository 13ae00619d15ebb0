// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! In-memory vault with the secret service's version-stage semantics.
//!
//! Backs dry runs and tests. Faults can be injected to exercise rejection
//! and rollback paths.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;

use crate::domain::secret::{
    Passphrase, SecretId, SecretLifecycle, SecretSummary, SecretVersion, VersionStage,
};
use crate::domain::vault::{
    CreateSecretRequest, SecretBundle, UpdateSecretRequest, VaultClient, VaultError, VaultTarget,
    VersionSelector,
};

/// Failures the in-memory vault can be told to produce.
#[derive(Debug, Clone, Default)]
pub struct VaultFaults {
    /// Reject every create with this status and message.
    pub reject_create: Option<(u16, String)>,
    /// Reject promotions of an older version to CURRENT.
    pub reject_promotion: bool,
    /// Report the next N `get_secret` calls as UPDATING.
    pub transitional_reads: u32,
    /// Fail the next N reads with a network error.
    pub network_failures: u32,
}

#[derive(Debug, Clone)]
struct StoredVersion {
    content: Passphrase,
    stages: Vec<VersionStage>,
}

#[derive(Debug, Clone)]
struct StoredSecret {
    target: VaultTarget,
    name: String,
    lifecycle: SecretLifecycle,
    versions: BTreeMap<u64, StoredVersion>,
    tags: BTreeMap<String, String>,
    deletion_at: Option<DateTime<Utc>>,
}

impl StoredSecret {
    fn current(&self) -> Option<u64> {
        self.versions
            .iter()
            .find(|(_, v)| v.stages.contains(&VersionStage::Current))
            .map(|(n, _)| *n)
    }

    fn summary(&self, id: &SecretId) -> SecretSummary {
        SecretSummary {
            id: id.clone(),
            name: self.name.clone(),
            lifecycle: self.lifecycle,
            current_version: self.current(),
        }
    }

    /// Make `number` CURRENT; the old CURRENT becomes PREVIOUS.
    fn promote(&mut self, number: u64) {
        let old = self.current();
        for version in self.versions.values_mut() {
            version
                .stages
                .retain(|s| *s != VersionStage::Current && *s != VersionStage::Previous);
        }
        if let Some(old) = old.filter(|old| *old != number) {
            if let Some(v) = self.versions.get_mut(&old) {
                v.stages.push(VersionStage::Previous);
            }
        }
        if let Some(v) = self.versions.get_mut(&number) {
            v.stages.push(VersionStage::Current);
        }
    }
}

#[derive(Default)]
struct VaultState {
    secrets: BTreeMap<SecretId, StoredSecret>,
    next_id: u64,
    faults: VaultFaults,
    mutations: Vec<String>,
}

impl VaultState {
    fn secret_mut(&mut self, id: &SecretId) -> Result<&mut StoredSecret, VaultError> {
        self.secrets
            .get_mut(id)
            .ok_or_else(|| VaultError::NotFound(id.to_string()))
    }

    fn read_fault(&mut self) -> Result<(), VaultError> {
        if self.faults.network_failures > 0 {
            self.faults.network_failures -= 1;
            return Err(VaultError::Network("connection reset by peer".to_string()));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryVaultClient {
    state: Mutex<VaultState>,
}

impl InMemoryVaultClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_faults(&self, faults: VaultFaults) {
        self.state.lock().faults = faults;
    }

    /// Seed a secret directly, bypassing the API (for test fixtures).
    pub fn insert_secret(
        &self,
        target: &VaultTarget,
        name: &str,
        lifecycle: SecretLifecycle,
        content: Passphrase,
    ) -> SecretId {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = SecretId(format!("ocid1.vaultsecret.test.{}", state.next_id));
        let mut versions = BTreeMap::new();
        versions.insert(
            1,
            StoredVersion {
                content,
                stages: vec![VersionStage::Current, VersionStage::Latest],
            },
        );
        state.secrets.insert(
            id.clone(),
            StoredSecret {
                target: target.clone(),
                name: name.to_string(),
                lifecycle,
                versions,
                tags: BTreeMap::new(),
                deletion_at: None,
            },
        );
        id
    }

    /// Passphrase a fetcher would receive for `name`: the pinned version if
    /// given, CURRENT otherwise. Deleted secrets yield nothing.
    pub fn passphrase_for(&self, name: &str, version: Option<u64>) -> Option<Passphrase> {
        let state = self.state.lock();
        let secret = state
            .secrets
            .values()
            .find(|s| s.name == name && s.lifecycle.is_live())?;
        let number = match version {
            Some(n) => n,
            None => secret.current()?,
        };
        secret.versions.get(&number).map(|v| v.content.clone())
    }

    pub fn current_version(&self, name: &str) -> Option<u64> {
        let state = self.state.lock();
        state
            .secrets
            .values()
            .find(|s| s.name == name && s.lifecycle.is_live())
            .and_then(StoredSecret::current)
    }

    pub fn lifecycle(&self, name: &str) -> Option<SecretLifecycle> {
        let state = self.state.lock();
        state
            .secrets
            .values()
            .find(|s| s.name == name)
            .map(|s| s.lifecycle)
    }

    pub fn tags(&self, name: &str) -> BTreeMap<String, String> {
        let state = self.state.lock();
        state
            .secrets
            .values()
            .find(|s| s.name == name)
            .map(|s| s.tags.clone())
            .unwrap_or_default()
    }

    /// Every mutating call made so far, e.g. `create vm01`, `update ocid..`.
    pub fn mutations(&self) -> Vec<String> {
        self.state.lock().mutations.clone()
    }
}

#[async_trait]
impl VaultClient for InMemoryVaultClient {
    async fn list_secrets(
        &self,
        target: &VaultTarget,
        name: Option<&str>,
    ) -> Result<Vec<SecretSummary>, VaultError> {
        let mut state = self.state.lock();
        state.read_fault()?;
        Ok(state
            .secrets
            .iter()
            .filter(|(_, s)| &s.target == target)
            .filter(|(_, s)| name.map_or(true, |n| s.name == n))
            .map(|(id, s)| s.summary(id))
            .collect())
    }

    async fn get_secret(&self, id: &SecretId) -> Result<SecretSummary, VaultError> {
        let mut state = self.state.lock();
        state.read_fault()?;
        let transitional = if state.faults.transitional_reads > 0 {
            state.faults.transitional_reads -= 1;
            true
        } else {
            false
        };
        let secret = state.secret_mut(id)?;
        let mut summary = secret.summary(id);
        if transitional {
            summary.lifecycle = SecretLifecycle::Updating;
        }
        Ok(summary)
    }

    async fn list_versions(&self, id: &SecretId) -> Result<Vec<SecretVersion>, VaultError> {
        let mut state = self.state.lock();
        state.read_fault()?;
        let secret = state.secret_mut(id)?;
        Ok(secret
            .versions
            .iter()
            .map(|(n, v)| SecretVersion {
                number: *n,
                stages: v.stages.clone(),
            })
            .collect())
    }

    async fn read_version(
        &self,
        id: &SecretId,
        selector: VersionSelector,
    ) -> Result<SecretBundle, VaultError> {
        let mut state = self.state.lock();
        state.read_fault()?;
        let secret = state.secret_mut(id)?;
        let found = secret.versions.iter().find(|(n, v)| match selector {
            VersionSelector::Number(number) => **n == number,
            VersionSelector::Stage(stage) => v.stages.contains(&stage),
        });
        found
            .map(|(n, v)| SecretBundle {
                version_number: *n,
                stages: v.stages.clone(),
                content: v.content.clone(),
            })
            .ok_or_else(|| VaultError::NotFound(format!("{} {:?}", id, selector)))
    }

    async fn create_secret(
        &self,
        request: CreateSecretRequest,
    ) -> Result<SecretSummary, VaultError> {
        let mut state = self.state.lock();
        state.mutations.push(format!("create {}", request.name));
        if let Some((status, message)) = state.faults.reject_create.clone() {
            return Err(VaultError::Rejected { status, message });
        }
        let duplicate = state.secrets.values().any(|s| {
            s.target == request.target && s.name == request.name && s.lifecycle.is_live()
        });
        if duplicate {
            return Err(VaultError::Rejected {
                status: 409,
                message: format!("secret {} already exists", request.name),
            });
        }
        state.next_id += 1;
        let id = SecretId(format!("ocid1.vaultsecret.test.{}", state.next_id));
        let mut versions = BTreeMap::new();
        versions.insert(
            1,
            StoredVersion {
                content: request.content,
                stages: vec![VersionStage::Current, VersionStage::Latest],
            },
        );
        let secret = StoredSecret {
            target: request.target,
            name: request.name,
            lifecycle: SecretLifecycle::Active,
            versions,
            tags: request.tags,
            deletion_at: None,
        };
        let summary = secret.summary(&id);
        state.secrets.insert(id, secret);
        Ok(summary)
    }

    async fn update_secret(
        &self,
        id: &SecretId,
        request: UpdateSecretRequest,
    ) -> Result<SecretSummary, VaultError> {
        let mut state = self.state.lock();
        state.mutations.push(format!("update {}", id));
        let reject_promotion = state.faults.reject_promotion;
        let secret = state.secret_mut(id)?;
        if secret.lifecycle != SecretLifecycle::Active {
            return Err(VaultError::Rejected {
                status: 409,
                message: format!("secret {} is {:?}", id, secret.lifecycle),
            });
        }

        if let Some(content) = request.content {
            let number = secret.versions.keys().next_back().copied().unwrap_or(0) + 1;
            for version in secret.versions.values_mut() {
                version.stages.retain(|s| *s != VersionStage::Latest);
            }
            secret.versions.insert(
                number,
                StoredVersion {
                    content,
                    stages: vec![VersionStage::Latest],
                },
            );
            secret.promote(number);
        } else if let Some(number) = request.current_version_number {
            if reject_promotion {
                return Err(VaultError::Rejected {
                    status: 409,
                    message: format!("version {} cannot be made current", number),
                });
            }
            match secret.versions.get(&number) {
                Some(v) if !v.stages.contains(&VersionStage::PendingDeletion) => {}
                _ => {
                    return Err(VaultError::Rejected {
                        status: 409,
                        message: format!("version {} is not available", number),
                    })
                }
            }
            secret.promote(number);
        }
        Ok(secret.summary(id))
    }

    async fn schedule_deletion(&self, id: &SecretId, at: DateTime<Utc>) -> Result<(), VaultError> {
        let mut state = self.state.lock();
        state.mutations.push(format!("schedule_deletion {}", id));
        let secret = state.secret_mut(id)?;
        secret.lifecycle = SecretLifecycle::PendingDeletion;
        secret.deletion_at = Some(at);
        Ok(())
    }

    async fn cancel_deletion(&self, id: &SecretId) -> Result<(), VaultError> {
        let mut state = self.state.lock();
        state.mutations.push(format!("cancel_deletion {}", id));
        let secret = state.secret_mut(id)?;
        if secret.lifecycle != SecretLifecycle::PendingDeletion {
            return Err(VaultError::Rejected {
                status: 409,
                message: format!("secret {} is not pending deletion", id),
            });
        }
        secret.lifecycle = SecretLifecycle::Active;
        secret.deletion_at = None;
        Ok(())
    }

    async fn schedule_version_deletion(
        &self,
        id: &SecretId,
        version_number: u64,
        _at: DateTime<Utc>,
    ) -> Result<(), VaultError> {
        let mut state = self.state.lock();
        state
            .mutations
            .push(format!("schedule_version_deletion {} {}", id, version_number));
        let secret = state.secret_mut(id)?;
        let version_count = secret.versions.len();
        let version = secret
            .versions
            .get_mut(&version_number)
            .ok_or_else(|| VaultError::NotFound(format!("{} version {}", id, version_number)))?;
        if version_count < 2 || version.stages.contains(&VersionStage::Current) {
            return Err(VaultError::Rejected {
                status: 409,
                message: format!("version {} is current or the only version", version_number),
            });
        }
        version.stages = vec![VersionStage::PendingDeletion];
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> VaultTarget {
        VaultTarget {
            compartment_id: "c".into(),
            vault_id: "v".into(),
        }
    }

    fn create(name: &str) -> CreateSecretRequest {
        CreateSecretRequest {
            target: target(),
            name: name.into(),
            key_id: "k".into(),
            content: Passphrase::from_plaintext("one"),
            tags: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_new_version_demotes_current() {
        let vault = InMemoryVaultClient::new();
        let created = vault.create_secret(create("vm01")).await.unwrap();
        vault
            .update_secret(
                &created.id,
                UpdateSecretRequest {
                    content: Some(Passphrase::from_plaintext("two")),
                    current_version_number: None,
                },
            )
            .await
            .unwrap();

        let versions = vault.list_versions(&created.id).await.unwrap();
        assert!(versions[0].has_stage(VersionStage::Previous));
        assert!(versions[1].has_stage(VersionStage::Current));
        assert_eq!(vault.passphrase_for("vm01", None).unwrap().expose(), "two");
        assert_eq!(vault.passphrase_for("vm01", Some(1)).unwrap().expose(), "one");

        // Promoting the previous version swaps the stages back.
        vault
            .update_secret(
                &created.id,
                UpdateSecretRequest {
                    content: None,
                    current_version_number: Some(1),
                },
            )
            .await
            .unwrap();
        assert_eq!(vault.current_version("vm01"), Some(1));
    }

    #[tokio::test]
    async fn test_duplicate_create_is_rejected() {
        let vault = InMemoryVaultClient::new();
        vault.create_secret(create("vm01")).await.unwrap();
        let err = vault.create_secret(create("vm01")).await.unwrap_err();
        assert!(matches!(err, VaultError::Rejected { status: 409, .. }));
    }

    #[tokio::test]
    async fn test_version_deletion_guards_current() {
        let vault = InMemoryVaultClient::new();
        let created = vault.create_secret(create("vm01")).await.unwrap();
        let err = vault
            .schedule_version_deletion(&created.id, 1, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::Rejected { .. }));
    }
}
