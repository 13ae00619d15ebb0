// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Secret Lifecycle Application Service
//!
//! Everything the workflows do to a host's secret in the vault:
//! - lookup by host name, reporting ambiguity instead of picking one
//! - create with a fresh random passphrase and wait for ACTIVE
//! - new version, promotion of an older version, cancel/schedule deletion
//!
//! Every vault call takes a permit from a semaphore shared by the whole
//! fleet run. Reads are retried on transport errors; mutations never are.
//!
//! Hosts whose descriptor names KMS_OBJECT_STORE keep their passphrase as a
//! KMS-sealed object in a bucket instead. Those objects have no versions
//! and are deleted outright on retirement.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::domain::config::EncryptionConfigManifest;
use crate::domain::error::EncryptionError;
use crate::domain::events::SecretEvent;
use crate::domain::host::HostId;
use crate::domain::object_store::{ObjectStoreError, ObjectStoreKeyClient, SealedPassphrase};
use crate::domain::secret::{
    secret_name_matches, KeySource, ObjectStoreLocation, Passphrase, RemoteSecretDescriptor,
    SecretId, SecretLifecycle, SecretSummary, SecretVersionState,
};
use crate::domain::vault::{
    CreateSecretRequest, UpdateSecretRequest, VaultClient, VaultError, VaultTarget,
};
use crate::infrastructure::event_bus::EventBus;

/// Result of looking up a host's secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretLookup {
    Found(SecretVersionState),
    NotFound,
    /// More than one live secret matches the host.
    Ambiguous(Vec<SecretSummary>),
}

/// Where a host's passphrase ended up after [`SecretLifecycleService::ensure_secret`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKey {
    Vault(SecretVersionState),
    /// KMS-sealed object; `created` is false when an existing one was kept.
    Object {
        bucket: String,
        name: String,
        created: bool,
    },
}

impl HostKey {
    pub fn describe(&self) -> String {
        match self {
            Self::Vault(state) => format!(
                "{} (version {})",
                state.secret.id,
                state.current().map(|v| v.number).unwrap_or_default()
            ),
            Self::Object { bucket, name, created } => format!(
                "{}/{} ({})",
                bucket,
                name,
                if *created { "created" } else { "reused" }
            ),
        }
    }
}

/// What [`SecretLifecycleService::retire_secret`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retirement {
    /// Vault secret, deleted after the grace period.
    Scheduled(DateTime<Utc>),
    /// Object store passphrase, gone now.
    Deleted,
}

#[async_trait]
pub trait SecretLifecycleService: Send + Sync {
    async fn lookup(
        &self,
        host: &HostId,
        descriptor: &RemoteSecretDescriptor,
    ) -> Result<SecretLookup, EncryptionError>;

    /// New secret named after `host`, with a freshly generated passphrase.
    async fn create(
        &self,
        host: &HostId,
        descriptor: &RemoteSecretDescriptor,
    ) -> Result<SecretVersionState, EncryptionError>;

    /// New random version; the vault demotes the old CURRENT to PREVIOUS.
    /// Returns the new version number.
    async fn create_new_version(&self, host: &HostId, secret: &SecretId) -> Result<u64, EncryptionError>;

    async fn cancel_scheduled_deletion(&self, host: &HostId, secret: &SecretId) -> Result<(), EncryptionError>;

    /// Schedule deletion `grace_days` from now. Never deletes immediately.
    async fn schedule_deletion(
        &self,
        host: &HostId,
        secret: &SecretId,
        grace_days: u32,
    ) -> Result<DateTime<Utc>, EncryptionError>;

    /// Schedule deletion of one non-CURRENT version.
    async fn schedule_version_deletion(
        &self,
        host: &HostId,
        secret: &SecretId,
        version: u64,
    ) -> Result<DateTime<Utc>, EncryptionError>;

    /// Make `version` CURRENT again.
    async fn promote_version(&self, host: &HostId, secret: &SecretId, version: u64) -> Result<(), EncryptionError>;

    /// Passphrase the host should be encrypted with: reused, revived from
    /// a pending deletion, or created, in the store `descriptor` names.
    async fn ensure_secret(
        &self,
        host: &HostId,
        descriptor: &RemoteSecretDescriptor,
        force_new_version: bool,
    ) -> Result<HostKey, EncryptionError>;

    /// Whether the host has exactly one usable passphrase. Ambiguous vault
    /// secrets are an error.
    async fn has_key(&self, host: &HostId, descriptor: &RemoteSecretDescriptor) -> Result<bool, EncryptionError>;

    /// Retire the host's passphrase, if it has one.
    async fn retire_secret(
        &self,
        host: &HostId,
        descriptor: &RemoteSecretDescriptor,
    ) -> Result<Option<Retirement>, EncryptionError>;
}

pub struct StandardSecretLifecycleService {
    vault: Arc<dyn VaultClient>,
    objects: Arc<dyn ObjectStoreKeyClient>,
    permits: Arc<Semaphore>,
    event_bus: Arc<EventBus>,
    config: Arc<EncryptionConfigManifest>,
}

impl StandardSecretLifecycleService {
    pub fn new(
        vault: Arc<dyn VaultClient>,
        objects: Arc<dyn ObjectStoreKeyClient>,
        event_bus: Arc<EventBus>,
        config: Arc<EncryptionConfigManifest>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.spec.vault.max_concurrent_calls.max(1)));
        Self {
            vault,
            objects,
            permits,
            event_bus,
            config,
        }
    }

    fn location<'a>(&self, descriptor: &'a RemoteSecretDescriptor) -> Result<&'a ObjectStoreLocation, EncryptionError> {
        descriptor.object_store.as_ref().ok_or_else(|| {
            EncryptionError::unsupported(
                "KMS_OBJECT_STORE needs descriptor.object_store",
                "add bucket, namespace, kms_key_id and kms_crypto_endpoint to the request",
            )
        })
    }

    fn object_failed(&self, host: &HostId, action: &str, err: ObjectStoreError) -> EncryptionError {
        warn!(host = %host, "object store {} failed: {}", action, err);
        match EncryptionError::from(err) {
            EncryptionError::VaultOperationFailed { cause, resolution } => EncryptionError::vault(
                format!("{} passphrase object for {}: {}", action, host, cause),
                resolution,
            ),
            other => other,
        }
    }

    async fn object_exists(&self, host: &HostId, location: &ObjectStoreLocation) -> Result<bool, EncryptionError> {
        self.config
            .spec
            .retry
            .vault_read
            .run_while(
                |_| self.objects.object_exists(location, host.as_str()),
                ObjectStoreError::is_retryable,
            )
            .await
            .map_err(|e| self.object_failed(host, "look up", e))
    }

    /// Seal a fresh passphrase under a new data key and store it as the
    /// host's object, replacing any earlier one.
    async fn put_sealed_passphrase(&self, host: &HostId, location: &ObjectStoreLocation) -> Result<(), ObjectStoreError> {
        let key = self.objects.generate_data_key(location).await?;
        let body = SealedPassphrase::seal(&Passphrase::generate(), &key)?.to_bytes()?;
        self.objects.put_object(location, host.as_str(), body).await
    }

    async fn ensure_object(
        &self,
        host: &HostId,
        descriptor: &RemoteSecretDescriptor,
        force_new_version: bool,
    ) -> Result<HostKey, EncryptionError> {
        let location = self.location(descriptor)?;
        let exists = self.object_exists(host, location).await?;
        if exists && !force_new_version {
            info!(host = %host, "Reusing passphrase object in {}", location.bucket);
        } else {
            self.put_sealed_passphrase(host, location)
                .await
                .map_err(|e| self.object_failed(host, "create", e))?;
            info!(host = %host, "Stored a new passphrase object in {}", location.bucket);
            self.event_bus.publish_secret_event(SecretEvent::SecretCreated {
                host: host.clone(),
                secret_id: format!("{}/{}", location.bucket, host),
                created_at: Utc::now(),
            });
        }
        Ok(HostKey::Object {
            bucket: location.bucket.clone(),
            name: host.as_str().to_string(),
            created: !exists || force_new_version,
        })
    }

    async fn retire_object(
        &self,
        host: &HostId,
        descriptor: &RemoteSecretDescriptor,
    ) -> Result<Option<Retirement>, EncryptionError> {
        let location = self.location(descriptor)?;
        if !self.object_exists(host, location).await? {
            return Ok(None);
        }
        match self.objects.delete_object(location, host.as_str()).await {
            Ok(()) | Err(ObjectStoreError::NotFound(_)) => {}
            Err(err) => return Err(self.object_failed(host, "delete", err)),
        }
        info!(host = %host, "Deleted passphrase object from {}", location.bucket);
        Ok(Some(Retirement::Deleted))
    }

    async fn ensure_vault_secret(
        &self,
        host: &HostId,
        descriptor: &RemoteSecretDescriptor,
        force_new_version: bool,
    ) -> Result<SecretVersionState, EncryptionError> {
        match self.lookup(host, descriptor).await? {
            SecretLookup::NotFound => self.create(host, descriptor).await,
            SecretLookup::Ambiguous(found) => Err(ambiguity(host, &found)),
            SecretLookup::Found(state) if state.is_pending_deletion() => {
                let id = state.secret.id.clone();
                self.cancel_scheduled_deletion(host, &id).await?;
                self.create_new_version(host, &id).await?;
                self.load_state(&id)
                    .await
                    .map_err(|e| self.failed(host, "look up", e))
            }
            SecretLookup::Found(state) if force_new_version => {
                let id = state.secret.id.clone();
                self.create_new_version(host, &id).await?;
                self.load_state(&id)
                    .await
                    .map_err(|e| self.failed(host, "look up", e))
            }
            SecretLookup::Found(state) => {
                if !state.has_single_current() {
                    return Err(EncryptionError::conflict(
                        format!("secret {} has more than one CURRENT version", state.secret.id),
                        "repair the version stages in the vault console and retry",
                    ));
                }
                info!(host = %host, "Reusing secret {}", state.secret.id);
                Ok(state)
            }
        }
    }

    /// One vault round-trip under the shared rate limit.
    async fn call<T>(&self, request: impl Future<Output = Result<T, VaultError>>) -> Result<T, VaultError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| VaultError::Network("vault call limiter closed".to_string()))?;
        request.await
    }

    async fn read<T, F, Fut>(&self, mut request: F) -> Result<T, VaultError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, VaultError>>,
    {
        self.config
            .spec
            .retry
            .vault_read
            .run_while(|_| self.call(request()), VaultError::is_retryable)
            .await
    }

    async fn load_state(&self, secret: &SecretId) -> Result<SecretVersionState, VaultError> {
        let summary = self.read(|| self.vault.get_secret(secret)).await?;
        let versions = self.read(|| self.vault.list_versions(secret)).await?;
        Ok(SecretVersionState {
            secret: summary,
            versions,
        })
    }

    /// Poll until the secret leaves its transitional state.
    async fn wait_for_active(&self, secret: &SecretId) -> Result<SecretSummary, VaultError> {
        self.config
            .spec
            .retry
            .vault_wait
            .run_while(
                |_| async move {
                    let summary = self.call(self.vault.get_secret(secret)).await?;
                    match summary.lifecycle {
                        SecretLifecycle::Active => Ok(summary),
                        state if state.is_transitional() => Err(VaultError::StateNotReached {
                            id: secret.to_string(),
                            expected: "ACTIVE".to_string(),
                            actual: format!("{:?}", state),
                        }),
                        state => Err(VaultError::Rejected {
                            status: 409,
                            message: format!("secret {} is {:?}", secret, state),
                        }),
                    }
                },
                |err| err.is_retryable() || matches!(err, VaultError::StateNotReached { .. }),
            )
            .await
    }

    fn failed(&self, host: &HostId, action: &str, err: VaultError) -> EncryptionError {
        warn!(host = %host, "vault {} failed: {}", action, err);
        let base: EncryptionError = err.into();
        match base {
            EncryptionError::VaultOperationFailed { cause, resolution } => EncryptionError::vault(
                format!("{} secret for {}: {}", action, host, cause),
                resolution,
            ),
            other => other,
        }
    }
}

#[async_trait]
impl SecretLifecycleService for StandardSecretLifecycleService {
    async fn lookup(
        &self,
        host: &HostId,
        descriptor: &RemoteSecretDescriptor,
    ) -> Result<SecretLookup, EncryptionError> {
        let target = VaultTarget::from(descriptor);
        let secrets = self
            .read(|| self.vault.list_secrets(&target, None))
            .await
            .map_err(|e| self.failed(host, "look up", e))?;
        let mut matching: Vec<SecretSummary> = secrets
            .into_iter()
            .filter(|s| s.lifecycle.is_live() && secret_name_matches(&s.name, host))
            .collect();

        match matching.len() {
            0 => Ok(SecretLookup::NotFound),
            1 => {
                let secret = matching.remove(0);
                let state = self
                    .load_state(&secret.id)
                    .await
                    .map_err(|e| self.failed(host, "look up", e))?;
                Ok(SecretLookup::Found(state))
            }
            _ => Ok(SecretLookup::Ambiguous(matching)),
        }
    }

    async fn create(
        &self,
        host: &HostId,
        descriptor: &RemoteSecretDescriptor,
    ) -> Result<SecretVersionState, EncryptionError> {
        let mut tags = BTreeMap::new();
        tags.insert(
            self.config.spec.vault.cluster_tag.clone(),
            descriptor.cluster_id.clone(),
        );
        let request = CreateSecretRequest {
            target: VaultTarget::from(descriptor),
            name: host.as_str().to_string(),
            key_id: descriptor.key_id.clone(),
            content: Passphrase::generate(),
            tags,
        };
        let created = self
            .call(self.vault.create_secret(request))
            .await
            .map_err(|e| self.failed(host, "create", e))?;

        if let Err(err) = self.wait_for_active(&created.id).await {
            // Leave nothing half-created behind.
            let at = Utc::now() + ChronoDuration::days(i64::from(self.config.spec.vault.deletion_grace_days));
            if let Err(cleanup) = self.call(self.vault.schedule_deletion(&created.id, at)).await {
                warn!(host = %host, "could not schedule deletion of {}: {}", created.id, cleanup);
            }
            return Err(self.failed(host, "create", err));
        }

        info!(host = %host, "Created secret {}", created.id);
        self.event_bus.publish_secret_event(SecretEvent::SecretCreated {
            host: host.clone(),
            secret_id: created.id.to_string(),
            created_at: Utc::now(),
        });
        self.load_state(&created.id)
            .await
            .map_err(|e| self.failed(host, "create", e))
    }

    async fn create_new_version(&self, host: &HostId, secret: &SecretId) -> Result<u64, EncryptionError> {
        let request = UpdateSecretRequest {
            content: Some(Passphrase::generate()),
            current_version_number: None,
        };
        self.call(self.vault.update_secret(secret, request))
            .await
            .map_err(|e| self.failed(host, "version", e))?;
        self.wait_for_active(secret)
            .await
            .map_err(|e| self.failed(host, "version", e))?;

        let state = self
            .load_state(secret)
            .await
            .map_err(|e| self.failed(host, "version", e))?;
        let version = state.current().map(|v| v.number).ok_or_else(|| {
            EncryptionError::vault(
                format!("secret {} has no CURRENT version after update", secret),
                "inspect the secret's versions in the vault console",
            )
        })?;

        info!(host = %host, "Secret {} now at version {}", secret, version);
        self.event_bus.publish_secret_event(SecretEvent::VersionCreated {
            host: host.clone(),
            secret_id: secret.to_string(),
            version,
            created_at: Utc::now(),
        });
        Ok(version)
    }

    async fn cancel_scheduled_deletion(&self, host: &HostId, secret: &SecretId) -> Result<(), EncryptionError> {
        self.call(self.vault.cancel_deletion(secret))
            .await
            .map_err(|e| self.failed(host, "cancel deletion of", e))?;
        self.wait_for_active(secret)
            .await
            .map_err(|e| self.failed(host, "cancel deletion of", e))?;
        info!(host = %host, "Cancelled scheduled deletion of {}", secret);
        self.event_bus.publish_secret_event(SecretEvent::DeletionCancelled {
            host: host.clone(),
            secret_id: secret.to_string(),
            cancelled_at: Utc::now(),
        });
        Ok(())
    }

    async fn schedule_deletion(
        &self,
        host: &HostId,
        secret: &SecretId,
        grace_days: u32,
    ) -> Result<DateTime<Utc>, EncryptionError> {
        let delete_at = Utc::now() + ChronoDuration::days(i64::from(grace_days.max(1)));
        self.call(self.vault.schedule_deletion(secret, delete_at))
            .await
            .map_err(|e| self.failed(host, "schedule deletion of", e))?;
        info!(host = %host, "Secret {} scheduled for deletion at {}", secret, delete_at);
        self.event_bus.publish_secret_event(SecretEvent::DeletionScheduled {
            host: host.clone(),
            secret_id: secret.to_string(),
            delete_at,
        });
        Ok(delete_at)
    }

    async fn schedule_version_deletion(
        &self,
        host: &HostId,
        secret: &SecretId,
        version: u64,
    ) -> Result<DateTime<Utc>, EncryptionError> {
        let state = self
            .load_state(secret)
            .await
            .map_err(|e| self.failed(host, "schedule version deletion of", e))?;
        if state.versions.len() < 2 || state.current().is_some_and(|v| v.number == version) {
            return Err(EncryptionError::conflict(
                format!("version {} of {} is CURRENT or the only version", version, secret),
                "only superseded versions can be scheduled for deletion",
            ));
        }
        let grace = self.config.spec.vault.deletion_grace_days.max(1);
        let delete_at = Utc::now() + ChronoDuration::days(i64::from(grace));
        self.call(self.vault.schedule_version_deletion(secret, version, delete_at))
            .await
            .map_err(|e| self.failed(host, "schedule version deletion of", e))?;
        info!(host = %host, "Version {} of {} scheduled for deletion at {}", version, secret, delete_at);
        Ok(delete_at)
    }

    async fn promote_version(&self, host: &HostId, secret: &SecretId, version: u64) -> Result<(), EncryptionError> {
        let request = UpdateSecretRequest {
            content: None,
            current_version_number: Some(version),
        };
        self.call(self.vault.update_secret(secret, request))
            .await
            .map_err(|e| self.failed(host, "promote", e))?;
        self.wait_for_active(secret)
            .await
            .map_err(|e| self.failed(host, "promote", e))?;
        info!(host = %host, "Version {} of {} is CURRENT", version, secret);
        Ok(())
    }

    async fn ensure_secret(
        &self,
        host: &HostId,
        descriptor: &RemoteSecretDescriptor,
        force_new_version: bool,
    ) -> Result<HostKey, EncryptionError> {
        match descriptor.key_source {
            KeySource::Vault => self
                .ensure_vault_secret(host, descriptor, force_new_version)
                .await
                .map(HostKey::Vault),
            KeySource::KmsObjectStore => self.ensure_object(host, descriptor, force_new_version).await,
        }
    }

    async fn has_key(&self, host: &HostId, descriptor: &RemoteSecretDescriptor) -> Result<bool, EncryptionError> {
        match descriptor.key_source {
            KeySource::Vault => match self.lookup(host, descriptor).await? {
                SecretLookup::Found(_) => Ok(true),
                SecretLookup::NotFound => Ok(false),
                SecretLookup::Ambiguous(found) => Err(ambiguity(host, &found)),
            },
            KeySource::KmsObjectStore => self.object_exists(host, self.location(descriptor)?).await,
        }
    }

    async fn retire_secret(
        &self,
        host: &HostId,
        descriptor: &RemoteSecretDescriptor,
    ) -> Result<Option<Retirement>, EncryptionError> {
        if descriptor.key_source == KeySource::KmsObjectStore {
            return self.retire_object(host, descriptor).await;
        }
        match self.lookup(host, descriptor).await? {
            SecretLookup::NotFound => Ok(None),
            SecretLookup::Ambiguous(found) => Err(ambiguity(host, &found)),
            SecretLookup::Found(state) if state.is_pending_deletion() => {
                info!(host = %host, "Secret {} already pending deletion", state.secret.id);
                Ok(None)
            }
            SecretLookup::Found(state) => self
                .schedule_deletion(host, &state.secret.id, self.config.spec.vault.deletion_grace_days)
                .await
                .map(|at| Some(Retirement::Scheduled(at))),
        }
    }
}

/// Error for a host with several live secrets.
pub fn ambiguity(host: &HostId, found: &[SecretSummary]) -> EncryptionError {
    let names: Vec<String> = found
        .iter()
        .map(|s| format!("{} ({}, {:?})", s.name, s.id, s.lifecycle))
        .collect();
    EncryptionError::conflict(
        format!("{} live secrets match {}: {}", found.len(), host, names.join(", ")),
        "delete or rename the stale secrets in the vault so exactly one remains, then retry",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::secret::{KeySource, VersionStage};
    use crate::infrastructure::object_store::memory::{InMemoryObjectStore, ObjectStoreFaults};
    use crate::infrastructure::vault::memory::{InMemoryVaultClient, VaultFaults};

    fn descriptor() -> RemoteSecretDescriptor {
        RemoteSecretDescriptor {
            key_source: KeySource::Vault,
            vault_id: "ocid1.vault.test".into(),
            compartment_id: "ocid1.compartment.test".into(),
            key_id: "ocid1.key.test".into(),
            cluster_id: "ocid1.cluster.test".into(),
            object_store: None,
        }
    }

    fn kms_descriptor() -> RemoteSecretDescriptor {
        RemoteSecretDescriptor {
            key_source: KeySource::KmsObjectStore,
            object_store: Some(ObjectStoreLocation {
                bucket: "fs-keys".into(),
                namespace: "tenancy".into(),
                kms_key_id: "ocid1.key.test.master".into(),
                kms_crypto_endpoint: "https://kms.example.invalid".into(),
            }),
            ..descriptor()
        }
    }

    fn service(vault: Arc<InMemoryVaultClient>) -> StandardSecretLifecycleService {
        with_store(vault, Arc::new(InMemoryObjectStore::new()))
    }

    fn with_store(vault: Arc<InMemoryVaultClient>, objects: Arc<InMemoryObjectStore>) -> StandardSecretLifecycleService {
        StandardSecretLifecycleService::new(
            vault,
            objects,
            Arc::new(EventBus::with_default_capacity()),
            Arc::new(EncryptionConfigManifest::default()),
        )
    }

    fn vault_state(key: HostKey) -> SecretVersionState {
        match key {
            HostKey::Vault(state) => state,
            other => panic!("expected a vault secret, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ensure_creates_then_reuses() {
        let vault = Arc::new(InMemoryVaultClient::new());
        let service = service(vault.clone());
        let host = HostId::new("vm01.example.com");

        let created = vault_state(service.ensure_secret(&host, &descriptor(), false).await.unwrap());
        assert_eq!(created.secret.name, "vm01.example.com");
        assert_eq!(created.current().map(|v| v.number), Some(1));
        assert_eq!(
            vault.tags("vm01.example.com").get("fs_encryption.cluster_id").map(String::as_str),
            Some("ocid1.cluster.test")
        );

        let reused = vault_state(service.ensure_secret(&host, &descriptor(), false).await.unwrap());
        assert_eq!(reused.secret.id, created.secret.id);
        assert_eq!(vault.mutations().len(), 1);

        let forced = vault_state(service.ensure_secret(&host, &descriptor(), true).await.unwrap());
        assert_eq!(forced.current().map(|v| v.number), Some(2));
        assert!(forced.versions[0].has_stage(VersionStage::Previous));
    }

    #[tokio::test]
    async fn test_pending_deletion_is_revived() {
        let vault = Arc::new(InMemoryVaultClient::new());
        let service = service(vault.clone());
        let host = HostId::new("vm03");
        let target = VaultTarget::from(&descriptor());
        vault.insert_secret(&target, "vm03", SecretLifecycle::PendingDeletion, Passphrase::from_plaintext("old"));

        let state = vault_state(service.ensure_secret(&host, &descriptor(), false).await.unwrap());
        assert_eq!(state.secret.lifecycle, SecretLifecycle::Active);
        assert_eq!(state.current().map(|v| v.number), Some(2));
        assert_ne!(vault.passphrase_for("vm03", None).unwrap().expose(), "old");
    }

    #[tokio::test]
    async fn test_rejected_create_reports_iam_resolution() {
        let vault = Arc::new(InMemoryVaultClient::new());
        vault.set_faults(VaultFaults {
            reject_create: Some((404, "NotAuthorizedOrNotFound".into())),
            ..VaultFaults::default()
        });
        let service = service(vault.clone());

        let err = service
            .create(&HostId::new("vm01"), &descriptor())
            .await
            .unwrap_err();
        assert!(matches!(err, EncryptionError::VaultOperationFailed { .. }));
        assert!(err.resolution().contains("IAM"));
        assert_eq!(vault.lifecycle("vm01"), None);
    }

    #[tokio::test]
    async fn test_lookup_reports_ambiguity() {
        let vault = Arc::new(InMemoryVaultClient::new());
        let target = VaultTarget::from(&descriptor());
        vault.insert_secret(&target, "vm02.example.com", SecretLifecycle::Active, Passphrase::generate());
        vault.insert_secret(&target, "vm02", SecretLifecycle::PendingDeletion, Passphrase::generate());
        vault.insert_secret(&target, "vm02.old", SecretLifecycle::Deleted, Passphrase::generate());
        let service = service(vault);

        match service.lookup(&HostId::new("vm02.example.com"), &descriptor()).await.unwrap() {
            SecretLookup::Ambiguous(found) => assert_eq!(found.len(), 2),
            other => panic!("expected ambiguity, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_foreign_fqdn_with_same_short_name_is_ignored() {
        let vault = Arc::new(InMemoryVaultClient::new());
        let target = VaultTarget::from(&descriptor());
        let own = vault.insert_secret(&target, "vm02.example.com", SecretLifecycle::Active, Passphrase::generate());
        vault.insert_secret(&target, "vm02.other.com", SecretLifecycle::Active, Passphrase::generate());
        let service = service(vault);

        match service.lookup(&HostId::new("vm02.example.com"), &descriptor()).await.unwrap() {
            SecretLookup::Found(state) => assert_eq!(state.secret.id, own),
            other => panic!("expected the host's own secret, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_kms_object_is_created_reused_and_deleted() {
        let vault = Arc::new(InMemoryVaultClient::new());
        let objects = Arc::new(InMemoryObjectStore::new());
        let service = with_store(vault.clone(), objects.clone());
        let host = HostId::new("vm04.example.com");
        let location = kms_descriptor().object_store.unwrap();

        let key = service.ensure_secret(&host, &kms_descriptor(), false).await.unwrap();
        assert_eq!(
            key,
            HostKey::Object {
                bucket: "fs-keys".into(),
                name: "vm04.example.com".into(),
                created: true,
            }
        );
        let first = objects.passphrase_for(&location, "vm04.example.com").unwrap();
        assert!(service.has_key(&host, &kms_descriptor()).await.unwrap());

        let reused = service.ensure_secret(&host, &kms_descriptor(), false).await.unwrap();
        assert!(matches!(reused, HostKey::Object { created: false, .. }));
        assert_eq!(objects.passphrase_for(&location, "vm04.example.com").unwrap(), first);

        service.ensure_secret(&host, &kms_descriptor(), true).await.unwrap();
        assert_ne!(objects.passphrase_for(&location, "vm04.example.com").unwrap(), first);
        assert!(vault.mutations().is_empty());

        assert_eq!(
            service.retire_secret(&host, &kms_descriptor()).await.unwrap(),
            Some(Retirement::Deleted)
        );
        assert!(!objects.contains(&location, "vm04.example.com"));
        assert_eq!(service.retire_secret(&host, &kms_descriptor()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_rejected_object_put_points_at_bucket_policy() {
        let objects = Arc::new(InMemoryObjectStore::new());
        objects.set_faults(ObjectStoreFaults {
            reject_put: Some((403, "NotAuthorized".into())),
            ..ObjectStoreFaults::default()
        });
        let service = with_store(Arc::new(InMemoryVaultClient::new()), objects);

        let err = service
            .ensure_secret(&HostId::new("vm04"), &kms_descriptor(), false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("passphrase object for vm04"));
        assert!(err.resolution().contains("bucket"));
    }

    #[tokio::test]
    async fn test_transient_read_errors_are_retried() {
        let vault = Arc::new(InMemoryVaultClient::new());
        vault.set_faults(VaultFaults {
            network_failures: 2,
            ..VaultFaults::default()
        });
        let mut config = EncryptionConfigManifest::default();
        config.spec.retry.vault_read.interval = std::time::Duration::ZERO;
        let service = StandardSecretLifecycleService::new(
            vault,
            Arc::new(InMemoryObjectStore::new()),
            Arc::new(EventBus::with_default_capacity()),
            Arc::new(config),
        );

        let found = service.lookup(&HostId::new("vm01"), &descriptor()).await.unwrap();
        assert_eq!(found, SecretLookup::NotFound);
    }

    #[tokio::test]
    async fn test_retire_schedules_with_grace_period() {
        let vault = Arc::new(InMemoryVaultClient::new());
        let service = service(vault.clone());
        let host = HostId::new("vm01");
        service.create(&host, &descriptor()).await.unwrap();

        let at = match service.retire_secret(&host, &descriptor()).await.unwrap() {
            Some(Retirement::Scheduled(at)) => at,
            other => panic!("expected a scheduled deletion, got {:?}", other),
        };
        assert!(at > Utc::now() + ChronoDuration::days(4));
        assert_eq!(vault.lifecycle("vm01"), Some(SecretLifecycle::PendingDeletion));
        assert_eq!(service.retire_secret(&host, &descriptor()).await.unwrap(), None);
    }
}
