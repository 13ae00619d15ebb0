// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Passphrase Rotation Application Service
//!
//! Replaces the key of an encrypted, mounted volume without unmounting it.
//! A new secret version is created first, so the vault briefly leads the
//! device. If the device never accepts the new key, the previous version is
//! promoted back to CURRENT so the boot-time unlock keeps working.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use crate::application::host_shell::{quote, HostShell};
use crate::application::inspector::VolumeInspector;
use crate::application::keyapi::{key_change, piped, FetchSource, KeyApiProvisioner, FETCH_FAILURE_EXIT_CODE};
use crate::application::secret_lifecycle::{ambiguity, SecretLifecycleService, SecretLookup};
use crate::domain::config::{EncryptionConfigManifest, KeyApiMode};
use crate::domain::encryption::RotationResult;
use crate::domain::error::EncryptionError;
use crate::domain::events::SecretEvent;
use crate::domain::host::HostId;
use crate::domain::remote::RemoteExecutor;
use crate::domain::secret::{KeySource, RemoteSecretDescriptor, SecretId, SecretVersionState};
use crate::infrastructure::event_bus::EventBus;

#[async_trait]
pub trait RotationService: Send + Sync {
    /// Rotate the passphrase of the volume mounted at `mount_point`.
    async fn rotate(
        &self,
        host: &HostId,
        mount_point: &str,
        descriptor: &RemoteSecretDescriptor,
    ) -> RotationResult;
}

pub struct StandardRotationService {
    executor: Arc<dyn RemoteExecutor>,
    inspector: Arc<dyn VolumeInspector>,
    secrets: Arc<dyn SecretLifecycleService>,
    keyapi: Arc<dyn KeyApiProvisioner>,
    event_bus: Arc<EventBus>,
    config: Arc<EncryptionConfigManifest>,
}

/// Versions involved in one rotation.
struct Rotation<'a> {
    host: &'a HostId,
    secret: SecretId,
    previous: u64,
    new: u64,
}

impl StandardRotationService {
    pub fn new(
        executor: Arc<dyn RemoteExecutor>,
        inspector: Arc<dyn VolumeInspector>,
        secrets: Arc<dyn SecretLifecycleService>,
        keyapi: Arc<dyn KeyApiProvisioner>,
        event_bus: Arc<EventBus>,
        config: Arc<EncryptionConfigManifest>,
    ) -> Self {
        Self {
            executor,
            inspector,
            secrets,
            keyapi,
            event_bus,
            config,
        }
    }

    fn shell<'a>(&'a self, host: &'a HostId) -> HostShell<'a> {
        HostShell::new(&self.executor, host, self.config.spec.remote.command_timeout)
    }

    /// The one live secret of `host`, with a single CURRENT version.
    async fn single_secret(
        &self,
        host: &HostId,
        descriptor: &RemoteSecretDescriptor,
    ) -> Result<SecretVersionState, EncryptionError> {
        let state = match self.secrets.lookup(host, descriptor).await? {
            SecretLookup::Found(state) => state,
            SecretLookup::Ambiguous(found) => return Err(ambiguity(host, &found)),
            SecretLookup::NotFound => {
                return Err(EncryptionError::conflict(
                    format!("no live secret found for {}", host),
                    "encrypt the host first, or restore its secret in the vault",
                ))
            }
        };
        if !state.has_single_current() || state.current().is_none() {
            return Err(EncryptionError::conflict(
                format!("secret {} does not have exactly one CURRENT version", state.secret.id),
                "repair the version stages in the vault console and retry",
            ));
        }
        Ok(state)
    }

    async fn try_rotate(
        &self,
        host: &HostId,
        mount_point: &str,
        descriptor: &RemoteSecretDescriptor,
    ) -> Result<u64, EncryptionError> {
        if descriptor.key_source != KeySource::Vault
            || matches!(self.config.spec.keyapi.mode, KeyApiMode::LocalDevelopment { .. })
        {
            return Err(EncryptionError::unsupported(
                "rotation needs a vault-backed secret",
                "use key_source VAULT and keyapi.mode remote",
            ));
        }

        let state = self.single_secret(host, descriptor).await?;
        let info = self.inspector.inspect(host, mount_point).await?;
        let luks_device = match (&info.underlying_luks_device_path, info.is_encrypted) {
            (Some(device), true) => device.clone(),
            _ => {
                return Err(EncryptionError::unsupported(
                    format!("{} on {} is not encrypted", mount_point, host),
                    "run the encryption workflow before rotating",
                ))
            }
        };
        let previous = state.current().map(|v| v.number).unwrap_or_default();

        let new = self.secrets.create_new_version(host, &state.secret.id).await?;
        let rotation = Rotation {
            host,
            secret: state.secret.id.clone(),
            previous,
            new,
        };
        let name = state.secret.name.as_str();

        let old_fetch = match self.keyapi.provision_pinned(host, name, descriptor, previous).await {
            Ok(fetch) => fetch,
            Err(err) => return Err(self.roll_back(&rotation, err, &[]).await),
        };
        let new_fetch = match self.keyapi.provision_pinned(host, name, descriptor, new).await {
            Ok(fetch) => fetch,
            Err(err) => return Err(self.roll_back(&rotation, err, &[&old_fetch]).await),
        };
        let pinned = [&old_fetch, &new_fetch];

        let shell = self.shell(host);
        match self.opens(&shell, &old_fetch, &luks_device).await {
            Ok(true) => {}
            Ok(false) => {
                let err = EncryptionError::encryption(
                    format!("version {} does not open {}", previous, luks_device),
                    "find which secret version the device was encrypted with before rotating",
                );
                return Err(self.roll_back(&rotation, err, &pinned).await);
            }
            Err(err) => return Err(self.roll_back(&rotation, err, &pinned).await),
        }

        if let Err(err) = self.change_key(&shell, &old_fetch, &new_fetch, &luks_device).await {
            // Only revert the vault while the device still takes the old key.
            return match self.opens(&shell, &old_fetch, &luks_device).await {
                Ok(true) => Err(self.roll_back(&rotation, err, &pinned).await),
                _ => {
                    error!(host = %host, "Neither version {} nor {} opens {}", previous, new, luks_device);
                    Err(EncryptionError::encryption(
                        format!(
                            "key change on {} failed and neither version {} nor {} opens it: {}",
                            luks_device, previous, new, err
                        ),
                        format!(
                            "do not reboot {}; inspect `cryptsetup luksDump {}` and the fetcher log {}",
                            host, luks_device, self.config.spec.keyapi.fetch_log
                        ),
                    ))
                }
            };
        }

        // Boot-time unlock uses the unpinned config, which now resolves to `new`.
        for (version, fetch) in [(previous, &old_fetch), (new, &new_fetch)] {
            if let Err(err) = self.keyapi.remove(host, fetch).await {
                warn!(host = %host, "Could not remove the fetcher config for version {}: {}", version, err);
            }
        }
        info!(host = %host, "Rotated {} from version {} to {}", mount_point, previous, new);
        self.event_bus.publish_secret_event(SecretEvent::RotationCompleted {
            host: host.clone(),
            previous_version: previous,
            new_version: new,
            completed_at: Utc::now(),
        });
        Ok(new)
    }

    /// Whether the key `fetch` prints opens `device`.
    async fn opens(&self, shell: &HostShell<'_>, fetch: &FetchSource, device: &str) -> Result<bool, EncryptionError> {
        let out = shell
            .run(&piped(
                fetch,
                &format!("cryptsetup open --type luks2 --test-passphrase --key-file=- {}", quote(device)),
            ))
            .await?;
        match out.exit_code {
            0 => Ok(true),
            FETCH_FAILURE_EXIT_CODE => Err(EncryptionError::encryption(
                format!("fetching the passphrase failed: {}", out.describe()),
                format!(
                    "check the fetcher log {} on the host and its access to the vault",
                    self.config.spec.keyapi.fetch_log
                ),
            )),
            _ => Ok(false),
        }
    }

    async fn change_key(
        &self,
        shell: &HostShell<'_>,
        old: &FetchSource,
        new: &FetchSource,
        device: &str,
    ) -> Result<(), EncryptionError> {
        self.config
            .spec
            .retry
            .key_change
            .run(|attempt| async move {
                let out = shell.run(&key_change(old, new, device)).await?;
                if !out.is_success() {
                    warn!(host = %shell.host(), "luksChangeKey attempt {} failed: {}", attempt, out.describe());
                }
                // The exit status alone does not say whether the slot changed.
                if self.opens(shell, new, device).await? {
                    return Ok(());
                }
                Err(EncryptionError::encryption(
                    format!("{} does not accept the new key: {}", device, out.describe()),
                    "check the LUKS key slots with `cryptsetup luksDump`",
                ))
            })
            .await
    }

    /// Make the previous version CURRENT again and drop the pinned configs.
    async fn roll_back(
        &self,
        rotation: &Rotation<'_>,
        cause: EncryptionError,
        pinned: &[&FetchSource],
    ) -> EncryptionError {
        let host = rotation.host;
        warn!(
            host = %host,
            "Rotation failed, restoring version {} as CURRENT: {}", rotation.previous, cause
        );
        let promoted = self
            .secrets
            .promote_version(host, &rotation.secret, rotation.previous)
            .await;
        for fetch in pinned {
            if let Err(err) = self.keyapi.remove(host, fetch).await {
                warn!(host = %host, "Could not remove a pinned fetcher config: {}", err);
            }
        }

        self.event_bus.publish_secret_event(SecretEvent::RotationRolledBack {
            host: host.clone(),
            reverted_to: rotation.previous,
            abandoned_version: rotation.new,
            success: promoted.is_ok(),
            rolled_back_at: Utc::now(),
        });

        match promoted {
            Ok(()) => {
                if let Err(err) = self
                    .secrets
                    .schedule_version_deletion(host, &rotation.secret, rotation.new)
                    .await
                {
                    warn!(host = %host, "Could not schedule deletion of version {}: {}", rotation.new, err);
                }
                EncryptionError::encryption(
                    format!(
                        "rotation rolled back, version {} is CURRENT again: {}",
                        rotation.previous, cause
                    ),
                    cause.resolution(),
                )
            }
            Err(rollback) => {
                error!(host = %host, "Restoring version {} failed: {}", rotation.previous, rollback);
                EncryptionError::RotationRollbackFailed {
                    cause: cause.to_string(),
                    rollback_cause: rollback.to_string(),
                    previous_version: rotation.previous,
                    new_version: rotation.new,
                }
            }
        }
    }
}

#[async_trait]
impl RotationService for StandardRotationService {
    async fn rotate(
        &self,
        host: &HostId,
        mount_point: &str,
        descriptor: &RemoteSecretDescriptor,
    ) -> RotationResult {
        let started = Instant::now();
        info!(host = %host, mount_point = %mount_point, "Starting passphrase rotation");
        match self.try_rotate(host, mount_point, descriptor).await {
            Ok(new_version) => RotationResult {
                host: host.clone(),
                success: true,
                comment: format!("{} now uses secret version {}", mount_point, new_version),
                new_version: Some(new_version),
                elapsed: started.elapsed(),
            },
            Err(err) => {
                error!(host = %host, "Rotation failed: {}", err);
                RotationResult {
                    host: host.clone(),
                    success: false,
                    comment: format!("{}; resolution: {}", err, err.resolution()),
                    new_version: None,
                    elapsed: started.elapsed(),
                }
            }
        }
    }
}
