// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! KeyApi Provisioner Application Service
//!
//! Places the passphrase fetcher, its config and the optional trust bundle
//! on a host, and renders the shell pipelines that feed the fetcher's
//! standard output straight into cryptsetup.
//!
//! The passphrase only ever exists inside a pipe on the host. Because a
//! pipeline's exit status is that of its last command, every pipeline
//! rendered here recomputes the status from `PIPESTATUS` and reports a
//! fetcher failure as [`FETCH_FAILURE_EXIT_CODE`].

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

use crate::application::host_shell::{bash, quote, HostShell};
use crate::domain::config::{EncryptionConfigManifest, KeyApiMode};
use crate::domain::error::EncryptionError;
use crate::domain::host::HostId;
use crate::domain::remote::RemoteExecutor;
use crate::domain::secret::{FetcherConfig, RemoteSecretDescriptor};

/// Exit status of a pipeline whose fetcher failed. cryptsetup itself never
/// exits above 5.
pub const FETCH_FAILURE_EXIT_CODE: i32 = 97;

const FETCHER_FILE: &str = "keyapi";
const CONFIG_FILE: &str = "config.json";
const CERT_FILE: &str = "certs.pem";
const OWNER_ONLY_EXEC: u32 = 0o500;

// ============================================================================
// Fetch source and pipelines
// ============================================================================

/// Something that prints the passphrase on standard output when run on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchSource {
    KeyApi {
        fetcher_path: String,
        config_path: String,
        cert_path: Option<String>,
    },
    /// Passphrase file already on the host (development rigs only).
    LocalFile { path: String },
}

impl FetchSource {
    pub fn command(&self) -> String {
        match self {
            Self::KeyApi {
                fetcher_path,
                config_path,
                ..
            } => format!("{} fetch -i {}", quote(fetcher_path), quote(config_path)),
            Self::LocalFile { path } => format!("cat {}", quote(path)),
        }
    }

    pub fn config_path(&self) -> Option<&str> {
        match self {
            Self::KeyApi { config_path, .. } => Some(config_path),
            Self::LocalFile { .. } => None,
        }
    }

    fn prelude(&self) -> String {
        match self {
            Self::KeyApi {
                cert_path: Some(cert),
                ..
            } => format!("export SSL_CERT_FILE={}; ", quote(cert)),
            _ => String::new(),
        }
    }
}

/// `fetch | consumer` with the fetcher's failure surfaced first.
pub fn piped(source: &FetchSource, consumer: &str) -> String {
    bash(&format!(
        "{}{} | {}; rc=(\"${{PIPESTATUS[@]}}\"); \
         if [ \"${{rc[0]}}\" -ne 0 ]; then exit {}; fi; exit \"${{rc[1]}}\"",
        source.prelude(),
        source.command(),
        consumer,
        FETCH_FAILURE_EXIT_CODE
    ))
}

/// ExecStart line for a systemd unit. systemd expands `$`, so this form
/// relies on `pipefail` instead of `PIPESTATUS`.
pub fn unit_exec_start(source: &FetchSource, consumer: &str) -> String {
    format!(
        "/bin/{}",
        bash(&format!(
            "{}set -o pipefail; {} | {}",
            source.prelude(),
            source.command(),
            consumer
        ))
    )
}

/// Replace the key `old` unlocks with the key `new` prints.
pub fn key_change(old: &FetchSource, new: &FetchSource, device: &str) -> String {
    bash(&format!(
        "{}cryptsetup luksChangeKey --batch-mode {} --key-file=<({}) <({})",
        new.prelude(),
        quote(device),
        old.command(),
        new.command()
    ))
}

// ============================================================================
// Service Trait
// ============================================================================

#[async_trait]
pub trait KeyApiProvisioner: Send + Sync {
    /// Ensure the fetcher, its config naming `secret_name` and the optional
    /// trust bundle exist on `host`. Anything already present is left alone.
    async fn provision(
        &self,
        host: &HostId,
        secret_name: &str,
        descriptor: &RemoteSecretDescriptor,
    ) -> Result<FetchSource, EncryptionError>;

    /// Like [`provision`](Self::provision) but with a config pinned to one
    /// secret version. The config is always rewritten.
    async fn provision_pinned(
        &self,
        host: &HostId,
        secret_name: &str,
        descriptor: &RemoteSecretDescriptor,
        version: u64,
    ) -> Result<FetchSource, EncryptionError>;

    /// Remove the config behind `source`. The fetcher binary stays.
    async fn remove(&self, host: &HostId, source: &FetchSource) -> Result<(), EncryptionError>;
}

// ============================================================================
// Implementation
// ============================================================================

pub struct StandardKeyApiProvisioner {
    executor: Arc<dyn RemoteExecutor>,
    config: Arc<EncryptionConfigManifest>,
}

impl StandardKeyApiProvisioner {
    pub fn new(executor: Arc<dyn RemoteExecutor>, config: Arc<EncryptionConfigManifest>) -> Self {
        Self { executor, config }
    }

    fn path(&self, file: &str) -> String {
        format!("{}/{}", self.config.spec.keyapi.remote_dir.trim_end_matches('/'), file)
    }

    fn fetcher_config(
        &self,
        secret_name: &str,
        descriptor: &RemoteSecretDescriptor,
        version: Option<u64>,
    ) -> FetcherConfig {
        FetcherConfig {
            secret_name: secret_name.to_string(),
            key_source: descriptor.key_source,
            vault_id: descriptor.vault_id.clone(),
            compartment_id: descriptor.compartment_id.clone(),
            endpoint: self.config.spec.vault.endpoint.clone(),
            version_number: version,
            object_store: descriptor.object_store.clone(),
            log_file: self.config.spec.keyapi.fetch_log.clone(),
        }
    }

    fn failure(&self, host: &HostId, what: &str, detail: String) -> EncryptionError {
        EncryptionError::preparation(
            format!("provisioning the key fetcher on {} failed ({}): {}", host, what, detail),
            format!(
                "verify {} is writable by root on the host and retry",
                self.config.spec.keyapi.remote_dir
            ),
        )
    }

    async fn lock_down(&self, shell: &HostShell<'_>, path: &str) -> Result<(), EncryptionError> {
        let command = format!(
            "chown root:root {p} && chmod {:o} {p}",
            OWNER_ONLY_EXEC,
            p = quote(path)
        );
        shell
            .run_checked(&command, |out| {
                self.failure(shell.host(), "permissions", out.describe())
            })
            .await?;
        Ok(())
    }

    /// Fetcher binary and trust bundle, shared by every config on the host.
    async fn ensure_binaries(&self, shell: &HostShell<'_>) -> Result<(Option<String>, String), EncryptionError> {
        let keyapi = &self.config.spec.keyapi;
        let dir = keyapi.remote_dir.trim_end_matches('/');
        shell
            .run_checked(&format!("mkdir -p {}", quote(dir)), |out| {
                self.failure(shell.host(), "directory", out.describe())
            })
            .await?;

        let fetcher = self.path(FETCHER_FILE);
        if shell.exists(&fetcher).await? {
            debug!(host = %shell.host(), "fetcher already present at {}", fetcher);
        } else {
            shell.copy_file(&keyapi.local_fetcher, &fetcher).await?;
            self.lock_down(shell, &fetcher).await?;
            info!(host = %shell.host(), "Installed key fetcher at {}", fetcher);
        }

        let cert = match &keyapi.certificate_bundle {
            Some(local) => {
                let cert = self.path(CERT_FILE);
                if !shell.exists(&cert).await? {
                    shell.copy_file(local, &cert).await?;
                    self.lock_down(shell, &cert).await?;
                    info!(host = %shell.host(), "Installed certificate bundle at {}", cert);
                }
                Some(cert)
            }
            None => None,
        };

        Ok((cert, fetcher))
    }

    async fn write_config(
        &self,
        shell: &HostShell<'_>,
        path: &str,
        contents: &FetcherConfig,
    ) -> Result<(), EncryptionError> {
        let json = serde_json::to_vec_pretty(contents)
            .map_err(|e| self.failure(shell.host(), "config", e.to_string()))?;
        shell.write_file(path, &json, OWNER_ONLY_EXEC).await?;
        self.lock_down(shell, path).await
    }
}

#[async_trait]
impl KeyApiProvisioner for StandardKeyApiProvisioner {
    async fn provision(
        &self,
        host: &HostId,
        secret_name: &str,
        descriptor: &RemoteSecretDescriptor,
    ) -> Result<FetchSource, EncryptionError> {
        if let KeyApiMode::LocalDevelopment { passphrase_file } = &self.config.spec.keyapi.mode {
            debug!(host = %host, "local development mode, passphrase read from {}", passphrase_file);
            return Ok(FetchSource::LocalFile {
                path: passphrase_file.clone(),
            });
        }

        let shell = HostShell::new(&self.executor, host, self.config.spec.remote.command_timeout);
        let (cert_path, fetcher_path) = self.ensure_binaries(&shell).await?;

        let config_path = self.path(CONFIG_FILE);
        if !shell.exists(&config_path).await? {
            let contents = self.fetcher_config(secret_name, descriptor, None);
            self.write_config(&shell, &config_path, &contents).await?;
            info!(host = %host, "Wrote fetcher config for secret {}", secret_name);
        }

        Ok(FetchSource::KeyApi {
            fetcher_path,
            config_path,
            cert_path,
        })
    }

    async fn provision_pinned(
        &self,
        host: &HostId,
        secret_name: &str,
        descriptor: &RemoteSecretDescriptor,
        version: u64,
    ) -> Result<FetchSource, EncryptionError> {
        if matches!(self.config.spec.keyapi.mode, KeyApiMode::LocalDevelopment { .. }) {
            return Err(EncryptionError::unsupported(
                "version-pinned fetchers need the remote key source",
                "switch keyapi.mode to remote to rotate passphrases",
            ));
        }

        let shell = HostShell::new(&self.executor, host, self.config.spec.remote.command_timeout);
        let (cert_path, fetcher_path) = self.ensure_binaries(&shell).await?;

        let config_path = self.path(&format!("config.v{}.json", version));
        let contents = self.fetcher_config(secret_name, descriptor, Some(version));
        self.write_config(&shell, &config_path, &contents).await?;
        debug!(host = %host, "Wrote fetcher config pinned to version {}", version);

        Ok(FetchSource::KeyApi {
            fetcher_path,
            config_path,
            cert_path,
        })
    }

    async fn remove(&self, host: &HostId, source: &FetchSource) -> Result<(), EncryptionError> {
        let Some(config_path) = source.config_path() else {
            return Ok(());
        };
        let shell = HostShell::new(&self.executor, host, self.config.spec.remote.command_timeout);
        shell
            .run_checked(&format!("rm -f {}", quote(config_path)), |out| {
                self.failure(host, "cleanup", out.describe())
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::secret::KeySource;
    use crate::infrastructure::remote::simulated::{SimulatedFleet, SimulatedHost};

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

    fn source() -> FetchSource {
        FetchSource::KeyApi {
            fetcher_path: "/opt/fleetcrypt/keyapi/keyapi".into(),
            config_path: "/opt/fleetcrypt/keyapi/config.json".into(),
            cert_path: None,
        }
    }

    #[test]
    fn test_piped_recomputes_exit_status() {
        let cmd = piped(&source(), "cryptsetup open --type luks2 --test-passphrase --key-file=- /dev/sdb1");
        assert!(cmd.starts_with("bash -c '/opt/fleetcrypt/keyapi/keyapi fetch -i /opt/fleetcrypt/keyapi/config.json | cryptsetup open"));
        assert!(cmd.contains(r#"rc=("${PIPESTATUS[@]}")"#));
        assert!(cmd.contains("then exit 97; fi"));
    }

    #[test]
    fn test_certificate_is_exported_first() {
        let source = FetchSource::KeyApi {
            fetcher_path: "/k/keyapi".into(),
            config_path: "/k/config.json".into(),
            cert_path: Some("/k/certs.pem".into()),
        };
        let cmd = piped(&source, "true");
        assert!(cmd.starts_with("bash -c 'export SSL_CERT_FILE=/k/certs.pem; /k/keyapi fetch"));
    }

    #[test]
    fn test_unit_exec_start_avoids_dollar_expansion() {
        let exec = unit_exec_start(&source(), "cryptsetup open /dev/sdb1 sdb1-crypt --key-file=-");
        assert!(exec.starts_with("/bin/bash -c 'set -o pipefail; "));
        assert!(!exec.contains('$'));
    }

    #[test]
    fn test_key_change_uses_both_sources() {
        let old = FetchSource::KeyApi {
            fetcher_path: "/k/keyapi".into(),
            config_path: "/k/config.v1.json".into(),
            cert_path: None,
        };
        let new = FetchSource::KeyApi {
            fetcher_path: "/k/keyapi".into(),
            config_path: "/k/config.v2.json".into(),
            cert_path: None,
        };
        assert_eq!(
            key_change(&old, &new, "/dev/sdb1"),
            "bash -c 'cryptsetup luksChangeKey --batch-mode /dev/sdb1 --key-file=<(/k/keyapi fetch -i /k/config.v1.json) <(/k/keyapi fetch -i /k/config.v2.json)'"
        );
    }

    #[tokio::test]
    async fn test_provision_is_idempotent() {
        let fleet = SimulatedFleet::new();
        let host = HostId::new("vm01.example.com");
        fleet.add_host(SimulatedHost::with_data_volume(host.as_str(), "/u02", "/dev/mapper/VGExaDb-LVu02", "ext4", None));
        let executor: Arc<dyn RemoteExecutor> = Arc::new(fleet.clone());
        let provisioner = StandardKeyApiProvisioner::new(executor, Arc::new(EncryptionConfigManifest::default()));

        let first = provisioner.provision(&host, host.as_str(), &descriptor()).await.unwrap();
        let copies = fleet.command_count(&host, "copy ");
        let second = provisioner.provision(&host, host.as_str(), &descriptor()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(fleet.command_count(&host, "copy "), copies);

        let snapshot = fleet.host(&host).unwrap();
        let fetcher = snapshot.files.get("/opt/fleetcrypt/keyapi/keyapi").unwrap();
        assert_eq!(fetcher.mode, 0o500);
        let config = snapshot.files.get("/opt/fleetcrypt/keyapi/config.json").unwrap();
        assert_eq!(config.mode, 0o500);
        let parsed: FetcherConfig = serde_json::from_slice(&config.contents).unwrap();
        assert_eq!(parsed.secret_name, "vm01.example.com");
        assert_eq!(parsed.version_number, None);
    }

    #[tokio::test]
    async fn test_pinned_config_and_removal() {
        let fleet = SimulatedFleet::new();
        let host = HostId::new("vm01.example.com");
        fleet.add_host(SimulatedHost::with_data_volume(host.as_str(), "/u02", "/dev/sdb1", "xfs", None));
        let executor: Arc<dyn RemoteExecutor> = Arc::new(fleet.clone());
        let provisioner = StandardKeyApiProvisioner::new(executor, Arc::new(EncryptionConfigManifest::default()));

        let pinned = provisioner
            .provision_pinned(&host, host.as_str(), &descriptor(), 3)
            .await
            .unwrap();
        assert_eq!(pinned.config_path(), Some("/opt/fleetcrypt/keyapi/config.v3.json"));
        let snapshot = fleet.host(&host).unwrap();
        let parsed: FetcherConfig =
            serde_json::from_slice(&snapshot.files["/opt/fleetcrypt/keyapi/config.v3.json"].contents).unwrap();
        assert_eq!(parsed.version_number, Some(3));

        provisioner.remove(&host, &pinned).await.unwrap();
        let snapshot = fleet.host(&host).unwrap();
        assert!(!snapshot.files.contains_key("/opt/fleetcrypt/keyapi/config.v3.json"));
        assert!(snapshot.files.contains_key("/opt/fleetcrypt/keyapi/keyapi"));
    }

    #[tokio::test]
    async fn test_local_development_mode_touches_nothing() {
        let fleet = SimulatedFleet::new();
        let host = HostId::new("vm01");
        fleet.add_host(SimulatedHost::with_data_volume("vm01", "/u02", "/dev/sdb1", "ext4", None));
        let mut config = EncryptionConfigManifest::default();
        config.spec.keyapi.mode = KeyApiMode::LocalDevelopment {
            passphrase_file: "/root/passphrase".into(),
        };
        let executor: Arc<dyn RemoteExecutor> = Arc::new(fleet.clone());
        let provisioner = StandardKeyApiProvisioner::new(executor, Arc::new(config));

        let source = provisioner.provision(&host, "vm01", &descriptor()).await.unwrap();
        assert_eq!(source.command(), "cat /root/passphrase");
        assert!(fleet.commands(&host).is_empty());
        assert!(provisioner.provision_pinned(&host, "vm01", &descriptor(), 2).await.is_err());
    }
}
