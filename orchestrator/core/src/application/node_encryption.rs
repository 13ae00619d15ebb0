// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Node Encryption Application Service
//!
//! Drives one mount point on one host through the encryption state machine:
//!
//! ```text
//! Booting -> Inspected -> PackagesVerified -> Prepared -> Encrypting(n)
//!         -> Opened -> PostPrepared -> FstabUpdated -> Remounted
//!         -> ServiceEnabled -> Done
//! ```
//!
//! An already encrypted mount point stops at `AlreadyEncrypted`. A run that
//! was interrupted after the device was converted resumes straight at
//! `FstabUpdated`. Every error is caught here and turned into a failed
//! [`WorkflowResult`]; callers never see a partially driven workflow.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::application::host_shell::{quote, HostShell};
use crate::application::inspector::VolumeInspector;
use crate::application::keyapi::{
    piped, unit_exec_start, FetchSource, KeyApiProvisioner, FETCH_FAILURE_EXIT_CODE,
};
use crate::application::preparer::VolumePreparer;
use crate::application::secret_lifecycle::SecretLifecycleService;
use crate::application::toolchain::ToolchainVerifier;
use crate::domain::config::{EncryptionConfigManifest, KeyApiMode};
use crate::domain::encryption::{NodeWorkflow, NodeWorkflowState, StateCheck, WorkflowResult};
use crate::domain::error::EncryptionError;
use crate::domain::events::NodeEncryptionEvent;
use crate::domain::host::HostId;
use crate::domain::mount::{
    mapping_name_for, mapping_name_of, rewrite_fstab, FilesystemType, MountPointInfo,
    FSTAB_BACKUP_PATH, FSTAB_PATH,
};
use crate::domain::remote::RemoteExecutor;
use crate::domain::secret::RemoteSecretDescriptor;
use crate::domain::service_unit::BoundServiceUnit;
use crate::infrastructure::event_bus::EventBus;

/// Space the LUKS2 header takes from the device, in 512-byte sectors.
const HEADER_SECTORS: &str = "8192S";

/// Per-request switches an operator can set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestOptions {
    /// Give an existing ACTIVE secret a fresh version before encrypting.
    #[serde(default)]
    pub force_new_secret_version: bool,
}

#[async_trait]
pub trait NodeEncryptionService: Send + Sync {
    /// Encrypt `mount_point` on `host` in place and make it unlock on boot.
    /// Never fails: the outcome, including any error, is in the result.
    async fn encrypt(
        &self,
        host: &HostId,
        mount_point: &str,
        descriptor: &RemoteSecretDescriptor,
        options: &RequestOptions,
    ) -> WorkflowResult;
}

pub struct StandardNodeEncryptionService {
    executor: Arc<dyn RemoteExecutor>,
    inspector: Arc<dyn VolumeInspector>,
    toolchain: Arc<dyn ToolchainVerifier>,
    secrets: Arc<dyn SecretLifecycleService>,
    keyapi: Arc<dyn KeyApiProvisioner>,
    preparer: Arc<dyn VolumePreparer>,
    event_bus: Arc<EventBus>,
    config: Arc<EncryptionConfigManifest>,
}

impl StandardNodeEncryptionService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        executor: Arc<dyn RemoteExecutor>,
        inspector: Arc<dyn VolumeInspector>,
        toolchain: Arc<dyn ToolchainVerifier>,
        secrets: Arc<dyn SecretLifecycleService>,
        keyapi: Arc<dyn KeyApiProvisioner>,
        preparer: Arc<dyn VolumePreparer>,
        event_bus: Arc<EventBus>,
        config: Arc<EncryptionConfigManifest>,
    ) -> Self {
        Self {
            executor,
            inspector,
            toolchain,
            secrets,
            keyapi,
            preparer,
            event_bus,
            config,
        }
    }

    fn shell<'a>(&'a self, host: &'a HostId) -> HostShell<'a> {
        HostShell::new(&self.executor, host, self.config.spec.remote.command_timeout)
    }

    fn advance(&self, workflow: &mut NodeWorkflow, next: NodeWorkflowState) -> Result<(), EncryptionError> {
        workflow.advance(next)?;
        info!(
            host = %workflow.host(),
            mount_point = %workflow.mount_point(),
            "Entered {}", next
        );
        self.event_bus.publish_node_event(NodeEncryptionEvent::StateEntered {
            host: workflow.host().clone(),
            mount_point: workflow.mount_point().to_string(),
            state: next,
            entered_at: Utc::now(),
        });
        Ok(())
    }

    async fn drive(
        &self,
        workflow: &mut NodeWorkflow,
        descriptor: &RemoteSecretDescriptor,
        options: &RequestOptions,
    ) -> Result<(), EncryptionError> {
        let host = workflow.host().clone();
        let mount_point = workflow.mount_point().to_string();
        descriptor
            .validate()
            .map_err(|cause| EncryptionError::unsupported(cause, "fix the secret descriptor in the request"))?;

        self.wait_for_boot(&host).await?;
        let state = self.inspector.check_encryption_state(&host, &mount_point).await?;
        self.advance(workflow, NodeWorkflowState::Inspected)?;

        match state {
            StateCheck::Done => {
                info!(host = %host, "{} is already encrypted", mount_point);
                self.advance(workflow, NodeWorkflowState::AlreadyEncrypted)
            }
            StateCheck::NotStarted => self.convert(workflow, descriptor, options).await,
            StateCheck::Failed { mapped_device } => {
                warn!(
                    host = %host,
                    "{} was left unmounted by an earlier run, resuming with {}",
                    mount_point, mapped_device
                );
                self.resume(workflow, descriptor, &mapped_device).await
            }
        }
    }

    /// Fresh conversion of a mounted plain filesystem.
    async fn convert(
        &self,
        workflow: &mut NodeWorkflow,
        descriptor: &RemoteSecretDescriptor,
        options: &RequestOptions,
    ) -> Result<(), EncryptionError> {
        let host = workflow.host().clone();
        let mount_point = workflow.mount_point().to_string();
        let info = self.inspector.inspect(&host, &mount_point).await?;

        self.toolchain.verify(&host).await?;
        self.advance(workflow, NodeWorkflowState::PackagesVerified)?;

        if self.uses_remote_key() {
            let force = options.force_new_secret_version || self.config.spec.secrets.force_new_version;
            let key = self.secrets.ensure_secret(&host, descriptor, force).await?;
            debug!(host = %host, "Encrypting with {}", key.describe());
        }
        let fetch = self.keyapi.provision(&host, host.as_str(), descriptor).await?;

        if let Err(err) = self.preparer.prepare_before(&host, &info).await {
            self.restore(&host, &mount_point).await;
            return Err(err);
        }
        self.advance(workflow, NodeWorkflowState::Prepared)?;

        let mapped_device = self.encrypt_device(workflow, &info, &fetch).await?;
        self.advance(workflow, NodeWorkflowState::Opened)?;

        self.preparer.prepare_after(&host, &info, &mapped_device).await?;
        self.advance(workflow, NodeWorkflowState::PostPrepared)?;

        self.update_fstab(&host, &mount_point, &mapped_device).await?;
        self.advance(workflow, NodeWorkflowState::FstabUpdated)?;

        self.finish(workflow, &fetch).await
    }

    /// Pick up a run that converted the device but never remounted it.
    async fn resume(
        &self,
        workflow: &mut NodeWorkflow,
        descriptor: &RemoteSecretDescriptor,
        mapped_device: &str,
    ) -> Result<(), EncryptionError> {
        let host = workflow.host().clone();
        let mount_point = workflow.mount_point().to_string();
        let shell = self.shell(&host);

        if self.uses_remote_key() && !self.secrets.has_key(&host, descriptor).await? {
            return Err(EncryptionError::conflict(
                format!(
                    "{} is encrypted but no {} passphrase exists for {}",
                    mount_point, descriptor.key_source, host
                ),
                "restore the host's passphrase in the vault or bucket; without it the volume cannot be opened",
            ));
        }
        let fetch = self.keyapi.provision(&host, host.as_str(), descriptor).await?;

        let fstab = self.read_fstab(&shell).await?;
        let fstype = fstab_filesystem(&fstab, &mount_point)
            .and_then(|t| FilesystemType::parse(&t))
            .ok_or_else(|| {
                EncryptionError::unsupported(
                    format!("no ext4 or xfs entry for {} in {}", mount_point, FSTAB_PATH),
                    format!("restore {} from {} and retry", FSTAB_PATH, FSTAB_BACKUP_PATH),
                )
            })?;

        let name = mapping_name_of(mapped_device).to_string();
        let luks_device = self.ensure_mapping_open(&shell, &fetch, &name).await?;
        let info = MountPointInfo {
            mount_point: mount_point.clone(),
            is_encrypted: true,
            backing_device_path: luks_device.clone(),
            filesystem_type: fstype,
            filesystem_label: None,
            underlying_luks_device_path: Some(luks_device),
        };
        self.preparer.prepare_after(&host, &info, mapped_device).await?;

        self.update_fstab(&host, &mount_point, mapped_device).await?;
        self.advance(workflow, NodeWorkflowState::FstabUpdated)?;

        self.finish(workflow, &fetch).await
    }

    async fn finish(&self, workflow: &mut NodeWorkflow, fetch: &FetchSource) -> Result<(), EncryptionError> {
        let host = workflow.host().clone();
        let mount_point = workflow.mount_point().to_string();

        self.preparer.remount(&host, &mount_point).await?;
        self.advance(workflow, NodeWorkflowState::Remounted)?;

        self.enable_unlock_service(&host, &mount_point, fetch).await?;
        self.advance(workflow, NodeWorkflowState::ServiceEnabled)?;

        self.advance(workflow, NodeWorkflowState::Done)
    }

    /// Local development mode keys hosts from a file instead of a store.
    fn uses_remote_key(&self) -> bool {
        matches!(self.config.spec.keyapi.mode, KeyApiMode::Remote)
    }

    async fn wait_for_boot(&self, host: &HostId) -> Result<(), EncryptionError> {
        let shell = self.shell(host);
        let shell = &shell;
        self.config
            .spec
            .retry
            .boot_wait
            .run_while(
                |attempt| async move {
                    let out = shell.run("systemd-analyze time").await?;
                    if out.is_success() {
                        return Ok(());
                    }
                    if attempt == 1 {
                        info!(host = %host, "Waiting for boot to finish");
                    }
                    Err(EncryptionError::preparation(
                        format!("{} did not finish booting: {}", host, out.describe()),
                        "check `systemctl list-jobs` on the host for stuck units and retry",
                    ))
                },
                |err| matches!(err, EncryptionError::PreparationFailed { .. }),
            )
            .await
    }

    async fn encrypt_device(
        &self,
        workflow: &mut NodeWorkflow,
        info: &MountPointInfo,
        fetch: &FetchSource,
    ) -> Result<String, EncryptionError> {
        let host = workflow.host().clone();
        let shell = self.shell(&host);
        let shell = &shell;
        let policy = self.config.spec.retry.encrypt;

        let result = policy
            .run_while(
                |attempt| {
                    let entered = self.advance(workflow, NodeWorkflowState::Encrypting { attempt });
                    async move {
                        entered?;
                        let attempted = self.encrypt_attempt(shell, info, fetch).await;
                        if let Err(err) = &attempted {
                            warn!(host = %shell.host(), "Encryption attempt {} failed: {}", attempt, err);
                            self.close_mapping(shell, &info.mapping_name()).await;
                        }
                        attempted
                    }
                },
                |err| matches!(err, EncryptionError::EncryptionFailed { .. }),
            )
            .await;

        match result {
            Ok(mapped) => Ok(mapped),
            Err(err) => {
                self.restore(&host, &info.mount_point).await;
                Err(match err {
                    EncryptionError::EncryptionFailed { cause, .. } => EncryptionError::encryption(
                        format!(
                            "{} not encrypted after {} attempts: {}",
                            info.backing_device_path,
                            policy.attempts.max(1),
                            cause
                        ),
                        format!(
                            "inspect {} and the cryptsetup output on the host; the original filesystem was remounted",
                            self.config.spec.keyapi.fetch_log
                        ),
                    ),
                    other => other,
                })
            }
        }
    }

    /// Encrypt (or finish a reencryption an earlier attempt left behind),
    /// verify the key and open the mapping. Returns the mapped device path.
    async fn encrypt_attempt(
        &self,
        shell: &HostShell<'_>,
        info: &MountPointInfo,
        fetch: &FetchSource,
    ) -> Result<String, EncryptionError> {
        let device = quote(&info.backing_device_path);
        let is_luks = shell
            .run(&format!("cryptsetup isLuks {}", device))
            .await?
            .is_success();
        if is_luks {
            debug!(host = %shell.host(), "{} already carries a LUKS header", info.backing_device_path);
            if self.reencrypt_pending(shell, info).await? {
                warn!(host = %shell.host(), "Resuming the unfinished reencryption of {}", info.backing_device_path);
                self.run_with_key(
                    shell,
                    fetch,
                    &format!("cryptsetup reencrypt --resume-only {} --key-file=-", device),
                )
                .await?;
                info!(host = %shell.host(), "Finished encrypting {} in place", info.backing_device_path);
            }
        } else {
            self.run_with_key(
                shell,
                fetch,
                &format!(
                    "cryptsetup reencrypt --encrypt {} --type luks2 --reduce-device-size {} --key-file=-",
                    device, HEADER_SECTORS
                ),
            )
            .await?;
            info!(host = %shell.host(), "Encrypted {} in place", info.backing_device_path);
        }

        self.run_with_key(
            shell,
            fetch,
            &format!("cryptsetup open --type luks2 --test-passphrase --key-file=- {}", device),
        )
        .await?;

        if let Some(label) = info.luks_label() {
            shell
                .run_checked(
                    &format!("cryptsetup config {} --label {}", device, quote(&label)),
                    |out| {
                        EncryptionError::encryption(
                            format!("labelling {} failed: {}", info.backing_device_path, out.describe()),
                            "check the LUKS header with `cryptsetup luksDump`",
                        )
                    },
                )
                .await?;
        }

        let name = info.mapping_name();
        self.run_with_key(
            shell,
            fetch,
            &format!("cryptsetup open --type luks2 --key-file=- {} {}", device, quote(&name)),
        )
        .await?;
        Ok(info.mapped_device_path())
    }

    /// Whether the LUKS2 header still flags an online reencryption.
    async fn reencrypt_pending(&self, shell: &HostShell<'_>, info: &MountPointInfo) -> Result<bool, EncryptionError> {
        let dump = shell
            .run_checked(
                &format!("cryptsetup luksDump {}", quote(&info.backing_device_path)),
                |out| {
                    EncryptionError::encryption(
                        format!("reading the LUKS header of {} failed: {}", info.backing_device_path, out.describe()),
                        "check the LUKS header with `cryptsetup luksDump`",
                    )
                },
            )
            .await?;
        Ok(dump
            .stdout
            .lines()
            .any(|l| l.trim_start().starts_with("Requirements:") && l.contains("online-reencrypt")))
    }

    /// Run `consumer` with the passphrase on its standard input.
    async fn run_with_key(
        &self,
        shell: &HostShell<'_>,
        fetch: &FetchSource,
        consumer: &str,
    ) -> Result<(), EncryptionError> {
        let out = shell.run(&piped(fetch, consumer)).await?;
        match out.exit_code {
            0 => Ok(()),
            FETCH_FAILURE_EXIT_CODE => Err(EncryptionError::encryption(
                format!("fetching the passphrase failed: {}", out.describe()),
                format!(
                    "check the fetcher log {} on the host and its access to the vault",
                    self.config.spec.keyapi.fetch_log
                ),
            )),
            _ => Err(EncryptionError::encryption(
                format!("`{}` failed: {}", consumer, out.describe()),
                "inspect the cryptsetup output on the host",
            )),
        }
    }

    async fn close_mapping(&self, shell: &HostShell<'_>, name: &str) {
        let status = shell.run(&format!("cryptsetup status {}", quote(name))).await;
        if !matches!(status, Ok(ref out) if out.is_success()) {
            return;
        }
        match shell.run(&format!("cryptsetup close {}", quote(name))).await {
            Ok(out) if out.is_success() => debug!(host = %shell.host(), "Closed {}", name),
            Ok(out) => warn!(host = %shell.host(), "Could not close {}: {}", name, out.describe()),
            Err(err) => warn!(host = %shell.host(), "Could not close {}: {}", name, err),
        }
    }

    /// Make sure `/dev/mapper/<name>` exists. Returns the LUKS device behind it.
    async fn ensure_mapping_open(
        &self,
        shell: &HostShell<'_>,
        fetch: &FetchSource,
        name: &str,
    ) -> Result<String, EncryptionError> {
        let status = shell.run(&format!("cryptsetup status {}", quote(name))).await?;
        if status.is_success() {
            if let Some(device) = status_device(&status.stdout) {
                return Ok(device);
            }
        }

        let candidates = shell.run("blkid -t TYPE=crypto_LUKS -o device").await?;
        let device = candidates
            .stdout
            .lines()
            .map(str::trim)
            .find(|dev| !dev.is_empty() && mapping_name_for(dev) == name)
            .map(str::to_string)
            .ok_or_else(|| {
                EncryptionError::encryption(
                    format!("no LUKS device on {} maps to {}", shell.host(), name),
                    format!(
                        "restore {} from {} if the device was never encrypted",
                        FSTAB_PATH, FSTAB_BACKUP_PATH
                    ),
                )
            })?;

        self.run_with_key(
            shell,
            fetch,
            &format!("cryptsetup open --type luks2 --key-file=- {} {}", quote(&device), quote(name)),
        )
        .await?;
        info!(host = %shell.host(), "Re-opened {} as {}", device, name);
        Ok(device)
    }

    async fn read_fstab(&self, shell: &HostShell<'_>) -> Result<String, EncryptionError> {
        Ok(shell
            .run_checked(&format!("cat {}", FSTAB_PATH), |out| {
                EncryptionError::preparation(
                    format!("cannot read {}: {}", FSTAB_PATH, out.describe()),
                    "verify the host's root filesystem is healthy",
                )
            })
            .await?
            .stdout)
    }

    async fn update_fstab(&self, host: &HostId, mount_point: &str, mapped_device: &str) -> Result<(), EncryptionError> {
        let shell = self.shell(host);
        let fstab = self.read_fstab(&shell).await?;
        let rewrite = rewrite_fstab(&fstab, mount_point, mapped_device).map_err(|e| {
            EncryptionError::preparation(
                format!("cannot rewrite {}: {}", FSTAB_PATH, e),
                format!("fix {} by hand so it lists {}, then retry", FSTAB_PATH, mount_point),
            )
        })?;

        if rewrite.changed {
            shell
                .run_checked(&format!("cp -p {} {}", FSTAB_PATH, FSTAB_BACKUP_PATH), |out| {
                    EncryptionError::preparation(
                        format!("backing up {} failed: {}", FSTAB_PATH, out.describe()),
                        "check free space on the root filesystem",
                    )
                })
                .await?;
            shell.write_file(FSTAB_PATH, rewrite.contents.as_bytes(), 0o644).await?;
            info!(
                host = %host,
                "Rewrote {} line(s) of {} for {}", rewrite.matched_lines, FSTAB_PATH, mount_point
            );
        }

        shell
            .run_checked("mount -fav", |out| {
                EncryptionError::preparation(
                    format!("{} does not verify: {}", FSTAB_PATH, out.describe()),
                    format!("compare {} with {} and fix the entry", FSTAB_PATH, FSTAB_BACKUP_PATH),
                )
            })
            .await?;
        Ok(())
    }

    async fn enable_unlock_service(
        &self,
        host: &HostId,
        mount_point: &str,
        fetch: &FetchSource,
    ) -> Result<(), EncryptionError> {
        let shell = self.shell(host);
        let info = self.inspector.inspect(host, mount_point).await?;
        let luks_device = info
            .underlying_luks_device_path
            .clone()
            .filter(|_| info.is_encrypted)
            .ok_or_else(|| {
                EncryptionError::preparation(
                    format!("{} is not mounted from a LUKS mapping", mount_point),
                    "re-run the workflow; it resumes from the current state",
                )
            })?;
        let mapping = mapping_name_of(&info.backing_device_path).to_string();

        let unit = BoundServiceUnit::new(
            mount_point,
            unit_exec_start(
                fetch,
                &format!("cryptsetup open {} {} --key-file=-", quote(&luks_device), quote(&mapping)),
            ),
        );
        let systemctl = |args: String| {
            let shell = &shell;
            async move {
                shell
                    .run_checked(&format!("systemctl {}", args), |out| {
                        EncryptionError::preparation(
                            format!("systemctl {} failed: {}", args, out.describe()),
                            "inspect `journalctl -xe` on the host",
                        )
                    })
                    .await
            }
        };

        systemctl("daemon-reload".to_string()).await?;
        systemctl(format!("is-active {}", quote(&unit.mount_unit))).await?;

        let path = unit.path();
        if shell.exists(&path).await?
            && shell
                .run(&format!("systemctl is-active {}", quote(&unit.unit_name)))
                .await?
                .is_success()
        {
            debug!(host = %host, "Replacing active unit {}", unit.unit_name);
            systemctl(format!("disable {}", quote(&unit.unit_name))).await?;
        }

        shell.write_file(&path, unit.render().as_bytes(), 0o600).await?;
        shell
            .run_checked(
                &format!("chown root:root {p} && chmod 600 {p}", p = quote(&path)),
                |out| {
                    EncryptionError::preparation(
                        format!("securing {} failed: {}", path, out.describe()),
                        format!("check the permissions of {}", path),
                    )
                },
            )
            .await?;
        systemctl("daemon-reload".to_string()).await?;
        systemctl(format!("enable {}", quote(&unit.unit_name))).await?;
        info!(host = %host, "Enabled {} for {}", unit.unit_name, mount_point);
        Ok(())
    }

    /// Best effort: leave the host's filesystems mountable after a failure.
    async fn restore(&self, host: &HostId, mount_point: &str) {
        match self.preparer.remount(host, mount_point).await {
            Ok(()) => info!(host = %host, "Remounted {} after the failure", mount_point),
            Err(err) => error!(host = %host, "Could not remount {}: {}", mount_point, err),
        }
    }
}

#[async_trait]
impl NodeEncryptionService for StandardNodeEncryptionService {
    async fn encrypt(
        &self,
        host: &HostId,
        mount_point: &str,
        descriptor: &RemoteSecretDescriptor,
        options: &RequestOptions,
    ) -> WorkflowResult {
        let mut workflow = NodeWorkflow::new(host.clone(), mount_point);
        info!(host = %host, mount_point = %mount_point, "Starting encryption workflow");

        let result = match self.drive(&mut workflow, descriptor, options).await {
            Ok(()) => workflow.complete(),
            Err(err) => {
                error!(
                    host = %host,
                    mount_point = %mount_point,
                    "Encryption workflow failed in {}: {}", workflow.state(), err
                );
                workflow.fail(&err)
            }
        };

        self.event_bus.publish_node_event(NodeEncryptionEvent::WorkflowCompleted {
            host: host.clone(),
            mount_point: mount_point.to_string(),
            status: result.status,
            elapsed_ms: result.elapsed.as_millis() as u64,
            error: result.error.clone(),
            completed_at: result.finished_at,
        });
        result
    }
}

/// `device:` line of `cryptsetup status`.
fn status_device(status: &str) -> Option<String> {
    status
        .lines()
        .filter_map(|l| l.trim().strip_prefix("device:"))
        .map(|d| d.trim().to_string())
        .find(|d| !d.is_empty())
}

/// Filesystem type column of the top-level fstab line for `mount_point`.
fn fstab_filesystem(fstab: &str, mount_point: &str) -> Option<String> {
    let mount_point = mount_point.trim_end_matches('/');
    fstab
        .lines()
        .map(str::trim)
        .filter(|l| !l.starts_with('#'))
        .find_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            (fields.len() >= 3 && fields[1] == mount_point).then(|| fields[2].to_string())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_device() {
        let status = "/dev/mapper/sdb1-crypt is active.\n  type:    LUKS2\n  device:  /dev/sdb1\n";
        assert_eq!(status_device(status).as_deref(), Some("/dev/sdb1"));
        assert_eq!(status_device("/dev/mapper/x is inactive."), None);
    }

    #[test]
    fn test_fstab_filesystem() {
        let fstab = "/dev/mapper/VG-LVu02-crypt\t/u02\text4\tdefaults,_netdev,nofail\t1 2\n";
        assert_eq!(fstab_filesystem(fstab, "/u02/").as_deref(), Some("ext4"));
        assert_eq!(fstab_filesystem(fstab, "/u03"), None);
    }

    #[test]
    fn test_request_options_default_off() {
        let options: RequestOptions = serde_yaml::from_str("{}").unwrap();
        assert!(!options.force_new_secret_version);
    }
}
