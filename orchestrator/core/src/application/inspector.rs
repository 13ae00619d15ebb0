// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Volume Inspector Application Service
//!
//! Classifies the block device behind a mount point: filesystem type and
//! label, and whether it already sits on an opened LUKS mapping. Also
//! answers the tri-state "was this mount point already converted" question
//! the workflow uses to resume interrupted runs.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::application::host_shell::{quote, HostShell};
use crate::domain::config::EncryptionConfigManifest;
use crate::domain::encryption::StateCheck;
use crate::domain::error::EncryptionError;
use crate::domain::host::HostId;
use crate::domain::mount::{
    mapped_device_path_for, mapped_source_for, parse_findmnt_line, FilesystemType,
    MountPointInfo, FSTAB_PATH,
};
use crate::domain::remote::RemoteExecutor;

/// `lsblk` TYPE of an opened dm-crypt mapping.
const CRYPT_DEVICE_TYPE: &str = "crypt";

#[async_trait]
pub trait VolumeInspector: Send + Sync {
    /// Fresh snapshot of `mount_point` on `host`.
    async fn inspect(&self, host: &HostId, mount_point: &str) -> Result<MountPointInfo, EncryptionError>;

    /// Done, NotStarted, or Failed (a previous run stopped part-way).
    async fn check_encryption_state(
        &self,
        host: &HostId,
        mount_point: &str,
    ) -> Result<StateCheck, EncryptionError>;
}

pub struct StandardVolumeInspector {
    executor: Arc<dyn RemoteExecutor>,
    config: Arc<EncryptionConfigManifest>,
}

impl StandardVolumeInspector {
    pub fn new(executor: Arc<dyn RemoteExecutor>, config: Arc<EncryptionConfigManifest>) -> Self {
        Self { executor, config }
    }

    fn shell<'a>(&'a self, host: &'a HostId) -> HostShell<'a> {
        HostShell::new(&self.executor, host, self.config.spec.remote.command_timeout)
    }

    /// `None` when nothing is mounted at `mount_point`.
    async fn read_mount(
        &self,
        shell: &HostShell<'_>,
        mount_point: &str,
    ) -> Result<Option<MountPointInfo>, EncryptionError> {
        let findmnt = shell
            .run(&format!("findmnt -rno SOURCE,FSTYPE,LABEL {}", quote(mount_point)))
            .await?;
        if !findmnt.is_success() {
            if findmnt.exit_code == 1 {
                return Ok(None);
            }
            return Err(EncryptionError::preparation(
                format!("findmnt {} failed: {}", mount_point, findmnt.describe()),
                "verify util-linux is installed on the host",
            ));
        }
        let (source, fstype, label) = findmnt
            .first_line()
            .and_then(parse_findmnt_line)
            .ok_or_else(|| {
                EncryptionError::preparation(
                    format!("unexpected findmnt output for {}: {:?}", mount_point, findmnt.stdout),
                    "inspect the mount table on the host",
                )
            })?;

        let filesystem_type = FilesystemType::parse(&fstype).ok_or_else(|| {
            EncryptionError::unsupported(
                format!("{} on {} is {}", mount_point, shell.host(), fstype),
                "only ext4 and xfs mount points can be encrypted in place",
            )
        })?;

        // findmnt leaves LABEL blank on some kernels; blkid reads the superblock.
        let filesystem_label = match label {
            Some(label) => Some(label),
            None => shell
                .run(&format!("blkid -s LABEL -o value {}", quote(&source)))
                .await?
                .first_line()
                .map(str::to_string),
        };

        let device_type = shell.run(&format!("lsblk -rno TYPE {}", quote(&source))).await?;
        let is_encrypted = device_type.first_line() == Some(CRYPT_DEVICE_TYPE);

        let underlying_luks_device_path = if is_encrypted {
            let tree = shell
                .run_checked(&format!("lsblk -nprso NAME {}", quote(&source)), |out| {
                    EncryptionError::preparation(
                        format!("cannot resolve the LUKS device under {}: {}", source, out.describe()),
                        "inspect the device tree with lsblk on the host",
                    )
                })
                .await?;
            // Inverse tree: the mapping itself, then its parent.
            let parent = tree
                .stdout
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .nth(1)
                .map(str::to_string);
            if parent.is_none() {
                return Err(EncryptionError::preparation(
                    format!("{} has no parent device", source),
                    "inspect the device tree with lsblk on the host",
                ));
            }
            parent
        } else {
            None
        };

        let info = MountPointInfo {
            mount_point: mount_point.to_string(),
            is_encrypted,
            backing_device_path: source,
            filesystem_type,
            filesystem_label,
            underlying_luks_device_path,
        };
        debug!(host = %shell.host(), "{} -> {:?}", mount_point, info);
        Ok(Some(info))
    }
}

#[async_trait]
impl VolumeInspector for StandardVolumeInspector {
    async fn inspect(&self, host: &HostId, mount_point: &str) -> Result<MountPointInfo, EncryptionError> {
        let shell = self.shell(host);
        self.read_mount(&shell, mount_point)
            .await?
            .ok_or_else(|| EncryptionError::MountPointNotFound {
                host: host.clone(),
                mount_point: mount_point.to_string(),
            })
    }

    async fn check_encryption_state(
        &self,
        host: &HostId,
        mount_point: &str,
    ) -> Result<StateCheck, EncryptionError> {
        let shell = self.shell(host);
        if let Some(info) = self.read_mount(&shell, mount_point).await? {
            return Ok(if info.is_encrypted {
                StateCheck::Done
            } else {
                StateCheck::NotStarted
            });
        }

        let fstab = shell
            .run_checked(&format!("cat {}", FSTAB_PATH), |out| {
                EncryptionError::preparation(
                    format!("cannot read {}: {}", FSTAB_PATH, out.describe()),
                    "verify the host's root filesystem is healthy",
                )
            })
            .await?
            .stdout;
        if let Some(mapped_device) = mapped_source_for(&fstab, mount_point) {
            return Ok(StateCheck::Failed { mapped_device });
        }

        // Stopped after encrypting but before the fstab rewrite: the fstab
        // source is now a LUKS container nothing can mount.
        if let Some(source) = plain_source_for(&fstab, mount_point) {
            if shell
                .run(&format!("cryptsetup isLuks {}", quote(&source)))
                .await?
                .is_success()
            {
                return Ok(StateCheck::Failed {
                    mapped_device: mapped_device_path_for(&source),
                });
            }
        }

        Err(EncryptionError::MountPointNotFound {
            host: host.clone(),
            mount_point: mount_point.to_string(),
        })
    }
}

/// Block-device source of the top-level fstab line for `mount_point`.
fn plain_source_for(fstab: &str, mount_point: &str) -> Option<String> {
    let mount_point = mount_point.trim_end_matches('/');
    fstab
        .lines()
        .map(str::trim)
        .filter(|l| !l.starts_with('#'))
        .find_map(|line| {
            let mut fields = line.split_whitespace();
            let source = fields.next()?;
            (fields.next()? == mount_point && source.starts_with("/dev/")).then(|| source.to_string())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::remote::simulated::{SimulatedFleet, SimulatedHost};

    fn inspector(fleet: &SimulatedFleet) -> StandardVolumeInspector {
        StandardVolumeInspector::new(
            Arc::new(fleet.clone()),
            Arc::new(EncryptionConfigManifest::default()),
        )
    }

    #[tokio::test]
    async fn test_inspect_plain_volume() {
        let fleet = SimulatedFleet::new();
        let host = HostId::new("vm01");
        fleet.add_host(SimulatedHost::with_data_volume("vm01", "/u02", "/dev/mapper/VGExaDb-LVu02", "ext4", Some("U02")));

        let info = inspector(&fleet).inspect(&host, "/u02").await.unwrap();
        assert!(!info.is_encrypted);
        assert_eq!(info.backing_device_path, "/dev/mapper/VGExaDb-LVu02");
        assert_eq!(info.filesystem_type, FilesystemType::Ext4);
        assert_eq!(info.filesystem_label.as_deref(), Some("U02"));
        assert_eq!(info.underlying_luks_device_path, None);
    }

    #[tokio::test]
    async fn test_inspect_encrypted_volume_finds_parent() {
        let fleet = SimulatedFleet::new();
        let host = HostId::new("vm01");
        let mut sim = SimulatedHost::with_data_volume("vm01", "/u02", "/dev/sdb1", "xfs", None);
        sim.devices.get_mut("/dev/sdb1").unwrap().luks = Some(Default::default());
        sim.mappings.insert("sdb1-crypt".into(), "/dev/sdb1".into());
        sim.mounts.get_mut("/u02").unwrap().source = "/dev/mapper/sdb1-crypt".into();
        fleet.add_host(sim);

        let inspector = inspector(&fleet);
        let info = inspector.inspect(&host, "/u02").await.unwrap();
        assert!(info.is_encrypted);
        assert_eq!(info.underlying_luks_device_path.as_deref(), Some("/dev/sdb1"));
        assert_eq!(
            inspector.check_encryption_state(&host, "/u02").await.unwrap(),
            StateCheck::Done
        );
    }

    #[tokio::test]
    async fn test_unsupported_filesystem() {
        let fleet = SimulatedFleet::new();
        let host = HostId::new("vm01");
        fleet.add_host(SimulatedHost::with_data_volume("vm01", "/u02", "/dev/sdb1", "btrfs", None));

        let err = inspector(&fleet).inspect(&host, "/u02").await.unwrap_err();
        assert!(matches!(err, EncryptionError::Unsupported { .. }));
    }

    #[tokio::test]
    async fn test_state_check_variants() {
        let fleet = SimulatedFleet::new();
        let host = HostId::new("vm01");
        fleet.add_host(SimulatedHost::with_data_volume("vm01", "/u02", "/dev/sdb1", "ext4", None));
        let inspector = inspector(&fleet);

        assert_eq!(
            inspector.check_encryption_state(&host, "/u02").await.unwrap(),
            StateCheck::NotStarted
        );
        assert!(matches!(
            inspector.check_encryption_state(&host, "/u09").await,
            Err(EncryptionError::MountPointNotFound { .. })
        ));

        // Unmounted with fstab already pointing at the mapping.
        fleet.with_host(&host, |h| {
            h.mounts.remove("/u02");
            let fstab = h.fstab().replace("/dev/sdb1", "/dev/mapper/sdb1-crypt");
            h.set_fstab(&fstab);
        });
        assert_eq!(
            inspector.check_encryption_state(&host, "/u02").await.unwrap(),
            StateCheck::Failed {
                mapped_device: "/dev/mapper/sdb1-crypt".into()
            }
        );
    }

    #[test]
    fn test_plain_source_for() {
        let fstab = "# c\n/dev/sdb1\t/u02\text4\tdefaults\t1 2\nUUID=x\t/u03\txfs\tdefaults\t0 0\n";
        assert_eq!(plain_source_for(fstab, "/u02").as_deref(), Some("/dev/sdb1"));
        assert_eq!(plain_source_for(fstab, "/u03"), None);
    }
}
