// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Volume Preparer Application Service
//!
//! Filesystem-specific work around the in-place encryption:
//!
//! - ext4: unmount, check, shrink to minimum before; check and grow after
//! - xfs: cannot shrink, so the logical volume is grown by the header size
//!   while still mounted (unless an earlier run already did), then unmounted
//!   and repaired; repaired again on the mapped device after
//!
//! Remounting is shared with the failure path, which must leave the host's
//! filesystems mountable.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::application::host_shell::{quote, HostShell};
use crate::domain::config::EncryptionConfigManifest;
use crate::domain::error::EncryptionError;
use crate::domain::host::{CommandOutput, HostId, MOUNT_PARTIAL_SUCCESS};
use crate::domain::mount::{count_fstab_references, FilesystemType, MountPointInfo, FSTAB_PATH};
use crate::domain::remote::RemoteExecutor;
use crate::domain::retry::RetryPolicy;

/// Space the LUKS2 header needs; matches `--reduce-device-size 8192S`.
const XFS_HEADER_RESERVATION: &str = "+32M";
const XFS_HEADER_BYTES: u64 = 8192 * 512;

/// e2fsck exit code for "errors corrected".
const E2FSCK_CORRECTED: i32 = 1;

#[async_trait]
pub trait VolumePreparer: Send + Sync {
    /// Make room for a LUKS header and leave the device unmounted.
    async fn prepare_before(&self, host: &HostId, info: &MountPointInfo) -> Result<(), EncryptionError>;

    /// Bring the filesystem on the opened mapping back to full size.
    async fn prepare_after(
        &self,
        host: &HostId,
        info: &MountPointInfo,
        new_device_path: &str,
    ) -> Result<(), EncryptionError>;

    /// Mount everything fstab lists, taking as many passes as there are
    /// fstab lines for `mount_point`.
    async fn remount(&self, host: &HostId, mount_point: &str) -> Result<(), EncryptionError>;
}

pub struct StandardVolumePreparer {
    executor: Arc<dyn RemoteExecutor>,
    config: Arc<EncryptionConfigManifest>,
}

enum MountPass {
    Partial(CommandOutput),
    Fatal(EncryptionError),
}

impl StandardVolumePreparer {
    pub fn new(executor: Arc<dyn RemoteExecutor>, config: Arc<EncryptionConfigManifest>) -> Self {
        Self { executor, config }
    }

    fn shell<'a>(&'a self, host: &'a HostId) -> HostShell<'a> {
        HostShell::new(&self.executor, host, self.config.spec.remote.command_timeout)
    }

    async fn unmount(&self, shell: &HostShell<'_>, mount_point: &str) -> Result<(), EncryptionError> {
        shell
            .run_checked(&format!("umount -R {}", quote(mount_point)), |out| {
                EncryptionError::preparation(
                    format!("unmounting {} failed: {}", mount_point, out.describe()),
                    format!(
                        "stop the processes using {} (see `fuser -vm {}`) and retry",
                        mount_point, mount_point
                    ),
                )
            })
            .await?;
        info!(host = %shell.host(), "Unmounted {}", mount_point);
        Ok(())
    }

    async fn e2fsck(&self, shell: &HostShell<'_>, device: &str) -> Result<(), EncryptionError> {
        let out = shell.run(&format!("e2fsck -f -p {}", quote(device))).await?;
        if out.is_success() || out.exit_code == E2FSCK_CORRECTED {
            return Ok(());
        }
        Err(EncryptionError::preparation(
            format!("e2fsck on {} failed: {}", device, out.describe()),
            format!("run `e2fsck -f {}` interactively on the host and retry", device),
        ))
    }

    async fn resize2fs(&self, shell: &HostShell<'_>, device: &str, shrink: bool) -> Result<(), EncryptionError> {
        let command = if shrink {
            format!("resize2fs -M {}", quote(device))
        } else {
            format!("resize2fs {}", quote(device))
        };
        shell
            .run_checked(&command, |out| {
                EncryptionError::preparation(
                    format!("{} failed: {}", command, out.describe()),
                    "check the filesystem with e2fsck and retry",
                )
            })
            .await?;
        Ok(())
    }

    async fn xfs_repair(&self, shell: &HostShell<'_>, device: &str) -> Result<(), EncryptionError> {
        shell
            .run_checked(&format!("xfs_repair {}", quote(device)), |out| {
                EncryptionError::preparation(
                    format!("xfs_repair on {} failed: {}", device, out.describe()),
                    format!("run `xfs_repair {}` on the host and inspect its output", device),
                )
            })
            .await?;
        Ok(())
    }

    /// Whether `device` already has room for the header behind the xfs
    /// filesystem mounted at `mount_point`. Unreadable sizes count as no.
    async fn header_space_reserved(
        &self,
        shell: &HostShell<'_>,
        device: &str,
        mount_point: &str,
    ) -> Result<bool, EncryptionError> {
        let device_size = shell.run(&format!("blockdev --getsize64 {}", quote(device))).await?;
        let fs_info = shell.run(&format!("xfs_info {}", quote(mount_point))).await?;
        let device_bytes = device_size
            .is_success()
            .then(|| device_size.stdout.trim().parse::<u64>().ok())
            .flatten();
        let fs_bytes = fs_info.is_success().then(|| xfs_data_bytes(&fs_info.stdout)).flatten();

        match (device_bytes, fs_bytes) {
            (Some(device_bytes), Some(fs_bytes)) => Ok(device_bytes.saturating_sub(fs_bytes) >= XFS_HEADER_BYTES),
            _ => {
                warn!(
                    host = %shell.host(),
                    "Could not compare the size of {} with its filesystem, growing it anyway", device
                );
                Ok(false)
            }
        }
    }

    async fn mount_pass(&self, shell: &HostShell<'_>) -> Result<(), MountPass> {
        let out = shell.run("mount -av").await.map_err(MountPass::Fatal)?;
        match out.exit_code {
            0 => Ok(()),
            MOUNT_PARTIAL_SUCCESS => Err(MountPass::Partial(out)),
            _ => Err(MountPass::Fatal(EncryptionError::preparation(
                format!("mount -a failed: {}", out.describe()),
                "check /etc/fstab and the device mapper state on the host, then mount manually",
            ))),
        }
    }
}

#[async_trait]
impl VolumePreparer for StandardVolumePreparer {
    async fn prepare_before(&self, host: &HostId, info: &MountPointInfo) -> Result<(), EncryptionError> {
        let shell = self.shell(host);
        let device = &info.backing_device_path;
        match info.filesystem_type {
            FilesystemType::Ext4 => {
                self.unmount(&shell, &info.mount_point).await?;
                self.e2fsck(&shell, device).await?;
                self.resize2fs(&shell, device, true).await?;
            }
            FilesystemType::Xfs => {
                if self.header_space_reserved(&shell, device, &info.mount_point).await? {
                    info!(host = %host, "{} already has room for the LUKS header", device);
                } else {
                    shell
                        .run_checked(
                            &format!("lvextend --size {} {}", XFS_HEADER_RESERVATION, quote(device)),
                            |out| {
                                EncryptionError::preparation(
                                    format!("growing {} for the LUKS header failed: {}", device, out.describe()),
                                    "free at least 32 MiB in the volume group and retry",
                                )
                            },
                        )
                        .await?;
                }
                self.unmount(&shell, &info.mount_point).await?;
                self.xfs_repair(&shell, device).await?;
            }
        }
        info!(host = %host, "Prepared {} ({}) for encryption", device, info.filesystem_type);
        Ok(())
    }

    async fn prepare_after(
        &self,
        host: &HostId,
        info: &MountPointInfo,
        new_device_path: &str,
    ) -> Result<(), EncryptionError> {
        let shell = self.shell(host);
        match info.filesystem_type {
            FilesystemType::Ext4 => {
                self.e2fsck(&shell, new_device_path).await?;
                self.resize2fs(&shell, new_device_path, false).await?;
            }
            FilesystemType::Xfs => self.xfs_repair(&shell, new_device_path).await?,
        }
        Ok(())
    }

    async fn remount(&self, host: &HostId, mount_point: &str) -> Result<(), EncryptionError> {
        let shell = self.shell(host);
        let fstab = shell
            .run_checked(&format!("cat {}", FSTAB_PATH), |out| {
                EncryptionError::preparation(
                    format!("cannot read {}: {}", FSTAB_PATH, out.describe()),
                    "verify the host's root filesystem is healthy",
                )
            })
            .await?
            .stdout;
        let passes = count_fstab_references(&fstab, mount_point).max(1) as u32;

        let result = RetryPolicy::new(passes, Duration::ZERO)
            .run_while(
                |pass| {
                    let shell = &shell;
                    async move {
                        if pass > 1 {
                            warn!(host = %shell.host(), "mount -a was partial, pass {}", pass);
                        }
                        self.mount_pass(shell).await
                    }
                },
                |err| matches!(err, MountPass::Partial(_)),
            )
            .await;

        match result {
            Ok(()) => {
                info!(host = %host, "Mounted {} and everything under it", mount_point);
                Ok(())
            }
            Err(MountPass::Fatal(err)) => Err(err),
            Err(MountPass::Partial(out)) => Err(EncryptionError::preparation(
                format!(
                    "{} still not fully mounted after {} passes: {}",
                    mount_point,
                    passes,
                    out.describe()
                ),
                "check the mount order of nested entries in /etc/fstab and mount manually",
            )),
        }
    }
}

/// Size of the xfs data section, from the `data` line of `xfs_info`.
fn xfs_data_bytes(info: &str) -> Option<u64> {
    let line = info.lines().find(|l| l.trim_start().starts_with("data"))?;
    let field = |name: &str| {
        line.split(|c: char| c.is_whitespace() || c == ',')
            .find_map(|w| w.strip_prefix(name))
            .and_then(|v| v.parse::<u64>().ok())
    };
    field("bsize=")?.checked_mul(field("blocks=")?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::remote::simulated::{SimulatedFleet, SimulatedHost};

    fn preparer(fleet: &SimulatedFleet) -> StandardVolumePreparer {
        StandardVolumePreparer::new(
            Arc::new(fleet.clone()),
            Arc::new(EncryptionConfigManifest::default()),
        )
    }

    fn info(device: &str, fstype: FilesystemType) -> MountPointInfo {
        MountPointInfo {
            mount_point: "/u02".into(),
            is_encrypted: false,
            backing_device_path: device.into(),
            filesystem_type: fstype,
            filesystem_label: None,
            underlying_luks_device_path: None,
        }
    }

    #[tokio::test]
    async fn test_ext4_shrinks_after_unmount() {
        let fleet = SimulatedFleet::new();
        let host = HostId::new("vm01");
        fleet.add_host(SimulatedHost::with_data_volume("vm01", "/u02", "/dev/sdb1", "ext4", None));

        preparer(&fleet)
            .prepare_before(&host, &info("/dev/sdb1", FilesystemType::Ext4))
            .await
            .unwrap();

        let snapshot = fleet.host(&host).unwrap();
        assert!(!snapshot.is_mounted("/u02"));
        assert!(snapshot.devices["/dev/sdb1"].shrunk);
        let commands = fleet.commands(&host);
        assert_eq!(
            commands,
            vec!["umount -R /u02", "e2fsck -f -p /dev/sdb1", "resize2fs -M /dev/sdb1"]
        );
    }

    #[tokio::test]
    async fn test_xfs_grows_volume_before_unmount() {
        let fleet = SimulatedFleet::new();
        let host = HostId::new("vm01");
        fleet.add_host(SimulatedHost::with_data_volume("vm01", "/u03", "/dev/mapper/VG-u03", "xfs", None));

        let mut xfs = info("/dev/mapper/VG-u03", FilesystemType::Xfs);
        xfs.mount_point = "/u03".into();
        preparer(&fleet).prepare_before(&host, &xfs).await.unwrap();

        let commands = fleet.commands(&host);
        assert_eq!(commands[0], "blockdev --getsize64 /dev/mapper/VG-u03");
        assert_eq!(commands[1], "xfs_info /u03");
        assert_eq!(commands[2], "lvextend --size +32M /dev/mapper/VG-u03");
        assert_eq!(commands[3], "umount -R /u03");
        assert_eq!(commands[4], "xfs_repair /dev/mapper/VG-u03");
        assert!(fleet.host(&host).unwrap().devices["/dev/mapper/VG-u03"].header_space);
    }

    #[tokio::test]
    async fn test_xfs_with_reserved_header_space_is_not_grown_again() {
        let fleet = SimulatedFleet::new();
        let host = HostId::new("vm01");
        let mut sim = SimulatedHost::with_data_volume("vm01", "/u03", "/dev/mapper/VG-u03", "xfs", None);
        if let Some(device) = sim.devices.get_mut("/dev/mapper/VG-u03") {
            device.header_space = true;
        }
        sim.faults.lvextend_fails = true;
        fleet.add_host(sim);

        let mut xfs = info("/dev/mapper/VG-u03", FilesystemType::Xfs);
        xfs.mount_point = "/u03".into();
        preparer(&fleet).prepare_before(&host, &xfs).await.unwrap();

        assert_eq!(fleet.command_count(&host, "lvextend"), 0);
        assert!(!fleet.host(&host).unwrap().is_mounted("/u03"));
    }

    #[test]
    fn test_xfs_data_bytes() {
        let info = "meta-data=/dev/mapper/VG-u03 isize=512    agcount=4, agsize=655360 blks\n\
                    data     =                       bsize=4096   blocks=2621440, imaxpct=25\n\
                    naming   =version 2              bsize=4096   ascii-ci=0, ftype=1\n";
        assert_eq!(xfs_data_bytes(info), Some(4096 * 2_621_440));
        assert_eq!(xfs_data_bytes("naming =version 2 bsize=4096"), None);
    }

    #[tokio::test]
    async fn test_busy_mount_point_fails_with_resolution() {
        let fleet = SimulatedFleet::new();
        let host = HostId::new("vm01");
        let mut sim = SimulatedHost::with_data_volume("vm01", "/u02", "/dev/sdb1", "ext4", None);
        sim.faults.umount_busy = true;
        fleet.add_host(sim);

        let err = preparer(&fleet)
            .prepare_before(&host, &info("/dev/sdb1", FilesystemType::Ext4))
            .await
            .unwrap_err();
        assert!(matches!(err, EncryptionError::PreparationFailed { .. }));
        assert!(err.resolution().contains("fuser"));
    }

    #[tokio::test]
    async fn test_remount_takes_one_pass_per_fstab_line() {
        let fleet = SimulatedFleet::new();
        let host = HostId::new("vm01");
        let mut sim = SimulatedHost::with_data_volume("vm01", "/u02", "/dev/sdb1", "ext4", None);
        sim.add_volume("/u02/app", "/dev/sdc1", "ext4", None);
        sim.mounts.remove("/u02");
        sim.mounts.remove("/u02/app");
        sim.faults.mount_partial_passes = 1;
        fleet.add_host(sim);

        preparer(&fleet).remount(&host, "/u02").await.unwrap();
        let snapshot = fleet.host(&host).unwrap();
        assert!(snapshot.is_mounted("/u02") && snapshot.is_mounted("/u02/app"));
        assert_eq!(fleet.command_count(&host, "mount -av"), 2);
    }
}
