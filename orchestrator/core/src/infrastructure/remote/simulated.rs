// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Simulated Fleet
//!
//! In-process stand-in for a set of guest hosts. Interprets the exact
//! command lines the workflows send (findmnt, cryptsetup, fstab handling,
//! systemctl, rpm) against a small model of each host's block devices,
//! LUKS headers, mappings, mounts, files and units.
//!
//! Fetcher pipelines are resolved against an [`InMemoryVaultClient`] or an
//! [`InMemoryObjectStore`], so a host only unlocks when the store its
//! fetcher config names actually serves a matching passphrase.
//! Faults can be injected per host to exercise retry and rollback paths.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::domain::host::{CommandOutput, HostId, MOUNT_PARTIAL_SUCCESS};
use crate::domain::mount::FSTAB_PATH;
use crate::domain::remote::{RemoteError, RemoteExecutor};
use crate::domain::secret::{FetcherConfig, KeySource};
use crate::domain::service_unit::{mount_unit_name, SYSTEMD_UNIT_DIR};
use crate::infrastructure::object_store::memory::InMemoryObjectStore;
use crate::infrastructure::vault::memory::InMemoryVaultClient;

const FETCH_FAILED: i32 = 97;
const ROOT_DEVICE: &str = "/dev/mapper/VGExaDb-LVDbSys1";
/// Every simulated filesystem: 2621440 blocks of 4 KiB.
const FS_BLOCK_SIZE: u64 = 4096;
const FS_BLOCKS: u64 = 2_621_440;
const HEADER_SPACE_BYTES: u64 = 32 * 1024 * 1024;

/// Stores a fetcher on a simulated host can read passphrases from.
#[derive(Clone, Copy)]
struct KeyStores<'a> {
    vault: Option<&'a InMemoryVaultClient>,
    objects: Option<&'a InMemoryObjectStore>,
}

impl KeyStores<'_> {
    fn passphrase_for(&self, config: &FetcherConfig) -> Option<String> {
        let passphrase = match (config.key_source, &config.object_store) {
            (KeySource::KmsObjectStore, Some(location)) => {
                self.objects?.passphrase_for(location, &config.secret_name)
            }
            _ => self.vault?.passphrase_for(&config.secret_name, config.version_number),
        };
        passphrase.map(|p| p.expose().to_string())
    }
}

// ============================================================================
// Host model
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LuksHeader {
    pub keys: Vec<String>,
    pub label: Option<String>,
    /// Set while an online reencryption is unfinished
    pub reencrypt_pending: bool,
}

/// A block device and the filesystem on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimDevice {
    pub fstype: String,
    pub label: Option<String>,
    pub luks: Option<LuksHeader>,
    /// ext4 shrunk with `resize2fs -M`
    pub shrunk: bool,
    /// Room for a LUKS header added with `lvextend`
    pub header_space: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimMount {
    pub source: String,
    pub fstype: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimFile {
    pub contents: Vec<u8>,
    pub mode: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimUnit {
    pub enabled: bool,
    pub active: bool,
}

/// Failures a host produces on demand. Counters are consumed as they fire.
#[derive(Debug, Clone, Default)]
pub struct HostFaults {
    pub fetch_failures: u32,
    pub reencrypt_failures: u32,
    /// Reencryptions that write the header, then die before finishing
    pub reencrypt_interruptions: u32,
    pub open_failures: u32,
    pub key_change_failures: u32,
    /// `mount -a` passes that only mount one entry each
    pub mount_partial_passes: u32,
    pub umount_busy: bool,
    pub lvextend_fails: bool,
    /// `copy_file` fails as scp would on a full disk
    pub transfer_fails: bool,
    /// Delay before every command completes
    pub response_delay: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct SimulatedHost {
    pub id: HostId,
    pub reachable: bool,
    /// `systemd-analyze time` calls that report boot still in progress
    pub boot_pending_checks: u32,
    pub devices: BTreeMap<String, SimDevice>,
    /// mapping name -> underlying device
    pub mappings: BTreeMap<String, String>,
    pub mounts: BTreeMap<String, SimMount>,
    pub files: BTreeMap<String, SimFile>,
    pub packages: BTreeMap<String, String>,
    /// rpm file name -> (package, version) it installs
    pub rpm_catalog: BTreeMap<String, (String, String)>,
    pub image_version: Option<String>,
    pub units: BTreeMap<String, SimUnit>,
    pub faults: HostFaults,
    pub log: Vec<String>,
}

impl SimulatedHost {
    /// Booted host with a root filesystem and nothing else.
    pub fn new(id: &str) -> Self {
        let mut host = Self {
            id: HostId::new(id),
            reachable: true,
            boot_pending_checks: 0,
            devices: BTreeMap::new(),
            mappings: BTreeMap::new(),
            mounts: BTreeMap::new(),
            files: BTreeMap::new(),
            packages: BTreeMap::new(),
            rpm_catalog: BTreeMap::new(),
            image_version: Some("23.1.0.0.0".to_string()),
            units: BTreeMap::new(),
            faults: HostFaults::default(),
            log: Vec::new(),
        };
        for package in ["cryptsetup", "cryptsetup-libs"] {
            host.packages.insert(package.to_string(), "2.6.0".to_string());
            host.rpm_catalog.insert(
                format!("{}.rpm", package),
                (package.to_string(), "2.6.0".to_string()),
            );
        }
        host.devices.insert(ROOT_DEVICE.to_string(), plain_device("xfs", None));
        host.mounts.insert(
            "/".to_string(),
            SimMount {
                source: ROOT_DEVICE.to_string(),
                fstype: "xfs".to_string(),
            },
        );
        host.set_fstab(&format!(
            "# /etc/fstab\n{}\t/\txfs\tdefaults\t0 0\n",
            ROOT_DEVICE
        ));
        host
    }

    /// Booted host with one mounted, unencrypted data volume.
    pub fn with_data_volume(
        id: &str,
        mount_point: &str,
        device: &str,
        fstype: &str,
        label: Option<&str>,
    ) -> Self {
        let mut host = Self::new(id);
        host.add_volume(mount_point, device, fstype, label);
        host
    }

    /// Add a mounted volume and its fstab line.
    pub fn add_volume(&mut self, mount_point: &str, device: &str, fstype: &str, label: Option<&str>) {
        self.devices
            .insert(device.to_string(), plain_device(fstype, label));
        self.mounts.insert(
            mount_point.to_string(),
            SimMount {
                source: device.to_string(),
                fstype: fstype.to_string(),
            },
        );
        let fstab = format!(
            "{}{}\t{}\t{}\tdefaults\t1 2\n",
            self.fstab(),
            device,
            mount_point,
            fstype
        );
        self.set_fstab(&fstab);
    }

    pub fn unreachable(id: &str) -> Self {
        let mut host = Self::new(id);
        host.reachable = false;
        host
    }

    pub fn fstab(&self) -> String {
        self.files
            .get(FSTAB_PATH)
            .map(|f| String::from_utf8_lossy(&f.contents).into_owned())
            .unwrap_or_default()
    }

    pub fn set_fstab(&mut self, contents: &str) {
        self.files.insert(
            FSTAB_PATH.to_string(),
            SimFile {
                contents: contents.as_bytes().to_vec(),
                mode: 0o644,
            },
        );
    }

    pub fn is_mounted(&self, mount_point: &str) -> bool {
        self.mounts.contains_key(mount_point)
    }

    /// Passphrases the LUKS header of `device` accepts.
    pub fn luks_keys(&self, device: &str) -> Vec<String> {
        self.devices
            .get(device)
            .and_then(|d| d.luks.as_ref())
            .map(|h| h.keys.clone())
            .unwrap_or_default()
    }

    pub fn file_text(&self, path: &str) -> Option<String> {
        self.files
            .get(path)
            .map(|f| String::from_utf8_lossy(&f.contents).into_owned())
    }

    // ------------------------------------------------------------------------
    // Device resolution
    // ------------------------------------------------------------------------

    /// Raw device holding the filesystem that `path` exposes.
    fn backing_of(&self, path: &str) -> Option<String> {
        if let Some(underlying) = path
            .strip_prefix("/dev/mapper/")
            .and_then(|name| self.mappings.get(name))
        {
            return Some(underlying.clone());
        }
        self.devices.contains_key(path).then(|| path.to_string())
    }

    fn is_mapped(&self, path: &str) -> bool {
        path.strip_prefix("/dev/mapper/")
            .is_some_and(|name| self.mappings.contains_key(name))
    }

    /// Whether `path` exposes a filesystem (an open mapping, or a device
    /// without a LUKS header).
    fn has_filesystem(&self, path: &str) -> bool {
        if self.is_mapped(path) {
            return true;
        }
        self.devices.get(path).is_some_and(|d| d.luks.is_none())
    }

    fn mounted_from(&self, path: &str) -> bool {
        self.mounts.values().any(|m| m.source == path)
            || self.mappings.iter().any(|(name, device)| {
                device == path && self.mounted_from(&format!("/dev/mapper/{}", name))
            })
    }

    // ------------------------------------------------------------------------
    // Interpreter
    // ------------------------------------------------------------------------

    fn exec(&mut self, command: &str, stores: KeyStores<'_>) -> CommandOutput {
        self.log.push(command.to_string());
        let words = shell_words(command);
        if words.len() == 3 && words[0] == "bash" && words[1] == "-c" {
            return self.run_script(&words[2], stores);
        }
        if command.contains(" && ") {
            let mut output = CommandOutput::success("");
            for part in command.split(" && ") {
                output = self.run(&shell_words(part), None);
                if !output.is_success() {
                    break;
                }
            }
            return output;
        }
        self.run(&words, None)
    }

    fn run_script(&mut self, script: &str, stores: KeyStores<'_>) -> CommandOutput {
        let mut body = script;
        if let Some(rest) = body.strip_prefix("export SSL_CERT_FILE=") {
            body = rest.split_once("; ").map(|(_, b)| b).unwrap_or(rest);
        }
        let unit_form = body.starts_with("set -o pipefail; ");
        body = body.strip_prefix("set -o pipefail; ").unwrap_or(body);

        if let Some(rest) = body.strip_prefix("cryptsetup luksChangeKey --batch-mode ") {
            return self.key_change(rest, stores);
        }

        let Some((fetch, consumer)) = body.split_once(" | ") else {
            return CommandOutput::failure(127, format!("bash: unsupported script: {}", script));
        };
        let consumer = consumer.split("; rc=").next().unwrap_or(consumer);
        let passphrase = match self.fetch(fetch, stores) {
            Ok(passphrase) => passphrase,
            Err(cause) if unit_form => return CommandOutput::failure(1, cause),
            Err(cause) => return CommandOutput::failure(FETCH_FAILED, cause),
        };
        self.run(&shell_words(consumer), Some(&passphrase))
    }

    /// Output of a fetch command, i.e. the passphrase it would print.
    fn fetch(&mut self, fetch: &str, stores: KeyStores<'_>) -> Result<String, String> {
        let words = shell_words(fetch);
        match words.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
            ["cat", path] => self
                .file_text(path)
                .map(|t| t.trim().to_string())
                .ok_or_else(|| format!("cat: {}: No such file or directory", path)),
            [fetcher, "fetch", "-i", config] => {
                if !self.files.contains_key(*fetcher) {
                    return Err(format!("{}: command not found", fetcher));
                }
                if self.faults.fetch_failures > 0 {
                    self.faults.fetch_failures -= 1;
                    return Err("keyapi: vault endpoint unreachable".to_string());
                }
                let raw = self
                    .files
                    .get(*config)
                    .ok_or_else(|| format!("keyapi: cannot read {}", config))?;
                let config: FetcherConfig = serde_json::from_slice(&raw.contents)
                    .map_err(|e| format!("keyapi: bad config: {}", e))?;
                stores
                    .passphrase_for(&config)
                    .ok_or_else(|| format!("keyapi: secret {} not found", config.secret_name))
            }
            _ => Err(format!("unsupported fetch command: {}", fetch)),
        }
    }

    fn key_change(&mut self, rest: &str, stores: KeyStores<'_>) -> CommandOutput {
        let parsed = rest.split_once(" --key-file=<(").and_then(|(device, tail)| {
            let (old, new) = tail.split_once(") <(")?;
            Some((device.to_string(), old.to_string(), new.strip_suffix(')')?.to_string()))
        });
        let Some((device, old, new)) = parsed else {
            return CommandOutput::failure(1, "luksChangeKey: bad arguments");
        };
        let (old, new) = match (self.fetch(&old, stores), self.fetch(&new, stores)) {
            (Ok(old), Ok(new)) => (old, new),
            _ => return CommandOutput::failure(2, "No key available with this passphrase."),
        };
        if self.faults.key_change_failures > 0 {
            self.faults.key_change_failures -= 1;
            return CommandOutput::failure(1, "Keyslot operation failed.");
        }
        let Some(header) = self.devices.get_mut(&device).and_then(|d| d.luks.as_mut()) else {
            return CommandOutput::failure(1, format!("Device {} is not a valid LUKS device.", device));
        };
        match header.keys.iter().position(|k| *k == old) {
            Some(slot) => {
                header.keys[slot] = new;
                CommandOutput::success("")
            }
            None => CommandOutput::failure(2, "No key available with this passphrase."),
        }
    }

    fn run(&mut self, words: &[String], stdin: Option<&str>) -> CommandOutput {
        let args: Vec<&str> = words.iter().map(String::as_str).collect();
        match args.as_slice() {
            ["systemd-analyze", "time"] => {
                if self.boot_pending_checks > 0 {
                    self.boot_pending_checks -= 1;
                    CommandOutput::failure(1, "Bootup is not yet finished.")
                } else {
                    CommandOutput::success("Startup finished in 12.3s (kernel) + 40.1s (userspace)\n")
                }
            }
            ["findmnt", "-rno", "SOURCE,FSTYPE,LABEL", mount_point] => self.findmnt(mount_point),
            ["blkid", "-s", "LABEL", "-o", "value", device] => {
                let label = self.backing_of(device).and_then(|d| {
                    let dev = &self.devices[&d];
                    match (&dev.luks, self.is_mapped(device)) {
                        (Some(header), false) => header.label.clone(),
                        _ => dev.label.clone(),
                    }
                });
                match label {
                    Some(label) => CommandOutput::success(format!("{}\n", label)),
                    None => CommandOutput::failure(2, ""),
                }
            }
            ["blkid", "-t", "TYPE=crypto_LUKS", "-o", "device"] => CommandOutput::success(
                self.devices
                    .iter()
                    .filter(|(_, d)| d.luks.is_some())
                    .map(|(p, _)| format!("{}\n", p))
                    .collect::<String>(),
            ),
            ["lsblk", "-rno", "TYPE", device] => {
                if self.is_mapped(device) {
                    CommandOutput::success("crypt\n")
                } else if self.devices.contains_key(*device) {
                    CommandOutput::success("lvm\n")
                } else {
                    CommandOutput::failure(32, format!("lsblk: {}: not a block device", device))
                }
            }
            ["lsblk", "-nprso", "NAME", device] => match self.backing_of(device) {
                Some(parent) if self.is_mapped(device) => {
                    CommandOutput::success(format!("{}\n{}\n", device, parent))
                }
                Some(_) => CommandOutput::success(format!("{}\n", device)),
                None => CommandOutput::failure(32, format!("lsblk: {}: not a block device", device)),
            },
            ["rpm", "-q", "--queryformat", "%{VERSION}", package] => match self.packages.get(*package) {
                Some(version) => CommandOutput::success(version.clone()),
                None => CommandOutput::failure(1, format!("package {} is not installed", package)),
            },
            ["rpm", "-ivh", "--force", path] => {
                if !self.files.contains_key(*path) {
                    return CommandOutput::failure(1, format!("error: open of {} failed", path));
                }
                let file = path.rsplit('/').next().unwrap_or(path);
                match self.rpm_catalog.get(file).cloned() {
                    Some((package, version)) => {
                        self.packages.insert(package, version);
                        CommandOutput::success("")
                    }
                    None => CommandOutput::failure(1, format!("error: {} is not an RPM package", path)),
                }
            }
            ["imageinfo", "-ver"] => match &self.image_version {
                Some(version) => CommandOutput::success(format!("{}\n", version)),
                None => CommandOutput::failure(127, "imageinfo: command not found"),
            },
            ["lvextend", "--size", "+32M", device] => {
                if self.faults.lvextend_fails {
                    return CommandOutput::failure(5, "Insufficient free space in volume group");
                }
                match self.devices.get_mut(*device) {
                    Some(dev) => {
                        dev.header_space = true;
                        CommandOutput::success("")
                    }
                    None => CommandOutput::failure(5, format!("Volume {} not found", device)),
                }
            }
            ["blockdev", "--getsize64", device] => match self.devices.get(*device) {
                Some(dev) => {
                    let extra = if dev.header_space { HEADER_SPACE_BYTES } else { 0 };
                    CommandOutput::success(format!("{}\n", FS_BLOCK_SIZE * FS_BLOCKS + extra))
                }
                None => CommandOutput::failure(1, format!("blockdev: cannot open {}", device)),
            },
            ["xfs_info", mount_point] => match self.mounts.get(*mount_point) {
                Some(mount) if mount.fstype == "xfs" => CommandOutput::success(format!(
                    "meta-data={} isize=512    agcount=4, agsize=655360 blks\n\
                     data     =                       bsize={}   blocks={}, imaxpct=25\n\
                     naming   =version 2              bsize=4096   ascii-ci=0, ftype=1\n",
                    mount.source, FS_BLOCK_SIZE, FS_BLOCKS
                )),
                _ => CommandOutput::failure(1, format!("xfs_info: {} is not a mounted XFS filesystem", mount_point)),
            },
            ["umount", "-R", mount_point] => {
                if self.faults.umount_busy {
                    return CommandOutput::failure(32, format!("umount: {}: target is busy.", mount_point));
                }
                if !self.mounts.contains_key(*mount_point) {
                    return CommandOutput::failure(32, format!("umount: {}: not mounted.", mount_point));
                }
                let nested = format!("{}/", mount_point.trim_end_matches('/'));
                self.mounts
                    .retain(|mp, _| mp != mount_point && !mp.starts_with(&nested));
                CommandOutput::success("")
            }
            ["e2fsck", "-f", "-p", device] | ["xfs_repair", device] => self.offline_check(device),
            ["resize2fs", "-M", device] => self.resize(device, true),
            ["resize2fs", device] => self.resize(device, false),
            ["cryptsetup", "reencrypt", "--encrypt", device, "--type", "luks2", "--reduce-device-size", "8192S", "--key-file=-"] => {
                self.reencrypt(device, stdin)
            }
            ["cryptsetup", "reencrypt", "--resume-only", device, "--key-file=-"] => self.resume_reencrypt(device, stdin),
            ["cryptsetup", "luksDump", device] => match self.devices.get(*device).and_then(|d| d.luks.as_ref()) {
                Some(header) => {
                    let requirements = if header.reencrypt_pending { "online-reencrypt" } else { "(no flag)" };
                    CommandOutput::success(format!(
                        "LUKS header information\nVersion:       \t2\nLabel:         \t{}\nRequirements:  \t{}\n\nKeyslots:\n",
                        header.label.as_deref().unwrap_or("(no label)"),
                        requirements
                    ))
                }
                None => CommandOutput::failure(1, format!("Device {} is not a valid LUKS device.", device)),
            },
            ["cryptsetup", "open", rest @ ..] => self.open(rest, stdin),
            ["cryptsetup", "config", device, "--label", label] => {
                match self.devices.get_mut(*device).and_then(|d| d.luks.as_mut()) {
                    Some(header) => {
                        header.label = Some(label.to_string());
                        CommandOutput::success("")
                    }
                    None => CommandOutput::failure(1, format!("Device {} is not a valid LUKS device.", device)),
                }
            }
            ["cryptsetup", "close", name] => {
                if !self.mappings.contains_key(*name) {
                    return CommandOutput::failure(4, format!("Device {} is not active.", name));
                }
                if self.mounts.values().any(|m| m.source == format!("/dev/mapper/{}", name)) {
                    return CommandOutput::failure(5, format!("Device {} is still in use.", name));
                }
                self.mappings.remove(*name);
                CommandOutput::success("")
            }
            ["cryptsetup", "status", name] => match self.mappings.get(*name) {
                Some(device) => CommandOutput::success(format!(
                    "/dev/mapper/{} is active.\n  type:    LUKS2\n  cipher:  aes-xts-plain64\n  device:  {}\n",
                    name, device
                )),
                None => CommandOutput::failure(4, format!("/dev/mapper/{} is inactive.", name)),
            },
            ["cryptsetup", "isLuks", device] => {
                if self.devices.get(*device).is_some_and(|d| d.luks.is_some()) {
                    CommandOutput::success("")
                } else {
                    CommandOutput::failure(1, "")
                }
            }
            ["cat", path] => match self.file_text(path) {
                Some(text) => CommandOutput::success(text),
                None => CommandOutput::failure(1, format!("cat: {}: No such file or directory", path)),
            },
            ["cp", "-p", from, to] => match self.files.get(*from).cloned() {
                Some(file) => {
                    self.files.insert(to.to_string(), file);
                    CommandOutput::success("")
                }
                None => CommandOutput::failure(1, format!("cp: cannot stat '{}'", from)),
            },
            ["mount", "-fav"] => self.mount_all(true),
            ["mount", "-av"] => self.mount_all(false),
            ["systemctl", "is-active", unit] => {
                let active = if unit.ends_with(".mount") {
                    self.mounts.keys().any(|mp| mount_unit_name(mp) == *unit)
                } else {
                    self.units.get(*unit).is_some_and(|u| u.active)
                };
                if active {
                    CommandOutput::success("active\n")
                } else {
                    CommandOutput {
                        stdout: "inactive\n".to_string(),
                        stderr: String::new(),
                        exit_code: 3,
                    }
                }
            }
            ["systemctl", "daemon-reload"] => {
                let prefix = format!("{}/", SYSTEMD_UNIT_DIR);
                let names: Vec<String> = self
                    .files
                    .keys()
                    .filter_map(|p| p.strip_prefix(&prefix))
                    .filter(|n| n.ends_with(".service"))
                    .map(str::to_string)
                    .collect();
                for name in names {
                    self.units.entry(name).or_default();
                }
                CommandOutput::success("")
            }
            ["systemctl", "enable", unit] => match self.units.get_mut(*unit) {
                Some(u) => {
                    u.enabled = true;
                    CommandOutput::success("")
                }
                None => CommandOutput::failure(1, format!("Failed to enable unit: Unit file {} does not exist.", unit)),
            },
            ["systemctl", "disable", unit] => {
                if let Some(u) = self.units.get_mut(*unit) {
                    u.enabled = false;
                }
                CommandOutput::success("")
            }
            ["test", "-e", path] => {
                if self.files.contains_key(*path) || self.devices.contains_key(*path) {
                    CommandOutput::success("")
                } else {
                    CommandOutput::failure(1, "")
                }
            }
            ["mkdir", "-p", _] => CommandOutput::success(""),
            ["chown", "root:root", path] => {
                if self.files.contains_key(*path) {
                    CommandOutput::success("")
                } else {
                    CommandOutput::failure(1, format!("chown: cannot access '{}'", path))
                }
            }
            ["chmod", mode, path] => {
                let Ok(mode) = u32::from_str_radix(mode, 8) else {
                    return CommandOutput::failure(1, format!("chmod: invalid mode: '{}'", mode));
                };
                match self.files.get_mut(*path) {
                    Some(file) => {
                        file.mode = mode;
                        CommandOutput::success("")
                    }
                    None => CommandOutput::failure(1, format!("chmod: cannot access '{}'", path)),
                }
            }
            ["rm", "-f", path] => {
                self.files.remove(*path);
                CommandOutput::success("")
            }
            _ => CommandOutput::failure(127, format!("simulated host: unsupported command: {}", words.join(" "))),
        }
    }

    fn findmnt(&self, mount_point: &str) -> CommandOutput {
        let Some(mount) = self.mounts.get(mount_point) else {
            return CommandOutput::failure(1, "");
        };
        let label = self
            .backing_of(&mount.source)
            .and_then(|d| self.devices[&d].label.clone())
            .unwrap_or_default();
        CommandOutput::success(format!("{} {} {}\n", mount.source, mount.fstype, label))
    }

    fn offline_check(&self, device: &str) -> CommandOutput {
        if !self.has_filesystem(device) {
            return CommandOutput::failure(8, format!("{}: no filesystem found", device));
        }
        if self.mounts.values().any(|m| m.source == device) {
            return CommandOutput::failure(8, format!("{} is mounted.", device));
        }
        CommandOutput::success("")
    }

    fn resize(&mut self, device: &str, shrink: bool) -> CommandOutput {
        let check = self.offline_check(device);
        if !check.is_success() {
            return check;
        }
        match self.backing_of(device).and_then(|d| self.devices.get_mut(&d)) {
            Some(dev) => {
                dev.shrunk = shrink;
                CommandOutput::success("")
            }
            None => CommandOutput::failure(1, format!("resize2fs: {} not found", device)),
        }
    }

    fn reencrypt(&mut self, device: &str, stdin: Option<&str>) -> CommandOutput {
        let Some(passphrase) = stdin.filter(|p| !p.is_empty()) else {
            return CommandOutput::failure(1, "Nothing to read on input.");
        };
        if self.mounted_from(device) {
            return CommandOutput::failure(5, format!("Device {} is in use.", device));
        }
        if self.faults.reencrypt_failures > 0 {
            self.faults.reencrypt_failures -= 1;
            return CommandOutput::failure(1, "Reencryption initialization failed.");
        }
        let Some(dev) = self.devices.get_mut(device) else {
            return CommandOutput::failure(4, format!("Device {} does not exist.", device));
        };
        if dev.luks.is_some() {
            return CommandOutput::failure(1, format!("Device {} is already LUKS device.", device));
        }
        let has_room = match dev.fstype.as_str() {
            "ext4" => dev.shrunk,
            _ => dev.header_space,
        };
        if !has_room {
            return CommandOutput::failure(1, "Device is too small to fit the LUKS header.");
        }
        let interrupted = self.faults.reencrypt_interruptions > 0;
        if interrupted {
            self.faults.reencrypt_interruptions -= 1;
        }
        if let Some(dev) = self.devices.get_mut(device) {
            dev.luks = Some(LuksHeader {
                keys: vec![passphrase.to_string()],
                label: None,
                reencrypt_pending: interrupted,
            });
        }
        if interrupted {
            return CommandOutput::failure(1, "Reencryption was interrupted.");
        }
        CommandOutput::success("")
    }

    fn resume_reencrypt(&mut self, device: &str, stdin: Option<&str>) -> CommandOutput {
        let Some(header) = self.devices.get_mut(device).and_then(|d| d.luks.as_mut()) else {
            return CommandOutput::failure(1, format!("Device {} is not a valid LUKS device.", device));
        };
        if !header.reencrypt_pending {
            return CommandOutput::failure(1, format!("Device {} is not in reencryption.", device));
        }
        if !stdin.is_some_and(|p| header.keys.iter().any(|k| k == p)) {
            return CommandOutput::failure(2, "No key available with this passphrase.");
        }
        header.reencrypt_pending = false;
        CommandOutput::success("")
    }

    fn open(&mut self, args: &[&str], stdin: Option<&str>) -> CommandOutput {
        let mut positional = Vec::new();
        let mut test_only = false;
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            match *arg {
                "--type" => {
                    iter.next();
                }
                "--test-passphrase" => test_only = true,
                a if a.starts_with("--") => {}
                a => positional.push(a),
            }
        }
        let Some(device) = positional.first() else {
            return CommandOutput::failure(1, "cryptsetup open: missing device");
        };
        let keys = self.luks_keys(device);
        if keys.is_empty() {
            return CommandOutput::failure(1, format!("Device {} is not a valid LUKS device.", device));
        }
        if !stdin.is_some_and(|p| keys.iter().any(|k| k == p)) {
            return CommandOutput::failure(2, "No key available with this passphrase.");
        }
        if test_only {
            return CommandOutput::success("");
        }
        let Some(name) = positional.get(1) else {
            return CommandOutput::failure(1, "cryptsetup open: missing mapping name");
        };
        if self
            .devices
            .get(*device)
            .and_then(|d| d.luks.as_ref())
            .is_some_and(|h| h.reencrypt_pending)
        {
            return CommandOutput::failure(1, "Device requires reencryption recovery. Run repair first.");
        }
        if self.faults.open_failures > 0 {
            self.faults.open_failures -= 1;
            return CommandOutput::failure(5, "Cannot use device, already in use.");
        }
        if self.mappings.contains_key(*name) {
            return CommandOutput::failure(5, format!("Device {} already exists.", name));
        }
        self.mappings.insert(name.to_string(), device.to_string());
        CommandOutput::success("")
    }

    fn mount_all(&mut self, fake: bool) -> CommandOutput {
        let entries: Vec<(String, String, String)> = self
            .fstab()
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .filter_map(|l| {
                let f: Vec<&str> = l.split_whitespace().collect();
                (f.len() >= 3 && f[2] != "swap")
                    .then(|| (f[0].to_string(), f[1].to_string(), f[2].to_string()))
            })
            .collect();

        let mountable = |host: &Self, source: &str| !source.starts_with("/dev/") || host.has_filesystem(source);

        if fake {
            return match entries.iter().find(|(source, _, _)| !mountable(self, source)) {
                Some((source, target, _)) => CommandOutput::failure(
                    32,
                    format!("mount: {}: special device {} does not exist.", target, source),
                ),
                None => CommandOutput::success(""),
            };
        }

        let single_pass = self.faults.mount_partial_passes > 0;
        let mut mounted = 0;
        let mut missing = 0;
        for (source, target, fstype) in entries {
            if self.mounts.contains_key(&target) {
                continue;
            }
            if (single_pass && mounted > 0) || !mountable(self, &source) {
                missing += 1;
                continue;
            }
            self.mounts.insert(target, SimMount { source, fstype });
            mounted += 1;
        }
        if single_pass {
            self.faults.mount_partial_passes -= 1;
        }

        match (mounted, missing) {
            (_, 0) => CommandOutput::success(""),
            (0, _) => CommandOutput::failure(32, "mount: some filesystems could not be mounted"),
            _ => CommandOutput::failure(MOUNT_PARTIAL_SUCCESS, "mount: some filesystems were not mounted"),
        }
    }

    /// Power-cycle: drop every data mount and mapping, run the enabled
    /// unlock units, then mount everything fstab lists.
    fn reboot(&mut self, stores: KeyStores<'_>) {
        self.mounts.retain(|mp, _| mp == "/");
        self.mappings.clear();
        let enabled: Vec<String> = self
            .units
            .iter()
            .filter(|(_, u)| u.enabled)
            .map(|(n, _)| n.clone())
            .collect();
        for name in enabled {
            let started = self
                .unit_exec_start(&name)
                .map(|exec| {
                    let words = shell_words(exec.trim_start_matches("/bin/"));
                    words.len() == 3 && self.run_script(&words[2], stores).is_success()
                })
                .unwrap_or(false);
            if let Some(unit) = self.units.get_mut(&name) {
                unit.active = started;
            }
        }
        for _ in 0..=self.fstab().lines().count() {
            if self.mount_all(false).exit_code != MOUNT_PARTIAL_SUCCESS {
                break;
            }
        }
    }

    fn unit_exec_start(&self, unit: &str) -> Option<String> {
        self.file_text(&format!("{}/{}", SYSTEMD_UNIT_DIR, unit))?
            .lines()
            .find_map(|l| l.strip_prefix("ExecStart="))
            .map(str::to_string)
    }
}

fn plain_device(fstype: &str, label: Option<&str>) -> SimDevice {
    SimDevice {
        fstype: fstype.to_string(),
        label: label.map(str::to_string),
        luks: None,
        shrunk: false,
        header_space: false,
    }
}

/// Split a command line into words, honouring single quotes and
/// backslash escapes.
fn shell_words(line: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                for quoted in chars.by_ref() {
                    if quoted == '\'' {
                        break;
                    }
                    current.push(quoted);
                }
            }
            '\\' => {
                in_word = true;
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words
}

// ============================================================================
// Fleet
// ============================================================================

/// Shared handle to every simulated host. Clones see the same hosts.
#[derive(Clone, Default)]
pub struct SimulatedFleet {
    hosts: Arc<Mutex<BTreeMap<HostId, SimulatedHost>>>,
    vault: Option<Arc<InMemoryVaultClient>>,
    objects: Option<Arc<InMemoryObjectStore>>,
}

impl SimulatedFleet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve fetcher pipelines against `vault`.
    pub fn with_vault(mut self, vault: Arc<InMemoryVaultClient>) -> Self {
        self.vault = Some(vault);
        self
    }

    /// Resolve KMS_OBJECT_STORE fetcher configs against `objects`.
    pub fn with_object_store(mut self, objects: Arc<InMemoryObjectStore>) -> Self {
        self.objects = Some(objects);
        self
    }

    fn stores(&self) -> KeyStores<'_> {
        KeyStores {
            vault: self.vault.as_deref(),
            objects: self.objects.as_deref(),
        }
    }

    pub fn add_host(&self, host: SimulatedHost) {
        self.hosts.lock().insert(host.id.clone(), host);
    }

    /// Snapshot of a host's current state.
    pub fn host(&self, id: &HostId) -> Option<SimulatedHost> {
        self.hosts.lock().get(id).cloned()
    }

    /// Mutate a host in place, e.g. to inject faults between runs.
    pub fn with_host<T>(&self, id: &HostId, f: impl FnOnce(&mut SimulatedHost) -> T) -> Option<T> {
        self.hosts.lock().get_mut(id).map(f)
    }

    pub fn commands(&self, id: &HostId) -> Vec<String> {
        self.hosts
            .lock()
            .get(id)
            .map(|h| h.log.clone())
            .unwrap_or_default()
    }

    pub fn command_count(&self, id: &HostId, prefix: &str) -> usize {
        self.commands(id)
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn reboot(&self, id: &HostId) {
        let stores = self.stores();
        if let Some(host) = self.hosts.lock().get_mut(id) {
            host.reboot(stores);
        }
    }

    fn unreachable(id: &HostId) -> RemoteError {
        RemoteError::Unreachable {
            host: id.clone(),
            cause: "ssh: connect to host port 22: No route to host".to_string(),
        }
    }

    fn delay(&self, id: &HostId) -> Result<Option<Duration>, RemoteError> {
        match self.hosts.lock().get(id) {
            Some(host) if host.reachable => Ok(host.faults.response_delay),
            _ => Err(Self::unreachable(id)),
        }
    }
}

#[async_trait]
impl RemoteExecutor for SimulatedFleet {
    async fn execute(
        &self,
        host: &HostId,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, RemoteError> {
        if let Some(delay) = self.delay(host)? {
            if delay > timeout {
                tokio::time::sleep(timeout).await;
                return Err(RemoteError::Timeout {
                    host: host.clone(),
                    timeout,
                });
            }
            tokio::time::sleep(delay).await;
        }
        let stores = self.stores();
        let mut hosts = self.hosts.lock();
        let sim = hosts.get_mut(host).ok_or_else(|| Self::unreachable(host))?;
        Ok(sim.exec(command, stores))
    }

    async fn copy_file(
        &self,
        host: &HostId,
        local_path: &Path,
        remote_path: &str,
    ) -> Result<(), RemoteError> {
        self.delay(host)?;
        let mut hosts = self.hosts.lock();
        let sim = hosts.get_mut(host).ok_or_else(|| Self::unreachable(host))?;
        sim.log
            .push(format!("copy {} -> {}", local_path.display(), remote_path));
        if sim.faults.transfer_fails {
            return Err(RemoteError::Transfer {
                host: host.clone(),
                path: remote_path.to_string(),
                cause: format!("scp: {}: No space left on device", remote_path),
            });
        }
        sim.files.insert(
            remote_path.to_string(),
            SimFile {
                contents: local_path.display().to_string().into_bytes(),
                mode: 0o644,
            },
        );
        Ok(())
    }

    async fn write_file(
        &self,
        host: &HostId,
        remote_path: &str,
        contents: &[u8],
        mode: u32,
    ) -> Result<(), RemoteError> {
        self.delay(host)?;
        let mut hosts = self.hosts.lock();
        let sim = hosts.get_mut(host).ok_or_else(|| Self::unreachable(host))?;
        sim.log.push(format!("write {}", remote_path));
        sim.files.insert(
            remote_path.to_string(),
            SimFile {
                contents: contents.to_vec(),
                mode,
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_words() {
        assert_eq!(
            shell_words(r"bash -c 'echo it'\''s' x"),
            vec!["bash", "-c", "echo it's", "x"]
        );
        assert_eq!(
            shell_words("rpm -q --queryformat '%{VERSION}' cryptsetup"),
            vec!["rpm", "-q", "--queryformat", "%{VERSION}", "cryptsetup"]
        );
    }

    #[tokio::test]
    async fn test_findmnt_and_unmount() {
        let fleet = SimulatedFleet::new();
        let id = HostId::new("vm01");
        fleet.add_host(SimulatedHost::with_data_volume("vm01", "/u02", "/dev/sdb1", "ext4", Some("DATA")));
        let t = Duration::from_secs(1);

        let out = fleet.execute(&id, "findmnt -rno SOURCE,FSTYPE,LABEL /u02", t).await.unwrap();
        assert_eq!(out.stdout, "/dev/sdb1 ext4 DATA\n");

        assert!(fleet.execute(&id, "umount -R /u02", t).await.unwrap().is_success());
        let out = fleet.execute(&id, "findmnt -rno SOURCE,FSTYPE,LABEL /u02", t).await.unwrap();
        assert_eq!(out.exit_code, 1);

        let out = fleet.execute(&id, "mount -av", t).await.unwrap();
        assert!(out.is_success());
        assert!(fleet.host(&id).unwrap().is_mounted("/u02"));
    }

    #[tokio::test]
    async fn test_pipeline_reports_fetch_failure() {
        let fleet = SimulatedFleet::new();
        let id = HostId::new("vm01");
        fleet.add_host(SimulatedHost::with_data_volume("vm01", "/u02", "/dev/sdb1", "ext4", None));
        let script = r#"bash -c '/k/keyapi fetch -i /k/config.json | cryptsetup isLuks /dev/sdb1; rc=("${PIPESTATUS[@]}"); if [ "${rc[0]}" -ne 0 ]; then exit 97; fi; exit "${rc[1]}"'"#;
        let out = fleet.execute(&id, script, Duration::from_secs(1)).await.unwrap();
        assert_eq!(out.exit_code, FETCH_FAILED);
    }

    #[tokio::test]
    async fn test_interrupted_reencrypt_leaves_a_resumable_header() {
        let fleet = SimulatedFleet::new();
        let id = HostId::new("vm01");
        let mut sim = SimulatedHost::new("vm01");
        sim.devices.insert(
            "/dev/sdc1".to_string(),
            SimDevice {
                header_space: true,
                ..plain_device("xfs", None)
            },
        );
        sim.files.insert(
            "/root/pass".to_string(),
            SimFile {
                contents: b"pw\n".to_vec(),
                mode: 0o600,
            },
        );
        sim.faults.reencrypt_interruptions = 1;
        fleet.add_host(sim);
        let t = Duration::from_secs(1);

        let encrypt = "bash -c 'cat /root/pass | cryptsetup reencrypt --encrypt /dev/sdc1 --type luks2 --reduce-device-size 8192S --key-file=-'";
        assert!(!fleet.execute(&id, encrypt, t).await.unwrap().is_success());
        let dump = fleet.execute(&id, "cryptsetup luksDump /dev/sdc1", t).await.unwrap();
        assert!(dump.stdout.contains("online-reencrypt"));
        let open = "bash -c 'cat /root/pass | cryptsetup open --type luks2 --key-file=- /dev/sdc1 sdc1-crypt'";
        assert!(!fleet.execute(&id, open, t).await.unwrap().is_success());

        let resume = "bash -c 'cat /root/pass | cryptsetup reencrypt --resume-only /dev/sdc1 --key-file=-'";
        assert!(fleet.execute(&id, resume, t).await.unwrap().is_success());
        let dump = fleet.execute(&id, "cryptsetup luksDump /dev/sdc1", t).await.unwrap();
        assert!(!dump.stdout.contains("online-reencrypt"));
        assert!(fleet.execute(&id, open, t).await.unwrap().is_success());
    }

    #[tokio::test]
    async fn test_unreachable_host() {
        let fleet = SimulatedFleet::new();
        fleet.add_host(SimulatedHost::unreachable("vm09"));
        let err = fleet
            .execute(&HostId::new("vm09"), "true", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Unreachable { .. }));
    }
}
