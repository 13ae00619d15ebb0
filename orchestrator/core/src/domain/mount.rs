// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Mount Point Domain Model
//!
//! Snapshot of a mount point and the pure text transformations applied to a
//! host's `/etc/fstab` during encryption:
//!
//! - [`MountPointInfo`] is built fresh on every inspection
//! - [`rewrite_fstab`] swaps the top-level source for the mapped device and
//!   adds `_netdev,nofail` to every line under the mount point
//! - device-mapper naming helpers

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const FSTAB_PATH: &str = "/etc/fstab";
pub const FSTAB_BACKUP_PATH: &str = "/etc/fstab.fleetcrypt.bak";
pub const DEVICE_MAPPER_DIR: &str = "/dev/mapper";

const MAPPING_SUFFIX: &str = "-crypt";
const NETWORK_DEPENDENT_OPTION: &str = "_netdev";
const NON_FATAL_OPTION: &str = "nofail";

// ============================================================================
// Value Objects
// ============================================================================

/// Filesystems the workflow knows how to shrink/grow around a LUKS header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilesystemType {
    Ext4,
    Xfs,
}

impl FilesystemType {
    /// Parse the FSTYPE column reported by `findmnt`.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "ext4" => Some(Self::Ext4),
            "xfs" => Some(Self::Xfs),
            _ => None,
        }
    }
}

impl std::fmt::Display for FilesystemType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ext4 => write!(f, "ext4"),
            Self::Xfs => write!(f, "xfs"),
        }
    }
}

/// Immutable snapshot of a mount point at inspection time.
///
/// Never cached across workflow steps: device paths change once the volume
/// is encrypted and re-opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountPointInfo {
    pub mount_point: String,
    pub is_encrypted: bool,
    pub backing_device_path: String,
    pub filesystem_type: FilesystemType,
    pub filesystem_label: Option<String>,
    /// LUKS container under the mapped device; only set when encrypted.
    pub underlying_luks_device_path: Option<String>,
}

impl MountPointInfo {
    /// Device-mapper name the encrypted volume will be opened as.
    pub fn mapping_name(&self) -> String {
        mapping_name_for(&self.backing_device_path)
    }

    pub fn mapped_device_path(&self) -> String {
        mapped_device_path_for(&self.backing_device_path)
    }

    /// LUKS header label derived from the filesystem label.
    pub fn luks_label(&self) -> Option<String> {
        self.filesystem_label
            .as_ref()
            .map(|label| format!("{}{}", label, MAPPING_SUFFIX))
    }
}

/// `/dev/mapper/VGExaDb-LVu02` -> `VGExaDb-LVu02-crypt`
pub fn mapping_name_for(device_path: &str) -> String {
    let base = device_path
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(device_path);
    format!("{}{}", base, MAPPING_SUFFIX)
}

pub fn mapped_device_path_for(device_path: &str) -> String {
    format!("{}/{}", DEVICE_MAPPER_DIR, mapping_name_for(device_path))
}

/// True for paths that look like a mapping this workflow created.
pub fn is_workflow_mapping(device_path: &str) -> bool {
    device_path.starts_with(DEVICE_MAPPER_DIR) && device_path.ends_with(MAPPING_SUFFIX)
}

/// Mapping name of a mapped device path (`/dev/mapper/x-crypt` -> `x-crypt`).
pub fn mapping_name_of(mapped_path: &str) -> &str {
    mapped_path.rsplit('/').next().unwrap_or(mapped_path)
}

/// Split one line of `findmnt -rno SOURCE,FSTYPE,LABEL` output.
///
/// The label column is empty for unlabeled filesystems, which in raw mode
/// leaves only two tokens on the line.
pub fn parse_findmnt_line(line: &str) -> Option<(String, String, Option<String>)> {
    let mut fields = line.split_whitespace();
    let source = fields.next()?;
    let fstype = fields.next()?;
    let label = fields
        .next()
        .map(unescape_findmnt)
        .filter(|l| !l.is_empty());
    Some((unescape_findmnt(source), fstype.to_string(), label))
}

/// findmnt raw output escapes blanks and other bytes as `\xHH`.
fn unescape_findmnt(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() && bytes[i + 1] == b'x' {
            let decoded = std::str::from_utf8(&bytes[i + 2..i + 4])
                .ok()
                .and_then(|hex| u8::from_str_radix(hex, 16).ok());
            if let Some(byte) = decoded {
                out.push(byte);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

// ============================================================================
// fstab
// ============================================================================

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FstabError {
    #[error("no /etc/fstab entry mounts {0}")]
    MissingEntry(String),

    #[error("malformed /etc/fstab line {line}: {content}")]
    Malformed { line: usize, content: String },
}

/// Result of rewriting an fstab for an encrypted mount point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FstabRewrite {
    pub contents: String,
    /// Lines for the mount point and everything nested under it.
    pub matched_lines: usize,
    pub changed: bool,
}

struct FstabEntry<'a> {
    source: &'a str,
    target: &'a str,
    fstype: &'a str,
    options: &'a str,
    dump: &'a str,
    pass: &'a str,
}

fn parse_entry(line: &str) -> Option<Result<FstabEntry<'_>, ()>> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    let fields: Vec<&str> = trimmed.split_whitespace().collect();
    if fields.len() < 4 {
        return Some(Err(()));
    }
    Some(Ok(FstabEntry {
        source: fields[0],
        target: fields[1],
        fstype: fields[2],
        options: fields[3],
        dump: fields.get(4).copied().unwrap_or("0"),
        pass: fields.get(5).copied().unwrap_or("0"),
    }))
}

fn covers(mount_point: &str, target: &str) -> bool {
    let mount_point = mount_point.trim_end_matches('/');
    target == mount_point
        || target
            .strip_prefix(mount_point)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Number of fstab lines for `mount_point` and its nested mount points.
pub fn count_fstab_references(fstab: &str, mount_point: &str) -> usize {
    fstab
        .lines()
        .filter_map(parse_entry)
        .filter_map(Result::ok)
        .filter(|entry| covers(mount_point, entry.target))
        .count()
}

/// Source of the top-level fstab line when it already points at a mapping
/// this workflow created.
pub fn mapped_source_for(fstab: &str, mount_point: &str) -> Option<String> {
    let mount_point = mount_point.trim_end_matches('/');
    fstab
        .lines()
        .filter_map(parse_entry)
        .filter_map(Result::ok)
        .find(|entry| entry.target == mount_point)
        .map(|entry| entry.source.to_string())
        .filter(|source| is_workflow_mapping(source))
}

fn with_boot_options(options: &str) -> String {
    let mut parts: Vec<&str> = options.split(',').filter(|o| !o.is_empty()).collect();
    for required in [NETWORK_DEPENDENT_OPTION, NON_FATAL_OPTION] {
        if !parts.contains(&required) {
            parts.push(required);
        }
    }
    parts.join(",")
}

/// Point the top-level entry at `mapped_device` and add the network and
/// non-fatal options to every entry under `mount_point`.
///
/// Rewriting an already rewritten fstab yields the same text.
pub fn rewrite_fstab(
    fstab: &str,
    mount_point: &str,
    mapped_device: &str,
) -> Result<FstabRewrite, FstabError> {
    let top_level = mount_point.trim_end_matches('/');
    let mut found_top_level = false;
    let mut matched_lines = 0;
    let mut changed = false;
    let mut out = Vec::new();

    for (index, line) in fstab.lines().enumerate() {
        let entry = match parse_entry(line) {
            None => {
                out.push(line.to_string());
                continue;
            }
            Some(Err(())) => {
                return Err(FstabError::Malformed {
                    line: index + 1,
                    content: line.to_string(),
                })
            }
            Some(Ok(entry)) => entry,
        };

        if !covers(mount_point, entry.target) {
            out.push(line.to_string());
            continue;
        }

        matched_lines += 1;
        let source = if entry.target == top_level {
            found_top_level = true;
            mapped_device
        } else {
            entry.source
        };
        let rewritten = format!(
            "{}\t{}\t{}\t{}\t{} {}",
            source,
            entry.target,
            entry.fstype,
            with_boot_options(entry.options),
            entry.dump,
            entry.pass
        );
        let before = format!(
            "{}\t{}\t{}\t{}\t{} {}",
            entry.source, entry.target, entry.fstype, entry.options, entry.dump, entry.pass
        );
        if rewritten != before {
            changed = true;
        }
        out.push(rewritten);
    }

    if !found_top_level {
        return Err(FstabError::MissingEntry(top_level.to_string()));
    }

    let mut contents = out.join("\n");
    if fstab.ends_with('\n') {
        contents.push('\n');
    }
    Ok(FstabRewrite {
        contents,
        matched_lines,
        changed,
    })
}
