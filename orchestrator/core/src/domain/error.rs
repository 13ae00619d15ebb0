// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Encryption Error Taxonomy
//!
//! Every fatal error a host workflow can end in. Each variant carries the
//! cause and an actionable resolution for the operator; the fleet report
//! records both.

use std::time::Duration;
use thiserror::Error;

use crate::domain::host::HostId;
use crate::domain::object_store::ObjectStoreError;
use crate::domain::remote::RemoteError;
use crate::domain::vault::VaultError;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EncryptionError {
    #[error("host {host} is unreachable: {cause}")]
    Unreachable { host: HostId, cause: String },

    #[error("command on {host} timed out after {timeout:?}")]
    CommandTimedOut { host: HostId, timeout: Duration },

    #[error("copying {path} to {host} failed: {cause}")]
    TransferFailed {
        host: HostId,
        path: String,
        cause: String,
    },

    #[error("control host error while driving {host}: {cause}")]
    ControlHostFailed { host: HostId, cause: String },

    #[error("{mount_point} is not mounted on {host}")]
    MountPointNotFound { host: HostId, mount_point: String },

    #[error("unsupported configuration: {cause}")]
    Unsupported { cause: String, resolution: String },

    #[error("volume preparation failed: {cause}")]
    PreparationFailed { cause: String, resolution: String },

    #[error("encryption failed: {cause}")]
    EncryptionFailed { cause: String, resolution: String },

    #[error("secret conflict: {cause}")]
    SecretConflict { cause: String, resolution: String },

    #[error("vault operation failed: {cause}")]
    VaultOperationFailed { cause: String, resolution: String },

    #[error("rotation failed ({cause}) and reverting to version {previous_version} also failed: {rollback_cause}")]
    RotationRollbackFailed {
        cause: String,
        rollback_cause: String,
        previous_version: u64,
        new_version: u64,
    },

    #[error("host workflow exceeded its {limit:?} budget")]
    TimedOut { limit: Duration },

    #[error("invalid workflow transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },
}

impl EncryptionError {
    pub fn unsupported(cause: impl Into<String>, resolution: impl Into<String>) -> Self {
        Self::Unsupported {
            cause: cause.into(),
            resolution: resolution.into(),
        }
    }

    pub fn preparation(cause: impl Into<String>, resolution: impl Into<String>) -> Self {
        Self::PreparationFailed {
            cause: cause.into(),
            resolution: resolution.into(),
        }
    }

    pub fn encryption(cause: impl Into<String>, resolution: impl Into<String>) -> Self {
        Self::EncryptionFailed {
            cause: cause.into(),
            resolution: resolution.into(),
        }
    }

    pub fn conflict(cause: impl Into<String>, resolution: impl Into<String>) -> Self {
        Self::SecretConflict {
            cause: cause.into(),
            resolution: resolution.into(),
        }
    }

    pub fn vault(cause: impl Into<String>, resolution: impl Into<String>) -> Self {
        Self::VaultOperationFailed {
            cause: cause.into(),
            resolution: resolution.into(),
        }
    }

    /// What the operator should do about this error.
    pub fn resolution(&self) -> String {
        match self {
            Self::Unreachable { host, .. } => format!(
                "verify network connectivity and SSH access to {} and retry",
                host
            ),
            Self::CommandTimedOut { host, timeout } => format!(
                "check {} for a hung cryptsetup or mount process; if the volume is large, raise \
                 spec.remote.command_timeout above {:?} and re-run",
                host, timeout
            ),
            Self::TransferFailed { host, path, .. } => format!(
                "check free space and permissions for {} on {} and that the local file exists",
                path, host
            ),
            Self::ControlHostFailed { .. } => {
                "check that the ssh and scp binaries in spec.remote are installed on the control host"
                    .to_string()
            }
            Self::MountPointNotFound { mount_point, .. } => format!(
                "verify that {} is mounted and listed in /etc/fstab, then retry",
                mount_point
            ),
            Self::Unsupported { resolution, .. }
            | Self::PreparationFailed { resolution, .. }
            | Self::EncryptionFailed { resolution, .. }
            | Self::SecretConflict { resolution, .. }
            | Self::VaultOperationFailed { resolution, .. } => resolution.clone(),
            Self::RotationRollbackFailed {
                previous_version, ..
            } => format!(
                "promote secret version {} to CURRENT manually before the host reboots",
                previous_version
            ),
            Self::TimedOut { .. } => {
                "inspect the host state and re-run the workflow; completed steps are skipped"
                    .to_string()
            }
            Self::InvalidStateTransition { .. } => {
                "re-run the workflow from the beginning".to_string()
            }
        }
    }
}

impl From<RemoteError> for EncryptionError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Unreachable { host, cause } => Self::Unreachable { host, cause },
            RemoteError::Timeout { host, timeout } => Self::CommandTimedOut { host, timeout },
            RemoteError::Transfer { host, path, cause } => Self::TransferFailed { host, path, cause },
            RemoteError::Io { host, cause } => Self::ControlHostFailed { host, cause },
        }
    }
}

impl From<VaultError> for EncryptionError {
    fn from(err: VaultError) -> Self {
        let resolution = match &err {
            VaultError::Rejected { status, .. } if *status == 401 || *status == 403 || *status == 404 => {
                "verify the IAM dynamic groups and policies grant this cluster access to the vault and compartment"
            }
            VaultError::Network(_) | VaultError::Timeout(_) => {
                "verify the vault endpoint is reachable from the control plane and retry"
            }
            _ => "inspect the secret in the vault console and retry",
        };
        Self::vault(err.to_string(), resolution)
    }
}

impl From<ObjectStoreError> for EncryptionError {
    fn from(err: ObjectStoreError) -> Self {
        let resolution = match &err {
            ObjectStoreError::Rejected { status, .. } if *status == 401 || *status == 403 || *status == 404 => {
                "verify the IAM policies grant this cluster use of the master key and write access to the bucket"
            }
            ObjectStoreError::Network(_) | ObjectStoreError::Timeout(_) => {
                "verify the object storage and KMS crypto endpoints are reachable from the control plane and retry"
            }
            _ => "inspect the passphrase object in the bucket and the master key state, then retry",
        };
        Self::vault(err.to_string(), resolution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_variant_has_a_resolution() {
        let host = HostId::new("vm01");
        let errors = vec![
            EncryptionError::Unreachable {
                host: host.clone(),
                cause: "connection refused".into(),
            },
            EncryptionError::MountPointNotFound {
                host,
                mount_point: "/u02".into(),
            },
            EncryptionError::unsupported("btrfs", "use ext4 or xfs"),
            EncryptionError::RotationRollbackFailed {
                cause: "a".into(),
                rollback_cause: "b".into(),
                previous_version: 1,
                new_version: 2,
            },
            EncryptionError::TimedOut {
                limit: Duration::from_secs(1),
            },
        ];
        for err in errors {
            assert!(!err.resolution().is_empty(), "{:?}", err);
        }
    }

    #[test]
    fn test_remote_errors_keep_their_kind() {
        let host = HostId::new("vm01");

        let err: EncryptionError = RemoteError::Unreachable {
            host: host.clone(),
            cause: "No route to host".into(),
        }
        .into();
        assert!(matches!(err, EncryptionError::Unreachable { .. }));
        assert!(err.resolution().contains("SSH access"));

        let err: EncryptionError = RemoteError::Timeout {
            host: host.clone(),
            timeout: Duration::from_secs(7200),
        }
        .into();
        assert!(matches!(err, EncryptionError::CommandTimedOut { .. }));
        assert!(err.resolution().contains("command_timeout"));
        assert!(!err.resolution().contains("SSH"));

        let err: EncryptionError = RemoteError::Transfer {
            host: host.clone(),
            path: "/opt/fleetcrypt/keyapi/keyapi".into(),
            cause: "scp: No space left on device".into(),
        }
        .into();
        assert!(matches!(err, EncryptionError::TransferFailed { .. }));
        assert!(err.to_string().contains("/opt/fleetcrypt/keyapi/keyapi"));
        assert!(err.resolution().contains("free space"));

        let err: EncryptionError = RemoteError::Io {
            host,
            cause: "ssh: No such file or directory".into(),
        }
        .into();
        assert!(matches!(err, EncryptionError::ControlHostFailed { .. }));
        assert!(err.resolution().contains("control host"));
    }

    #[test]
    fn test_vault_rejection_points_at_iam() {
        let err: EncryptionError = VaultError::Rejected {
            status: 404,
            message: "NotAuthorizedOrNotFound".into(),
        }
        .into();
        assert!(matches!(err, EncryptionError::VaultOperationFailed { .. }));
        assert!(err.resolution().contains("IAM"));
    }

    #[test]
    fn test_object_store_errors_point_at_bucket_or_endpoint() {
        let err: EncryptionError = ObjectStoreError::Rejected {
            status: 403,
            message: "NotAuthorized".into(),
        }
        .into();
        assert!(err.resolution().contains("bucket"));

        let err: EncryptionError = ObjectStoreError::Timeout("kms".into()).into();
        assert!(err.resolution().contains("KMS crypto endpoint"));
    }
}
