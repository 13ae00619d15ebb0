// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Secret Domain Model
//!
//! Where a host's passphrase lives and what state its versions are in.
//! Passphrase material is held in [`Passphrase`], which wipes itself on drop
//! and never prints its contents.

use base64::{engine::general_purpose::STANDARD, engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::domain::host::HostId;

/// Random bytes behind every generated passphrase.
const PASSPHRASE_ENTROPY_BYTES: usize = 48;

// ============================================================================
// Descriptor
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeySource {
    Vault,
    KmsObjectStore,
}

impl std::fmt::Display for KeySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Vault => write!(f, "VAULT"),
            Self::KmsObjectStore => write!(f, "KMS_OBJECT_STORE"),
        }
    }
}

/// Object-store coordinates used when passphrases are KMS-wrapped objects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectStoreLocation {
    pub bucket: String,
    pub namespace: String,
    pub kms_key_id: String,
    pub kms_crypto_endpoint: String,
}

/// Identifies where a host's passphrase material lives.
///
/// Built once per operator request and shared read-only by every host task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSecretDescriptor {
    pub key_source: KeySource,
    pub vault_id: String,
    pub compartment_id: String,
    /// Master encryption key the vault wraps secret content with.
    pub key_id: String,
    /// Cluster identifier written into every secret's cluster tag.
    pub cluster_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_store: Option<ObjectStoreLocation>,
}

impl RemoteSecretDescriptor {
    pub fn validate(&self) -> Result<(), String> {
        if self.vault_id.is_empty() {
            return Err("descriptor.vault_id cannot be empty".to_string());
        }
        if self.compartment_id.is_empty() {
            return Err("descriptor.compartment_id cannot be empty".to_string());
        }
        if self.key_source == KeySource::KmsObjectStore && self.object_store.is_none() {
            return Err("descriptor.object_store is required for KMS_OBJECT_STORE".to_string());
        }
        Ok(())
    }
}

/// Contents of the fetcher's config file on a host.
///
/// Names the secret and where to find it, never the secret itself. A pinned
/// `version_number` makes the fetcher read that version instead of CURRENT;
/// rotation uses one pinned config per version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetcherConfig {
    pub secret_name: String,
    pub key_source: KeySource,
    pub vault_id: String,
    pub compartment_id: String,
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_number: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_store: Option<ObjectStoreLocation>,
    pub log_file: String,
}

// ============================================================================
// Vault state
// ============================================================================

/// Opaque vault identifier of a secret.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretId(pub String);

impl std::fmt::Display for SecretId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SecretLifecycle {
    Creating,
    Active,
    Updating,
    SchedulingDeletion,
    PendingDeletion,
    CancellingDeletion,
    Deleted,
    Failed,
}

impl SecretLifecycle {
    /// Deleted secrets never count towards a host's live key material.
    pub fn is_live(self) -> bool {
        !matches!(self, Self::Deleted)
    }

    pub fn is_transitional(self) -> bool {
        matches!(
            self,
            Self::Creating | Self::Updating | Self::SchedulingDeletion | Self::CancellingDeletion
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VersionStage {
    Current,
    Previous,
    PendingDeletion,
    Latest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretSummary {
    pub id: SecretId,
    pub name: String,
    pub lifecycle: SecretLifecycle,
    pub current_version: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretVersion {
    pub number: u64,
    pub stages: Vec<VersionStage>,
}

impl SecretVersion {
    pub fn has_stage(&self, stage: VersionStage) -> bool {
        self.stages.contains(&stage)
    }
}

/// A secret together with its versions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretVersionState {
    pub secret: SecretSummary,
    pub versions: Vec<SecretVersion>,
}

impl SecretVersionState {
    pub fn current(&self) -> Option<&SecretVersion> {
        self.versions.iter().find(|v| v.has_stage(VersionStage::Current))
    }

    pub fn previous(&self) -> Option<&SecretVersion> {
        self.versions.iter().find(|v| v.has_stage(VersionStage::Previous))
    }

    pub fn is_pending_deletion(&self) -> bool {
        self.secret.lifecycle == SecretLifecycle::PendingDeletion
    }

    /// At most one version may carry the CURRENT stage.
    pub fn has_single_current(&self) -> bool {
        self.versions
            .iter()
            .filter(|v| v.has_stage(VersionStage::Current))
            .count()
            <= 1
    }
}

/// Whether a vault secret name belongs to `host`.
///
/// Secrets are named after the canonical host name. Older deployments used
/// the bare short name, which also matches so that rotation sees both and
/// reports the ambiguity instead of silently picking one. A dotted name
/// only matches in full: `vm02.other.com` never belongs to `vm02.example.com`.
pub fn secret_name_matches(name: &str, host: &HostId) -> bool {
    name == host.as_str() || (!name.contains('.') && name == host.short_name())
}

// ============================================================================
// Passphrase
// ============================================================================

/// Passphrase bytes, wiped on drop.
#[derive(Clone)]
pub struct Passphrase(Zeroizing<String>);

impl Passphrase {
    /// Fresh passphrase from the operating system's CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = Zeroizing::new([0u8; PASSPHRASE_ENTROPY_BYTES]);
        OsRng.fill_bytes(&mut bytes[..]);
        Self(Zeroizing::new(URL_SAFE_NO_PAD.encode(&bytes[..])))
    }

    pub fn from_plaintext(value: impl Into<String>) -> Self {
        Self(Zeroizing::new(value.into()))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Base64 payload the vault stores as secret content.
    pub fn to_vault_content(&self) -> Zeroizing<String> {
        Zeroizing::new(STANDARD.encode(self.0.as_bytes()))
    }

    pub fn from_vault_content(content: &str) -> Option<Self> {
        let decoded = Zeroizing::new(STANDARD.decode(content.trim()).ok()?);
        let text = String::from_utf8(decoded.to_vec()).ok()?;
        Some(Self::from_plaintext(text))
    }
}

impl std::fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Passphrase(<redacted>)")
    }
}

impl PartialEq for Passphrase {
    fn eq(&self, other: &Self) -> bool {
        self.expose() == other.expose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(stages: &[(u64, &[VersionStage])]) -> SecretVersionState {
        SecretVersionState {
            secret: SecretSummary {
                id: SecretId("ocid1.secret.a".into()),
                name: "vm01.example.com".into(),
                lifecycle: SecretLifecycle::Active,
                current_version: None,
            },
            versions: stages
                .iter()
                .map(|(n, s)| SecretVersion {
                    number: *n,
                    stages: s.to_vec(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_current_and_previous() {
        let s = state(&[
            (1, &[VersionStage::Previous]),
            (2, &[VersionStage::Current, VersionStage::Latest]),
        ]);
        assert_eq!(s.current().map(|v| v.number), Some(2));
        assert_eq!(s.previous().map(|v| v.number), Some(1));
        assert!(s.has_single_current());

        let broken = state(&[(1, &[VersionStage::Current]), (2, &[VersionStage::Current])]);
        assert!(!broken.has_single_current());
    }

    #[test]
    fn test_secret_name_matching() {
        let host = HostId::new("vm02.example.com");
        assert!(secret_name_matches("vm02.example.com", &host));
        assert!(secret_name_matches("vm02", &host));
        assert!(!secret_name_matches("vm020.example.com", &host));
        assert!(!secret_name_matches("vm03.example.com", &host));
        assert!(!secret_name_matches("vm02.other.com", &host));
        assert!(!secret_name_matches("vm02.example", &host));

        let short = HostId::new("vm02");
        assert!(secret_name_matches("vm02", &short));
        assert!(!secret_name_matches("vm02.example.com", &short));
    }

    #[test]
    fn test_generated_passphrases_differ_and_are_redacted() {
        let a = Passphrase::generate();
        let b = Passphrase::generate();
        assert_ne!(a, b);
        assert_eq!(a.expose().len(), 64);
        assert_eq!(format!("{:?}", a), "Passphrase(<redacted>)");
    }

    #[test]
    fn test_vault_content_roundtrip() {
        let p = Passphrase::from_plaintext("correct horse");
        let content = p.to_vault_content();
        assert_eq!(Passphrase::from_vault_content(&content), Some(p));
        assert_eq!(Passphrase::from_vault_content("%%%"), None);
    }

    #[test]
    fn test_descriptor_validation() {
        let mut d = RemoteSecretDescriptor {
            key_source: KeySource::KmsObjectStore,
            vault_id: "ocid1.vault.a".into(),
            compartment_id: "ocid1.compartment.a".into(),
            key_id: "ocid1.key.a".into(),
            cluster_id: "ocid1.cluster.a".into(),
            object_store: None,
        };
        assert!(d.validate().is_err());
        d.key_source = KeySource::Vault;
        assert!(d.validate().is_ok());
    }
}
