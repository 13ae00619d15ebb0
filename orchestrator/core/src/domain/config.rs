// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Encryption Configuration Types
//
// Defines the configuration schema for fleet encryption runs, including:
// - Kubernetes-style manifest format (apiVersion/kind/metadata/spec)
// - Fleet parallelism and per-host time budget
// - Named retry policies for every polling/retrying step
// - Package, image and fetcher provisioning settings
// - Vault endpoint and rate limiting
// - Object store endpoint for KMS-wrapped passphrases
//
// The manifest is loaded once per run and passed by Arc to every service;
// nothing reads configuration from ambient process state after loading.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::retry::RetryPolicy;

pub const API_VERSION: &str = "fleetcrypt/v1";
pub const KIND: &str = "EncryptionConfig";

/// Top-level Kubernetes-style configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionConfigManifest {
    /// API version (must be "fleetcrypt/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "EncryptionConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    #[serde(default)]
    pub spec: EncryptionConfigSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EncryptionConfigSpec {
    #[serde(default)]
    pub fleet: FleetConfig,

    #[serde(default)]
    pub remote: RemoteConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub packages: PackageConfig,

    #[serde(default)]
    pub image: ImageConfig,

    #[serde(default)]
    pub keyapi: KeyApiConfig,

    #[serde(default)]
    pub vault: VaultConfig,

    #[serde(default)]
    pub object_store: ObjectStoreConfig,

    #[serde(default)]
    pub secrets: SecretPolicyConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Host workflows running at the same time
    #[serde(default = "default_max_parallel_hosts")]
    pub max_parallel_hosts: usize,

    /// Wall-clock budget for one host's workflow
    #[serde(default = "default_host_timeout", with = "humantime_serde")]
    pub host_timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default = "default_remote_user")]
    pub user: String,

    #[serde(default = "default_ssh_binary")]
    pub ssh_binary: String,

    #[serde(default = "default_scp_binary")]
    pub scp_binary: String,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Upper bound for one remote command; in-place encryption of a large
    /// volume is the slowest one.
    #[serde(default = "default_command_timeout", with = "humantime_serde")]
    pub command_timeout: Duration,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Polling for boot completion before touching any mount
    #[serde(default = "default_boot_wait")]
    pub boot_wait: RetryPolicy,

    /// Encrypt, self-test and open sequence
    #[serde(default = "default_encrypt_retry")]
    pub encrypt: RetryPolicy,

    /// Key-change during rotation
    #[serde(default = "default_key_change_retry")]
    pub key_change: RetryPolicy,

    /// Waiting for a secret to reach a stable lifecycle state
    #[serde(default = "default_vault_wait")]
    pub vault_wait: RetryPolicy,

    /// Retries of idempotent vault reads on network errors
    #[serde(default = "default_vault_read")]
    pub vault_read: RetryPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageConfig {
    #[serde(default = "default_min_cryptsetup_version")]
    pub min_cryptsetup_version: String,

    /// Install the packages from `cache_dir` when missing or too old
    #[serde(default)]
    pub install_from_cache: bool,

    #[serde(default = "default_package_cache_dir")]
    pub cache_dir: PathBuf,

    /// Package name to rpm file name in `cache_dir`
    #[serde(default = "default_package_rpms")]
    pub rpms: Vec<PackageRpm>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRpm {
    pub package: String,
    pub file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Lowest guest image version that supports encryption
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_version: Option<String>,

    #[serde(default = "default_image_version_command")]
    pub version_command: String,

    #[serde(default)]
    pub ignore_cutoff: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyApiConfig {
    /// Fetcher executable on the control host
    #[serde(default = "default_local_fetcher")]
    pub local_fetcher: PathBuf,

    #[serde(default = "default_remote_dir")]
    pub remote_dir: String,

    /// Trust anchors the fetcher needs to validate the vault endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_bundle: Option<PathBuf>,

    /// Log the fetcher writes on the host
    #[serde(default = "default_fetch_log")]
    pub fetch_log: String,

    #[serde(default)]
    pub mode: KeyApiMode,
}

/// Where hosts get their passphrase from.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KeyApiMode {
    /// Fetch from the vault on every unlock
    #[default]
    Remote,
    /// Read a passphrase file already present on the host. Test rigs only.
    LocalDevelopment { passphrase_file: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    #[serde(default = "default_vault_endpoint")]
    pub endpoint: String,

    /// Environment variable holding the API token
    #[serde(default = "default_token_env")]
    pub token_env: String,

    /// Vault API calls in flight across the whole fleet
    #[serde(default = "default_max_concurrent_calls")]
    pub max_concurrent_calls: usize,

    #[serde(default = "default_deletion_grace_days")]
    pub deletion_grace_days: u32,

    /// Defined tag carrying the cluster identifier, as `namespace.key`
    #[serde(default = "default_cluster_tag")]
    pub cluster_tag: String,

    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,
}

/// Where KMS_OBJECT_STORE passphrase objects are kept. The KMS crypto
/// endpoint comes with each request's descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectStoreConfig {
    #[serde(default = "default_object_store_endpoint")]
    pub endpoint: String,

    /// Environment variable holding the API token, shared with KMS calls
    #[serde(default = "default_object_store_token_env")]
    pub token_env: String,

    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecretPolicyConfig {
    /// Give an existing ACTIVE secret a fresh version before encrypting a
    /// host, instead of reusing the current one
    #[serde(default)]
    pub force_new_version: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (e.g., "info", "debug", "trace")
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format ("json" or "text")
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_max_parallel_hosts() -> usize {
    32
}

fn default_host_timeout() -> Duration {
    Duration::from_secs(6 * 60 * 60)
}

fn default_remote_user() -> String {
    "root".to_string()
}

fn default_ssh_binary() -> String {
    "ssh".to_string()
}

fn default_scp_binary() -> String {
    "scp".to_string()
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(2 * 60 * 60)
}

fn default_boot_wait() -> RetryPolicy {
    RetryPolicy::new(600, Duration::from_secs(1))
}

fn default_encrypt_retry() -> RetryPolicy {
    RetryPolicy::new(3, Duration::from_secs(1))
}

fn default_key_change_retry() -> RetryPolicy {
    RetryPolicy::new(5, Duration::from_secs(5))
}

fn default_vault_wait() -> RetryPolicy {
    RetryPolicy::new(60, Duration::from_secs(2))
}

fn default_vault_read() -> RetryPolicy {
    RetryPolicy::new(3, Duration::from_secs(1))
}

fn default_min_cryptsetup_version() -> String {
    "2.3".to_string()
}

fn default_package_cache_dir() -> PathBuf {
    PathBuf::from("packages")
}

fn default_package_rpms() -> Vec<PackageRpm> {
    vec![
        PackageRpm {
            package: "cryptsetup".to_string(),
            file: "cryptsetup.rpm".to_string(),
        },
        PackageRpm {
            package: "cryptsetup-libs".to_string(),
            file: "cryptsetup-libs.rpm".to_string(),
        },
    ]
}

fn default_image_version_command() -> String {
    "imageinfo -ver".to_string()
}

fn default_local_fetcher() -> PathBuf {
    PathBuf::from("packages/keyapi")
}

fn default_remote_dir() -> String {
    "/opt/fleetcrypt/keyapi".to_string()
}

fn default_fetch_log() -> String {
    "/var/log/fleetcrypt/keyapi.log".to_string()
}

fn default_vault_endpoint() -> String {
    "https://vaults.example.invalid/20180608".to_string()
}

fn default_token_env() -> String {
    "FLEETCRYPT_VAULT_TOKEN".to_string()
}

fn default_max_concurrent_calls() -> usize {
    8
}

fn default_deletion_grace_days() -> u32 {
    5
}

fn default_cluster_tag() -> String {
    "fs_encryption.cluster_id".to_string()
}

fn default_object_store_endpoint() -> String {
    "https://objectstorage.example.invalid".to_string()
}

fn default_object_store_token_env() -> String {
    "FLEETCRYPT_OBJECT_STORE_TOKEN".to_string()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            max_parallel_hosts: default_max_parallel_hosts(),
            host_timeout: default_host_timeout(),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            user: default_remote_user(),
            ssh_binary: default_ssh_binary(),
            scp_binary: default_scp_binary(),
            connect_timeout_secs: default_connect_timeout(),
            command_timeout: default_command_timeout(),
            identity_file: None,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            boot_wait: default_boot_wait(),
            encrypt: default_encrypt_retry(),
            key_change: default_key_change_retry(),
            vault_wait: default_vault_wait(),
            vault_read: default_vault_read(),
        }
    }
}

impl Default for PackageConfig {
    fn default() -> Self {
        Self {
            min_cryptsetup_version: default_min_cryptsetup_version(),
            install_from_cache: false,
            cache_dir: default_package_cache_dir(),
            rpms: default_package_rpms(),
        }
    }
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            min_version: None,
            version_command: default_image_version_command(),
            ignore_cutoff: false,
        }
    }
}

impl Default for KeyApiConfig {
    fn default() -> Self {
        Self {
            local_fetcher: default_local_fetcher(),
            remote_dir: default_remote_dir(),
            certificate_bundle: None,
            fetch_log: default_fetch_log(),
            mode: KeyApiMode::Remote,
        }
    }
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            endpoint: default_vault_endpoint(),
            token_env: default_token_env(),
            max_concurrent_calls: default_max_concurrent_calls(),
            deletion_grace_days: default_deletion_grace_days(),
            cluster_tag: default_cluster_tag(),
            request_timeout: default_request_timeout(),
        }
    }
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            endpoint: default_object_store_endpoint(),
            token_env: default_object_store_token_env(),
            request_timeout: default_request_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for EncryptionConfigManifest {
    fn default() -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: "default".to_string(),
                description: None,
            },
            spec: EncryptionConfigSpec::default(),
        }
    }
}

impl EncryptionConfigManifest {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to YAML file
    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Parse configuration from YAML string
    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Discover configuration file using precedence order
    /// 1. FLEETCRYPT_CONFIG_PATH environment variable
    /// 2. ./fleetcrypt-config.yaml (working directory)
    /// 3. ~/.fleetcrypt/config.yaml (user home)
    /// 4. /etc/fleetcrypt/config.yaml (system)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("FLEETCRYPT_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./fleetcrypt-config.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".fleetcrypt").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        let system_config = PathBuf::from("/etc/fleetcrypt/config.yaml");
        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        // Explicit CLI path (fail if missing/invalid)
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path).map_err(|e| {
                anyhow::anyhow!("Failed to load config at {:?}: {}", path, e)
            })?;
            config.apply_env_overrides();
            return Ok(config);
        }

        if let Some(config_path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", config_path);
            let mut config = Self::from_yaml_file(config_path)?;
            config.apply_env_overrides();
            Ok(config)
        } else {
            tracing::warn!("No configuration file found in standard locations. Using defaults.");
            let mut config = Self::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("FLEETCRYPT_FORCE_PACKAGE_INSTALL") {
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => {
                    tracing::info!("Environment override: FLEETCRYPT_FORCE_PACKAGE_INSTALL=true");
                    self.spec.packages.install_from_cache = true;
                }
                "false" | "0" | "no" | "off" => {
                    tracing::info!("Environment override: FLEETCRYPT_FORCE_PACKAGE_INSTALL=false");
                    self.spec.packages.install_from_cache = false;
                }
                _ => {
                    tracing::warn!(
                        "Invalid value for FLEETCRYPT_FORCE_PACKAGE_INSTALL: '{}'. Expected true/false. Ignoring.",
                        val
                    );
                }
            }
        }

        if let Ok(val) = std::env::var("FLEETCRYPT_VAULT_ENDPOINT") {
            tracing::info!("Environment override: FLEETCRYPT_VAULT_ENDPOINT={}", val);
            self.spec.vault.endpoint = val;
        }

        if let Ok(val) = std::env::var("FLEETCRYPT_OBJECT_STORE_ENDPOINT") {
            tracing::info!("Environment override: FLEETCRYPT_OBJECT_STORE_ENDPOINT={}", val);
            self.spec.object_store.endpoint = val;
        }

        if let Ok(val) = std::env::var("FLEETCRYPT_MAX_PARALLEL_HOSTS") {
            match val.parse::<usize>() {
                Ok(n) => {
                    tracing::info!("Environment override: FLEETCRYPT_MAX_PARALLEL_HOSTS={}", n);
                    self.spec.fleet.max_parallel_hosts = n;
                }
                Err(_) => {
                    tracing::warn!(
                        "Invalid value for FLEETCRYPT_MAX_PARALLEL_HOSTS: '{}'. Expected a number. Ignoring.",
                        val
                    );
                }
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!(
                "Invalid apiVersion: '{}'. Must be '{}'",
                self.api_version,
                API_VERSION
            );
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        let spec = &self.spec;
        if spec.fleet.max_parallel_hosts == 0 {
            anyhow::bail!("spec.fleet.max_parallel_hosts must be at least 1");
        }

        if spec.fleet.host_timeout.is_zero() {
            anyhow::bail!("spec.fleet.host_timeout must be greater than zero");
        }

        for (name, policy) in [
            ("boot_wait", &spec.retry.boot_wait),
            ("encrypt", &spec.retry.encrypt),
            ("key_change", &spec.retry.key_change),
            ("vault_wait", &spec.retry.vault_wait),
            ("vault_read", &spec.retry.vault_read),
        ] {
            if policy.attempts == 0 {
                anyhow::bail!("spec.retry.{}.attempts must be at least 1", name);
            }
        }

        if spec.vault.max_concurrent_calls == 0 {
            anyhow::bail!("spec.vault.max_concurrent_calls must be at least 1");
        }

        if spec.vault.deletion_grace_days == 0 {
            anyhow::bail!("spec.vault.deletion_grace_days must be at least 1; secrets are never deleted immediately");
        }

        if !spec.vault.cluster_tag.contains('.') {
            anyhow::bail!(
                "spec.vault.cluster_tag must be 'namespace.key', got '{}'",
                spec.vault.cluster_tag
            );
        }

        if !spec.object_store.endpoint.starts_with("http://")
            && !spec.object_store.endpoint.starts_with("https://")
        {
            anyhow::bail!(
                "spec.object_store.endpoint must be an http(s) URL, got '{}'",
                spec.object_store.endpoint
            );
        }

        if !spec.keyapi.remote_dir.starts_with('/') {
            anyhow::bail!(
                "spec.keyapi.remote_dir must be an absolute path, got '{}'",
                spec.keyapi.remote_dir
            );
        }

        if let KeyApiMode::LocalDevelopment { passphrase_file } = &spec.keyapi.mode {
            if !passphrase_file.starts_with('/') {
                anyhow::bail!("spec.keyapi.mode.passphrase_file must be an absolute path");
            }
        }

        crate::domain::version::parse_version(&spec.packages.min_cryptsetup_version).ok_or_else(|| {
            anyhow::anyhow!(
                "spec.packages.min_cryptsetup_version is not a version: '{}'",
                spec.packages.min_cryptsetup_version
            )
        })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_manifest() {
        let manifest = EncryptionConfigManifest::default();
        assert_eq!(manifest.api_version, API_VERSION);
        assert_eq!(manifest.spec.retry.encrypt.attempts, 3);
        assert_eq!(manifest.spec.fleet.host_timeout, Duration::from_secs(21600));
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_yaml_roundtrip_with_partial_spec() {
        let yaml = r#"
apiVersion: fleetcrypt/v1
kind: EncryptionConfig
metadata:
  name: prod-fleet
spec:
  fleet:
    max_parallel_hosts: 4
    host_timeout: 90m
  retry:
    key_change:
      attempts: 2
      interval: 10s
  keyapi:
    mode:
      type: local_development
      passphrase_file: /root/test-passphrase
"#;
        let manifest = EncryptionConfigManifest::from_yaml_str(yaml).unwrap();
        assert_eq!(manifest.spec.fleet.max_parallel_hosts, 4);
        assert_eq!(manifest.spec.fleet.host_timeout, Duration::from_secs(5400));
        assert_eq!(manifest.spec.retry.key_change.attempts, 2);
        // Unspecified sections keep their defaults.
        assert_eq!(manifest.spec.retry.encrypt.attempts, 3);
        assert_eq!(manifest.spec.vault.deletion_grace_days, 5);
        assert_eq!(
            manifest.spec.keyapi.mode,
            KeyApiMode::LocalDevelopment {
                passphrase_file: "/root/test-passphrase".to_string()
            }
        );
        manifest.validate().unwrap();

        let serialized = serde_yaml::to_string(&manifest).unwrap();
        let reparsed = EncryptionConfigManifest::from_yaml_str(&serialized).unwrap();
        assert_eq!(reparsed.spec.fleet.max_parallel_hosts, 4);
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let mut manifest = EncryptionConfigManifest::default();
        manifest.metadata.name = "lab".to_string();
        manifest.to_yaml_file(&path).unwrap();

        let loaded = EncryptionConfigManifest::load_or_default(Some(path)).unwrap();
        assert_eq!(loaded.metadata.name, "lab");
    }

    #[test]
    fn test_validation() {
        let mut manifest = EncryptionConfigManifest::default();
        manifest.kind = "NodeConfig".to_string();
        assert!(manifest.validate().is_err());

        let mut manifest = EncryptionConfigManifest::default();
        manifest.spec.vault.deletion_grace_days = 0;
        assert!(manifest.validate().is_err());

        let mut manifest = EncryptionConfigManifest::default();
        manifest.spec.retry.encrypt.attempts = 0;
        assert!(manifest.validate().is_err());

        let mut manifest = EncryptionConfigManifest::default();
        manifest.spec.keyapi.remote_dir = "opt/keyapi".to_string();
        assert!(manifest.validate().is_err());

        let mut manifest = EncryptionConfigManifest::default();
        manifest.spec.packages.min_cryptsetup_version = "latest".to_string();
        assert!(manifest.validate().is_err());

        let mut manifest = EncryptionConfigManifest::default();
        manifest.spec.object_store.endpoint = "objectstorage.local".to_string();
        assert!(manifest.validate().is_err());
    }
}
