// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Toolchain and guest image checks run before any device is touched.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use crate::application::host_shell::{quote, HostShell};
use crate::domain::config::{EncryptionConfigManifest, PackageRpm};
use crate::domain::error::EncryptionError;
use crate::domain::host::HostId;
use crate::domain::remote::RemoteExecutor;
use crate::domain::version::meets_minimum;

/// Package whose version gates LUKS2 online reencryption.
const CRYPTSETUP_PACKAGE: &str = "cryptsetup";

#[async_trait]
pub trait ToolchainVerifier: Send + Sync {
    /// Ensure the encryption packages are installed and recent enough, and
    /// that the guest image is not below the supported cutoff.
    async fn verify(&self, host: &HostId) -> Result<(), EncryptionError>;
}

pub struct StandardToolchainVerifier {
    executor: Arc<dyn RemoteExecutor>,
    config: Arc<EncryptionConfigManifest>,
}

impl StandardToolchainVerifier {
    pub fn new(executor: Arc<dyn RemoteExecutor>, config: Arc<EncryptionConfigManifest>) -> Self {
        Self { executor, config }
    }

    async fn installed_version(
        &self,
        shell: &HostShell<'_>,
        package: &str,
    ) -> Result<Option<String>, EncryptionError> {
        let out = shell
            .run(&format!("rpm -q --queryformat {} {}", quote("%{VERSION}"), quote(package)))
            .await?;
        Ok(if out.is_success() {
            out.first_line().map(str::to_string)
        } else {
            None
        })
    }

    fn acceptable(&self, rpm: &PackageRpm, version: Option<&str>) -> bool {
        match version {
            None => false,
            Some(v) if rpm.package == CRYPTSETUP_PACKAGE => {
                meets_minimum(v, &self.config.spec.packages.min_cryptsetup_version)
            }
            Some(_) => true,
        }
    }

    async fn install_from_cache(&self, shell: &HostShell<'_>, rpm: &PackageRpm) -> Result<(), EncryptionError> {
        let local = self.config.spec.packages.cache_dir.join(&rpm.file);
        let remote = format!("/tmp/{}", rpm.file);
        shell.copy_file(&local, &remote).await?;
        let installed = shell
            .run_checked(&format!("rpm -ivh --force {}", quote(&remote)), |out| {
                EncryptionError::preparation(
                    format!("installing {} failed: {}", rpm.file, out.describe()),
                    format!("install {} on the host manually and retry", rpm.package),
                )
            })
            .await;
        let cleanup = shell.run(&format!("rm -f {}", quote(&remote))).await;
        if let Err(err) = cleanup {
            warn!(host = %shell.host(), "failed to remove {}: {}", remote, err);
        }
        installed?;
        info!(host = %shell.host(), "Installed {} from the package cache", rpm.package);
        Ok(())
    }

    async fn verify_packages(&self, shell: &HostShell<'_>) -> Result<(), EncryptionError> {
        let packages = &self.config.spec.packages;
        for rpm in &packages.rpms {
            let version = self.installed_version(shell, &rpm.package).await?;
            if self.acceptable(rpm, version.as_deref()) {
                continue;
            }
            if !packages.install_from_cache {
                return Err(EncryptionError::preparation(
                    format!(
                        "{} is {} on {}",
                        rpm.package,
                        version.map_or("not installed".to_string(), |v| format!("at version {}", v)),
                        shell.host()
                    ),
                    format!(
                        "install {} {} or later on the host (or enable packages.install_from_cache) and retry",
                        rpm.package, packages.min_cryptsetup_version
                    ),
                ));
            }
            self.install_from_cache(shell, rpm).await?;
            let version = self.installed_version(shell, &rpm.package).await?;
            if !self.acceptable(rpm, version.as_deref()) {
                return Err(EncryptionError::preparation(
                    format!("{} from the package cache is still too old", rpm.package),
                    format!(
                        "refresh {} in the package cache with version {} or later",
                        rpm.file, packages.min_cryptsetup_version
                    ),
                ));
            }
        }
        Ok(())
    }

    async fn verify_image(&self, shell: &HostShell<'_>) -> Result<(), EncryptionError> {
        let image = &self.config.spec.image;
        let Some(minimum) = image.min_version.as_deref().filter(|_| !image.ignore_cutoff) else {
            return Ok(());
        };
        let out = shell
            .run_checked(&image.version_command, |out| {
                EncryptionError::preparation(
                    format!("cannot determine the image version: {}", out.describe()),
                    "verify image.version_command, or set image.ignore_cutoff to skip the check",
                )
            })
            .await?;
        let version = out.first_line().unwrap_or_default();
        if !meets_minimum(version, minimum) {
            return Err(EncryptionError::unsupported(
                format!("image version {} on {} is below the supported cutoff {}", version, shell.host(), minimum),
                format!("upgrade the guest image to {} or later", minimum),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ToolchainVerifier for StandardToolchainVerifier {
    async fn verify(&self, host: &HostId) -> Result<(), EncryptionError> {
        let shell = HostShell::new(&self.executor, host, self.config.spec.remote.command_timeout);
        self.verify_image(&shell).await?;
        self.verify_packages(&shell).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::remote::simulated::{SimulatedFleet, SimulatedHost};

    fn verifier(fleet: &SimulatedFleet, config: EncryptionConfigManifest) -> StandardToolchainVerifier {
        StandardToolchainVerifier::new(Arc::new(fleet.clone()), Arc::new(config))
    }

    #[tokio::test]
    async fn test_missing_package_without_cache_fails() {
        let fleet = SimulatedFleet::new();
        let host = HostId::new("vm01");
        let mut sim = SimulatedHost::new("vm01");
        sim.packages.remove("cryptsetup");
        fleet.add_host(sim);

        let err = verifier(&fleet, EncryptionConfigManifest::default())
            .verify(&host)
            .await
            .unwrap_err();
        assert!(matches!(err, EncryptionError::PreparationFailed { .. }));
        assert!(err.resolution().contains("install cryptsetup"));
    }

    #[tokio::test]
    async fn test_old_package_installed_from_cache() {
        let fleet = SimulatedFleet::new();
        let host = HostId::new("vm01");
        let mut sim = SimulatedHost::new("vm01");
        sim.packages.insert("cryptsetup".into(), "2.0.3".into());
        fleet.add_host(sim);
        let mut config = EncryptionConfigManifest::default();
        config.spec.packages.install_from_cache = true;

        verifier(&fleet, config).verify(&host).await.unwrap();
        assert_eq!(fleet.host(&host).unwrap().packages["cryptsetup"], "2.6.0");
        assert_eq!(fleet.command_count(&host, "rpm -ivh --force /tmp/cryptsetup.rpm"), 1);
        assert_eq!(fleet.command_count(&host, "rm -f /tmp/cryptsetup.rpm"), 1);
    }

    #[tokio::test]
    async fn test_image_below_cutoff_is_unsupported() {
        let fleet = SimulatedFleet::new();
        let host = HostId::new("vm01");
        let mut sim = SimulatedHost::new("vm01");
        sim.image_version = Some("19.2.4".into());
        fleet.add_host(sim);
        let mut config = EncryptionConfigManifest::default();
        config.spec.image.min_version = Some("21.2".into());

        let err = verifier(&fleet, config.clone()).verify(&host).await.unwrap_err();
        assert!(matches!(err, EncryptionError::Unsupported { .. }));

        config.spec.image.ignore_cutoff = true;
        verifier(&fleet, config).verify(&host).await.unwrap();
    }
}
