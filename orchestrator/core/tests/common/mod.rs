// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use fleetcrypt_core::application::fleet::{EncryptionRequest, FleetOrchestrator};
use fleetcrypt_core::domain::config::EncryptionConfigManifest;
use fleetcrypt_core::domain::host::HostId;
use fleetcrypt_core::domain::retry::RetryPolicy;
use fleetcrypt_core::domain::secret::{KeySource, ObjectStoreLocation, RemoteSecretDescriptor};
use fleetcrypt_core::infrastructure::event_bus::EventBus;
use fleetcrypt_core::infrastructure::object_store::InMemoryObjectStore;
use fleetcrypt_core::infrastructure::remote::{SimulatedFleet, SimulatedHost};
use fleetcrypt_core::infrastructure::vault::InMemoryVaultClient;

pub const DATA_DEVICE: &str = "/dev/mapper/VGExaDb-LVu02";
pub const MAPPED_DEVICE: &str = "/dev/mapper/VGExaDb-LVu02-crypt";

/// Default config with every retry interval collapsed to zero.
pub fn fast_config() -> EncryptionConfigManifest {
    let mut config = EncryptionConfigManifest::default();
    let retry = &mut config.spec.retry;
    for policy in [
        &mut retry.boot_wait,
        &mut retry.encrypt,
        &mut retry.key_change,
        &mut retry.vault_wait,
        &mut retry.vault_read,
    ] {
        *policy = RetryPolicy::new(policy.attempts, Duration::ZERO);
    }
    config
}

pub fn descriptor() -> RemoteSecretDescriptor {
    RemoteSecretDescriptor {
        key_source: KeySource::Vault,
        vault_id: "ocid1.vault.oc1.test.vault".to_string(),
        compartment_id: "ocid1.compartment.oc1..test".to_string(),
        key_id: "ocid1.key.oc1.test.key".to_string(),
        cluster_id: "ocid1.cluster.oc1.test.c1".to_string(),
        object_store: None,
    }
}

/// Passphrases kept as KMS-sealed objects instead of vault secrets.
pub fn kms_descriptor() -> RemoteSecretDescriptor {
    RemoteSecretDescriptor {
        key_source: KeySource::KmsObjectStore,
        object_store: Some(ObjectStoreLocation {
            bucket: "fs-keys".to_string(),
            namespace: "tenancy".to_string(),
            kms_key_id: "ocid1.key.oc1.test.master".to_string(),
            kms_crypto_endpoint: "https://kms.example.invalid".to_string(),
        }),
        ..descriptor()
    }
}

/// Host with an unencrypted ext4 volume labelled U02 mounted at /u02.
pub fn data_host(id: &str) -> SimulatedHost {
    SimulatedHost::with_data_volume(id, "/u02", DATA_DEVICE, "ext4", Some("U02"))
}

pub fn request(hosts: &[&str]) -> EncryptionRequest {
    EncryptionRequest {
        hosts: hosts.iter().map(|h| HostId::new(*h)).collect(),
        mount_point: "/u02".to_string(),
        descriptor: descriptor(),
        options: Default::default(),
    }
}

pub struct Harness {
    pub fleet: SimulatedFleet,
    pub vault: Arc<InMemoryVaultClient>,
    pub objects: Arc<InMemoryObjectStore>,
    pub event_bus: Arc<EventBus>,
    pub orchestrator: FleetOrchestrator,
}

impl Harness {
    pub fn new(hosts: Vec<SimulatedHost>) -> Self {
        Self::with_config(hosts, fast_config())
    }

    pub fn with_config(hosts: Vec<SimulatedHost>, config: EncryptionConfigManifest) -> Self {
        let vault = Arc::new(InMemoryVaultClient::new());
        let objects = Arc::new(InMemoryObjectStore::new());
        let fleet = SimulatedFleet::new()
            .with_vault(vault.clone())
            .with_object_store(objects.clone());
        for host in hosts {
            fleet.add_host(host);
        }
        let event_bus = Arc::new(EventBus::with_default_capacity());
        let orchestrator = FleetOrchestrator::with_standard_services(
            Arc::new(fleet.clone()),
            vault.clone(),
            objects.clone(),
            event_bus.clone(),
            Arc::new(config),
        );
        Self {
            fleet,
            vault,
            objects,
            event_bus,
            orchestrator,
        }
    }
}
