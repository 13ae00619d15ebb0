// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

mod common;

use common::{data_host, descriptor, request, Harness, DATA_DEVICE};
use fleetcrypt_core::domain::events::SecretEvent;
use fleetcrypt_core::domain::host::HostId;
use fleetcrypt_core::domain::secret::{Passphrase, SecretLifecycle};
use fleetcrypt_core::domain::vault::VaultTarget;
use fleetcrypt_core::infrastructure::event_bus::DomainEvent;
use fleetcrypt_core::infrastructure::vault::VaultFaults;

const HOST: &str = "vm01.example.com";

/// Harness with vm01 already encrypted on version 1.
async fn encrypted_harness() -> Harness {
    let harness = Harness::new(vec![data_host(HOST)]);
    harness
        .orchestrator
        .encrypt_fleet(&request(&[HOST]))
        .await
        .expect("initial encryption");
    harness
}

#[tokio::test]
async fn test_rotation_moves_the_device_to_the_new_version() {
    let harness = encrypted_harness().await;
    let host = HostId::new(HOST);
    let old = harness.vault.passphrase_for(HOST, Some(1)).unwrap();

    let report = harness
        .orchestrator
        .rotate_fleet(&request(&[HOST]))
        .await
        .expect("rotation should succeed");
    let result = &report.results[&host];

    assert!(result.success, "{}", result.comment);
    assert_eq!(result.new_version, Some(2));
    assert_eq!(harness.vault.current_version(HOST), Some(2));

    let new = harness.vault.passphrase_for(HOST, Some(2)).unwrap();
    assert_ne!(new.expose(), old.expose());
    let sim = harness.fleet.host(&host).unwrap();
    assert_eq!(sim.luks_keys(DATA_DEVICE), vec![new.expose().to_string()]);
    assert!(sim.is_mounted("/u02"));
    assert!(sim.file_text("/opt/fleetcrypt/keyapi/config.v1.json").is_none());
    assert!(sim.file_text("/opt/fleetcrypt/keyapi/config.v2.json").is_none());

    harness.fleet.reboot(&host);
    assert!(harness.fleet.host(&host).unwrap().is_mounted("/u02"));
}

#[tokio::test]
async fn test_ambiguous_secrets_abort_before_any_mutation() {
    let harness = Harness::new(vec![data_host("vm02.example.com")]);
    let target = VaultTarget::from(&descriptor());
    harness.vault.insert_secret(
        &target,
        "vm02.example.com",
        SecretLifecycle::Active,
        Passphrase::generate(),
    );
    harness
        .vault
        .insert_secret(&target, "vm02.retired", SecretLifecycle::Active, Passphrase::generate());

    let failure = harness
        .orchestrator
        .rotate_fleet(&request(&["vm02.example.com"]))
        .await
        .expect_err("rotation should fail");
    let result = &failure.report.results[&HostId::new("vm02.example.com")];

    assert!(!result.success);
    assert!(result.comment.contains("2 live secrets match vm02.example.com"));
    assert!(result.comment.contains("resolution:"));
    assert!(harness.vault.mutations().is_empty());
    assert!(harness.fleet.commands(&HostId::new("vm02.example.com")).is_empty());
}

#[tokio::test]
async fn test_failed_key_change_rolls_back_to_the_previous_version() {
    let harness = encrypted_harness().await;
    let host = HostId::new(HOST);
    let original = harness.vault.passphrase_for(HOST, Some(1)).unwrap();
    harness.fleet.with_host(&host, |sim| sim.faults.key_change_failures = 10);
    let mut events = harness.event_bus.subscribe();

    let failure = harness
        .orchestrator
        .rotate_fleet(&request(&[HOST]))
        .await
        .expect_err("rotation should fail");
    let result = &failure.report.results[&host];

    assert!(!result.success);
    assert!(result.comment.contains("rotation rolled back, version 1 is CURRENT again"));
    assert_eq!(harness.vault.current_version(HOST), Some(1));
    assert!(harness
        .vault
        .mutations()
        .iter()
        .any(|m| m.starts_with("schedule_version_deletion") && m.ends_with(" 2")));
    assert_eq!(
        harness
            .fleet
            .commands(&host)
            .iter()
            .filter(|c| c.contains("luksChangeKey"))
            .count(),
        5
    );

    let mut rolled_back = None;
    while let Ok(event) = events.try_recv() {
        if let DomainEvent::Secret(SecretEvent::RotationRolledBack {
            reverted_to, success, ..
        }) = event
        {
            rolled_back = Some((reverted_to, success));
        }
    }
    assert_eq!(rolled_back, Some((1, true)));

    let sim = harness.fleet.host(&host).unwrap();
    assert_eq!(sim.luks_keys(DATA_DEVICE), vec![original.expose().to_string()]);
    harness.fleet.reboot(&host);
    assert!(harness.fleet.host(&host).unwrap().is_mounted("/u02"));
}

#[tokio::test]
async fn test_failed_rollback_reports_both_errors() {
    let harness = encrypted_harness().await;
    let host = HostId::new(HOST);
    harness.fleet.with_host(&host, |sim| sim.faults.key_change_failures = 10);
    harness.vault.set_faults(VaultFaults {
        reject_promotion: true,
        ..Default::default()
    });
    let mut events = harness.event_bus.subscribe();

    let failure = harness
        .orchestrator
        .rotate_fleet(&request(&[HOST]))
        .await
        .expect_err("rotation should fail");
    let result = &failure.report.results[&host];

    assert!(!result.success);
    assert!(result.comment.contains("promote secret version 1 to CURRENT manually"));
    assert_eq!(harness.vault.current_version(HOST), Some(2));

    let mut rolled_back = None;
    while let Ok(event) = events.try_recv() {
        if let DomainEvent::Secret(SecretEvent::RotationRolledBack { success, .. }) = event {
            rolled_back = Some(success);
        }
    }
    assert_eq!(rolled_back, Some(false));
}

#[tokio::test]
async fn test_unencrypted_volume_is_not_rotated() {
    let harness = Harness::new(vec![data_host(HOST)]);
    let target = VaultTarget::from(&descriptor());
    harness
        .vault
        .insert_secret(&target, HOST, SecretLifecycle::Active, Passphrase::generate());

    let failure = harness
        .orchestrator
        .rotate_fleet(&request(&[HOST]))
        .await
        .expect_err("rotation should fail");
    let result = &failure.report.results[&HostId::new(HOST)];

    assert!(result.comment.contains("is not encrypted"));
    assert_eq!(harness.vault.current_version(HOST), Some(1));
    assert!(harness.vault.mutations().is_empty());
}
