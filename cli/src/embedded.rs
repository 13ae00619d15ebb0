// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! In-process service wiring
//!
//! Every command runs the orchestrator inside the CLI process: SSH for the
//! hosts, the HTTP vault and object store clients for passphrases, one
//! event bus for the run.

use anyhow::{Context, Result};
use colored::Colorize;
use std::sync::Arc;
use tokio::task::JoinHandle;

use fleetcrypt_core::{
    application::fleet::FleetOrchestrator,
    domain::{config::EncryptionConfigManifest, events::NodeEncryptionEvent, events::SecretEvent},
    infrastructure::{
        event_bus::{DomainEvent, EventBus, EventBusError},
        object_store::{create_object_store_client, ObjectStoreBackend},
        remote::SshExecutor,
        vault::{create_vault_client, VaultBackend},
    },
};

pub struct EmbeddedRuntime {
    orchestrator: FleetOrchestrator,
    event_bus: Arc<EventBus>,
    config: Arc<EncryptionConfigManifest>,
}

impl EmbeddedRuntime {
    pub fn new(config: EncryptionConfigManifest) -> Result<Self> {
        config.validate().context("Configuration validation failed")?;
        let config = Arc::new(config);

        let executor = Arc::new(SshExecutor::new(config.spec.remote.clone()));
        let vault = create_vault_client(VaultBackend::Http(config.spec.vault.clone()))
            .context("Failed to initialize the vault client")?;
        let objects = create_object_store_client(ObjectStoreBackend::Http(config.spec.object_store.clone()))
            .context("Failed to initialize the object store client")?;
        let event_bus = Arc::new(EventBus::with_default_capacity());
        let orchestrator = FleetOrchestrator::with_standard_services(
            executor,
            vault,
            objects,
            event_bus.clone(),
            config.clone(),
        );

        Ok(Self {
            orchestrator,
            event_bus,
            config,
        })
    }

    pub fn orchestrator(&self) -> &FleetOrchestrator {
        &self.orchestrator
    }

    pub fn config(&self) -> &EncryptionConfigManifest {
        &self.config
    }

    /// Print workflow and rotation events as they happen, until the
    /// returned task is aborted or the bus closes.
    pub fn watch(&self) -> JoinHandle<()> {
        let mut receiver = self.event_bus.subscribe();
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => print_event(&event),
                    Err(EventBusError::Lagged(_)) => continue,
                    Err(_) => break,
                }
            }
        })
    }
}

fn print_event(event: &DomainEvent) {
    match event {
        DomainEvent::NodeEncryption(NodeEncryptionEvent::StateEntered {
            host,
            mount_point,
            state,
            ..
        }) => println!("  {} {} -> {}", host.as_str().bold(), mount_point, state),
        DomainEvent::NodeEncryption(NodeEncryptionEvent::WorkflowCompleted {
            host, status, ..
        }) => println!("  {} finished: {}", host.as_str().bold(), status),
        DomainEvent::Secret(SecretEvent::RotationRolledBack {
            host,
            reverted_to,
            success,
            ..
        }) => {
            let line = format!("  {} rolled back to version {}", host, reverted_to);
            if *success {
                println!("{}", line.yellow());
            } else {
                println!("{}", format!("{} FAILED", line).red());
            }
        }
        _ => {}
    }
}
