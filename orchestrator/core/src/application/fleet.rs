// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Fleet Orchestrator
//!
//! Runs one per-host task (encryption or rotation) across a host set:
//! - at most `fleet.max_parallel_hosts` tasks at once
//! - each task bounded by `fleet.host_timeout`, measured from when it gets
//!   its slot
//! - no fail-fast: every host finishes or times out before the report is
//!   returned, and any failure turns the whole run into
//!   [`FleetPartialFailure`]

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::application::inspector::StandardVolumeInspector;
use crate::application::keyapi::StandardKeyApiProvisioner;
use crate::application::node_encryption::{
    NodeEncryptionService, RequestOptions, StandardNodeEncryptionService,
};
use crate::application::preparer::StandardVolumePreparer;
use crate::application::rotation::{RotationService, StandardRotationService};
use crate::application::secret_lifecycle::{SecretLifecycleService, StandardSecretLifecycleService};
use crate::application::toolchain::StandardToolchainVerifier;
use crate::domain::config::EncryptionConfigManifest;
use crate::domain::encryption::{FleetReport, HostOutcome, RotationResult, WorkflowResult};
use crate::domain::error::EncryptionError;
use crate::domain::events::FleetEvent;
use crate::domain::host::HostId;
use crate::domain::object_store::ObjectStoreKeyClient;
use crate::domain::remote::RemoteExecutor;
use crate::domain::secret::RemoteSecretDescriptor;
use crate::domain::vault::VaultClient;
use crate::infrastructure::event_bus::EventBus;

/// What an operator asks for: which hosts, which mount point, which secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionRequest {
    pub hosts: Vec<HostId>,
    pub mount_point: String,
    pub descriptor: RemoteSecretDescriptor,
    #[serde(default)]
    pub options: RequestOptions,
}

impl EncryptionRequest {
    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let request: Self = serde_yaml::from_str(yaml)?;
        request.validate()?;
        Ok(request)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.hosts.is_empty() {
            anyhow::bail!("request.hosts cannot be empty");
        }
        if !self.mount_point.starts_with('/') || self.mount_point == "/" {
            anyhow::bail!("request.mount_point must be an absolute path other than /");
        }
        self.descriptor.validate().map_err(anyhow::Error::msg)
    }
}

/// At least one host failed. The full report is attached.
#[derive(Debug, Error)]
#[error("{count} of {total} hosts failed")]
pub struct FleetPartialFailure<R: std::fmt::Debug> {
    pub count: usize,
    pub total: usize,
    pub report: FleetReport<R>,
}

/// One unit of per-host work the orchestrator can fan out.
#[async_trait]
pub trait HostTask: Send + Sync + 'static {
    type Output: HostOutcome;

    async fn run(&self, host: HostId) -> Self::Output;
}

pub struct EncryptionTask {
    pub service: Arc<dyn NodeEncryptionService>,
    pub mount_point: String,
    pub descriptor: RemoteSecretDescriptor,
    pub options: RequestOptions,
}

#[async_trait]
impl HostTask for EncryptionTask {
    type Output = WorkflowResult;

    async fn run(&self, host: HostId) -> WorkflowResult {
        self.service
            .encrypt(&host, &self.mount_point, &self.descriptor, &self.options)
            .await
    }
}

pub struct RotationTask {
    pub service: Arc<dyn RotationService>,
    pub mount_point: String,
    pub descriptor: RemoteSecretDescriptor,
}

#[async_trait]
impl HostTask for RotationTask {
    type Output = RotationResult;

    async fn run(&self, host: HostId) -> RotationResult {
        self.service
            .rotate(&host, &self.mount_point, &self.descriptor)
            .await
    }
}

pub struct FleetOrchestrator {
    node: Arc<dyn NodeEncryptionService>,
    rotation: Arc<dyn RotationService>,
    secrets: Arc<dyn SecretLifecycleService>,
    event_bus: Arc<EventBus>,
    config: Arc<EncryptionConfigManifest>,
}

impl FleetOrchestrator {
    pub fn new(
        node: Arc<dyn NodeEncryptionService>,
        rotation: Arc<dyn RotationService>,
        secrets: Arc<dyn SecretLifecycleService>,
        event_bus: Arc<EventBus>,
        config: Arc<EncryptionConfigManifest>,
    ) -> Self {
        Self {
            node,
            rotation,
            secrets,
            event_bus,
            config,
        }
    }

    /// Wire the standard services around one executor and the two key
    /// stores. The vault call limiter is shared by every host of every run.
    pub fn with_standard_services(
        executor: Arc<dyn RemoteExecutor>,
        vault: Arc<dyn VaultClient>,
        objects: Arc<dyn ObjectStoreKeyClient>,
        event_bus: Arc<EventBus>,
        config: Arc<EncryptionConfigManifest>,
    ) -> Self {
        let secrets: Arc<dyn SecretLifecycleService> = Arc::new(StandardSecretLifecycleService::new(
            vault,
            objects,
            event_bus.clone(),
            config.clone(),
        ));
        let inspector = Arc::new(StandardVolumeInspector::new(executor.clone(), config.clone()));
        let keyapi = Arc::new(StandardKeyApiProvisioner::new(executor.clone(), config.clone()));

        let node = Arc::new(StandardNodeEncryptionService::new(
            executor.clone(),
            inspector.clone(),
            Arc::new(StandardToolchainVerifier::new(executor.clone(), config.clone())),
            secrets.clone(),
            keyapi.clone(),
            Arc::new(StandardVolumePreparer::new(executor.clone(), config.clone())),
            event_bus.clone(),
            config.clone(),
        ));
        let rotation = Arc::new(StandardRotationService::new(
            executor,
            inspector,
            secrets.clone(),
            keyapi,
            event_bus.clone(),
            config.clone(),
        ));

        Self::new(node, rotation, secrets, event_bus, config)
    }

    pub fn secrets(&self) -> Arc<dyn SecretLifecycleService> {
        self.secrets.clone()
    }

    pub async fn encrypt_fleet(
        &self,
        request: &EncryptionRequest,
    ) -> Result<FleetReport<WorkflowResult>, FleetPartialFailure<WorkflowResult>> {
        let task = Arc::new(EncryptionTask {
            service: self.node.clone(),
            mount_point: request.mount_point.clone(),
            descriptor: request.descriptor.clone(),
            options: request.options.clone(),
        });
        self.run_fleet(&request.hosts, task).await
    }

    pub async fn rotate_fleet(
        &self,
        request: &EncryptionRequest,
    ) -> Result<FleetReport<RotationResult>, FleetPartialFailure<RotationResult>> {
        let task = Arc::new(RotationTask {
            service: self.rotation.clone(),
            mount_point: request.mount_point.clone(),
            descriptor: request.descriptor.clone(),
        });
        self.run_fleet(&request.hosts, task).await
    }

    /// Run `task` once per distinct host and collect every outcome.
    pub async fn run_fleet<T: HostTask>(
        &self,
        hosts: &[HostId],
        task: Arc<T>,
    ) -> Result<FleetReport<T::Output>, FleetPartialFailure<T::Output>> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let mut seen = BTreeSet::new();
        let hosts: Vec<HostId> = hosts.iter().filter(|h| seen.insert(*h)).cloned().collect();

        info!(run_id = %run_id, "Starting fleet run over {} host(s)", hosts.len());
        self.event_bus.publish_fleet_event(FleetEvent::RunStarted {
            run_id,
            host_count: hosts.len(),
            started_at,
        });

        let slots = Arc::new(Semaphore::new(self.config.spec.fleet.max_parallel_hosts.max(1)));
        let limit = self.config.spec.fleet.host_timeout;
        let mut tasks = JoinSet::new();
        for host in hosts.iter().cloned() {
            let slots = slots.clone();
            let task = task.clone();
            tasks.spawn(async move {
                let _slot = slots.acquire_owned().await.ok();
                let host_started = Utc::now();
                match tokio::time::timeout(limit, task.run(host.clone())).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        warn!(host = %host, "Host task exceeded {:?}", limit);
                        T::Output::from_error(host, host_started, &EncryptionError::TimedOut { limit })
                    }
                }
            });
        }

        let mut results = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => {
                    results.insert(outcome.host().clone(), outcome);
                }
                Err(e) => error!(run_id = %run_id, "Host task aborted: {}", e),
            }
        }
        // A panicked task leaves no outcome behind.
        for host in hosts {
            if !results.contains_key(&host) {
                let err = EncryptionError::preparation(
                    format!("the task for {} aborted without a result", host),
                    "check the orchestrator log for a panic and re-run the host",
                );
                results.insert(host.clone(), T::Output::from_error(host, started_at, &err));
            }
        }

        let report = FleetReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            results,
        };
        let failed = report.failed_count();
        let succeeded = report.succeeded_count();
        info!(run_id = %run_id, "Fleet run finished: {} succeeded, {} failed", succeeded, failed);
        self.event_bus.publish_fleet_event(FleetEvent::RunCompleted {
            run_id,
            succeeded,
            failed,
            completed_at: report.finished_at,
        });

        if failed > 0 {
            return Err(FleetPartialFailure {
                count: failed,
                total: report.results.len(),
                report,
            });
        }
        Ok(report)
    }
}
