// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Node Encryption Domain Model
//!
//! - [`NodeWorkflowState`] and the [`NodeWorkflow`] aggregate that enforces
//!   the legal order of steps for one host
//! - [`StateCheck`], the tri-state answer to "has this host been done already"
//! - per-host results and the fleet-level report

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

use crate::domain::error::EncryptionError;
use crate::domain::host::HostId;

// ============================================================================
// Workflow state machine
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum NodeWorkflowState {
    Booting,
    Inspected,
    AlreadyEncrypted,
    PackagesVerified,
    Prepared,
    Encrypting { attempt: u32 },
    Opened,
    PostPrepared,
    FstabUpdated,
    Remounted,
    ServiceEnabled,
    Done,
    Failed,
}

impl NodeWorkflowState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::AlreadyEncrypted | Self::Done | Self::Failed)
    }

    /// Whether `next` may follow `self`.
    ///
    /// `Inspected -> FstabUpdated` is the resume path for a run that stopped
    /// after the fstab rewrite.
    pub fn can_transition_to(&self, next: &NodeWorkflowState) -> bool {
        use NodeWorkflowState::*;
        if matches!(next, Failed) {
            return !self.is_terminal();
        }
        match (self, next) {
            (Booting, Inspected) => true,
            (Inspected, AlreadyEncrypted | PackagesVerified | FstabUpdated) => true,
            (PackagesVerified, Prepared) => true,
            (Prepared, Encrypting { attempt: 1 }) => true,
            (Encrypting { attempt: a }, Encrypting { attempt: b }) => *b == *a + 1,
            (Encrypting { .. }, Opened) => true,
            (Opened, PostPrepared) => true,
            (PostPrepared, FstabUpdated) => true,
            (FstabUpdated, Remounted) => true,
            (Remounted, ServiceEnabled) => true,
            (ServiceEnabled, Done) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for NodeWorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Encrypting { attempt } => write!(f, "Encrypting(attempt={})", attempt),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Progress of one host through the encryption steps.
#[derive(Debug, Clone)]
pub struct NodeWorkflow {
    host: HostId,
    mount_point: String,
    state: NodeWorkflowState,
    history: Vec<NodeWorkflowState>,
    started_at: DateTime<Utc>,
}

impl NodeWorkflow {
    pub fn new(host: HostId, mount_point: impl Into<String>) -> Self {
        Self {
            host,
            mount_point: mount_point.into(),
            state: NodeWorkflowState::Booting,
            history: vec![NodeWorkflowState::Booting],
            started_at: Utc::now(),
        }
    }

    pub fn host(&self) -> &HostId {
        &self.host
    }

    pub fn mount_point(&self) -> &str {
        &self.mount_point
    }

    pub fn state(&self) -> NodeWorkflowState {
        self.state
    }

    pub fn history(&self) -> &[NodeWorkflowState] {
        &self.history
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn advance(&mut self, next: NodeWorkflowState) -> Result<(), EncryptionError> {
        if !self.state.can_transition_to(&next) {
            return Err(EncryptionError::InvalidStateTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        self.history.push(next);
        Ok(())
    }

    /// Record the failure and build the final result.
    pub fn fail(mut self, error: &EncryptionError) -> WorkflowResult {
        if !self.state.is_terminal() {
            self.state = NodeWorkflowState::Failed;
            self.history.push(NodeWorkflowState::Failed);
        }
        WorkflowResult::finish(
            self.host,
            WorkflowStatus::Failed,
            self.started_at,
            self.history,
            Some(error),
        )
    }

    /// Build the result for a workflow that reached a successful terminal state.
    pub fn complete(self) -> WorkflowResult {
        let status = match self.state {
            NodeWorkflowState::AlreadyEncrypted => WorkflowStatus::SkippedAlreadyEncrypted,
            NodeWorkflowState::Done => WorkflowStatus::Success,
            _ => WorkflowStatus::Failed,
        };
        WorkflowResult::finish(self.host, status, self.started_at, self.history, None)
    }
}

/// Answer to "has this mount point already been converted".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateCheck {
    /// Mounted on an opened LUKS mapping.
    Done,
    /// Mounted on a plain device.
    NotStarted,
    /// Not mounted, but fstab already names the mapped device: a previous
    /// run stopped between the fstab rewrite and the remount.
    Failed { mapped_device: String },
}

// ============================================================================
// Results
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Success,
    Failed,
    SkippedAlreadyEncrypted,
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::SkippedAlreadyEncrypted => write!(f, "skipped (already encrypted)"),
        }
    }
}

/// Per-host outcome of one fleet run. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub host: HostId,
    pub status: WorkflowStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
    pub states: Vec<NodeWorkflowState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
}

impl WorkflowResult {
    fn finish(
        host: HostId,
        status: WorkflowStatus,
        started_at: DateTime<Utc>,
        states: Vec<NodeWorkflowState>,
        error: Option<&EncryptionError>,
    ) -> Self {
        let finished_at = Utc::now();
        Self {
            host,
            status,
            started_at,
            finished_at,
            elapsed: (finished_at - started_at).to_std().unwrap_or_default(),
            states,
            error: error.map(|e| e.to_string()),
            resolution: error.map(|e| e.resolution()),
        }
    }

    pub fn final_state(&self) -> Option<NodeWorkflowState> {
        self.states.last().copied()
    }
}

/// Outcome of rotating one host's passphrase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RotationResult {
    pub host: HostId,
    pub success: bool,
    pub comment: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_version: Option<u64>,
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
}

/// Common shape of per-host outcomes the fleet orchestrator aggregates.
pub trait HostOutcome: Clone + Send + std::fmt::Debug + 'static {
    fn host(&self) -> &HostId;

    fn is_failure(&self) -> bool;

    /// Outcome for a host whose task never produced one (timeout, panic).
    fn from_error(host: HostId, started_at: DateTime<Utc>, error: &EncryptionError) -> Self;
}

impl HostOutcome for WorkflowResult {
    fn host(&self) -> &HostId {
        &self.host
    }

    fn is_failure(&self) -> bool {
        self.status == WorkflowStatus::Failed
    }

    fn from_error(host: HostId, started_at: DateTime<Utc>, error: &EncryptionError) -> Self {
        Self::finish(
            host,
            WorkflowStatus::Failed,
            started_at,
            vec![NodeWorkflowState::Failed],
            Some(error),
        )
    }
}

impl HostOutcome for RotationResult {
    fn host(&self) -> &HostId {
        &self.host
    }

    fn is_failure(&self) -> bool {
        !self.success
    }

    fn from_error(host: HostId, started_at: DateTime<Utc>, error: &EncryptionError) -> Self {
        Self {
            host,
            success: false,
            comment: format!("{}; resolution: {}", error, error.resolution()),
            new_version: None,
            elapsed: (Utc::now() - started_at).to_std().unwrap_or_default(),
        }
    }
}

/// Fleet-level report: one outcome per requested host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetReport<R> {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub results: BTreeMap<HostId, R>,
}

impl<R: HostOutcome> FleetReport<R> {
    pub fn failed_count(&self) -> usize {
        self.results.values().filter(|r| r.is_failure()).count()
    }

    pub fn succeeded_count(&self) -> usize {
        self.results.len() - self.failed_count()
    }

    pub fn failed_hosts(&self) -> Vec<&HostId> {
        self.results
            .values()
            .filter(|r| r.is_failure())
            .map(|r| r.host())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use NodeWorkflowState::*;

    #[test]
    fn test_happy_path_transitions() {
        let mut wf = NodeWorkflow::new(HostId::new("vm01"), "/u02");
        for next in [
            Inspected,
            PackagesVerified,
            Prepared,
            Encrypting { attempt: 1 },
            Encrypting { attempt: 2 },
            Opened,
            PostPrepared,
            FstabUpdated,
            Remounted,
            ServiceEnabled,
            Done,
        ] {
            wf.advance(next).unwrap();
        }
        let result = wf.complete();
        assert_eq!(result.status, WorkflowStatus::Success);
        assert_eq!(result.final_state(), Some(Done));
        assert_eq!(result.states.len(), 12);
    }

    #[test]
    fn test_rejects_skipping_steps() {
        let mut wf = NodeWorkflow::new(HostId::new("vm01"), "/u02");
        wf.advance(Inspected).unwrap();
        let err = wf.advance(Opened).unwrap_err();
        assert!(matches!(err, EncryptionError::InvalidStateTransition { .. }));
        assert_eq!(wf.state(), Inspected);
    }

    #[test]
    fn test_encrypt_attempts_must_be_sequential() {
        assert!(Prepared.can_transition_to(&Encrypting { attempt: 1 }));
        assert!(!Prepared.can_transition_to(&Encrypting { attempt: 2 }));
        assert!(!Encrypting { attempt: 1 }.can_transition_to(&Encrypting { attempt: 3 }));
    }

    #[test]
    fn test_terminal_states_cannot_fail() {
        assert!(!Done.can_transition_to(&Failed));
        assert!(Remounted.can_transition_to(&Failed));
    }

    #[test]
    fn test_already_encrypted_is_skipped() {
        let mut wf = NodeWorkflow::new(HostId::new("vm01"), "/u02");
        wf.advance(Inspected).unwrap();
        wf.advance(AlreadyEncrypted).unwrap();
        let result = wf.complete();
        assert_eq!(result.status, WorkflowStatus::SkippedAlreadyEncrypted);
        assert!(!result.is_failure());
    }

    #[test]
    fn test_failure_records_resolution() {
        let mut wf = NodeWorkflow::new(HostId::new("vm01"), "/u02");
        wf.advance(Inspected).unwrap();
        let err = EncryptionError::unsupported("btrfs is not supported", "convert to ext4");
        let result = wf.fail(&err);
        assert_eq!(result.status, WorkflowStatus::Failed);
        assert_eq!(result.final_state(), Some(Failed));
        assert_eq!(result.resolution.as_deref(), Some("convert to ext4"));
    }

    #[test]
    fn test_report_counts() {
        let started = Utc::now();
        let mut results = BTreeMap::new();
        let mut ok = NodeWorkflow::new(HostId::new("vm01"), "/u02");
        ok.advance(Inspected).unwrap();
        ok.advance(AlreadyEncrypted).unwrap();
        results.insert(HostId::new("vm01"), ok.complete());
        let err = EncryptionError::TimedOut {
            limit: Duration::from_secs(1),
        };
        results.insert(
            HostId::new("vm02"),
            WorkflowResult::from_error(HostId::new("vm02"), started, &err),
        );
        let report = FleetReport {
            run_id: Uuid::new_v4(),
            started_at: started,
            finished_at: Utc::now(),
            results,
        };
        assert_eq!(report.failed_count(), 1);
        assert_eq!(report.succeeded_count(), 1);
        assert_eq!(report.failed_hosts(), vec![&HostId::new("vm02")]);
    }
}
