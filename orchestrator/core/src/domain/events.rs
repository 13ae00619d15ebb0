// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::encryption::{NodeWorkflowState, WorkflowStatus};
use crate::domain::host::HostId;

/// Node encryption workflow events
///
/// One `StateEntered` per step a host passes through, then exactly one
/// `WorkflowCompleted`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NodeEncryptionEvent {
    StateEntered {
        host: HostId,
        mount_point: String,
        state: NodeWorkflowState,
        entered_at: DateTime<Utc>,
    },
    WorkflowCompleted {
        host: HostId,
        mount_point: String,
        status: WorkflowStatus,
        elapsed_ms: u64,
        error: Option<String>,
        completed_at: DateTime<Utc>,
    },
}

/// Secret lifecycle and rotation events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SecretEvent {
    SecretCreated {
        host: HostId,
        secret_id: String,
        created_at: DateTime<Utc>,
    },
    VersionCreated {
        host: HostId,
        secret_id: String,
        version: u64,
        created_at: DateTime<Utc>,
    },
    DeletionCancelled {
        host: HostId,
        secret_id: String,
        cancelled_at: DateTime<Utc>,
    },
    DeletionScheduled {
        host: HostId,
        secret_id: String,
        delete_at: DateTime<Utc>,
    },
    RotationCompleted {
        host: HostId,
        previous_version: u64,
        new_version: u64,
        completed_at: DateTime<Utc>,
    },
    RotationRolledBack {
        host: HostId,
        reverted_to: u64,
        abandoned_version: u64,
        /// False when reverting the CURRENT tag itself failed
        success: bool,
        rolled_back_at: DateTime<Utc>,
    },
}

/// Fleet run events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FleetEvent {
    RunStarted {
        run_id: Uuid,
        host_count: usize,
        started_at: DateTime<Utc>,
    },
    RunCompleted {
        run_id: Uuid,
        succeeded: usize,
        failed: usize,
        completed_at: DateTime<Utc>,
    },
}
