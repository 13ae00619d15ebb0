// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod fleet;
pub mod host_shell;
pub mod inspector;
pub mod keyapi;
pub mod node_encryption;
pub mod preparer;
pub mod rotation;
pub mod secret_lifecycle;
pub mod toolchain;

// Re-export services for convenience
pub use fleet::{EncryptionRequest, FleetOrchestrator, FleetPartialFailure, HostTask};
pub use node_encryption::{NodeEncryptionService, RequestOptions, StandardNodeEncryptionService};
pub use rotation::{RotationService, StandardRotationService};
pub use secret_lifecycle::{SecretLifecycleService, SecretLookup, StandardSecretLifecycleService};
