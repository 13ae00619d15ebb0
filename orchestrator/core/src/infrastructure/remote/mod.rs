// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Remote Execution Infrastructure Module

pub mod simulated;
pub mod ssh;

pub use simulated::{SimulatedFleet, SimulatedHost};
pub use ssh::SshExecutor;
