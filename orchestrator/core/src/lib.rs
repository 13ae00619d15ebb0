// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Lib
//!
//! In-place LUKS encryption of mounted volumes across a VM fleet, with
//! vault-held passphrases, boot-time unlock and passphrase rotation.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Domain model, application services and the SSH and
//!   vault adapters

pub mod application;
pub mod domain;
pub mod infrastructure;

pub use domain::*;
