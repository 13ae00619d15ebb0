// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain
//!
//! Pure types, invariants and collaborator traits for fleet encryption.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Host, mount, secret and workflow models plus the remote
//!   executor, vault and object store anti-corruption traits

pub mod config;
pub mod encryption;
pub mod error;
pub mod events;
pub mod host;
pub mod mount;
pub mod object_store;
pub mod remote;
pub mod retry;
pub mod secret;
pub mod service_unit;
pub mod vault;
pub mod version;
