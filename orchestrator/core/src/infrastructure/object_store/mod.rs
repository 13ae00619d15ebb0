// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Object Store Infrastructure Module
//!
//! Concrete implementations of the [`ObjectStoreKeyClient`] trait.

pub mod http;
pub mod memory;

pub use http::HttpObjectStoreClient;
pub use memory::{InMemoryObjectStore, ObjectStoreFaults};

use std::sync::Arc;

use crate::domain::config::ObjectStoreConfig;
use crate::domain::object_store::{ObjectStoreError, ObjectStoreKeyClient};

/// Object store backend selection
#[derive(Debug, Clone)]
pub enum ObjectStoreBackend {
    /// Object storage and KMS crypto REST APIs (production)
    Http(ObjectStoreConfig),

    /// In-process bucket and KMS for dry runs and tests
    InMemory,
}

pub fn create_object_store_client(
    backend: ObjectStoreBackend,
) -> Result<Arc<dyn ObjectStoreKeyClient>, ObjectStoreError> {
    match backend {
        ObjectStoreBackend::Http(config) => Ok(Arc::new(HttpObjectStoreClient::new(&config)?)),
        ObjectStoreBackend::InMemory => Ok(Arc::new(InMemoryObjectStore::new())),
    }
}
