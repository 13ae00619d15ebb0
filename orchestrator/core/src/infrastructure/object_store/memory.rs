// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! In-memory bucket and KMS.
//!
//! Wrapped data keys are opaque handles the store can unwrap again, which is
//! what a host's fetcher does with the KMS decrypt call.

use async_trait::async_trait;
use parking_lot::Mutex;
use rand_core::{OsRng, RngCore};
use std::collections::BTreeMap;
use zeroize::Zeroizing;

use crate::domain::object_store::{
    DataKey, ObjectStoreError, ObjectStoreKeyClient, SealedPassphrase, DATA_KEY_BYTES,
};
use crate::domain::secret::{ObjectStoreLocation, Passphrase};

/// Failures the in-memory store can be told to produce.
#[derive(Debug, Clone, Default)]
pub struct ObjectStoreFaults {
    /// Reject every put with this status and message.
    pub reject_put: Option<(u16, String)>,
    /// Fail the next N existence checks with a network error.
    pub network_failures: u32,
}

type ObjectKey = (String, String, String);

fn object_key(location: &ObjectStoreLocation, name: &str) -> ObjectKey {
    (
        location.namespace.clone(),
        location.bucket.clone(),
        name.to_string(),
    )
}

#[derive(Default)]
struct StoreState {
    objects: BTreeMap<ObjectKey, Vec<u8>>,
    /// Wrapped data key to plaintext, per master key.
    data_keys: BTreeMap<(String, String), Zeroizing<Vec<u8>>>,
    next_key: u64,
    faults: ObjectStoreFaults,
    mutations: Vec<String>,
}

#[derive(Default)]
pub struct InMemoryObjectStore {
    state: Mutex<StoreState>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_faults(&self, faults: ObjectStoreFaults) {
        self.state.lock().faults = faults;
    }

    pub fn contains(&self, location: &ObjectStoreLocation, name: &str) -> bool {
        self.state.lock().objects.contains_key(&object_key(location, name))
    }

    /// Passphrase a fetcher allowed to use `location.kms_key_id` would
    /// recover from object `name`.
    pub fn passphrase_for(&self, location: &ObjectStoreLocation, name: &str) -> Option<Passphrase> {
        let state = self.state.lock();
        let body = state.objects.get(&object_key(location, name))?;
        let sealed = SealedPassphrase::from_slice(body).ok()?;
        let key = state
            .data_keys
            .get(&(location.kms_key_id.clone(), sealed.wrapped_key.clone()))?;
        sealed.open(key).ok()
    }

    /// Every mutating call made so far, e.g. `put vm01`, `delete vm01`.
    pub fn mutations(&self) -> Vec<String> {
        self.state.lock().mutations.clone()
    }
}

#[async_trait]
impl ObjectStoreKeyClient for InMemoryObjectStore {
    async fn generate_data_key(&self, location: &ObjectStoreLocation) -> Result<DataKey, ObjectStoreError> {
        let mut plaintext = Zeroizing::new(vec![0u8; DATA_KEY_BYTES]);
        OsRng.fill_bytes(&mut plaintext);

        let mut state = self.state.lock();
        state.next_key += 1;
        let ciphertext = format!("wrapped-dek-{}", state.next_key);
        state.data_keys.insert(
            (location.kms_key_id.clone(), ciphertext.clone()),
            plaintext.clone(),
        );
        Ok(DataKey { ciphertext, plaintext })
    }

    async fn object_exists(&self, location: &ObjectStoreLocation, name: &str) -> Result<bool, ObjectStoreError> {
        let mut state = self.state.lock();
        if state.faults.network_failures > 0 {
            state.faults.network_failures -= 1;
            return Err(ObjectStoreError::Network("connection reset by peer".to_string()));
        }
        Ok(state.objects.contains_key(&object_key(location, name)))
    }

    async fn put_object(
        &self,
        location: &ObjectStoreLocation,
        name: &str,
        body: Vec<u8>,
    ) -> Result<(), ObjectStoreError> {
        let mut state = self.state.lock();
        if let Some((status, message)) = state.faults.reject_put.clone() {
            return Err(ObjectStoreError::Rejected { status, message });
        }
        state.mutations.push(format!("put {}", name));
        state.objects.insert(object_key(location, name), body);
        Ok(())
    }

    async fn delete_object(&self, location: &ObjectStoreLocation, name: &str) -> Result<(), ObjectStoreError> {
        let mut state = self.state.lock();
        state.mutations.push(format!("delete {}", name));
        state
            .objects
            .remove(&object_key(location, name))
            .map(|_| ())
            .ok_or_else(|| ObjectStoreError::NotFound(name.to_string()))
    }
}
