//! Persistence shim.
//!
//! Models are stored as one JSON document per entity under deterministic
//! keys:
//!
//! | Entity   | Key                                  |
//! |----------|--------------------------------------|
//! | provider | `corral/resource/<type>/<provider>`  |
//! | workload | `corral/alta/<workloadId>`           |
//! | volume   | `corral/volume/<type>:<volumeId>`    |
//!
//! Writes are plain `set`s; there are no cross-key transactions.

use corral_store::{keys::ROOT, CoordStore, StoreError};
use serde::{de::DeserializeOwned, Serialize};
use tracing::warn;

pub fn resource_dir() -> String {
    format!("{ROOT}/resource")
}

pub fn resource_key(resource_type: &str, provider: &str) -> String {
    format!("{ROOT}/resource/{resource_type}/{provider}")
}

pub fn workload_dir() -> String {
    format!("{ROOT}/alta")
}

pub fn workload_key(id: &str) -> String {
    format!("{ROOT}/alta/{id}")
}

pub fn volume_dir() -> String {
    format!("{ROOT}/volume")
}

pub fn volume_key(key: &str) -> String {
    format!("{ROOT}/volume/{key}")
}

/// Write `model` as JSON under `key`.
pub async fn save<T: Serialize>(
    store: &dyn CoordStore,
    key: &str,
    model: &T,
) -> Result<(), StoreError> {
    let json = serde_json::to_string(model)?;
    store.set(key, &json, None).await?;
    Ok(())
}

/// Remove `key`; a key that is already gone counts as removed.
pub async fn remove(store: &dyn CoordStore, key: &str) -> Result<(), StoreError> {
    match store.delete(key).await {
        Ok(()) | Err(StoreError::KeyNotFound(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Decode every document under `dir`. Undecodable documents are logged and
/// skipped.
pub async fn load_all<T: DeserializeOwned>(
    store: &dyn CoordStore,
    dir: &str,
) -> Result<Vec<(String, T)>, StoreError> {
    let entries = store.list_dir(dir).await?;
    let mut models = Vec::with_capacity(entries.len());
    for kv in entries {
        match serde_json::from_str(&kv.value) {
            Ok(model) => models.push((kv.key, model)),
            Err(e) => warn!(key = %kv.key, error = %e, "Skipping undecodable document"),
        }
    }
    Ok(models)
}
