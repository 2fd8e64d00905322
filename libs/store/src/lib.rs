//! # corral-store
//!
//! The coordination-store contract the control plane builds on, plus the
//! primitives layered over it.
//!
//! - [`CoordStore`]: get/set/create/delete, compare-and-swap and
//!   compare-and-delete keyed on a revision, recursive listing, watches and
//!   TTL-bearing keys
//! - [`MemoryStore`]: in-process implementation, used by tests and
//!   single-replica deployments
//! - [`EtcdStore`]: client for the etcd v2 keys API
//! - [`DistributedLock`]: lease-based mutual exclusion
//! - [`ServiceRegistry`]: TTL-refreshed service registrations and watches

mod error;
mod etcd;
pub mod keys;
mod lock;
mod memory;
mod registry;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

pub use error::StoreError;
pub use etcd::EtcdStore;
pub use lock::{DistributedLock, LockError, LockEvent, LockStatus};
pub use memory::MemoryStore;
pub use registry::{Registration, ServiceEvent, ServiceInfo, ServiceRegistry, ServiceWatch};

/// A leaf key and its current value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
    /// Store revision of the last write to this key.
    pub revision: u64,
}

/// Kind of change reported by a [`Watch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchAction {
    Create,
    Set,
    Update,
    CompareAndSwap,
    Delete,
    CompareAndDelete,
    Expire,
}

impl WatchAction {
    /// True when the key no longer exists after this change.
    pub fn is_removal(self) -> bool {
        matches!(self, Self::Delete | Self::CompareAndDelete | Self::Expire)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Set => "set",
            Self::Update => "update",
            Self::CompareAndSwap => "compareAndSwap",
            Self::Delete => "delete",
            Self::CompareAndDelete => "compareAndDelete",
            Self::Expire => "expire",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "create" => Self::Create,
            "set" => Self::Set,
            "update" => Self::Update,
            "compareAndSwap" => Self::CompareAndSwap,
            "delete" => Self::Delete,
            "compareAndDelete" => Self::CompareAndDelete,
            "expire" => Self::Expire,
            _ => return None,
        })
    }
}

impl fmt::Display for WatchAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub action: WatchAction,
    pub key: String,
    /// New value; `None` for removals.
    pub value: Option<String>,
    pub revision: u64,
}

/// Stream of changes under a key. Dropping it stops the watch.
#[derive(Debug)]
pub struct Watch {
    rx: mpsc::Receiver<WatchEvent>,
    _guard: DropGuard,
}

impl Watch {
    pub(crate) fn new(rx: mpsc::Receiver<WatchEvent>, token: CancellationToken) -> Self {
        Self {
            rx,
            _guard: token.drop_guard(),
        }
    }

    /// Next change, or `None` once the watch has ended.
    pub async fn next(&mut self) -> Option<WatchEvent> {
        self.rx.recv().await
    }
}

/// Buffer between a watch producer and its consumer.
pub(crate) const WATCH_BUFFER: usize = 64;

/// Linearizable key-value store used for coordination and persistence.
///
/// Keys are `/`-separated paths without a leading slash. Revisions increase
/// monotonically across the whole store.
#[async_trait]
pub trait CoordStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>, StoreError>;

    /// Unconditional write. Returns the new revision.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<u64, StoreError>;

    /// Write only if the key is absent; fails with [`StoreError::KeyExists`].
    async fn create(&self, key: &str, value: &str, ttl: Option<Duration>)
        -> Result<u64, StoreError>;

    /// Write only if the key's revision is still `prev_revision`.
    async fn compare_and_swap(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
        prev_revision: u64,
    ) -> Result<u64, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Delete only if the key's revision is still `prev_revision`.
    async fn compare_and_delete(&self, key: &str, prev_revision: u64) -> Result<(), StoreError>;

    /// All leaves below `prefix`, recursively, sorted by key.
    async fn list_dir(&self, prefix: &str) -> Result<Vec<KeyValue>, StoreError>;

    /// Watch `key`, or everything below it when `recursive`.
    async fn watch(&self, key: &str, recursive: bool) -> Result<Watch, StoreError>;
}

/// True when `key` is `prefix` itself or lies below it.
pub(crate) fn under_prefix(key: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    prefix.is_empty()
        || key == prefix
        || (key.starts_with(prefix) && key.as_bytes().get(prefix.len()) == Some(&b'/'))
}

/// Strip surrounding slashes so `"/a/b/"` and `"a/b"` name the same key.
pub(crate) fn normalize_key(key: &str) -> &str {
    key.trim_matches('/')
}
