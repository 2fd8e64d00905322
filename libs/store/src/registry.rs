//! Service registry on top of the coordination store.
//!
//! Each instance of a service is one TTL key at
//! `corral/service/<name>/<host>:<port>` whose value is the JSON-encoded
//! [`ServiceInfo`]. Registrations refresh their lease in the background;
//! when a process dies the lease lapses and watchers see the removal.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{keys, CoordStore, StoreError, Watch, WatchAction};

/// One registered service instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInfo {
    pub service_name: String,
    pub host_addr: String,
    pub port: u16,
}

impl ServiceInfo {
    pub fn new(service_name: impl Into<String>, host_addr: impl Into<String>, port: u16) -> Self {
        Self {
            service_name: service_name.into(),
            host_addr: host_addr.into(),
            port,
        }
    }

    pub fn key(&self) -> String {
        keys::service(&self.service_name, &self.host_addr, self.port)
    }

    /// Rebuild an entry from its key alone, for removals that carry no value.
    fn from_key(service: &str, key: &str) -> Option<Self> {
        let leaf = key.rsplit('/').next()?;
        let (host, port) = leaf.rsplit_once(':')?;
        Some(Self::new(service, host, port.parse().ok()?))
    }
}

/// Membership change for a watched service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceEvent {
    Added(ServiceInfo),
    Removed(ServiceInfo),
}

/// Registry operations bound to one store.
#[derive(Clone)]
pub struct ServiceRegistry {
    store: Arc<dyn CoordStore>,
}

impl ServiceRegistry {
    pub fn new(store: Arc<dyn CoordStore>) -> Self {
        Self { store }
    }

    /// Publish `info` with a lease of `ttl`, refreshed every `ttl / 3` until
    /// the returned [`Registration`] is dropped or deregistered.
    pub async fn register(
        &self,
        info: ServiceInfo,
        ttl: Duration,
    ) -> Result<Registration, StoreError> {
        let key = info.key();
        let value = serde_json::to_string(&info)?;
        let revision = match self.store.create(&key, &value, Some(ttl)).await {
            Ok(revision) => revision,
            // Stale entry from a previous run of the same instance.
            Err(StoreError::KeyExists(_)) => self.store.set(&key, &value, Some(ttl)).await?,
            Err(e) => return Err(e),
        };
        info!(key = %key, "Registered service");

        let stop = CancellationToken::new();
        tokio::spawn(refresh(
            self.store.clone(),
            key.clone(),
            value,
            ttl,
            revision,
            stop.clone(),
        ));

        Ok(Registration {
            store: self.store.clone(),
            key,
            stop,
        })
    }

    /// Current instances of `service`.
    pub async fn list(&self, service: &str) -> Result<Vec<ServiceInfo>, StoreError> {
        let entries = self.store.list_dir(&keys::service_dir(service)).await?;
        let mut services = Vec::with_capacity(entries.len());
        for kv in entries {
            match serde_json::from_str(&kv.value) {
                Ok(info) => services.push(info),
                Err(e) => warn!(key = %kv.key, error = %e, "Skipping undecodable service entry"),
            }
        }
        Ok(services)
    }

    /// Watch membership changes of `service`. Lease refreshes are filtered
    /// out; only arrivals and departures are reported.
    pub async fn watch(&self, service: &str) -> Result<ServiceWatch, StoreError> {
        let inner = self.store.watch(&keys::service_dir(service), true).await?;
        Ok(ServiceWatch {
            service: service.to_string(),
            inner,
        })
    }
}

/// Stream of [`ServiceEvent`]s.
pub struct ServiceWatch {
    service: String,
    inner: Watch,
}

impl ServiceWatch {
    pub async fn next(&mut self) -> Option<ServiceEvent> {
        loop {
            let event = self.inner.next().await?;
            match event.action {
                WatchAction::Create | WatchAction::Set => {
                    let decoded = event
                        .value
                        .as_deref()
                        .and_then(|v| serde_json::from_str::<ServiceInfo>(v).ok());
                    match decoded {
                        Some(info) => return Some(ServiceEvent::Added(info)),
                        None => warn!(key = %event.key, "Ignoring undecodable service entry"),
                    }
                }
                WatchAction::Update | WatchAction::CompareAndSwap => {}
                WatchAction::Delete | WatchAction::CompareAndDelete | WatchAction::Expire => {
                    match ServiceInfo::from_key(&self.service, &event.key) {
                        Some(info) => return Some(ServiceEvent::Removed(info)),
                        None => warn!(key = %event.key, "Ignoring malformed service key"),
                    }
                }
            }
        }
    }
}

/// Live registration. Dropping it stops the refresh and lets the lease lapse.
pub struct Registration {
    store: Arc<dyn CoordStore>,
    key: String,
    stop: CancellationToken,
}

impl Registration {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Stop refreshing and remove the entry immediately.
    pub async fn deregister(self) -> Result<(), StoreError> {
        self.stop.cancel();
        match self.store.delete(&self.key).await {
            Ok(()) | Err(StoreError::KeyNotFound(_)) => {
                info!(key = %self.key, "Deregistered service");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn refresh(
    store: Arc<dyn CoordStore>,
    key: String,
    value: String,
    ttl: Duration,
    mut revision: u64,
    stop: CancellationToken,
) {
    let period = (ttl / 3).max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                match store.compare_and_swap(&key, &value, Some(ttl), revision).await {
                    Ok(next) => revision = next,
                    Err(StoreError::KeyNotFound(_)) | Err(StoreError::CompareFailed { .. }) => {
                        // Lease lapsed or someone rewrote it; publish afresh.
                        match store.set(&key, &value, Some(ttl)).await {
                            Ok(next) => revision = next,
                            Err(e) => warn!(key = %key, error = %e, "Failed to re-register service"),
                        }
                    }
                    Err(e) => warn!(key = %key, error = %e, "Failed to refresh service lease"),
                }
            }
        }
    }
    debug!(key = %key, "Service refresh stopped");
}
