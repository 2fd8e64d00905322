//! In-process coordination store.
//!
//! Behaves like a single-node etcd: one global revision counter, TTL keys
//! expired by a background sweeper, and watch fan-out over a broadcast
//! channel. All state sits behind one mutex that is never held across an
//! await.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    normalize_key, under_prefix, CoordStore, KeyValue, StoreError, Watch, WatchAction, WatchEvent,
    WATCH_BUFFER,
};

/// Default interval between expiry sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(100);

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug)]
struct Entry {
    value: String,
    revision: u64,
    expires_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct State {
    revision: u64,
    entries: BTreeMap<String, Entry>,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<State>,
    events: broadcast::Sender<WatchEvent>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn publish(&self, event: WatchEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    /// Drop every entry whose lease ran out, emitting `Expire` for each.
    fn expire(&self, state: &mut State, now: Instant) {
        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at.is_some_and(|t| t <= now))
            .map(|(k, _)| k.clone())
            .collect();

        for key in expired {
            state.entries.remove(&key);
            state.revision += 1;
            debug!(key = %key, "Key expired");
            self.publish(WatchEvent {
                action: WatchAction::Expire,
                key,
                value: None,
                revision: state.revision,
            });
        }
    }

    fn write(
        &self,
        state: &mut State,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
        action: WatchAction,
    ) -> u64 {
        state.revision += 1;
        let revision = state.revision;
        state.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                revision,
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        self.publish(WatchEvent {
            action,
            key: key.to_string(),
            value: Some(value.to_string()),
            revision,
        });
        revision
    }

    fn remove(&self, state: &mut State, key: &str, action: WatchAction) {
        state.entries.remove(key);
        state.revision += 1;
        self.publish(WatchEvent {
            action,
            key: key.to_string(),
            value: None,
            revision: state.revision,
        });
    }
}

/// In-memory [`CoordStore`].
///
/// Clones share the same data.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create a store with the default sweep interval.
    ///
    /// When called inside a tokio runtime a sweeper task is spawned; it
    /// exits once the last clone of the store is dropped. Outside a runtime
    /// keys still expire, but only when the store is next touched.
    pub fn new() -> Self {
        Self::with_sweep_interval(DEFAULT_SWEEP_INTERVAL)
    }

    pub fn with_sweep_interval(interval: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(Shared {
            state: Mutex::new(State::default()),
            events,
        });

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let weak = Arc::downgrade(&shared);
            handle.spawn(sweep(weak, interval));
        }

        Self { shared }
    }

    /// Current store revision.
    pub fn revision(&self) -> u64 {
        self.shared.lock().revision
    }

    fn locked(&self) -> MutexGuard<'_, State> {
        let mut state = self.shared.lock();
        self.shared.expire(&mut state, Instant::now());
        state
    }
}

async fn sweep(shared: Weak<Shared>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(shared) = shared.upgrade() else {
            break;
        };
        {
            let mut state = shared.lock();
            shared.expire(&mut state, Instant::now());
        }
    }
}

#[async_trait]
impl CoordStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>, StoreError> {
        let key = normalize_key(key);
        let state = self.locked();
        Ok(state.entries.get(key).map(|e| KeyValue {
            key: key.to_string(),
            value: e.value.clone(),
            revision: e.revision,
        }))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<u64, StoreError> {
        let key = normalize_key(key);
        let mut state = self.locked();
        Ok(self
            .shared
            .write(&mut state, key, value, ttl, WatchAction::Set))
    }

    async fn create(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<u64, StoreError> {
        let key = normalize_key(key);
        let mut state = self.locked();
        if state.entries.contains_key(key) {
            return Err(StoreError::KeyExists(key.to_string()));
        }
        Ok(self
            .shared
            .write(&mut state, key, value, ttl, WatchAction::Create))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
        prev_revision: u64,
    ) -> Result<u64, StoreError> {
        let key = normalize_key(key);
        let mut state = self.locked();
        match state.entries.get(key) {
            None => Err(StoreError::KeyNotFound(key.to_string())),
            Some(e) if e.revision != prev_revision => Err(StoreError::CompareFailed {
                key: key.to_string(),
                expected: prev_revision,
            }),
            Some(_) => Ok(self.shared.write(
                &mut state,
                key,
                value,
                ttl,
                WatchAction::CompareAndSwap,
            )),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let key = normalize_key(key);
        let mut state = self.locked();
        if !state.entries.contains_key(key) {
            return Err(StoreError::KeyNotFound(key.to_string()));
        }
        self.shared.remove(&mut state, key, WatchAction::Delete);
        Ok(())
    }

    async fn compare_and_delete(&self, key: &str, prev_revision: u64) -> Result<(), StoreError> {
        let key = normalize_key(key);
        let mut state = self.locked();
        match state.entries.get(key) {
            None => Err(StoreError::KeyNotFound(key.to_string())),
            Some(e) if e.revision != prev_revision => Err(StoreError::CompareFailed {
                key: key.to_string(),
                expected: prev_revision,
            }),
            Some(_) => {
                self.shared
                    .remove(&mut state, key, WatchAction::CompareAndDelete);
                Ok(())
            }
        }
    }

    async fn list_dir(&self, prefix: &str) -> Result<Vec<KeyValue>, StoreError> {
        let prefix = normalize_key(prefix);
        let state = self.locked();
        Ok(state
            .entries
            .iter()
            .filter(|(k, _)| under_prefix(k, prefix) && k.as_str() != prefix)
            .map(|(k, e)| KeyValue {
                key: k.clone(),
                value: e.value.clone(),
                revision: e.revision,
            })
            .collect())
    }

    async fn watch(&self, key: &str, recursive: bool) -> Result<Watch, StoreError> {
        let key = normalize_key(key).to_string();
        let mut events = self.shared.events.subscribe();
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let token = CancellationToken::new();
        let stop = token.clone();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = stop.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(event) => {
                        let matches = if recursive {
                            under_prefix(&event.key, &key)
                        } else {
                            event.key == key
                        };
                        if matches && tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(key = %key, skipped, "Watch lagged, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(Watch::new(rx, token))
    }
}
