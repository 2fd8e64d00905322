//! Lease-based distributed lock.
//!
//! A lock is a TTL key whose value is the holder's id. Each
//! [`DistributedLock`] runs one background loop that:
//!
//! 1. opens a watch on the key before reading it, so a release that lands
//!    between the read and the wait is never missed
//! 2. creates the key if absent, or adopts it if it already carries our id
//! 3. otherwise waits for a delete/expire notification, the acquisition
//!    deadline, or a stop request
//! 4. while held, extends the lease every `3 * ttl / 10` with a
//!    compare-and-swap on the last revision it wrote
//!
//! Outcomes are reported as [`LockEvent`]s. Store errors while contending
//! are logged and retried until the lock is released or killed.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{keys, CoordStore, StoreError, Watch};

/// Default pause between attempts after a store error.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

const EVENT_BUFFER: usize = 16;

/// Notifications delivered on the lock's event channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockEvent {
    /// This instance now holds the lock.
    Acquired,
    /// The acquisition deadline passed while another instance held the lock.
    AcquireTimeout,
    /// A lease refresh failed; this instance no longer holds the lock.
    Lost,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LockError {
    #[error("lock {0} is already being acquired")]
    AlreadyStarted(String),
}

/// Point-in-time view of a lock.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockStatus {
    pub acquired: bool,
    /// Last holder observed in the store.
    pub holder: Option<String>,
    /// Revision of our last successful write while held.
    pub revision: Option<u64>,
}

struct Running {
    stop: CancellationToken,
    task: JoinHandle<Option<u64>>,
}

/// Handle to one contender for a named lock.
pub struct DistributedLock {
    store: Arc<dyn CoordStore>,
    name: String,
    key: String,
    self_id: String,
    ttl: Duration,
    retry_interval: Duration,
    status_tx: Arc<watch::Sender<LockStatus>>,
    status_rx: watch::Receiver<LockStatus>,
    events_tx: mpsc::Sender<LockEvent>,
    events_rx: Option<mpsc::Receiver<LockEvent>>,
    running: Option<Running>,
}

impl DistributedLock {
    pub fn new(
        store: Arc<dyn CoordStore>,
        name: impl Into<String>,
        self_id: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        let name = name.into();
        let (status_tx, status_rx) = watch::channel(LockStatus::default());
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        Self {
            store,
            key: keys::lock(&name),
            name,
            self_id: self_id.into(),
            ttl,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            status_tx: Arc::new(status_tx),
            status_rx,
            events_tx,
            events_rx: Some(events_rx),
            running: None,
        }
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    /// Take the event receiver. Returns `None` after the first call.
    pub fn events(&mut self) -> Option<mpsc::Receiver<LockEvent>> {
        self.events_rx.take()
    }

    /// Start contending. Returns immediately; the outcome arrives on the
    /// event channel. A zero or absent timeout waits forever.
    pub fn acquire(&mut self, timeout: Option<Duration>) -> Result<(), LockError> {
        if self.running.as_ref().is_some_and(|r| !r.task.is_finished()) {
            return Err(LockError::AlreadyStarted(self.name.clone()));
        }

        let stop = CancellationToken::new();
        let worker = LockLoop {
            store: self.store.clone(),
            key: self.key.clone(),
            self_id: self.self_id.clone(),
            ttl: self.ttl,
            retry_interval: self.retry_interval,
            status: self.status_tx.clone(),
            events: self.events_tx.clone(),
            stop: stop.clone(),
            deadline: timeout
                .filter(|t| !t.is_zero())
                .map(|t| Instant::now() + t),
        };

        debug!(lock = %self.name, holder = %self.self_id, "Starting lock acquisition");
        self.running = Some(Running {
            stop,
            task: tokio::spawn(worker.run()),
        });
        Ok(())
    }

    /// Stop contending and, if held, delete the key (compare-and-delete on
    /// the last revision). Deletion failures are logged only.
    pub async fn release(&mut self) {
        let Some(held) = self.stop().await else {
            return;
        };
        match self.store.compare_and_delete(&self.key, held).await {
            Ok(()) => info!(lock = %self.name, "Released lock"),
            Err(e) => warn!(lock = %self.name, error = %e, "Failed to delete lock key on release"),
        }
    }

    /// Stop all background work without touching the key, as if the
    /// process had crashed. The lease expires on its own.
    pub async fn kill(&mut self) {
        self.stop().await;
    }

    async fn stop(&mut self) -> Option<u64> {
        let running = self.running.take()?;
        running.stop.cancel();
        let held = running.task.await.ok().flatten();
        self.status_tx.send_modify(|s| {
            s.acquired = false;
            s.revision = None;
        });
        held
    }

    pub fn is_acquired(&self) -> bool {
        self.status_rx.borrow().acquired
    }

    /// Last holder observed, which may be us.
    pub fn holder(&self) -> Option<String> {
        self.status_rx.borrow().holder.clone()
    }

    pub fn status(&self) -> LockStatus {
        self.status_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<LockStatus> {
        self.status_rx.clone()
    }
}

impl Drop for DistributedLock {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.stop.cancel();
        }
    }
}

// =============================================================================
// Background loop
// =============================================================================

enum Attempt {
    Acquired(u64),
    HeldBy(String),
    /// Lost a create race; re-read immediately.
    Contended,
    /// Store error; pause first.
    Failed,
}

enum Wait {
    Retry,
    Reopen,
    TimedOut,
    Stopped,
}

enum Hold {
    Stopped(u64),
    Lost,
}

struct LockLoop {
    store: Arc<dyn CoordStore>,
    key: String,
    self_id: String,
    ttl: Duration,
    retry_interval: Duration,
    status: Arc<watch::Sender<LockStatus>>,
    events: mpsc::Sender<LockEvent>,
    stop: CancellationToken,
    deadline: Option<Instant>,
}

impl LockLoop {
    /// Returns the revision still held when stopped, if any.
    async fn run(self) -> Option<u64> {
        let mut watch = self.open_watch().await?;

        loop {
            if self.stop.is_cancelled() {
                return None;
            }

            match self.try_acquire().await {
                Attempt::Acquired(revision) => {
                    self.publish(true, Some(self.self_id.clone()), Some(revision));
                    info!(key = %self.key, holder = %self.self_id, revision, "Acquired lock");
                    self.emit(LockEvent::Acquired);

                    match self.hold(revision, &mut watch).await {
                        Hold::Stopped(revision) => return Some(revision),
                        Hold::Lost => {
                            self.publish(false, None, None);
                            warn!(key = %self.key, holder = %self.self_id, "Lost lock");
                            self.emit(LockEvent::Lost);
                            watch = self.open_watch().await?;
                        }
                    }
                }
                Attempt::HeldBy(holder) => {
                    debug!(key = %self.key, holder = %holder, "Lock held elsewhere, waiting");
                    self.publish(false, Some(holder), None);

                    match self.wait_for_release(&mut watch).await {
                        Wait::Retry => {}
                        Wait::Reopen => watch = self.open_watch().await?,
                        Wait::TimedOut => {
                            warn!(key = %self.key, "Timed out acquiring lock");
                            self.emit(LockEvent::AcquireTimeout);
                            return None;
                        }
                        Wait::Stopped => return None,
                    }
                }
                Attempt::Contended => {}
                Attempt::Failed => {
                    if !self.pause().await {
                        return None;
                    }
                }
            }
        }
    }

    async fn open_watch(&self) -> Option<Watch> {
        loop {
            match self.store.watch(&self.key, false).await {
                Ok(watch) => return Some(watch),
                Err(e) => {
                    warn!(key = %self.key, error = %e, "Failed to watch lock key");
                    if !self.pause().await {
                        return None;
                    }
                }
            }
        }
    }

    async fn try_acquire(&self) -> Attempt {
        match self.store.get(&self.key).await {
            Ok(None) => match self
                .store
                .create(&self.key, &self.self_id, Some(self.ttl))
                .await
            {
                Ok(revision) => Attempt::Acquired(revision),
                Err(StoreError::KeyExists(_)) => Attempt::Contended,
                Err(e) => {
                    warn!(key = %self.key, error = %e, "Failed to create lock key");
                    Attempt::Failed
                }
            },
            Ok(Some(kv)) if kv.value == self.self_id => Attempt::Acquired(kv.revision),
            Ok(Some(kv)) => Attempt::HeldBy(kv.value),
            Err(e) => {
                warn!(key = %self.key, error = %e, "Failed to read lock key");
                Attempt::Failed
            }
        }
    }

    async fn wait_for_release(&self, watch: &mut Watch) -> Wait {
        loop {
            let deadline = async {
                match self.deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = self.stop.cancelled() => return Wait::Stopped,
                _ = deadline => return Wait::TimedOut,
                event = watch.next() => match event {
                    Some(event) if event.action.is_removal() => {
                        debug!(key = %self.key, action = %event.action, "Lock key released");
                        return Wait::Retry;
                    }
                    Some(_) => {}
                    None => return Wait::Reopen,
                },
            }
        }
    }

    async fn hold(&self, mut revision: u64, watch: &mut Watch) -> Hold {
        let period = (self.ttl * 3 / 10).max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        let mut watching = true;

        loop {
            tokio::select! {
                _ = self.stop.cancelled() => return Hold::Stopped(revision),
                _ = ticker.tick() => {
                    match self
                        .store
                        .compare_and_swap(&self.key, &self.self_id, Some(self.ttl), revision)
                        .await
                    {
                        Ok(next) => {
                            revision = next;
                            self.publish(true, Some(self.self_id.clone()), Some(revision));
                        }
                        Err(e) => {
                            warn!(key = %self.key, error = %e, "Lease refresh failed");
                            return Hold::Lost;
                        }
                    }
                }
                // Drain our own refresh notifications.
                event = watch.next(), if watching => {
                    if event.is_none() {
                        watching = false;
                    }
                }
            }
        }
    }

    /// Sleep for the retry interval. Returns false if stopped meanwhile.
    async fn pause(&self) -> bool {
        tokio::select! {
            _ = self.stop.cancelled() => false,
            _ = tokio::time::sleep(self.retry_interval) => true,
        }
    }

    fn publish(&self, acquired: bool, holder: Option<String>, revision: Option<u64>) {
        self.status.send_replace(LockStatus {
            acquired,
            holder,
            revision,
        });
    }

    fn emit(&self, event: LockEvent) {
        if let Err(e) = self.events.try_send(event) {
            warn!(key = %self.key, event = ?event, error = %e, "Dropping lock event");
        }
    }
}
