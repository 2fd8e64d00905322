//! Core actor framework types and traits.
//!
//! Provides the building blocks every controller in the control plane is
//! made of:
//! - `Actor` trait for defining actor behavior
//! - `Supervisor` for spawning actors under one cancellation tree
//! - `ActorHandle` for sending messages (and request/reply calls) to actors
//! - `mailbox` for handing out a handle before its actor exists

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// =============================================================================
// Core Traits
// =============================================================================

/// Marker trait for actor messages.
pub trait Message: Send + Debug + 'static {}

impl<T: Send + Debug + 'static> Message for T {}

/// The Actor trait defines behavior for an actor.
///
/// Actors:
/// - Process messages one at a time (no internal concurrency)
/// - Own mutable state not shared with other actors
/// - Communicate only via message passing
#[async_trait]
pub trait Actor: Send + 'static {
    /// The message type this actor handles.
    type Message: Message;

    /// Actor name for logging.
    fn name(&self) -> &str;

    /// Handle a single message.
    ///
    /// Returns `Ok(true)` to continue or `Ok(false)` to stop. An `Err` is
    /// logged and the actor keeps running.
    async fn handle(
        &mut self,
        msg: Self::Message,
        ctx: &mut ActorContext<Self::Message>,
    ) -> Result<bool, ActorError>;

    /// Called once before the first message.
    async fn on_start(&mut self, _ctx: &mut ActorContext<Self::Message>) -> Result<(), ActorError> {
        Ok(())
    }

    /// Called when the actor is about to stop.
    async fn on_stop(&mut self, _ctx: &mut ActorContext<Self::Message>) {}

    /// Period of the actor's ticker, if it has one.
    fn tick_interval(&self) -> Option<Duration> {
        None
    }

    /// Message to process on a tick. `None` skips the tick.
    fn on_tick(&mut self) -> Option<Self::Message> {
        None
    }
}

/// Context provided to actors during message handling.
pub struct ActorContext<M: Message> {
    /// Actor's unique ID.
    pub actor_id: String,

    /// Cancelled when the actor is stopped. Long calls select against it.
    pub cancel: CancellationToken,

    /// Handle to this actor's own mailbox, for follow-up messages.
    pub myself: ActorHandle<M>,

    /// Message counter.
    pub messages_processed: u64,
}

impl<M: Message> ActorContext<M> {
    pub fn new(actor_id: String, cancel: CancellationToken, myself: ActorHandle<M>) -> Self {
        Self {
            actor_id,
            cancel,
            myself,
            messages_processed: 0,
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Errors that can occur in actors.
#[derive(Debug, Error)]
pub enum ActorError {
    /// Logged; the actor keeps running.
    #[error("transient error: {0}")]
    Transient(String),

    /// Actor mailbox is full.
    #[error("mailbox full")]
    MailboxFull,

    /// Actor has stopped.
    #[error("actor stopped")]
    ActorStopped,

    /// The actor dropped a request without replying.
    #[error("actor dropped the request without replying")]
    NoReply,
}

// =============================================================================
// Actor Handle
// =============================================================================

/// Handle for sending messages to an actor.
pub struct ActorHandle<M: Message> {
    tx: mpsc::Sender<M>,
    actor_id: String,
}

impl<M: Message> Clone for ActorHandle<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            actor_id: self.actor_id.clone(),
        }
    }
}

impl<M: Message> Debug for ActorHandle<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorHandle")
            .field("actor_id", &self.actor_id)
            .finish()
    }
}

impl<M: Message> ActorHandle<M> {
    /// Send a message to the actor, waiting for mailbox space.
    pub async fn send(&self, msg: M) -> Result<(), ActorError> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| ActorError::ActorStopped)
    }

    /// Try to send a message without blocking.
    pub fn try_send(&self, msg: M) -> Result<(), ActorError> {
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ActorError::MailboxFull,
            mpsc::error::TrySendError::Closed(_) => ActorError::ActorStopped,
        })
    }

    /// Send a request carrying a reply channel and wait for the answer.
    pub async fn call<R, F>(&self, make: F) -> Result<R, ActorError>
    where
        F: FnOnce(oneshot::Sender<R>) -> M,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(make(reply_tx)).await?;
        reply_rx.await.map_err(|_| ActorError::NoReply)
    }

    /// Get the actor ID.
    pub fn actor_id(&self) -> &str {
        &self.actor_id
    }
}

/// Receiving side of an actor's mailbox, not yet attached to an actor.
pub struct Mailbox<M: Message> {
    rx: mpsc::Receiver<M>,
    handle: ActorHandle<M>,
}

/// Create a mailbox and its handle.
///
/// Lets two actors that talk to each other be wired up before either runs:
/// hand the handle out first, then spawn the actor with
/// [`Supervisor::spawn_with_mailbox`].
pub fn mailbox<M: Message>(name: &str, size: usize) -> (ActorHandle<M>, Mailbox<M>) {
    let actor_id = format!("{}_{}", name, generate_actor_id());
    let (tx, rx) = mpsc::channel(size);
    let handle = ActorHandle { tx, actor_id };
    (
        handle.clone(),
        Mailbox {
            rx,
            handle,
        },
    )
}

/// Task of one supervised actor.
struct ActorRef {
    task_handle: tokio::task::JoinHandle<()>,
}

impl ActorRef {
    fn is_running(&self) -> bool {
        !self.task_handle.is_finished()
    }

    fn abort(&self) {
        self.task_handle.abort();
    }
}

// =============================================================================
// Supervisor
// =============================================================================

/// How long `stop_all` waits before aborting stragglers.
const STOP_GRACE: Duration = Duration::from_secs(10);

/// Owns a set of actors running under one cancellation token.
///
/// Cancelling the parent token passed to [`Supervisor::new`] stops every
/// child as well.
pub struct Supervisor {
    name: String,
    children: HashMap<String, ActorRef>,
    cancel: CancellationToken,
}

impl Supervisor {
    pub fn new(name: impl Into<String>, parent: &CancellationToken) -> Self {
        Self {
            name: name.into(),
            children: HashMap::new(),
            cancel: parent.child_token(),
        }
    }

    /// Spawn and supervise an actor with a fresh mailbox.
    pub fn spawn<A>(&mut self, actor: A, mailbox_size: usize) -> ActorHandle<A::Message>
    where
        A: Actor,
    {
        let (handle, mailbox) = mailbox(actor.name(), mailbox_size);
        self.spawn_with_mailbox(actor, mailbox);
        handle
    }

    /// Spawn an actor on a mailbox created earlier with [`mailbox`].
    pub fn spawn_with_mailbox<A>(&mut self, actor: A, mailbox: Mailbox<A::Message>)
    where
        A: Actor,
    {
        self.children.retain(|_, child| child.is_running());

        let actor_id = mailbox.handle.actor_id.clone();
        let actor_type = actor.name().to_string();
        let cancel = self.cancel.child_token();

        let task_handle = tokio::spawn(run_actor_loop(actor, mailbox, cancel));

        debug!(
            supervisor = %self.name,
            actor_id = %actor_id,
            actor_type = %actor_type,
            "Spawned actor"
        );

        self.children.insert(actor_id, ActorRef { task_handle });
    }

    /// Stop all supervised actors, aborting any that outlive the grace period.
    pub async fn stop_all(&mut self) {
        info!(supervisor = %self.name, count = self.children.len(), "Stopping all actors");

        self.cancel.cancel();

        let deadline = Instant::now() + STOP_GRACE;
        while Instant::now() < deadline {
            if self.children.values().all(|c| !c.is_running()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        for (actor_id, child) in &self.children {
            if child.is_running() {
                warn!(actor_id = %actor_id, "Force aborting actor");
                child.abort();
            }
        }

        self.children.clear();
    }

    /// Token cancelled together with this supervisor's actors, for helper
    /// tasks that belong to them.
    pub fn child_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }
}

// =============================================================================
// Actor Loop
// =============================================================================

async fn run_actor_loop<A: Actor>(
    mut actor: A,
    mailbox: Mailbox<A::Message>,
    cancel: CancellationToken,
) {
    let Mailbox { mut rx, handle } = mailbox;
    let actor_id = handle.actor_id.clone();
    let mut ctx = ActorContext::new(actor_id.clone(), cancel.clone(), handle);

    if let Err(e) = actor.on_start(&mut ctx).await {
        error!(actor_id = %actor_id, error = %e, "Actor failed to start");
        return;
    }

    debug!(actor_id = %actor_id, "Actor started");

    let mut ticker = actor.tick_interval().map(|period| {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker
    });

    loop {
        let tick = async {
            match ticker.as_mut() {
                Some(ticker) => {
                    ticker.tick().await;
                }
                None => std::future::pending::<()>().await,
            }
        };

        let msg = tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!(actor_id = %actor_id, "Actor cancelled");
                break;
            }

            msg = rx.recv() => match msg {
                Some(msg) => msg,
                None => {
                    debug!(actor_id = %actor_id, "Actor mailbox closed");
                    break;
                }
            },

            _ = tick => match actor.on_tick() {
                Some(msg) => msg,
                None => continue,
            },
        };

        ctx.messages_processed += 1;

        match actor.handle(msg, &mut ctx).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(actor_id = %actor_id, "Actor requested stop");
                break;
            }
            Err(e) => {
                warn!(actor_id = %actor_id, error = %e, "Actor error");
            }
        }
    }

    actor.on_stop(&mut ctx).await;

    debug!(
        actor_id = %actor_id,
        messages_processed = ctx.messages_processed,
        "Actor stopped"
    );
}

// =============================================================================
// Helpers
// =============================================================================

static ACTOR_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

fn generate_actor_id() -> u64 {
    ACTOR_ID_COUNTER.fetch_add(1, Ordering::SeqCst)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    enum CounterMsg {
        Add(u64),
        Get(oneshot::Sender<u64>),
        Tick,
        Stop,
    }

    struct Counter {
        total: u64,
        ticks: u64,
        tick_every: Option<Duration>,
    }

    impl Counter {
        fn new() -> Self {
            Self {
                total: 0,
                ticks: 0,
                tick_every: None,
            }
        }
    }

    #[async_trait]
    impl Actor for Counter {
        type Message = CounterMsg;

        fn name(&self) -> &str {
            "counter"
        }

        async fn handle(
            &mut self,
            msg: CounterMsg,
            _ctx: &mut ActorContext<CounterMsg>,
        ) -> Result<bool, ActorError> {
            match msg {
                CounterMsg::Add(n) => self.total += n,
                CounterMsg::Get(reply) => {
                    let _ = reply.send(self.total + self.ticks * 1000);
                }
                CounterMsg::Tick => self.ticks += 1,
                CounterMsg::Stop => return Ok(false),
            }
            Ok(true)
        }

        fn tick_interval(&self) -> Option<Duration> {
            self.tick_every
        }

        fn on_tick(&mut self) -> Option<CounterMsg> {
            Some(CounterMsg::Tick)
        }
    }

    #[tokio::test]
    async fn test_messages_processed_in_order() {
        let root = CancellationToken::new();
        let mut sup = Supervisor::new("test", &root);
        let handle = sup.spawn(Counter::new(), 16);

        handle.send(CounterMsg::Add(2)).await.unwrap();
        handle.try_send(CounterMsg::Add(3)).unwrap();
        let total = handle.call(CounterMsg::Get).await.unwrap();

        assert_eq!(total, 5);
        sup.stop_all().await;
    }

    #[tokio::test]
    async fn test_ticks_are_delivered_through_the_loop() {
        let root = CancellationToken::new();
        let mut sup = Supervisor::new("test", &root);
        let handle = sup.spawn(
            Counter {
                tick_every: Some(Duration::from_millis(10)),
                ..Counter::new()
            },
            16,
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        let total = handle.call(CounterMsg::Get).await.unwrap();

        assert!(total >= 1000, "expected at least one tick, got {total}");
        sup.stop_all().await;
    }

    #[tokio::test]
    async fn test_mailbox_accepts_messages_before_spawn() {
        let root = CancellationToken::new();
        let mut sup = Supervisor::new("test", &root);
        let (handle, mailbox) = mailbox::<CounterMsg>("counter", 4);

        handle.try_send(CounterMsg::Add(7)).unwrap();
        sup.spawn_with_mailbox(Counter::new(), mailbox);

        assert_eq!(handle.call(CounterMsg::Get).await.unwrap(), 7);
        sup.stop_all().await;
    }

    #[tokio::test]
    async fn test_parent_cancel_stops_children() {
        let root = CancellationToken::new();
        let mut sup = Supervisor::new("test", &root);
        let handle = sup.spawn(Counter::new(), 4);

        root.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(sup.children.values().all(|c| !c.is_running()));
        assert!(matches!(
            handle.call(CounterMsg::Get).await,
            Err(ActorError::ActorStopped) | Err(ActorError::NoReply)
        ));
    }

    #[tokio::test]
    async fn test_requested_stop_ends_actor() {
        let root = CancellationToken::new();
        let mut sup = Supervisor::new("test", &root);
        let handle = sup.spawn(Counter::new(), 4);

        handle.send(CounterMsg::Stop).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(sup.children.values().all(|c| !c.is_running()));
        assert!(matches!(
            handle.call(CounterMsg::Get).await,
            Err(ActorError::ActorStopped)
        ));
    }

    #[tokio::test]
    async fn test_try_send_reports_full_mailbox() {
        let (handle, _mailbox) = mailbox::<CounterMsg>("counter", 1);
        handle.try_send(CounterMsg::Add(1)).unwrap();
        assert!(matches!(
            handle.try_send(CounterMsg::Add(1)),
            Err(ActorError::MailboxFull)
        ));
    }
}
