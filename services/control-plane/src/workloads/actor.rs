//! One actor per workload.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use corral_fsm::{Callbacks, Fsm, FsmError, Outcome};
use corral_reconcile::RetryTracker;
use corral_store::CoordStore;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::fsm::{table, WorkloadAction, WorkloadEvent, WorkloadPhase};
use super::model::{WorkloadModel, WorkloadState};
use super::WorkloadError;
use crate::actors::{Actor, ActorContext, ActorError, ActorHandle};
use crate::agent::NodeAgentClient;
use crate::nodes::NodeController;
use crate::persist;
use crate::resources::{ResourceManager, ResourceRequest, CPU, MEMORY};
use crate::scheduler::{PlacementRequest, Scheduler};
use crate::volumes::VolumeController;

/// Collaborators every workload actor shares.
#[derive(Clone)]
pub struct WorkloadDeps {
    pub store: Arc<dyn CoordStore>,
    pub scheduler: Scheduler,
    pub resources: ResourceManager,
    pub volumes: VolumeController,
    /// Gate for every agent call.
    pub nodes: NodeController,
    pub schedule_retry: Duration,
    pub mount_timeout: Duration,
    pub restart_window: Duration,
}

/// Side effects of the workload FSM. Owns the model.
struct WorkloadOps {
    model: WorkloadModel,
    deps: WorkloadDeps,
    restarts: RetryTracker,
    myself: ActorHandle<WorkloadEvent>,
    cancel: CancellationToken,
}

pub struct WorkloadActor {
    name: String,
    fsm: Fsm<WorkloadPhase, WorkloadEvent, WorkloadAction>,
    ops: WorkloadOps,
    published: watch::Sender<WorkloadState>,
}

impl WorkloadActor {
    /// Build an actor around `model`, resuming in the model's phase.
    pub fn new(
        model: WorkloadModel,
        deps: WorkloadDeps,
        myself: ActorHandle<WorkloadEvent>,
    ) -> (Self, watch::Receiver<WorkloadState>) {
        let (published, state) = watch::channel(model.state());
        let actor = Self {
            name: format!("workload-{}", model.id()),
            fsm: Fsm::with_state(table(), model.phase),
            ops: WorkloadOps {
                restarts: RetryTracker::new(model.max_restarts, deps.restart_window),
                model,
                deps,
                myself,
                cancel: CancellationToken::new(),
            },
            published,
        };
        (actor, state)
    }

    async fn persist(&self) {
        let model = &self.ops.model;
        let key = persist::workload_key(&model.id().to_string());
        if let Err(e) = persist::save(self.ops.deps.store.as_ref(), &key, model).await {
            warn!(workload = %model.id(), error = %e, "Failed to persist workload");
        }
    }
}

#[async_trait]
impl Actor for WorkloadActor {
    type Message = WorkloadEvent;

    fn name(&self) -> &str {
        &self.name
    }

    async fn on_start(&mut self, ctx: &mut ActorContext<WorkloadEvent>) -> Result<(), ActorError> {
        self.ops.cancel = ctx.cancel.clone();
        Ok(())
    }

    async fn handle(
        &mut self,
        event: WorkloadEvent,
        _ctx: &mut ActorContext<WorkloadEvent>,
    ) -> Result<bool, ActorError> {
        let result = self.fsm.fire(event, &mut self.ops).await;
        if matches!(result, Ok(Outcome::Dropped { .. })) {
            return Ok(true);
        }

        let phase = self.fsm.state();
        if phase != self.ops.model.phase {
            info!(
                workload = %self.ops.model.id(),
                from = %self.ops.model.phase,
                to = %phase,
                "Workload transitioned"
            );
            self.ops.model.phase = phase;
        }
        self.persist().await;
        self.published.send_replace(self.ops.model.state());

        match result {
            Ok(_) => Ok(true),
            Err(FsmError::Callback { source, .. }) => {
                Err(ActorError::Transient(source.to_string()))
            }
        }
    }

    fn tick_interval(&self) -> Option<Duration> {
        Some(self.ops.deps.schedule_retry)
    }

    fn on_tick(&mut self) -> Option<WorkloadEvent> {
        self.fsm
            .state()
            .is_unplaced()
            .then_some(WorkloadEvent::Schedule)
    }
}

#[async_trait]
impl Callbacks<WorkloadAction, WorkloadEvent> for WorkloadOps {
    type Error = WorkloadError;

    async fn perform(
        &mut self,
        action: WorkloadAction,
        _event: &WorkloadEvent,
    ) -> Result<(), WorkloadError> {
        match action {
            WorkloadAction::Schedule => self.schedule().await,
            WorkloadAction::CreateNetwork => self.create_networks().await,
            WorkloadAction::MountVolumes => self.mount_volumes().await,
            WorkloadAction::PullImage => self.pull_image().await,
            WorkloadAction::CreateContainer => self.create_container().await,
            WorkloadAction::Start | WorkloadAction::Restart => {
                let id = self.model.id().to_string();
                self.agent().await?.start_workload(&id, &self.cancel).await?;
                info!(workload = %id, "Workload started");
                Ok(())
            }
            WorkloadAction::Stop => {
                let id = self.model.id().to_string();
                self.agent().await?.stop_workload(&id, &self.cancel).await?;
                info!(workload = %id, "Workload stopped");
                Ok(())
            }
            WorkloadAction::HandleFailure => {
                self.handle_failure().await;
                Ok(())
            }
            WorkloadAction::Reschedule => {
                self.reschedule().await;
                Ok(())
            }
            WorkloadAction::Absorb => Ok(()),
        }
    }
}

impl WorkloadOps {
    /// Client for the workload's node; refused unless that node is alive.
    async fn agent(&self) -> Result<NodeAgentClient, WorkloadError> {
        let Some(node) = &self.model.node else {
            return Err(WorkloadError::Unplaced(self.model.id().to_string()));
        };
        Ok(self.deps.nodes.agent(node).await??)
    }

    fn queue(&self, event: WorkloadEvent) {
        if let Err(e) = self.myself.try_send(event) {
            warn!(workload = %self.model.id(), event = %event, error = %e, "Could not queue event");
        }
    }

    async fn schedule(&mut self) -> Result<(), WorkloadError> {
        let request = PlacementRequest {
            user_key: self.model.id().to_string(),
            cpu: self.model.spec.cpu,
            memory: self.model.spec.memory,
            filters: self.model.filters.clone(),
        };
        let placement = self
            .deps
            .scheduler
            .schedule(self.model.scheduler, &request)
            .await?;
        self.model.node = Some(placement.node);
        self.queue(WorkloadEvent::CreateNet);
        Ok(())
    }

    async fn create_networks(&mut self) -> Result<(), WorkloadError> {
        let agent = self.agent().await?;
        for network in &self.model.spec.networks {
            if let Err(e) = agent.create_network(network, &self.cancel).await {
                warn!(workload = %self.model.id(), network = %network, error = %e, "Network creation failed");
            }
        }
        self.queue(WorkloadEvent::CreateVol);
        Ok(())
    }

    async fn mount_volumes(&mut self) -> Result<(), WorkloadError> {
        let node = self.agent().await?.addr().to_string();
        for bind in &self.model.spec.volumes {
            let mount = self.deps.volumes.mount(bind.clone(), node.clone());
            match tokio::time::timeout(self.deps.mount_timeout, mount).await {
                Ok(result) => result?,
                Err(_) => return Err(WorkloadError::MountTimeout(bind.key())),
            }
            debug!(workload = %self.model.id(), volume = %bind.key(), "Volume mounted");
        }
        self.queue(WorkloadEvent::PullImg);
        Ok(())
    }

    async fn pull_image(&mut self) -> Result<(), WorkloadError> {
        let agent = self.agent().await?;
        let image = &self.model.spec.image;
        if !agent.image_present(image, &self.cancel).await? {
            info!(workload = %self.model.id(), image = %image, node = %agent.addr(), "Pulling image");
            agent.pull_image(image, &self.cancel).await?;
        }
        self.queue(WorkloadEvent::ImgReady);
        Ok(())
    }

    async fn create_container(&mut self) -> Result<(), WorkloadError> {
        let container_id = self
            .agent()
            .await?
            .create_workload(&self.model.spec, &self.cancel)
            .await?;
        info!(workload = %self.model.id(), container = %container_id, "Container created");
        self.model.container_id = Some(container_id);
        self.queue(WorkloadEvent::Start);
        Ok(())
    }

    async fn handle_failure(&mut self) {
        let id = self.model.id().to_string();
        warn!(workload = %id, node = ?self.model.node, "Workload failed");

        // The container may already be gone.
        if let Ok(agent) = self.agent().await {
            if let Err(e) = agent.stop_workload(&id, &self.cancel).await {
                debug!(workload = %id, error = %e, "Stop after failure failed");
            }
        }

        if !self.model.restart_policy.restarts_on_failure() {
            info!(workload = %id, "Restart policy forbids restart");
            return;
        }
        if self.restarts.record_failure(&id) {
            warn!(
                workload = %id,
                restarts = self.restarts.count(&id),
                "Restart budget exhausted"
            );
            return;
        }
        self.queue(WorkloadEvent::Restart);
    }

    async fn reschedule(&mut self) {
        let id = self.model.id().to_string();
        if let Some(node) = self.model.node.take() {
            let release = vec![
                ResourceRequest::new(CPU, &node, &id, 0),
                ResourceRequest::new(MEMORY, &node, &id, 0),
            ];
            if let Err(e) = self.deps.resources.free(release).await {
                warn!(workload = %id, node = %node, error = %e, "Could not release reservation");
            }
        }
        for bind in &self.model.spec.volumes {
            if let Err(e) = self.deps.volumes.unmount(bind.clone()).await {
                warn!(workload = %id, volume = %bind.key(), error = %e, "Unmount failed");
            }
        }
        self.model.container_id = None;
        info!(workload = %id, "Rescheduling workload");
        self.queue(WorkloadEvent::Schedule);
    }
}
