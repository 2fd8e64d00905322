//! Workload lifecycle.
//!
//! Each workload ("alta") is an actor driving its own FSM through
//! placement, network and volume setup, image pull, container creation and
//! start. Every step is one node agent RPC and queues the next event when it
//! succeeds. The model is written to the store after every accepted event,
//! so a restarted leader resumes each workload in its last known phase
//! without replaying any RPC.

mod actor;
mod controller;
pub mod fsm;
pub mod model;

use corral_id::{IdError, WorkloadId};
use corral_reconcile::ReportedWorkload;
use corral_store::StoreError;
use thiserror::Error;

use crate::actors::{ActorError, ActorHandle};
use crate::agent::{AgentError, WorkloadSpec};
use crate::resources::ResourceError;
use crate::scheduler::ScheduleError;
use crate::volumes::VolumeError;

pub use actor::{WorkloadActor, WorkloadDeps};
pub use controller::{WorkloadControlMsg, WorkloadControllerActor, WorkloadDefaults};
pub use fsm::{WorkloadAction, WorkloadEvent, WorkloadPhase};
pub use model::{RestartPolicy, WorkloadConfig, WorkloadModel, WorkloadState};

#[derive(Debug, Error)]
pub enum WorkloadError {
    #[error("workload {0} already exists")]
    AlreadyExists(String),

    #[error("unknown datastore type {0}")]
    InvalidDatastore(String),

    #[error("invalid workload config: {0}")]
    InvalidConfig(String),

    #[error("workload {0} not found")]
    NotFound(String),

    #[error("unsupported workload event: {0}")]
    UnsupportedEvent(String),

    #[error("workload {0} has no node")]
    Unplaced(String),

    #[error("timed out waiting for volume {0} to mount")]
    MountTimeout(String),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Volume(#[from] VolumeError),

    #[error(transparent)]
    Resources(#[from] ResourceError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Id(#[from] IdError),

    #[error(transparent)]
    Actor(#[from] ActorError),
}

/// A spec to push to a node that runs the container but lost track of the
/// workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecPush {
    pub container_id: String,
    pub spec: WorkloadSpec,
}

/// Handle to the workload controller.
#[derive(Debug, Clone)]
pub struct WorkloadController {
    handle: ActorHandle<WorkloadControlMsg>,
}

impl WorkloadController {
    pub fn new(handle: ActorHandle<WorkloadControlMsg>) -> Self {
        Self { handle }
    }

    /// Validate `config`, persist the new workload and start scheduling it.
    pub async fn create(&self, config: WorkloadConfig) -> Result<WorkloadId, WorkloadError> {
        self.handle
            .call(|reply| WorkloadControlMsg::Create { config, reply })
            .await?
    }

    pub async fn list(&self) -> Result<Vec<WorkloadState>, WorkloadError> {
        Ok(self
            .handle
            .call(|reply| WorkloadControlMsg::List { reply })
            .await?)
    }

    pub async fn get(&self, id: WorkloadId) -> Result<Option<WorkloadState>, WorkloadError> {
        Ok(self
            .handle
            .call(|reply| WorkloadControlMsg::Get { id, reply })
            .await?)
    }

    /// Queue `event` on the workload's actor.
    pub async fn send_event(
        &self,
        id: WorkloadId,
        event: WorkloadEvent,
    ) -> Result<(), WorkloadError> {
        self.handle
            .call(|reply| WorkloadControlMsg::SendEvent { id, event, reply })
            .await?
    }

    /// Compare `reported` with the workloads placed on `node`. Crashed
    /// workloads get a `failure` event; the returned specs are for the
    /// node to push back to its agent.
    pub async fn reconcile_node(
        &self,
        node: &str,
        reported: Vec<ReportedWorkload>,
    ) -> Result<Vec<SpecPush>, ActorError> {
        let node = node.to_string();
        self.handle
            .call(|reply| WorkloadControlMsg::ReconcileNode {
                node,
                reported,
                reply,
            })
            .await
    }

    /// Send `nodeFailure` to every workload on `node`. Returns how many were
    /// notified.
    pub async fn node_down(&self, node: &str) -> Result<usize, ActorError> {
        let node = node.to_string();
        self.handle
            .call(|reply| WorkloadControlMsg::NodeDown { node, reply })
            .await
    }

    /// Rebuild actors from the store in their persisted phase.
    pub async fn restore(&self) -> Result<usize, WorkloadError> {
        self.handle
            .call(|reply| WorkloadControlMsg::Restore { reply })
            .await?
    }
}
