//! Volume lifecycle.
//!
//! Volumes are keyed by `<datastoreType>:<datastoreVolumeId>` and created
//! lazily the first time a workload asks for them. A volume is mounted on at
//! most one node at a time.

mod actor;
mod controller;
pub mod fsm;

use corral_store::StoreError;
use thiserror::Error;

use crate::actors::{ActorError, ActorHandle};
use crate::agent::{AgentError, VolumeBind};

pub use actor::{VolumeActor, VolumeModel, VolumeMsg};
pub use controller::{VolumeControlMsg, VolumeControllerActor};
pub use fsm::{VolumeAction, VolumeEvent, VolumeEventKind, VolumeState};

/// Size, in MiB, of volumes created on first mount.
pub const DEFAULT_VOLUME_SIZE: u64 = 1024;

#[derive(Debug, Error)]
pub enum VolumeError {
    #[error("volume {volume} is mounted on {node}")]
    MountedElsewhere { volume: String, node: String },

    #[error("volume {0} was destroyed")]
    Destroyed(String),

    #[error("volume {0} not found")]
    NotFound(String),

    #[error("volume {volume} cannot {event} while {state}")]
    InvalidState {
        volume: String,
        state: VolumeState,
        event: VolumeEventKind,
    },

    #[error("volume operation failed: {0}")]
    Failed(String),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Actor(#[from] ActorError),
}

/// Handle to the volume controller.
#[derive(Debug, Clone)]
pub struct VolumeController {
    handle: ActorHandle<VolumeControlMsg>,
}

impl VolumeController {
    pub fn new(handle: ActorHandle<VolumeControlMsg>) -> Self {
        Self { handle }
    }

    /// Resolve once `bind` is mounted on `node`, creating the volume first
    /// if needed.
    pub async fn mount(&self, bind: VolumeBind, node: String) -> Result<(), VolumeError> {
        self.handle
            .call(|reply| VolumeControlMsg::Mount { bind, node, reply })
            .await?
    }

    /// Unmount `bind` from wherever it is mounted. Unknown volumes are a
    /// no-op.
    pub async fn unmount(&self, bind: VolumeBind) -> Result<(), VolumeError> {
        self.handle
            .call(|reply| VolumeControlMsg::Unmount { bind, reply })
            .await?
    }

    /// Destroy an unmounted volume.
    pub async fn destroy(&self, key: &str) -> Result<(), VolumeError> {
        let key = key.to_string();
        self.handle
            .call(|reply| VolumeControlMsg::Destroy { key, reply })
            .await?
    }

    pub async fn list(&self) -> Result<Vec<VolumeModel>, VolumeError> {
        Ok(self
            .handle
            .call(|reply| VolumeControlMsg::List { reply })
            .await?)
    }

    pub async fn restore(&self) -> Result<usize, VolumeError> {
        self.handle
            .call(|reply| VolumeControlMsg::Restore { reply })
            .await?
    }
}
