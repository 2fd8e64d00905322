//! The volume table.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use corral_store::CoordStore;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::actor::{VolumeActor, VolumeModel, VolumeMsg};
use super::fsm::{VolumeEventKind, VolumeState};
use super::{VolumeError, DEFAULT_VOLUME_SIZE};
use crate::actors::{mailbox, Actor, ActorContext, ActorError, ActorHandle, Supervisor};
use crate::agent::{VolumeBind, VolumeSpec};
use crate::nodes::NodeController;
use crate::persist;

const VOLUME_MAILBOX: usize = 16;

type Reply<T> = oneshot::Sender<Result<T, VolumeError>>;

#[derive(Debug)]
pub enum VolumeControlMsg {
    Mount {
        bind: VolumeBind,
        node: String,
        reply: Reply<()>,
    },
    Unmount {
        bind: VolumeBind,
        reply: Reply<()>,
    },
    Destroy {
        key: String,
        reply: Reply<()>,
    },
    List {
        reply: oneshot::Sender<Vec<VolumeModel>>,
    },
    Restore {
        reply: Reply<usize>,
    },
}

struct VolumeEntry {
    handle: ActorHandle<VolumeMsg>,
    view: watch::Receiver<VolumeModel>,
}

pub struct VolumeControllerActor {
    store: Arc<dyn CoordStore>,
    nodes: NodeController,
    volumes: BTreeMap<String, VolumeEntry>,
    supervisor: Supervisor,
}

impl VolumeControllerActor {
    pub fn new(
        store: Arc<dyn CoordStore>,
        nodes: NodeController,
        parent: &CancellationToken,
    ) -> Self {
        Self {
            store,
            nodes,
            volumes: BTreeMap::new(),
            supervisor: Supervisor::new("volumes", parent),
        }
    }

    fn spawn(&mut self, model: VolumeModel) -> &VolumeEntry {
        let key = model.key();
        let (handle, mb) = mailbox(&format!("volume-{key}"), VOLUME_MAILBOX);
        let (actor, view) = VolumeActor::new(model, self.store.clone(), self.nodes.clone());
        self.supervisor.spawn_with_mailbox(actor, mb);
        self.volumes
            .entry(key)
            .or_insert(VolumeEntry { handle, view })
    }

    fn forward(&self, key: &str, msg: VolumeMsg) {
        let Some(entry) = self.volumes.get(key) else {
            reject(msg, VolumeError::NotFound(key.to_string()));
            return;
        };
        if let Err(e) = entry.handle.try_send(msg) {
            // The reply sender is dropped with the message; the caller sees
            // NoReply.
            warn!(volume = %key, error = %e, "Could not deliver volume request");
        }
    }

    async fn restore(&mut self) -> Result<usize, VolumeError> {
        let models: Vec<(String, VolumeModel)> =
            persist::load_all(self.store.as_ref(), &persist::volume_dir()).await?;
        let mut restored = 0;
        for (_, model) in models {
            if !self.volumes.contains_key(&model.key()) {
                self.spawn(model);
                restored += 1;
            }
        }
        info!(volumes = restored, "Restored volumes");
        Ok(restored)
    }
}

fn reject(msg: VolumeMsg, error: VolumeError) {
    let reply = match msg {
        VolumeMsg::Mount { reply, .. } | VolumeMsg::Unmount { reply } | VolumeMsg::Destroy { reply } => {
            reply
        }
    };
    let _ = reply.send(Err(error));
}

#[async_trait]
impl Actor for VolumeControllerActor {
    type Message = VolumeControlMsg;

    fn name(&self) -> &str {
        "volume-controller"
    }

    async fn handle(
        &mut self,
        msg: VolumeControlMsg,
        _ctx: &mut ActorContext<VolumeControlMsg>,
    ) -> Result<bool, ActorError> {
        match msg {
            VolumeControlMsg::Mount { bind, node, reply } => {
                let key = bind.key();
                if !self.volumes.contains_key(&key) {
                    info!(volume = %key, "Creating volume");
                    self.spawn(VolumeModel::new(VolumeSpec {
                        datastore_type: bind.datastore_type,
                        datastore_volume_id: bind.datastore_volume_id,
                        volume_size: DEFAULT_VOLUME_SIZE,
                    }));
                }
                self.forward(&key, VolumeMsg::Mount { node, reply });
            }
            VolumeControlMsg::Unmount { bind, reply } => {
                let key = bind.key();
                if self.volumes.contains_key(&key) {
                    self.forward(&key, VolumeMsg::Unmount { reply });
                } else {
                    let _ = reply.send(Ok(()));
                }
            }
            VolumeControlMsg::Destroy { key, reply } => {
                let state = self.volumes.get(&key).map(|e| e.view.borrow().state);
                if state == Some(VolumeState::Mounted) {
                    let _ = reply.send(Err(VolumeError::InvalidState {
                        volume: key,
                        state: VolumeState::Mounted,
                        event: VolumeEventKind::Destroy,
                    }));
                    return Ok(true);
                }
                self.forward(&key, VolumeMsg::Destroy { reply });
                if let Some(entry) = self.volumes.remove(&key) {
                    info!(volume = %key, actor = %entry.handle.actor_id(), "Destroying volume");
                }
            }
            VolumeControlMsg::List { reply } => {
                let models = self.volumes.values().map(|e| e.view.borrow().clone()).collect();
                let _ = reply.send(models);
            }
            VolumeControlMsg::Restore { reply } => {
                let _ = reply.send(self.restore().await);
            }
        }
        Ok(true)
    }

    async fn on_stop(&mut self, _ctx: &mut ActorContext<VolumeControlMsg>) {
        self.supervisor.stop_all().await;
    }
}
