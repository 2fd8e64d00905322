//! One actor per volume.

use std::sync::Arc;

use async_trait::async_trait;
use corral_fsm::{Callbacks, Fsm, FsmError, Outcome};
use corral_store::CoordStore;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::fsm::{table, VolumeAction, VolumeEvent, VolumeEventKind, VolumeState};
use super::VolumeError;
use crate::actors::{Actor, ActorContext, ActorError};
use crate::agent::{AgentError, VolumeSpec};
use crate::nodes::NodeController;
use crate::persist;

/// Persisted volume document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeModel {
    pub spec: VolumeSpec,
    /// Node the volume is mounted on.
    #[serde(default)]
    pub node: Option<String>,
    pub state: VolumeState,
}

impl VolumeModel {
    pub fn new(spec: VolumeSpec) -> Self {
        Self {
            spec,
            node: None,
            state: VolumeState::Created,
        }
    }

    pub fn key(&self) -> String {
        format!(
            "{}:{}",
            self.spec.datastore_type, self.spec.datastore_volume_id
        )
    }
}

type Reply = oneshot::Sender<Result<(), VolumeError>>;

#[derive(Debug)]
pub enum VolumeMsg {
    /// Make sure the volume is mounted on `node`.
    Mount { node: String, reply: Reply },
    Unmount { reply: Reply },
    Destroy { reply: Reply },
}

struct VolumeOps {
    model: VolumeModel,
    nodes: NodeController,
    cancel: CancellationToken,
}

#[async_trait]
impl Callbacks<VolumeAction, VolumeEvent> for VolumeOps {
    type Error = VolumeError;

    async fn perform(&mut self, action: VolumeAction, event: &VolumeEvent) -> Result<(), VolumeError> {
        let spec = &self.model.spec;
        match (action, event) {
            (VolumeAction::Create, VolumeEvent::Init { node }) => {
                self.nodes
                    .agent(node)
                    .await??
                    .create_volume(spec, &self.cancel)
                    .await?;
            }
            (VolumeAction::Mount, VolumeEvent::Mount { node }) => {
                self.nodes
                    .agent(node)
                    .await??
                    .mount_volume(spec, &self.cancel)
                    .await?;
                self.model.node = Some(node.clone());
            }
            (VolumeAction::Unmount, _) => {
                if let Some(node) = &self.model.node {
                    match self.nodes.agent(node).await? {
                        Ok(agent) => agent.unmount_volume(spec, &self.cancel).await?,
                        // The mount went away with the node.
                        Err(AgentError::NodeDown(_)) => {
                            warn!(
                                volume = %self.model.key(),
                                node = %node,
                                "Forgetting mount on lost node"
                            );
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                self.model.node = None;
            }
            (VolumeAction::Forget, _) => {}
            (action, event) => {
                return Err(VolumeError::Failed(format!(
                    "action {action:?} cannot run for {event:?}"
                )))
            }
        }
        Ok(())
    }
}

pub struct VolumeActor {
    name: String,
    store: Arc<dyn CoordStore>,
    fsm: Fsm<VolumeState, VolumeEventKind, VolumeAction>,
    ops: VolumeOps,
    published: watch::Sender<VolumeModel>,
}

impl VolumeActor {
    pub fn new(
        model: VolumeModel,
        store: Arc<dyn CoordStore>,
        nodes: NodeController,
    ) -> (Self, watch::Receiver<VolumeModel>) {
        let (published, view) = watch::channel(model.clone());
        let actor = Self {
            name: format!("volume-{}", model.key()),
            store,
            fsm: Fsm::with_state(table(), model.state),
            ops: VolumeOps {
                model,
                nodes,
                cancel: CancellationToken::new(),
            },
            published,
        };
        (actor, view)
    }

    fn key(&self) -> String {
        self.ops.model.key()
    }

    async fn fire(&mut self, event: VolumeEvent) -> Result<(), VolumeError> {
        let result = self.fsm.fire(event, &mut self.ops).await;
        self.ops.model.state = self.fsm.state();
        match result {
            Ok(Outcome::Dropped { state, event }) => Err(VolumeError::InvalidState {
                volume: self.key(),
                state,
                event,
            }),
            Ok(_) => {
                let key = persist::volume_key(&self.key());
                if let Err(e) = persist::save(self.store.as_ref(), &key, &self.ops.model).await {
                    warn!(volume = %self.key(), error = %e, "Failed to persist volume");
                }
                self.published.send_replace(self.ops.model.clone());
                Ok(())
            }
            Err(FsmError::Callback { source, .. }) => Err(VolumeError::Failed(source.to_string())),
        }
    }

    async fn mount(&mut self, node: String) -> Result<(), VolumeError> {
        match self.fsm.state() {
            VolumeState::Mounted => match &self.ops.model.node {
                Some(current) if *current == node => Ok(()),
                current => Err(VolumeError::MountedElsewhere {
                    volume: self.key(),
                    node: current.clone().unwrap_or_default(),
                }),
            },
            VolumeState::Created => {
                self.fire(VolumeEvent::Init { node: node.clone() }).await?;
                self.fire(VolumeEvent::Mount { node }).await
            }
            VolumeState::Inited => self.fire(VolumeEvent::Mount { node }).await,
            VolumeState::Destroyed => Err(VolumeError::Destroyed(self.key())),
        }
    }
}

#[async_trait]
impl Actor for VolumeActor {
    type Message = VolumeMsg;

    fn name(&self) -> &str {
        &self.name
    }

    async fn on_start(&mut self, ctx: &mut ActorContext<VolumeMsg>) -> Result<(), ActorError> {
        self.ops.cancel = ctx.cancel.clone();
        Ok(())
    }

    async fn handle(
        &mut self,
        msg: VolumeMsg,
        _ctx: &mut ActorContext<VolumeMsg>,
    ) -> Result<bool, ActorError> {
        match msg {
            VolumeMsg::Mount { node, reply } => {
                let result = self.mount(node).await;
                if result.is_ok() {
                    info!(volume = %self.key(), node = ?self.ops.model.node, "Volume mounted");
                }
                let _ = reply.send(result);
                Ok(true)
            }
            VolumeMsg::Unmount { reply } => {
                let result = match self.fsm.state() {
                    VolumeState::Mounted => self.fire(VolumeEvent::Unmount).await,
                    _ => Ok(()),
                };
                let _ = reply.send(result);
                Ok(true)
            }
            VolumeMsg::Destroy { reply } => {
                if self.fsm.state() == VolumeState::Created {
                    // Never created on any node; nothing to tear down.
                    let _ = reply.send(Ok(()));
                    return Ok(false);
                }
                let result = self.fire(VolumeEvent::Destroy).await;
                let done = result.is_ok();
                if done {
                    let key = persist::volume_key(&self.key());
                    if let Err(e) = persist::remove(self.store.as_ref(), &key).await {
                        warn!(volume = %self.key(), error = %e, "Failed to delete volume document");
                    }
                }
                let _ = reply.send(result);
                Ok(!done)
            }
        }
    }
}
