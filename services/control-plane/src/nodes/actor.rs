//! One actor per node.
//!
//! The actor owns the node's liveness FSM. Events come from the controller
//! (`up`/`down`), from its own ticker, and from its own callbacks (a failed
//! reconciliation queues `timeout`, a successful health check queues `up`).
//! Every state change is published on a `watch` channel so the controller
//! can answer queries without calling back into node actors.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use corral_fsm::{Callbacks, Fsm, FsmError};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::fsm::{table, NodeAction, NodeEvent, NodeState};
use super::{NodeController, NodeView};
use crate::actors::{Actor, ActorContext, ActorError, ActorHandle};
use crate::agent::{AgentConnector, AgentError, NodeAgentClient};
use crate::resources::{ProviderDecl, ResourceError, ResourceManager};
use crate::workloads::WorkloadController;

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Resources(#[from] ResourceError),

    #[error(transparent)]
    Actor(#[from] ActorError),
}

/// Collaborators a node actor needs.
#[derive(Clone)]
pub struct NodeDeps {
    pub resources: ResourceManager,
    pub connector: AgentConnector,
    pub controller: NodeController,
    pub workloads: WorkloadController,
    pub tick: Duration,
}

/// Side effects of the node FSM.
struct NodeOps {
    addr: String,
    client: NodeAgentClient,
    deps: NodeDeps,
    state: NodeState,
    view: watch::Sender<NodeView>,
    myself: ActorHandle<NodeEvent>,
    cancel: CancellationToken,
}

pub struct NodeActor {
    name: String,
    fsm: Fsm<NodeState, NodeEvent, NodeAction>,
    ops: NodeOps,
}

impl NodeActor {
    pub fn new(
        view: NodeView,
        deps: NodeDeps,
        myself: ActorHandle<NodeEvent>,
    ) -> (Self, watch::Receiver<NodeView>) {
        let addr = view.addr.clone();
        let state = view.state;
        let (view_tx, view_rx) = watch::channel(view);
        let actor = Self {
            name: format!("node-{addr}"),
            fsm: Fsm::with_state(table(), state),
            ops: NodeOps {
                client: deps.connector.node(&addr),
                addr,
                deps,
                state,
                view: view_tx,
                myself,
                cancel: CancellationToken::new(),
            },
        };
        (actor, view_rx)
    }
}

#[async_trait]
impl Actor for NodeActor {
    type Message = NodeEvent;

    fn name(&self) -> &str {
        &self.name
    }

    async fn on_start(&mut self, ctx: &mut ActorContext<NodeEvent>) -> Result<(), ActorError> {
        self.ops.cancel = ctx.cancel.clone();
        Ok(())
    }

    async fn handle(
        &mut self,
        event: NodeEvent,
        _ctx: &mut ActorContext<NodeEvent>,
    ) -> Result<bool, ActorError> {
        let before = self.fsm.state();
        let result = self.fsm.fire(event, &mut self.ops).await;
        let state = self.fsm.state();
        if state != before {
            info!(node = %self.ops.addr, from = %before, to = %state, "Node transitioned");
        }
        // A callback may publish its target state early; a failed one leaves
        // the machine where it was and the view follows it back.
        self.ops.publish(state);
        match result {
            Ok(_) => Ok(true),
            Err(FsmError::Callback { source, .. }) => {
                Err(ActorError::Transient(source.to_string()))
            }
        }
    }

    fn tick_interval(&self) -> Option<Duration> {
        Some(self.ops.deps.tick)
    }

    fn on_tick(&mut self) -> Option<NodeEvent> {
        Some(NodeEvent::Ticker)
    }
}

#[async_trait]
impl Callbacks<NodeAction, NodeEvent> for NodeOps {
    type Error = NodeError;

    async fn perform(&mut self, action: NodeAction, _event: &NodeEvent) -> Result<(), NodeError> {
        match action {
            NodeAction::Register => self.register().await,
            NodeAction::Noop => Ok(()),
            NodeAction::Reconcile => self.reconcile().await,
            NodeAction::MarkUnreachable => {
                warn!(node = %self.addr, "Node stopped answering");
                Ok(())
            }
            NodeAction::Recheck => {
                self.recheck().await;
                Ok(())
            }
            NodeAction::NodeDown => self.node_down().await,
        }
    }
}

impl NodeOps {
    fn publish(&mut self, state: NodeState) {
        self.state = state;
        self.view.send_if_modified(|v| {
            let changed = v.state != state;
            v.state = state;
            changed
        });
    }

    /// Agent client for calls that must not reach a node that is down.
    fn rpc(&self) -> Result<&NodeAgentClient, AgentError> {
        if self.state == NodeState::Down {
            return Err(AgentError::NodeDown(self.addr.clone()));
        }
        Ok(&self.client)
    }

    async fn register(&mut self) -> Result<(), NodeError> {
        // Registration is the one call allowed while down; it is how a node
        // comes back.
        let spec = self.client.node_spec(&self.cancel).await?;

        let decls: Vec<ProviderDecl> = spec
            .resources
            .iter()
            .map(|r| ProviderDecl {
                resource_type: r.resource_type.clone(),
                provider: self.addr.clone(),
                unit_kind: r.unit_kind,
                total: r.amount,
            })
            .collect();
        self.deps.resources.add_providers(decls).await?;

        self.view.send_modify(|v| {
            v.hostname = spec.host_name.clone();
            v.attributes = spec.attributes.clone();
            v.resources = spec.resources.clone();
            v.last_seen = Some(Utc::now());
        });
        info!(
            node = %self.addr,
            hostname = %spec.host_name,
            resources = spec.resources.len(),
            "Registered node"
        );

        self.exchange_peers().await;
        Ok(())
    }

    /// Full-mesh peer announcement between this node and every alive node.
    async fn exchange_peers(&self) {
        let peers = match self.deps.controller.alive_peers(&self.addr).await {
            Ok(peers) => peers,
            Err(e) => {
                warn!(node = %self.addr, error = %e, "Could not list peers");
                return;
            }
        };
        for peer in peers {
            if let Err(e) = self.client.add_peer(&peer, &self.cancel).await {
                warn!(node = %self.addr, peer = %peer, error = %e, "Failed to add peer");
            }
            let other = self.deps.connector.node(&peer);
            if let Err(e) = other.add_peer(&self.addr, &self.cancel).await {
                warn!(node = %peer, peer = %self.addr, error = %e, "Failed to add peer");
            }
        }
    }

    async fn reconcile(&mut self) -> Result<(), NodeError> {
        let reported = match self.rpc()?.list_workloads(&self.cancel).await {
            Ok(reported) => reported,
            Err(e) => {
                if let Err(send) = self.myself.try_send(NodeEvent::Timeout) {
                    warn!(node = %self.addr, error = %send, "Could not queue timeout");
                }
                return Err(e.into());
            }
        };
        self.view.send_modify(|v| v.last_seen = Some(Utc::now()));

        let pushes = self
            .deps
            .workloads
            .reconcile_node(&self.addr, reported)
            .await?;
        for push in pushes {
            info!(
                node = %self.addr,
                workload = %push.spec.workload_id,
                container = %push.container_id,
                "Pushing workload spec to node"
            );
            if let Err(e) = self
                .rpc()?
                .update_workload(&push.container_id, &push.spec, &self.cancel)
                .await
            {
                warn!(node = %self.addr, container = %push.container_id, error = %e, "Spec push failed");
            }
        }
        Ok(())
    }

    async fn recheck(&self) {
        match self.client.node_spec(&self.cancel).await {
            Ok(_) => {
                info!(node = %self.addr, "Unreachable node answered");
                if let Err(e) = self.myself.try_send(NodeEvent::Up) {
                    warn!(node = %self.addr, error = %e, "Could not queue up event");
                }
            }
            Err(e) => debug!(node = %self.addr, error = %e, "Node still unreachable"),
        }
    }

    async fn node_down(&mut self) -> Result<(), NodeError> {
        // Out of the schedulable set before any workload looks for a new home.
        self.publish(NodeState::Down);

        let failed = self.deps.workloads.node_down(&self.addr).await?;
        info!(node = %self.addr, workloads = failed, "Node down");

        // Providers still reserved by workloads stay until the next `up`.
        let removed = self.deps.resources.remove_idle_providers(&self.addr).await?;
        debug!(node = %self.addr, providers = removed.len(), "Dropped idle providers");
        Ok(())
    }
}
