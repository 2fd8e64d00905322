//! Node discovery and the node table.

use std::collections::BTreeMap;

use async_trait::async_trait;
use corral_store::{ServiceEvent, ServiceInfo, ServiceRegistry, StoreError};
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::actor::{NodeActor, NodeDeps};
use super::fsm::{NodeEvent, NodeState};
use super::NodeView;
use crate::actors::{mailbox, Actor, ActorContext, ActorError, ActorHandle, Supervisor};

const NODE_MAILBOX: usize = 64;

#[derive(Debug)]
pub enum NodeControlMsg {
    /// Membership change from the service registry.
    Service(ServiceEvent),
    FilterNodes {
        filters: BTreeMap<String, String>,
        reply: oneshot::Sender<Vec<String>>,
    },
    ListNodes {
        reply: oneshot::Sender<Vec<NodeView>>,
    },
    AlivePeers {
        exclude: String,
        reply: oneshot::Sender<Vec<String>>,
    },
    /// Current state of one node, if known.
    State {
        addr: String,
        reply: oneshot::Sender<Option<NodeState>>,
    },
    /// List the agent service, then follow its changes.
    StartDiscovery {
        reply: oneshot::Sender<Result<usize, StoreError>>,
    },
}

struct NodeEntry {
    handle: ActorHandle<NodeEvent>,
    view: watch::Receiver<NodeView>,
}

impl NodeEntry {
    fn state(&self) -> NodeState {
        self.view.borrow().state
    }
}

pub struct NodeControllerActor {
    registry: ServiceRegistry,
    service: String,
    agent_port: u16,
    deps: NodeDeps,
    nodes: BTreeMap<String, NodeEntry>,
    supervisor: Supervisor,
}

impl NodeControllerActor {
    pub fn new(
        registry: ServiceRegistry,
        service: impl Into<String>,
        agent_port: u16,
        deps: NodeDeps,
        parent: &CancellationToken,
    ) -> Self {
        Self {
            registry,
            service: service.into(),
            agent_port,
            deps,
            nodes: BTreeMap::new(),
            supervisor: Supervisor::new("nodes", parent),
        }
    }

    fn addr_of(&self, info: &ServiceInfo) -> (String, u16) {
        let port = if info.port == 0 {
            self.agent_port
        } else {
            info.port
        };
        (format!("{}:{}", info.host_addr, port), port)
    }

    fn on_service(&mut self, event: ServiceEvent) {
        match event {
            ServiceEvent::Added(info) => {
                let (addr, port) = self.addr_of(&info);
                match self.nodes.get(&addr) {
                    Some(entry) if entry.state() == NodeState::Alive => {
                        debug!(node = %addr, "Node already alive");
                    }
                    Some(entry) => notify(&addr, &entry.handle, NodeEvent::Up),
                    None => {
                        info!(node = %addr, "Discovered node");
                        let view = NodeView::new(&addr, &info.host_addr, port);
                        let (handle, mb) = mailbox(&format!("node-{addr}"), NODE_MAILBOX);
                        let (actor, view) = NodeActor::new(view, self.deps.clone(), handle.clone());
                        self.supervisor.spawn_with_mailbox(actor, mb);
                        notify(&addr, &handle, NodeEvent::Up);
                        self.nodes.insert(addr, NodeEntry { handle, view });
                    }
                }
            }
            ServiceEvent::Removed(info) => {
                let (addr, _) = self.addr_of(&info);
                match self.nodes.get(&addr) {
                    Some(entry) => notify(&addr, &entry.handle, NodeEvent::Down),
                    None => debug!(node = %addr, "Removal for unknown node"),
                }
            }
        }
    }

    fn filter_nodes(&self, filters: &BTreeMap<String, String>) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|(_, entry)| {
                let view = entry.view.borrow();
                view.state == NodeState::Alive
                    && filters
                        .iter()
                        .all(|(k, v)| view.attributes.get(k) == Some(v))
            })
            .map(|(addr, _)| addr.clone())
            .collect()
    }

    fn alive_peers(&self, exclude: &str) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|(addr, entry)| addr.as_str() != exclude && entry.state() == NodeState::Alive)
            .map(|(addr, _)| addr.clone())
            .collect()
    }

    async fn start_discovery(
        &mut self,
        ctx: &ActorContext<NodeControlMsg>,
    ) -> Result<usize, StoreError> {
        // Watch before listing so nothing registered in between is missed.
        let mut watch = self.registry.watch(&self.service).await?;
        let current = self.registry.list(&self.service).await?;
        let found = current.len();
        for info in current {
            self.on_service(ServiceEvent::Added(info));
        }

        let myself = ctx.myself.clone();
        let cancel = ctx.cancel.clone();
        let service = self.service.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = watch.next() => event,
                };
                let Some(event) = event else {
                    warn!(service = %service, "Service watch ended");
                    break;
                };
                if myself.send(NodeControlMsg::Service(event)).await.is_err() {
                    break;
                }
            }
        });

        info!(service = %self.service, nodes = found, "Node discovery started");
        Ok(found)
    }
}

fn notify(addr: &str, handle: &ActorHandle<NodeEvent>, event: NodeEvent) {
    if let Err(e) = handle.try_send(event) {
        warn!(node = %addr, event = %event, error = %e, "Could not deliver node event");
    }
}

#[async_trait]
impl Actor for NodeControllerActor {
    type Message = NodeControlMsg;

    fn name(&self) -> &str {
        "node-controller"
    }

    async fn handle(
        &mut self,
        msg: NodeControlMsg,
        ctx: &mut ActorContext<NodeControlMsg>,
    ) -> Result<bool, ActorError> {
        match msg {
            NodeControlMsg::Service(event) => self.on_service(event),
            NodeControlMsg::FilterNodes { filters, reply } => {
                let _ = reply.send(self.filter_nodes(&filters));
            }
            NodeControlMsg::ListNodes { reply } => {
                let views = self.nodes.values().map(|e| e.view.borrow().clone()).collect();
                let _ = reply.send(views);
            }
            NodeControlMsg::AlivePeers { exclude, reply } => {
                let _ = reply.send(self.alive_peers(&exclude));
            }
            NodeControlMsg::State { addr, reply } => {
                let _ = reply.send(self.nodes.get(&addr).map(NodeEntry::state));
            }
            NodeControlMsg::StartDiscovery { reply } => {
                let result = self.start_discovery(ctx).await;
                let _ = reply.send(result);
            }
        }
        Ok(true)
    }

    async fn on_stop(&mut self, _ctx: &mut ActorContext<NodeControlMsg>) {
        self.supervisor.stop_all().await;
    }
}
