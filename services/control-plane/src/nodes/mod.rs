//! Node liveness and reconciliation.
//!
//! The controller discovers node agents through the service registry and
//! runs one [`actor::NodeActor`] per node. Each node actor:
//! - registers the node's capacity with the resource manager on `up`
//! - reconciles the node's workloads on every tick while alive
//! - rechecks the node while unreachable
//! - fails the node's workloads and drops its idle providers on `down`
//!
//! The controller never waits on a node actor; it only `try_send`s events.
//! Node actors read the controller (peers) and the workload controller
//! (reconciliation) through request/reply calls.

mod actor;
mod controller;
pub mod fsm;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use corral_store::StoreError;
use serde::Serialize;

use crate::actors::{ActorError, ActorHandle};
use crate::agent::{AgentConnector, AgentError, NodeAgentClient, NodeResource};
use crate::scheduler::{NodeFilter, ScheduleError};

pub use actor::{NodeActor, NodeDeps, NodeError};
pub use controller::{NodeControlMsg, NodeControllerActor};
pub use fsm::{NodeAction, NodeEvent, NodeState};

/// Published snapshot of one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeView {
    /// `host:port`; also the node's provider id.
    pub addr: String,
    pub host: String,
    pub port: u16,
    pub state: NodeState,
    pub hostname: String,
    pub attributes: BTreeMap<String, String>,
    pub resources: Vec<NodeResource>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl NodeView {
    pub fn new(addr: &str, host: &str, port: u16) -> Self {
        Self {
            addr: addr.to_string(),
            host: host.to_string(),
            port,
            state: NodeState::Created,
            hostname: String::new(),
            attributes: BTreeMap::new(),
            resources: Vec::new(),
            last_seen: None,
        }
    }
}

/// Handle to the node controller.
#[derive(Debug, Clone)]
pub struct NodeController {
    handle: ActorHandle<NodeControlMsg>,
    connector: AgentConnector,
}

impl NodeController {
    pub fn new(handle: ActorHandle<NodeControlMsg>, connector: AgentConnector) -> Self {
        Self { handle, connector }
    }

    /// Client for the agent at `addr`, refused with [`AgentError::NodeDown`]
    /// unless the node is alive. Every workload and volume call goes
    /// through here.
    pub async fn agent(
        &self,
        addr: &str,
    ) -> Result<Result<NodeAgentClient, AgentError>, ActorError> {
        let node = addr.to_string();
        let state = self
            .handle
            .call(|reply| NodeControlMsg::State { addr: node, reply })
            .await?;
        Ok(match state {
            Some(NodeState::Alive) => Ok(self.connector.node(addr)),
            _ => Err(AgentError::NodeDown(addr.to_string())),
        })
    }

    /// Start following the agent service. Returns the number of nodes
    /// registered at the time of the initial listing.
    pub async fn start_discovery(&self) -> Result<Result<usize, StoreError>, ActorError> {
        self.handle
            .call(|reply| NodeControlMsg::StartDiscovery { reply })
            .await
    }

    pub async fn list_nodes(&self) -> Result<Vec<NodeView>, ActorError> {
        self.handle
            .call(|reply| NodeControlMsg::ListNodes { reply })
            .await
    }

    /// Alive nodes, other than `exclude`, in address order.
    pub async fn alive_peers(&self, exclude: &str) -> Result<Vec<String>, ActorError> {
        let exclude = exclude.to_string();
        self.handle
            .call(|reply| NodeControlMsg::AlivePeers { exclude, reply })
            .await
    }
}

#[async_trait]
impl NodeFilter for NodeController {
    async fn filter_nodes(
        &self,
        filters: &BTreeMap<String, String>,
    ) -> Result<Vec<String>, ScheduleError> {
        let filters = filters.clone();
        let nodes = self
            .handle
            .call(|reply| NodeControlMsg::FilterNodes { filters, reply })
            .await?;
        Ok(nodes)
    }
}
