//! Workload placement.
//!
//! The scheduler is responsible for:
//! - Narrowing the cluster to alive nodes whose attributes match the
//!   workload's filters
//! - Picking one of them with the workload's [`SchedulerPolicy`]
//! - Reserving cpu and memory there under the workload id
//!
//! The reservation is what makes a decision stick: two concurrent schedules
//! can never book the same capacity because both go through the resource
//! manager. Nothing is reserved unless every line fits.

mod policies;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};

use crate::actors::ActorError;
use crate::resources::{Grant, ResourceError, ResourceManager, ResourceRequest, CPU, MEMORY};

pub use policies::{bin_pack, least_used, Candidate, SchedulerPolicy};

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("No nodes to schedule")]
    NoNodes,

    #[error("No nodes that match the filter")]
    NoMatchingNodes,

    #[error("No Nodes with resource")]
    NoCapacity,

    #[error("unknown scheduler policy: {0}")]
    UnknownPolicy(String),

    #[error(transparent)]
    Resources(#[from] ResourceError),

    #[error("node controller unavailable: {0}")]
    Nodes(#[from] ActorError),
}

/// Source of eligible node ids.
#[async_trait]
pub trait NodeFilter: Send + Sync {
    /// Alive nodes whose attributes contain every `filters` pair.
    async fn filter_nodes(
        &self,
        filters: &BTreeMap<String, String>,
    ) -> Result<Vec<String>, ScheduleError>;
}

/// What a workload asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementRequest {
    /// Resource user key; the workload id.
    pub user_key: String,
    pub cpu: u64,
    pub memory: u64,
    pub filters: BTreeMap<String, String>,
}

/// Where a workload landed and what it holds there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub node: String,
    pub grants: Vec<Grant>,
}

#[derive(Clone)]
pub struct Scheduler {
    resources: ResourceManager,
    nodes: Arc<dyn NodeFilter>,
}

impl Scheduler {
    pub fn new(resources: ResourceManager, nodes: Arc<dyn NodeFilter>) -> Self {
        Self { resources, nodes }
    }

    /// Choose a node and reserve the request there.
    ///
    /// A workload that already holds cpu somewhere is sent back to that node;
    /// the allocation then returns the existing grants.
    pub async fn schedule(
        &self,
        policy: SchedulerPolicy,
        request: &PlacementRequest,
    ) -> Result<Placement, ScheduleError> {
        let cpu = self.resources.providers(CPU).await?;
        if cpu.is_empty() {
            return Err(ScheduleError::NoNodes);
        }
        let memory = self.resources.providers(MEMORY).await?;
        if memory.is_empty() {
            return Err(ScheduleError::NoNodes);
        }
        let eligible: BTreeSet<String> = self
            .nodes
            .filter_nodes(&request.filters)
            .await?
            .into_iter()
            .collect();

        let candidates: Vec<Candidate<'_>> = cpu
            .iter()
            .filter(|(node, _)| eligible.contains(*node))
            .filter_map(|(node, c)| {
                memory.get(node).map(|m| Candidate {
                    node: node.as_str(),
                    free_cpu: c.free,
                    free_memory: m.free,
                })
            })
            .collect();
        if candidates.is_empty() {
            return Err(ScheduleError::NoMatchingNodes);
        }

        let existing = candidates
            .iter()
            .find(|c| cpu[c.node].users.contains_key(&request.user_key))
            .map(|c| c.node);
        let node = match existing {
            Some(node) => {
                debug!(workload = %request.user_key, node = %node, "Workload already holds resources");
                node
            }
            None => policy
                .pick(&candidates, request.cpu, request.memory)
                .ok_or(ScheduleError::NoCapacity)?,
        };

        let grants = self
            .resources
            .alloc(vec![
                ResourceRequest::new(CPU, node, &request.user_key, request.cpu),
                ResourceRequest::new(MEMORY, node, &request.user_key, request.memory),
            ])
            .await?;

        info!(
            workload = %request.user_key,
            node = %node,
            policy = %policy,
            cpu = request.cpu,
            memory = request.memory,
            "Scheduled workload"
        );
        Ok(Placement {
            node: node.to_string(),
            grants,
        })
    }
}

#[cfg(test)]
mod tests {
    use corral_store::MemoryStore;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::resources::{ProviderDecl, UnitKind};

    struct StaticNodes(Vec<String>);

    #[async_trait]
    impl NodeFilter for StaticNodes {
        async fn filter_nodes(
            &self,
            _filters: &BTreeMap<String, String>,
        ) -> Result<Vec<String>, ScheduleError> {
            Ok(self.0.clone())
        }
    }

    fn decl(resource_type: &str, node: &str, total: u64) -> ProviderDecl {
        ProviderDecl {
            resource_type: resource_type.to_string(),
            provider: node.to_string(),
            unit_kind: UnitKind::Fluid,
            total,
        }
    }

    async fn cluster(nodes: &[(&str, u64, u64)], alive: &[&str]) -> (Scheduler, ResourceManager) {
        let rm = ResourceManager::spawn(Arc::new(MemoryStore::new()), CancellationToken::new());
        for (node, cpu, memory) in nodes {
            rm.add_providers(vec![decl(CPU, node, *cpu), decl(MEMORY, node, *memory)])
                .await
                .unwrap();
        }
        let filter = StaticNodes(alive.iter().map(|n| n.to_string()).collect());
        (Scheduler::new(rm.clone(), Arc::new(filter)), rm)
    }

    fn request(user: &str, cpu: u64, memory: u64) -> PlacementRequest {
        PlacementRequest {
            user_key: user.to_string(),
            cpu,
            memory,
            filters: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_schedule_reserves_on_chosen_node() {
        let (scheduler, rm) = cluster(&[("n1", 4, 4096), ("n2", 2, 4096)], &["n1", "n2"]).await;

        let placement = scheduler
            .schedule(SchedulerPolicy::LeastUsed, &request("w1", 2, 1024))
            .await
            .unwrap();

        assert_eq!(placement.node, "n1");
        assert_eq!(rm.provider(CPU, "n1").await.unwrap().unwrap().free, 2);
        assert_eq!(rm.provider(MEMORY, "n1").await.unwrap().unwrap().free, 3072);
    }

    #[tokio::test]
    async fn test_schedule_is_idempotent_per_workload() {
        let (scheduler, rm) = cluster(&[("n1", 4, 4096), ("n2", 4, 4096)], &["n1", "n2"]).await;

        let first = scheduler
            .schedule(SchedulerPolicy::LeastUsed, &request("w1", 2, 1024))
            .await
            .unwrap();
        let second = scheduler
            .schedule(SchedulerPolicy::LeastUsed, &request("w1", 2, 1024))
            .await
            .unwrap();

        assert_eq!(first.node, second.node);
        assert_eq!(rm.provider(CPU, &first.node).await.unwrap().unwrap().free, 2);
    }

    #[tokio::test]
    async fn test_schedule_errors() {
        let (empty, _) = cluster(&[], &[]).await;
        assert!(matches!(
            empty
                .schedule(SchedulerPolicy::BinPack, &request("w1", 1, 1))
                .await,
            Err(ScheduleError::NoNodes)
        ));

        let (filtered, _) = cluster(&[("n1", 4, 4096)], &["n9"]).await;
        let err = filtered
            .schedule(SchedulerPolicy::BinPack, &request("w1", 1, 1))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "No nodes that match the filter");

        let (full, rm) = cluster(&[("n1", 4, 4096)], &["n1"]).await;
        let err = full
            .schedule(SchedulerPolicy::LeastUsed, &request("w1", 8, 1))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "No Nodes with resource");
        assert_eq!(rm.provider(CPU, "n1").await.unwrap().unwrap().free, 4);
    }

    #[tokio::test]
    async fn test_cpu_without_memory_is_no_nodes() {
        let (scheduler, rm) = cluster(&[], &["n1"]).await;
        rm.add_providers(vec![decl(CPU, "n1", 4)]).await.unwrap();

        let err = scheduler
            .schedule(SchedulerPolicy::LeastUsed, &request("w1", 1, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, ScheduleError::NoNodes));
        assert_eq!(rm.provider(CPU, "n1").await.unwrap().unwrap().free, 4);
    }

    #[tokio::test]
    async fn test_least_used_does_not_fall_back_to_less_cpu() {
        let (scheduler, rm) = cluster(&[("n1", 2, 8192), ("n2", 8, 1024)], &["n1", "n2"]).await;

        let err = scheduler
            .schedule(SchedulerPolicy::LeastUsed, &request("w1", 1, 4096))
            .await
            .unwrap_err();
        assert!(matches!(err, ScheduleError::NoCapacity));
        assert_eq!(rm.provider(MEMORY, "n1").await.unwrap().unwrap().free, 8192);

        let placement = scheduler
            .schedule(SchedulerPolicy::BinPack, &request("w1", 1, 4096))
            .await
            .unwrap();
        assert_eq!(placement.node, "n1");
    }
}
