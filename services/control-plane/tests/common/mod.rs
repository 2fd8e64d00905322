//! A control plane wired to one mock node agent.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use corral_control_plane::nodes::NodeState;
use corral_control_plane::resources::CPU;
use corral_control_plane::state::{AppState, ControlPlane, ControlPlaneOptions};
use corral_control_plane::workloads::{WorkloadPhase, WorkloadState};
use corral_id::WorkloadId;
use corral_store::{CoordStore, MemoryStore, Registration, ServiceInfo, ServiceRegistry};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const WAIT: Duration = Duration::from_secs(10);

pub struct Cluster {
    pub agent: MockServer,
    pub node: String,
    pub store: Arc<dyn CoordStore>,
    pub plane: ControlPlane,
    pub cancel: CancellationToken,
    registration: Option<Registration>,
}

impl Cluster {
    /// One node with `cpu` cores and `memory` MiB and the happy-path agent
    /// responses mounted.
    pub async fn start(cpu: u64, memory: u64) -> Self {
        let options = ControlPlaneOptions {
            // Keep the reconciliation ticker out of the way.
            node_tick: Duration::from_secs(3600),
            ..ControlPlaneOptions::default()
        };
        Self::start_with(cpu, memory, options).await
    }

    pub async fn start_with(cpu: u64, memory: u64, options: ControlPlaneOptions) -> Self {
        let agent = MockServer::start().await;
        mount_node_spec(&agent, cpu, memory).await;
        mount_happy_path(&agent).await;

        let store: Arc<dyn CoordStore> = Arc::new(MemoryStore::new());
        let port = agent.address().port();
        let registration = ServiceRegistry::new(store.clone())
            .register(
                ServiceInfo::new("node-agent", "127.0.0.1", port),
                Duration::from_secs(30),
            )
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let plane = ControlPlane::start(store.clone(), options, &cancel)
            .await
            .unwrap();

        let cluster = Self {
            agent,
            node: format!("127.0.0.1:{port}"),
            store,
            plane,
            cancel,
            registration: Some(registration),
        };
        cluster.wait_node_alive().await;
        cluster
    }

    /// Drop the node from the service registry, as if its agent went away.
    pub async fn deregister_node(&mut self) {
        if let Some(registration) = self.registration.take() {
            registration.deregister().await.unwrap();
        }
    }

    pub fn state(&self) -> AppState {
        self.plane.state()
    }

    pub async fn wait_node_alive(&self) {
        let state = self.state();
        let node = self.node.clone();
        eventually("node alive with providers", || {
            let state = state.clone();
            let node = node.clone();
            async move {
                let alive = state
                    .nodes()
                    .list_nodes()
                    .await
                    .unwrap()
                    .iter()
                    .any(|n| n.addr == node && n.state == NodeState::Alive);
                let registered = state.resources().provider(CPU, &node).await.unwrap().is_some();
                alive && registered
            }
        })
        .await;
    }

    pub async fn wait_phase(&self, id: WorkloadId, phase: WorkloadPhase) -> WorkloadState {
        let state = self.state();
        eventually(&format!("workload {id} {phase}"), || {
            let state = state.clone();
            async move {
                state
                    .workloads()
                    .get(id)
                    .await
                    .unwrap()
                    .is_some_and(|w| w.state == phase)
            }
        })
        .await;
        self.state().workloads().get(id).await.unwrap().unwrap()
    }

    pub async fn free(&self, resource_type: &str) -> u64 {
        self.state()
            .resources()
            .provider(resource_type, &self.node)
            .await
            .unwrap()
            .unwrap()
            .free
    }

    pub async fn shutdown(self) {
        self.plane.shutdown().await;
        self.cancel.cancel();
    }
}

pub async fn mount_node_spec(agent: &MockServer, cpu: u64, memory: u64) {
    Mock::given(method("GET"))
        .and(path("/node"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "hostName": "node-1",
            "resources": [
                {"type": "cpu", "unitKind": "fluid", "amount": cpu},
                {"type": "memory", "unitKind": "fluid", "amount": memory}
            ],
            "attributes": {"zone": "a"}
        })))
        .mount(agent)
        .await;
}

/// Every call a workload makes on its way to `running`.
pub async fn mount_happy_path(agent: &MockServer) {
    let ok = || ResponseTemplate::new(200).set_body_json(json!({"success": true}));

    Mock::given(method("POST"))
        .and(path_regex(r"^/network/[^/]+/create$"))
        .respond_with(ok())
        .mount(agent)
        .await;
    Mock::given(method("POST"))
        .and(path_regex(r"^/image/.+/ispresent$"))
        .respond_with(ok())
        .mount(agent)
        .await;
    Mock::given(method("POST"))
        .and(path_regex(r"^/volume/(create|mount|unmount)$"))
        .respond_with(ok())
        .mount(agent)
        .await;
    Mock::given(method("GET"))
        .and(path("/alta"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .with_priority(10)
        .mount(agent)
        .await;
    Mock::given(method("POST"))
        .and(path("/alta/create"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"containerId": "c-1"})))
        .mount(agent)
        .await;
    Mock::given(method("POST"))
        .and(path_regex(r"^/alta/[^/]+/(start|stop|update)$"))
        .respond_with(ok())
        .mount(agent)
        .await;
}

/// Poll `check` until it holds or [`WAIT`] passes.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
