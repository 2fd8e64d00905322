//! The leader's runtime context.
//!
//! [`ControlPlane`] is built once per leadership term and owns every
//! controller. Request handlers see it through [`AppState`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use corral_reconcile::{
    MismatchPolicy, DEFAULT_MAX_RESTARTS, DEFAULT_NODE_TICK, DEFAULT_RESTART_WINDOW,
    DEFAULT_SCHEDULE_RETRY,
};
use corral_store::{CoordStore, ServiceRegistry};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::actors::{mailbox, Supervisor};
use crate::agent::AgentConnector;
use crate::config::Config;
use crate::nodes::{NodeController, NodeControllerActor, NodeDeps};
use crate::resources::ResourceManager;
use crate::scheduler::{Scheduler, SchedulerPolicy};
use crate::volumes::{VolumeController, VolumeControllerActor};
use crate::workloads::{
    WorkloadController, WorkloadControllerActor, WorkloadDefaults, WorkloadDeps,
};

const CONTROLLER_MAILBOX: usize = 256;

/// Tunables for one control plane instance.
#[derive(Debug, Clone)]
pub struct ControlPlaneOptions {
    pub agent_service: String,
    pub agent_port: u16,
    pub agent_timeout: Duration,
    pub node_tick: Duration,
    pub schedule_retry: Duration,
    pub volume_mount_timeout: Duration,
    pub restart_window: Duration,
    pub max_restarts: u32,
    pub mismatch_policy: MismatchPolicy,
    pub default_scheduler: SchedulerPolicy,
}

impl Default for ControlPlaneOptions {
    fn default() -> Self {
        Self {
            agent_service: "node-agent".to_string(),
            agent_port: 8000,
            agent_timeout: Duration::from_secs(30),
            node_tick: DEFAULT_NODE_TICK,
            schedule_retry: DEFAULT_SCHEDULE_RETRY,
            volume_mount_timeout: Duration::from_secs(15),
            restart_window: DEFAULT_RESTART_WINDOW,
            max_restarts: DEFAULT_MAX_RESTARTS,
            mismatch_policy: MismatchPolicy::Log,
            default_scheduler: SchedulerPolicy::LeastUsed,
        }
    }
}

impl From<&Config> for ControlPlaneOptions {
    fn from(config: &Config) -> Self {
        Self {
            agent_service: config.agent_service.clone(),
            agent_port: config.agent_port,
            agent_timeout: config.agent_timeout,
            node_tick: config.node_tick,
            schedule_retry: config.schedule_retry,
            volume_mount_timeout: config.volume_mount_timeout,
            mismatch_policy: config.mismatch_policy,
            default_scheduler: config.default_scheduler,
            ..Self::default()
        }
    }
}

/// Every controller of one leadership term.
pub struct ControlPlane {
    state: AppState,
    cancel: CancellationToken,
    supervisor: Supervisor,
}

impl ControlPlane {
    /// Start the controllers, restore persisted state and begin node
    /// discovery. Cancelling `parent` tears everything down.
    pub async fn start(
        store: Arc<dyn CoordStore>,
        options: ControlPlaneOptions,
        parent: &CancellationToken,
    ) -> Result<Self> {
        let cancel = parent.child_token();
        let mut supervisor = Supervisor::new("control-plane", &cancel);

        let resources = ResourceManager::spawn(store.clone(), cancel.child_token());
        let connector = AgentConnector::new(options.agent_timeout);

        // Controllers reference each other; hand out handles before any of
        // them runs.
        let (node_handle, node_mailbox) = mailbox("node-controller", CONTROLLER_MAILBOX);
        let (workload_handle, workload_mailbox) =
            mailbox("workload-controller", CONTROLLER_MAILBOX);
        let (volume_handle, volume_mailbox) = mailbox("volume-controller", CONTROLLER_MAILBOX);
        let nodes = NodeController::new(node_handle, connector.clone());
        let workloads = WorkloadController::new(workload_handle);
        let volumes = VolumeController::new(volume_handle);

        let node_deps = NodeDeps {
            resources: resources.clone(),
            connector,
            controller: nodes.clone(),
            workloads: workloads.clone(),
            tick: options.node_tick,
        };
        supervisor.spawn_with_mailbox(
            NodeControllerActor::new(
                ServiceRegistry::new(store.clone()),
                options.agent_service.clone(),
                options.agent_port,
                node_deps,
                &cancel,
            ),
            node_mailbox,
        );

        let workload_deps = WorkloadDeps {
            store: store.clone(),
            scheduler: Scheduler::new(resources.clone(), Arc::new(nodes.clone())),
            resources: resources.clone(),
            volumes: volumes.clone(),
            nodes: nodes.clone(),
            schedule_retry: options.schedule_retry,
            mount_timeout: options.volume_mount_timeout,
            restart_window: options.restart_window,
        };
        let defaults = WorkloadDefaults {
            scheduler: options.default_scheduler,
            max_restarts: options.max_restarts,
            mismatch_policy: options.mismatch_policy,
        };
        supervisor.spawn_with_mailbox(
            WorkloadControllerActor::new(workload_deps, defaults, &cancel),
            workload_mailbox,
        );

        supervisor.spawn_with_mailbox(
            VolumeControllerActor::new(store.clone(), nodes.clone(), &cancel),
            volume_mailbox,
        );

        let providers = resources
            .restore()
            .await
            .context("restoring resource providers")?;
        let restored_volumes = volumes.restore().await.context("restoring volumes")?;
        let restored_workloads = workloads.restore().await.context("restoring workloads")?;
        let discovered = nodes
            .start_discovery()
            .await?
            .context("starting node discovery")?;

        info!(
            providers,
            volumes = restored_volumes,
            workloads = restored_workloads,
            nodes = discovered,
            "Control plane started"
        );

        Ok(Self {
            state: AppState::new(resources, nodes, workloads, volumes),
            cancel,
            supervisor,
        })
    }

    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    /// Token cancelled when this control plane shuts down.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop every controller and the actors under them.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        self.supervisor.stop_all().await;
        info!("Control plane stopped");
    }
}

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    resources: ResourceManager,
    nodes: NodeController,
    workloads: WorkloadController,
    volumes: VolumeController,
}

impl AppState {
    pub fn new(
        resources: ResourceManager,
        nodes: NodeController,
        workloads: WorkloadController,
        volumes: VolumeController,
    ) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                resources,
                nodes,
                workloads,
                volumes,
            }),
        }
    }

    pub fn resources(&self) -> &ResourceManager {
        &self.inner.resources
    }

    pub fn nodes(&self) -> &NodeController {
        &self.inner.nodes
    }

    pub fn workloads(&self) -> &WorkloadController {
        &self.inner.workloads
    }

    pub fn volumes(&self) -> &VolumeController {
        &self.inner.volumes
    }
}
