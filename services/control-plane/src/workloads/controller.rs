//! The workload table.

use std::collections::BTreeMap;

use async_trait::async_trait;
use corral_id::WorkloadId;
use corral_reconcile::{
    diff_node, plan_repair, ExpectedWorkload, Finding, MismatchPolicy, Repair, ReportedWorkload,
};
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::actor::{WorkloadActor, WorkloadDeps};
use super::fsm::WorkloadEvent;
use super::model::{WorkloadConfig, WorkloadModel, WorkloadState};
use super::{SpecPush, WorkloadError};
use crate::actors::{mailbox, Actor, ActorContext, ActorError, ActorHandle, Supervisor};
use crate::persist;
use crate::scheduler::SchedulerPolicy;

const WORKLOAD_MAILBOX: usize = 32;

type Reply<T> = oneshot::Sender<Result<T, WorkloadError>>;

#[derive(Debug)]
pub enum WorkloadControlMsg {
    Create {
        config: WorkloadConfig,
        reply: Reply<WorkloadId>,
    },
    List {
        reply: oneshot::Sender<Vec<WorkloadState>>,
    },
    Get {
        id: WorkloadId,
        reply: oneshot::Sender<Option<WorkloadState>>,
    },
    SendEvent {
        id: WorkloadId,
        event: WorkloadEvent,
        reply: Reply<()>,
    },
    ReconcileNode {
        node: String,
        reported: Vec<ReportedWorkload>,
        reply: oneshot::Sender<Vec<SpecPush>>,
    },
    NodeDown {
        node: String,
        reply: oneshot::Sender<usize>,
    },
    Restore {
        reply: Reply<usize>,
    },
}

struct WorkloadEntry {
    handle: ActorHandle<WorkloadEvent>,
    state: watch::Receiver<WorkloadState>,
}

impl WorkloadEntry {
    fn send(&self, event: WorkloadEvent) -> Result<(), ActorError> {
        self.handle.try_send(event)
    }
}

/// Defaults applied to new workloads.
#[derive(Debug, Clone, Copy)]
pub struct WorkloadDefaults {
    pub scheduler: SchedulerPolicy,
    pub max_restarts: u32,
    pub mismatch_policy: MismatchPolicy,
}

pub struct WorkloadControllerActor {
    deps: WorkloadDeps,
    defaults: WorkloadDefaults,
    workloads: BTreeMap<WorkloadId, WorkloadEntry>,
    names: BTreeMap<String, WorkloadId>,
    supervisor: Supervisor,
}

impl WorkloadControllerActor {
    pub fn new(deps: WorkloadDeps, defaults: WorkloadDefaults, parent: &CancellationToken) -> Self {
        Self {
            deps,
            defaults,
            workloads: BTreeMap::new(),
            names: BTreeMap::new(),
            supervisor: Supervisor::new("workloads", parent),
        }
    }

    fn spawn(&mut self, model: WorkloadModel) -> &WorkloadEntry {
        let id = model.id();
        let (handle, mb) = mailbox(&format!("workload-{id}"), WORKLOAD_MAILBOX);
        self.names.insert(model.spec.name.clone(), id);
        let (actor, state) = WorkloadActor::new(model, self.deps.clone(), handle.clone());
        self.supervisor.spawn_with_mailbox(actor, mb);
        self.workloads
            .entry(id)
            .or_insert(WorkloadEntry { handle, state })
    }

    async fn create(&mut self, config: WorkloadConfig) -> Result<WorkloadId, WorkloadError> {
        let id = WorkloadId::generate_unique(|id| self.workloads.contains_key(id))?;
        let model = config.into_model(
            id,
            self.defaults.scheduler,
            self.defaults.max_restarts,
        )?;
        if self.names.contains_key(&model.spec.name) {
            return Err(WorkloadError::AlreadyExists(model.spec.name));
        }

        let key = persist::workload_key(&id.to_string());
        persist::save(self.deps.store.as_ref(), &key, &model).await?;

        info!(
            workload = %id,
            name = %model.spec.name,
            image = %model.spec.image,
            cpu = model.spec.cpu,
            memory = model.spec.memory,
            "Created workload"
        );
        self.spawn(model).send(WorkloadEvent::Schedule)?;
        Ok(id)
    }

    fn send_event(&self, id: WorkloadId, event: WorkloadEvent) -> Result<(), WorkloadError> {
        let entry = self
            .workloads
            .get(&id)
            .ok_or_else(|| WorkloadError::NotFound(id.to_string()))?;
        entry.send(event)?;
        Ok(())
    }

    fn reconcile_node(&self, node: &str, reported: &[ReportedWorkload]) -> Vec<SpecPush> {
        let placed: BTreeMap<String, WorkloadState> = self
            .workloads
            .iter()
            .map(|(id, entry)| (id.to_string(), entry.state.borrow().clone()))
            .filter(|(_, state)| state.node.as_deref() == Some(node))
            .collect();
        let expected: Vec<ExpectedWorkload> = placed
            .iter()
            .map(|(id, state)| ExpectedWorkload {
                workload_id: id.clone(),
                container_id: state.container_id.clone().unwrap_or_default(),
            })
            .collect();

        let mut pushes = Vec::new();
        for finding in diff_node(&expected, reported) {
            match &finding {
                Finding::ContainerMismatch {
                    workload_id,
                    expected,
                    reported,
                } => warn!(
                    node = %node,
                    workload = %workload_id,
                    expected = %expected,
                    reported = ?reported,
                    "Container mismatch"
                ),
                Finding::Unexpected { container_id } => {
                    info!(node = %node, container = %container_id, "Unexpected container on node")
                }
                Finding::Crashed { workload_id, .. } => {
                    warn!(node = %node, workload = %workload_id, "Workload missing from node")
                }
                Finding::MissingBookkeeping { .. } => {}
            }

            match plan_repair(&finding, self.defaults.mismatch_policy) {
                Repair::PushSpec {
                    workload_id,
                    container_id,
                } => {
                    if let Some(state) = placed.get(&workload_id) {
                        pushes.push(SpecPush {
                            container_id,
                            spec: state.spec.clone(),
                        });
                    }
                }
                Repair::Fail { workload_id } => {
                    let sent = workload_id
                        .parse::<WorkloadId>()
                        .map_err(WorkloadError::from)
                        .and_then(|id| self.send_event(id, WorkloadEvent::Failure));
                    if let Err(e) = sent {
                        warn!(workload = %workload_id, error = %e, "Could not deliver failure");
                    }
                }
                Repair::Ignore => {}
            }
        }
        pushes
    }

    fn node_down(&self, node: &str) -> usize {
        let mut failed = 0;
        for (id, entry) in &self.workloads {
            if entry.state.borrow().node.as_deref() != Some(node) {
                continue;
            }
            match entry.send(WorkloadEvent::NodeFailure) {
                Ok(()) => failed += 1,
                Err(e) => warn!(workload = %id, error = %e, "Could not deliver node failure"),
            }
        }
        failed
    }

    async fn restore(&mut self) -> Result<usize, WorkloadError> {
        let models: Vec<(String, WorkloadModel)> =
            persist::load_all(self.deps.store.as_ref(), &persist::workload_dir()).await?;
        let mut restored = 0;
        for (key, model) in models {
            if self.workloads.contains_key(&model.id()) {
                continue;
            }
            info!(key = %key, workload = %model.id(), phase = %model.phase, "Restoring workload");
            self.spawn(model);
            restored += 1;
        }
        Ok(restored)
    }
}

#[async_trait]
impl Actor for WorkloadControllerActor {
    type Message = WorkloadControlMsg;

    fn name(&self) -> &str {
        "workload-controller"
    }

    async fn handle(
        &mut self,
        msg: WorkloadControlMsg,
        _ctx: &mut ActorContext<WorkloadControlMsg>,
    ) -> Result<bool, ActorError> {
        match msg {
            WorkloadControlMsg::Create { config, reply } => {
                let _ = reply.send(self.create(config).await);
            }
            WorkloadControlMsg::List { reply } => {
                let states = self
                    .workloads
                    .values()
                    .map(|e| e.state.borrow().clone())
                    .collect();
                let _ = reply.send(states);
            }
            WorkloadControlMsg::Get { id, reply } => {
                let state = self.workloads.get(&id).map(|e| e.state.borrow().clone());
                let _ = reply.send(state);
            }
            WorkloadControlMsg::SendEvent { id, event, reply } => {
                let _ = reply.send(self.send_event(id, event));
            }
            WorkloadControlMsg::ReconcileNode {
                node,
                reported,
                reply,
            } => {
                let _ = reply.send(self.reconcile_node(&node, &reported));
            }
            WorkloadControlMsg::NodeDown { node, reply } => {
                let _ = reply.send(self.node_down(&node));
            }
            WorkloadControlMsg::Restore { reply } => {
                let result = self.restore().await;
                if let Ok(n) = &result {
                    info!(workloads = *n, "Restored workloads");
                }
                let _ = reply.send(result);
            }
        }
        Ok(true)
    }

    async fn on_stop(&mut self, _ctx: &mut ActorContext<WorkloadControlMsg>) {
        self.supervisor.stop_all().await;
    }
}
