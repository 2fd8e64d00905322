//! Volume lifecycle and node loss.

mod common;

use std::time::Duration;

use common::{eventually, Cluster};
use corral_control_plane::agent::{AgentError, VolumeBind};
use corral_control_plane::nodes::NodeState;
use corral_control_plane::state::ControlPlaneOptions;
use corral_control_plane::volumes::{VolumeError, VolumeState};
use corral_control_plane::workloads::{WorkloadConfig, WorkloadEvent, WorkloadPhase};
use corral_reconcile::ReportedWorkload;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

fn data_volume() -> VolumeBind {
    VolumeBind {
        datastore_type: "HostVolume".into(),
        datastore_volume_id: "data".into(),
        bind_mount_point: "/var/lib/data".into(),
    }
}

#[tokio::test]
async fn test_workload_mounts_volume_on_its_node() {
    let cluster = Cluster::start(4, 4096).await;
    let state = cluster.state();

    let id = state
        .workloads()
        .create(WorkloadConfig {
            name: "db".into(),
            image: "postgres".into(),
            volumes: vec![data_volume()],
            ..Default::default()
        })
        .await
        .unwrap();
    cluster.wait_phase(id, WorkloadPhase::Running).await;

    let volumes = state.volumes().list().await.unwrap();
    assert_eq!(volumes.len(), 1);
    assert_eq!(volumes[0].key(), "HostVolume:data");
    assert_eq!(volumes[0].state, VolumeState::Mounted);
    assert_eq!(volumes[0].node.as_deref(), Some(cluster.node.as_str()));
    assert_eq!(volumes[0].spec.volume_size, 1024);

    let paths: Vec<String> = cluster
        .agent
        .received_requests()
        .await
        .unwrap()
        .iter()
        .map(|r| r.url.path().to_string())
        .collect();
    let create = paths.iter().position(|p| p == "/volume/create").unwrap();
    let mount = paths.iter().position(|p| p == "/volume/mount").unwrap();
    assert!(create < mount);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_volume_is_mounted_on_one_node_at_a_time() {
    let cluster = Cluster::start(4, 4096).await;
    let volumes = cluster.state().volumes().clone();

    volumes
        .mount(data_volume(), cluster.node.clone())
        .await
        .unwrap();
    // Mounting again where it already is succeeds without another RPC.
    volumes
        .mount(data_volume(), cluster.node.clone())
        .await
        .unwrap();

    let err = volumes
        .mount(data_volume(), "10.0.0.9:8000".into())
        .await
        .unwrap_err();
    assert!(matches!(err, VolumeError::MountedElsewhere { .. }));

    let err = volumes.destroy("HostVolume:data").await.unwrap_err();
    assert!(matches!(err, VolumeError::InvalidState { .. }));

    volumes.unmount(data_volume()).await.unwrap();
    assert_eq!(volumes.list().await.unwrap()[0].state, VolumeState::Inited);

    volumes.destroy("HostVolume:data").await.unwrap();
    assert!(volumes.list().await.unwrap().is_empty());

    let mounts = cluster
        .agent
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.path() == "/volume/mount")
        .count();
    assert_eq!(mounts, 1);

    cluster.shutdown().await;
}

async fn wait_all_down(cluster: &Cluster) {
    let nodes = cluster.state().nodes().clone();
    eventually("node down", || {
        let nodes = nodes.clone();
        async move {
            nodes
                .list_nodes()
                .await
                .unwrap()
                .iter()
                .all(|n| n.state == NodeState::Down)
        }
    })
    .await;
}

async fn request_count(cluster: &Cluster, wanted: &str) -> usize {
    cluster
        .agent
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.path() == wanted)
        .count()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_removed_node_goes_down_and_workloads_reschedule() {
    let options = ControlPlaneOptions {
        node_tick: Duration::from_secs(3600),
        schedule_retry: Duration::from_millis(50),
        ..ControlPlaneOptions::default()
    };
    let mut cluster = Cluster::start_with(4, 4096, options).await;
    let state = cluster.state();

    let id = state
        .workloads()
        .create(WorkloadConfig {
            name: "web".into(),
            image: "nginx".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    cluster.wait_phase(id, WorkloadPhase::Running).await;

    cluster.deregister_node().await;
    wait_all_down(&cluster).await;

    // No alive node remains, so the workload waits for capacity.
    let workload = cluster.wait_phase(id, WorkloadPhase::Rescheduling).await;
    assert_eq!(workload.node, None);
    assert_eq!(workload.container_id, None);

    // Several schedule retries later it is still off the dead node.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let workload = state.workloads().get(id).await.unwrap().unwrap();
    assert_eq!(workload.state, WorkloadPhase::Rescheduling);
    assert_eq!(workload.node, None);
    assert_eq!(request_count(&cluster, "/alta/create").await, 1);
    assert_eq!(state.resources().fatal_error(), None);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_agent_calls_to_down_node_are_refused() {
    let mut cluster = Cluster::start(4, 4096).await;
    let state = cluster.state();

    let id = state
        .workloads()
        .create(WorkloadConfig {
            name: "web".into(),
            image: "nginx".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    cluster.wait_phase(id, WorkloadPhase::Running).await;
    state
        .workloads()
        .send_event(id, WorkloadEvent::Stop)
        .await
        .unwrap();
    cluster.wait_phase(id, WorkloadPhase::Stopped).await;
    assert!(state.nodes().agent(&cluster.node).await.unwrap().is_ok());

    cluster.deregister_node().await;
    wait_all_down(&cluster).await;

    let refused = state.nodes().agent(&cluster.node).await.unwrap();
    assert!(matches!(refused, Err(AgentError::NodeDown(ref n)) if *n == cluster.node));
    let unknown = state.nodes().agent("10.0.0.9:8000").await.unwrap();
    assert!(matches!(unknown, Err(AgentError::NodeDown(_))));

    // A stopped workload keeps its node; starting it there is refused.
    state
        .workloads()
        .send_event(id, WorkloadEvent::Start)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let workload = state.workloads().get(id).await.unwrap().unwrap();
    assert_eq!(workload.state, WorkloadPhase::Stopped);
    let start = format!("/alta/{id}/start");
    assert_eq!(request_count(&cluster, &start).await, 1);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_ticker_reconciles_and_repairs_bookkeeping() {
    let options = ControlPlaneOptions {
        node_tick: Duration::from_millis(100),
        ..ControlPlaneOptions::default()
    };
    let cluster = Cluster::start_with(4, 4096, options).await;

    // The agent still runs the container but has forgotten which workload
    // it belongs to.
    let reported = vec![ReportedWorkload {
        workload_id: String::new(),
        container_id: "c-1".into(),
    }];
    Mock::given(method("GET"))
        .and(path("/alta"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!(reported)))
        .mount(&cluster.agent)
        .await;

    let id = cluster
        .state()
        .workloads()
        .create(WorkloadConfig {
            name: "web".into(),
            image: "nginx".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    cluster.wait_phase(id, WorkloadPhase::Running).await;

    let agent = &cluster.agent;
    eventually("spec pushed", || async move {
        agent
            .received_requests()
            .await
            .unwrap()
            .iter()
            .any(|r| r.url.path() == "/alta/c-1/update")
    })
    .await;
    assert_eq!(
        cluster.state().workloads().get(id).await.unwrap().unwrap().state,
        WorkloadPhase::Running
    );

    cluster.shutdown().await;
}
