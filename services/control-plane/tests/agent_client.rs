//! Node agent client against a mock agent.

use std::time::Duration;

use corral_control_plane::agent::{AgentConnector, AgentError, NodeAgentClient, VolumeSpec};
use corral_control_plane::resources::UnitKind;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn agent(timeout: Duration) -> (MockServer, NodeAgentClient) {
    let server = MockServer::start().await;
    let addr = server.address().to_string();
    let client = AgentConnector::new(timeout).node(&addr);
    (server, client)
}

#[tokio::test]
async fn test_node_spec_and_listing() {
    let (server, client) = agent(Duration::from_secs(5)).await;
    let cancel = CancellationToken::new();

    Mock::given(method("GET"))
        .and(path("/node"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "hostName": "n1",
            "resources": [{"type": "cpu", "unitType": "fluid", "numRsrc": 8}]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/alta"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"altaId": "00000000000000aa", "containerId": "c-1"},
            {"containerId": "c-2"}
        ])))
        .mount(&server)
        .await;

    let spec = client.node_spec(&cancel).await.unwrap();
    assert_eq!(spec.host_name, "n1");
    assert_eq!(spec.resources[0].unit_kind, UnitKind::Fluid);
    assert_eq!(spec.resources[0].amount, 8);
    assert!(spec.attributes.is_empty());

    let listed = client.list_workloads(&cancel).await.unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].workload_id, "00000000000000aa");
    assert_eq!(listed[1].workload_id, "");
}

#[tokio::test]
async fn test_volume_calls_send_spec() {
    let (server, client) = agent(Duration::from_secs(5)).await;
    let spec = VolumeSpec {
        datastore_type: "HostVolume".into(),
        datastore_volume_id: "data".into(),
        volume_size: 1024,
    };

    Mock::given(method("POST"))
        .and(path("/volume/mount"))
        .and(body_json(json!({
            "datastoreType": "HostVolume",
            "datastoreVolumeId": "data",
            "volumeSize": 1024
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
        .expect(1)
        .mount(&server)
        .await;

    client
        .mount_volume(&spec, &CancellationToken::new())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_rejected_and_failed_calls() {
    let (server, client) = agent(Duration::from_secs(5)).await;
    let cancel = CancellationToken::new();

    Mock::given(method("POST"))
        .and(path("/network/default/create"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": false})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/alta/create"))
        .respond_with(ResponseTemplate::new(500).set_body_string("disk full"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/image/nginx/ispresent"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .mount(&server)
        .await;

    let err = client.create_network("default", &cancel).await.unwrap_err();
    assert!(matches!(err, AgentError::Rejected { ref path, .. } if path == "/network/default/create"));

    let spec = serde_json::from_value(json!({
        "workloadId": "00000000000000aa",
        "name": "web",
        "image": "nginx",
        "cpu": 1,
        "memory": 512
    }))
    .unwrap();
    let err = client.create_workload(&spec, &cancel).await.unwrap_err();
    assert!(matches!(err, AgentError::Status { status: 500, ref body, .. } if body == "disk full"));

    let err = client.image_present("nginx", &cancel).await.unwrap_err();
    assert!(matches!(err, AgentError::Decode { .. }));
}

#[tokio::test]
async fn test_slow_agent_times_out() {
    let (server, client) = agent(Duration::from_millis(100)).await;

    Mock::given(method("GET"))
        .and(path("/node"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({}))
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;

    let err = client.node_spec(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, AgentError::Timeout { .. }));
}

#[tokio::test]
async fn test_cancelled_call_returns_immediately() {
    let (server, client) = agent(Duration::from_secs(30)).await;

    Mock::given(method("GET"))
        .and(path("/alta"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([]))
                .set_delay(Duration::from_secs(30)),
        )
        .mount(&server)
        .await;

    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let started = std::time::Instant::now();
    let err = client.list_workloads(&cancel).await.unwrap_err();
    assert!(matches!(err, AgentError::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(5));
}
