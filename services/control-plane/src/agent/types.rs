//! JSON bodies exchanged with node agents.

use std::collections::BTreeMap;

use corral_id::WorkloadId;
use serde::{Deserialize, Serialize};

use crate::resources::UnitKind;

/// One schedulable resource a node offers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeResource {
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(alias = "unitType")]
    pub unit_kind: UnitKind,
    #[serde(alias = "numRsrc")]
    pub amount: u64,
}

/// Response of `GET /node`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSpec {
    #[serde(default)]
    pub host_name: String,
    #[serde(default)]
    pub resources: Vec<NodeResource>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

/// Generic `{success}` response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReqSuccess {
    pub success: bool,
}

/// Response of `POST /alta/create`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerCreated {
    pub container_id: String,
}

/// A volume to mount into a workload's container.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeBind {
    /// `PersistentVolume` or `HostVolume`.
    pub datastore_type: String,
    pub datastore_volume_id: String,
    #[serde(default)]
    pub bind_mount_point: String,
}

impl VolumeBind {
    /// Volume identity: `<datastoreType>:<datastoreVolumeId>`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.datastore_type, self.datastore_volume_id)
    }
}

/// Body of the `/volume/*` calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSpec {
    pub datastore_type: String,
    pub datastore_volume_id: String,
    /// MiB.
    pub volume_size: u64,
}

/// What a node agent needs to run a workload. Body of `POST /alta/create`
/// and `POST /alta/{containerId}/update`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSpec {
    #[serde(alias = "altaId")]
    pub workload_id: WorkloadId,
    #[serde(alias = "altaName")]
    pub name: String,
    pub image: String,
    /// Cores.
    pub cpu: u64,
    /// MiB.
    pub memory: u64,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub networks: Vec<String>,
    #[serde(default)]
    pub volumes: Vec<VolumeBind>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_spec_accepts_legacy_field_names() {
        let spec: NodeSpec = serde_json::from_str(
            r#"{"hostName":"h1","resources":[
                {"type":"cpu","unitType":"fluid","numRsrc":4},
                {"type":"vlan","unitKind":"descrete","amount":100}],
                "attributes":{"zone":"a"}}"#,
        )
        .unwrap();

        assert_eq!(spec.host_name, "h1");
        assert_eq!(spec.resources[0].unit_kind, UnitKind::Fluid);
        assert_eq!(spec.resources[1].unit_kind, UnitKind::Discrete);
        assert_eq!(spec.resources[1].amount, 100);
        assert_eq!(spec.attributes["zone"], "a");
    }

    #[test]
    fn test_volume_key() {
        let bind = VolumeBind {
            datastore_type: "HostVolume".into(),
            datastore_volume_id: "data".into(),
            bind_mount_point: "/data".into(),
        };
        assert_eq!(bind.key(), "HostVolume:data");
    }
}
