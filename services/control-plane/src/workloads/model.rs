//! Workload documents: the API request body, the persisted model and the
//! published state.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use corral_id::WorkloadId;
use serde::{Deserialize, Serialize};

use super::fsm::WorkloadPhase;
use super::WorkloadError;
use crate::agent::{VolumeBind, WorkloadSpec};
use crate::scheduler::SchedulerPolicy;

/// Datastore types a volume bind may name.
pub const DATASTORE_TYPES: [&str; 2] = ["PersistentVolume", "HostVolume"];

const DEFAULT_CPU: u64 = 1;
const DEFAULT_MEMORY_MIB: u64 = 512;
const DEFAULT_NETWORK: &str = "default";

/// When a failed workload is started again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RestartPolicy {
    #[default]
    Always,
    OnFailure,
    Never,
}

impl RestartPolicy {
    pub fn restarts_on_failure(self) -> bool {
        !matches!(self, Self::Never)
    }
}

/// Body of `POST /v1/workloads`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkloadConfig {
    pub name: String,
    pub image: String,
    /// Whole cores, e.g. `"2"`. Empty means one.
    pub cpu: String,
    /// `512M`, `2g`, or a bare MiB count. Empty means 512 MiB.
    pub memory: String,
    /// Entry point override.
    pub command: String,
    #[serde(rename = "network")]
    pub networks: Vec<String>,
    pub environment: Vec<String>,
    pub volumes: Vec<VolumeBind>,
    pub scheduler: String,
    pub filters: BTreeMap<String, String>,
    pub restart_policy: RestartPolicy,
    pub max_restarts: Option<u32>,
}

/// Parse a cpu request in whole cores.
pub fn parse_cpu(cpu: &str) -> Result<u64, WorkloadError> {
    let cpu = cpu.trim();
    if cpu.is_empty() {
        return Ok(DEFAULT_CPU);
    }
    cpu.parse()
        .map_err(|_| WorkloadError::InvalidConfig(format!("invalid cpu: {cpu}")))
}

/// Parse a memory request into MiB.
pub fn parse_memory(memory: &str) -> Result<u64, WorkloadError> {
    let memory = memory.trim();
    if memory.is_empty() {
        return Ok(DEFAULT_MEMORY_MIB);
    }
    let invalid = || WorkloadError::InvalidConfig(format!("invalid memory: {memory}"));

    let (digits, scale) = match memory.char_indices().find(|(_, c)| !c.is_ascii_digit()) {
        None => (memory, 1),
        Some((i, _)) => {
            let scale = match memory[i..].to_ascii_lowercase().as_str() {
                "m" | "mb" | "mib" => 1,
                "g" | "gb" | "gib" => 1024,
                _ => return Err(invalid()),
            };
            (&memory[..i], scale)
        }
    };
    let amount: u64 = digits.parse().map_err(|_| invalid())?;
    amount.checked_mul(scale).ok_or_else(invalid)
}

impl WorkloadConfig {
    /// Validate the request and turn it into a model for `id`.
    ///
    /// `default_scheduler` applies when the request names none.
    pub fn into_model(
        self,
        id: WorkloadId,
        default_scheduler: SchedulerPolicy,
        default_max_restarts: u32,
    ) -> Result<WorkloadModel, WorkloadError> {
        if self.image.is_empty() {
            return Err(WorkloadError::InvalidConfig("image is required".to_string()));
        }
        for bind in &self.volumes {
            if !DATASTORE_TYPES.contains(&bind.datastore_type.as_str()) {
                return Err(WorkloadError::InvalidDatastore(bind.datastore_type.clone()));
            }
        }
        let scheduler = if self.scheduler.is_empty() {
            default_scheduler
        } else {
            self.scheduler.parse()?
        };

        let spec = WorkloadSpec {
            workload_id: id,
            name: if self.name.is_empty() {
                id.to_string()
            } else {
                self.name
            },
            image: self.image,
            cpu: parse_cpu(&self.cpu)?,
            memory: parse_memory(&self.memory)?,
            command: if self.command.is_empty() {
                Vec::new()
            } else {
                vec![self.command]
            },
            env: self.environment,
            networks: if self.networks.is_empty() {
                vec![DEFAULT_NETWORK.to_string()]
            } else {
                self.networks
            },
            volumes: self.volumes,
        };

        Ok(WorkloadModel {
            spec,
            node: None,
            container_id: None,
            phase: WorkloadPhase::Created,
            scheduler,
            filters: self.filters,
            restart_policy: self.restart_policy,
            max_restarts: self.max_restarts.unwrap_or(default_max_restarts),
        })
    }
}

/// Persisted workload document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadModel {
    pub spec: WorkloadSpec,
    #[serde(default)]
    pub node: Option<String>,
    #[serde(default)]
    pub container_id: Option<String>,
    pub phase: WorkloadPhase,
    #[serde(default)]
    pub scheduler: SchedulerPolicy,
    #[serde(default)]
    pub filters: BTreeMap<String, String>,
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    #[serde(default)]
    pub max_restarts: u32,
}

impl WorkloadModel {
    pub fn id(&self) -> WorkloadId {
        self.spec.workload_id
    }

    pub fn state(&self) -> WorkloadState {
        WorkloadState {
            spec: self.spec.clone(),
            node: self.node.clone(),
            container_id: self.container_id.clone(),
            state: self.phase,
        }
    }
}

/// What the API reports for one workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadState {
    pub spec: WorkloadSpec,
    pub node: Option<String>,
    pub container_id: Option<String>,
    pub state: WorkloadPhase,
}

impl fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Always => write!(f, "always"),
            Self::OnFailure => write!(f, "onFailure"),
            Self::Never => write!(f, "never"),
        }
    }
}

impl FromStr for RestartPolicy {
    type Err = WorkloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "always" => Ok(Self::Always),
            "onFailure" => Ok(Self::OnFailure),
            "never" => Ok(Self::Never),
            other => Err(WorkloadError::InvalidConfig(format!(
                "unknown restart policy: {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("", 512)]
    #[case("256", 256)]
    #[case("256M", 256)]
    #[case("300m", 300)]
    #[case("2G", 2048)]
    #[case("1g", 1024)]
    #[case(" 64MB ", 64)]
    fn test_parse_memory(#[case] input: &str, #[case] mib: u64) {
        assert_eq!(parse_memory(input).unwrap(), mib);
    }

    #[rstest]
    #[case("lots")]
    #[case("12T")]
    #[case("G")]
    fn test_parse_memory_rejects(#[case] input: &str) {
        assert!(parse_memory(input).is_err());
    }

    #[test]
    fn test_config_defaults() {
        let config: WorkloadConfig =
            serde_json::from_str(r#"{"name":"web","image":"nginx"}"#).unwrap();
        let id = WorkloadId::generate();
        let model = config
            .into_model(id, SchedulerPolicy::BinPack, 3)
            .unwrap();

        assert_eq!(model.spec.cpu, 1);
        assert_eq!(model.spec.memory, 512);
        assert_eq!(model.spec.networks, vec!["default".to_string()]);
        assert_eq!(model.scheduler, SchedulerPolicy::BinPack);
        assert_eq!(model.restart_policy, RestartPolicy::Always);
        assert_eq!(model.max_restarts, 3);
        assert_eq!(model.phase, WorkloadPhase::Created);
    }

    #[test]
    fn test_config_full() {
        let config: WorkloadConfig = serde_json::from_str(
            r#"{"name":"db","image":"postgres","cpu":"2","memory":"1G",
                "command":"postgres -D /data","network":["backend"],
                "environment":["A=1"],"scheduler":"leastUsed",
                "filters":{"disk":"ssd"},"restartPolicy":"never","maxRestarts":1,
                "volumes":[{"datastoreType":"HostVolume","datastoreVolumeId":"pg","bindMountPoint":"/data"}]}"#,
        )
        .unwrap();
        let model = config
            .into_model(WorkloadId::generate(), SchedulerPolicy::BinPack, 5)
            .unwrap();

        assert_eq!((model.spec.cpu, model.spec.memory), (2, 1024));
        assert_eq!(model.spec.command, vec!["postgres -D /data".to_string()]);
        assert_eq!(model.spec.networks, vec!["backend".to_string()]);
        assert_eq!(model.scheduler, SchedulerPolicy::LeastUsed);
        assert_eq!(model.filters["disk"], "ssd");
        assert!(!model.restart_policy.restarts_on_failure());
        assert_eq!(model.max_restarts, 1);
    }

    #[test]
    fn test_config_rejects_unknown_datastore() {
        let config = WorkloadConfig {
            image: "nginx".into(),
            volumes: vec![VolumeBind {
                datastore_type: "NFS".into(),
                datastore_volume_id: "x".into(),
                bind_mount_point: "/x".into(),
            }],
            ..Default::default()
        };
        assert!(matches!(
            config.into_model(WorkloadId::generate(), SchedulerPolicy::LeastUsed, 5),
            Err(WorkloadError::InvalidDatastore(_))
        ));
    }

    #[test]
    fn test_config_rejects_unknown_scheduler() {
        let config = WorkloadConfig {
            image: "nginx".into(),
            scheduler: "random".into(),
            ..Default::default()
        };
        assert!(config
            .into_model(WorkloadId::generate(), SchedulerPolicy::LeastUsed, 5)
            .is_err());
    }
}
