//! Placement policies.
//!
//! Policies are pure: they look at a snapshot of free capacity and return a
//! node id. Reservation happens afterwards in [`super::Scheduler`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::ScheduleError;

/// Which placement policy a workload uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SchedulerPolicy {
    /// Spread: the node with the most free cpu, then the most free memory.
    /// Memory only decides between nodes tied on cpu.
    #[default]
    LeastUsed,
    /// Pack: the first node, in address order, that fits.
    BinPack,
}

impl fmt::Display for SchedulerPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LeastUsed => write!(f, "leastUsed"),
            Self::BinPack => write!(f, "binPack"),
        }
    }
}

impl FromStr for SchedulerPolicy {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "default" | "leastUsed" => Ok(Self::LeastUsed),
            "binPack" => Ok(Self::BinPack),
            other => Err(ScheduleError::UnknownPolicy(other.to_string())),
        }
    }
}

/// Free capacity of one eligible node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate<'a> {
    pub node: &'a str,
    pub free_cpu: u64,
    pub free_memory: u64,
}

impl Candidate<'_> {
    fn fits(&self, cpu: u64, memory: u64) -> bool {
        self.free_cpu >= cpu && self.free_memory >= memory
    }
}

impl SchedulerPolicy {
    pub fn pick<'a>(self, candidates: &[Candidate<'a>], cpu: u64, memory: u64) -> Option<&'a str> {
        match self {
            Self::LeastUsed => least_used(candidates, cpu, memory),
            Self::BinPack => bin_pack(candidates, cpu, memory),
        }
    }
}

/// Most free cpu, then most free memory among the nodes at that cpu level.
///
/// Memory only breaks the cpu tie: if none of the nodes with the most free
/// cpu has room for the memory, nothing is picked. Remaining ties go to the
/// lexicographically smallest node id.
pub fn least_used<'a>(candidates: &[Candidate<'a>], cpu: u64, memory: u64) -> Option<&'a str> {
    let top_cpu = candidates
        .iter()
        .filter(|c| c.free_cpu >= cpu)
        .map(|c| c.free_cpu)
        .max()?;
    candidates
        .iter()
        .filter(|c| c.free_cpu == top_cpu && c.free_memory >= memory)
        .max_by(|a, b| a.free_memory.cmp(&b.free_memory).then(b.node.cmp(a.node)))
        .map(|c| c.node)
}

/// Smallest node id with room for the request.
pub fn bin_pack<'a>(candidates: &[Candidate<'a>], cpu: u64, memory: u64) -> Option<&'a str> {
    candidates
        .iter()
        .filter(|c| c.fits(cpu, memory))
        .min_by(|a, b| a.node.cmp(b.node))
        .map(|c| c.node)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn candidates() -> Vec<Candidate<'static>> {
        vec![
            Candidate {
                node: "10.0.0.3:8000",
                free_cpu: 8,
                free_memory: 1024,
            },
            Candidate {
                node: "10.0.0.1:8000",
                free_cpu: 2,
                free_memory: 8192,
            },
            Candidate {
                node: "10.0.0.2:8000",
                free_cpu: 8,
                free_memory: 4096,
            },
        ]
    }

    #[rstest]
    #[case(1, 512, Some("10.0.0.2:8000"))]
    #[case(1, 2048, Some("10.0.0.2:8000"))]
    #[case(1, 5000, None)]
    #[case(9, 1, None)]
    fn test_least_used(#[case] cpu: u64, #[case] memory: u64, #[case] expected: Option<&str>) {
        assert_eq!(least_used(&candidates(), cpu, memory), expected);
    }

    #[rstest]
    #[case(1, 512, Some("10.0.0.1:8000"))]
    #[case(4, 512, Some("10.0.0.2:8000"))]
    #[case(4, 2048, Some("10.0.0.2:8000"))]
    #[case(3, 8192, None)]
    fn test_bin_pack(#[case] cpu: u64, #[case] memory: u64, #[case] expected: Option<&str>) {
        assert_eq!(bin_pack(&candidates(), cpu, memory), expected);
    }

    #[test]
    fn test_least_used_ties_pick_smallest_id() {
        let tied = vec![
            Candidate {
                node: "b",
                free_cpu: 4,
                free_memory: 100,
            },
            Candidate {
                node: "a",
                free_cpu: 4,
                free_memory: 100,
            },
        ];
        assert_eq!(least_used(&tied, 1, 1), Some("a"));
    }

    #[rstest]
    #[case("", SchedulerPolicy::LeastUsed)]
    #[case("default", SchedulerPolicy::LeastUsed)]
    #[case("leastUsed", SchedulerPolicy::LeastUsed)]
    #[case("binPack", SchedulerPolicy::BinPack)]
    fn test_policy_names(#[case] name: &str, #[case] expected: SchedulerPolicy) {
        assert_eq!(name.parse::<SchedulerPolicy>().unwrap(), expected);
    }

    #[test]
    fn test_unknown_policy() {
        assert!(matches!(
            "roundRobin".parse::<SchedulerPolicy>(),
            Err(ScheduleError::UnknownPolicy(_))
        ));
    }
}
