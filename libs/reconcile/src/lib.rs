//! Node reconciliation primitives.
//!
//! The control plane keeps an *expected* view of which workloads live on a
//! node; the node agent reports what it *observes*. This crate compares the
//! two and classifies every discrepancy so callers can decide how to repair
//! it. Everything here is pure: no I/O, no clocks except inside
//! [`RetryTracker`].
//!
//! # Invariants
//!
//! - Diffing is deterministic given the same inputs
//! - Each expected workload yields at most one [`Finding`]
//! - Workloads with no container assigned yet are never reported

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reconciliation errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    /// Mismatch policy name not recognised.
    #[error("unknown mismatch policy: {0}")]
    UnknownPolicy(String),
}

/// A workload the control plane believes is placed on a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedWorkload {
    pub workload_id: String,
    /// Empty until the container has been created on the node.
    pub container_id: String,
}

/// One entry of a node agent's `GET /alta` listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportedWorkload {
    /// Empty when the agent has a container it can't attribute to a workload.
    #[serde(default, alias = "altaId")]
    pub workload_id: String,
    pub container_id: String,
}

/// A single discrepancy between expected and observed state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finding {
    /// The node runs the container but lost track of which workload it is.
    MissingBookkeeping {
        workload_id: String,
        container_id: String,
    },

    /// The node knows the workload but runs it under a different container.
    ContainerMismatch {
        workload_id: String,
        expected: String,
        reported: Vec<String>,
    },

    /// The node has neither the workload nor its container.
    Crashed {
        workload_id: String,
        container_id: String,
    },

    /// A container the control plane does not expect on this node.
    Unexpected { container_id: String },
}

impl Finding {
    /// Workload the finding concerns, if any.
    pub fn workload_id(&self) -> Option<&str> {
        match self {
            Self::MissingBookkeeping { workload_id, .. }
            | Self::ContainerMismatch { workload_id, .. }
            | Self::Crashed { workload_id, .. } => Some(workload_id),
            Self::Unexpected { .. } => None,
        }
    }
}

/// Compare expected workloads against a node's report.
///
/// Findings for expected workloads come first, in input order, followed by
/// unexpected containers sorted by id.
pub fn diff_node(expected: &[ExpectedWorkload], reported: &[ReportedWorkload]) -> Vec<Finding> {
    let mut by_workload: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    let mut containers: BTreeSet<&str> = BTreeSet::new();
    for entry in reported {
        containers.insert(entry.container_id.as_str());
        if !entry.workload_id.is_empty() {
            by_workload
                .entry(entry.workload_id.as_str())
                .or_default()
                .push(entry.container_id.as_str());
        }
    }

    let mut findings = Vec::new();
    let mut accounted: BTreeSet<&str> = BTreeSet::new();

    for workload in expected {
        if workload.container_id.is_empty() {
            continue;
        }
        accounted.insert(workload.container_id.as_str());

        let has_container = containers.contains(workload.container_id.as_str());
        match by_workload.get(workload.workload_id.as_str()) {
            None if has_container => findings.push(Finding::MissingBookkeeping {
                workload_id: workload.workload_id.clone(),
                container_id: workload.container_id.clone(),
            }),
            None => findings.push(Finding::Crashed {
                workload_id: workload.workload_id.clone(),
                container_id: workload.container_id.clone(),
            }),
            Some(cids) if !cids.contains(&workload.container_id.as_str()) => {
                accounted.extend(cids.iter().copied());
                findings.push(Finding::ContainerMismatch {
                    workload_id: workload.workload_id.clone(),
                    expected: workload.container_id.clone(),
                    reported: cids.iter().map(|c| c.to_string()).collect(),
                });
            }
            Some(_) => {}
        }
    }

    for container_id in containers {
        if !accounted.contains(container_id) {
            findings.push(Finding::Unexpected {
                container_id: container_id.to_string(),
            });
        }
    }

    findings
}

/// What to do about a [`Finding::ContainerMismatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MismatchPolicy {
    /// Log and leave the workload alone.
    #[default]
    Log,
    /// Treat the workload as failed so its restart path runs.
    Fail,
}

impl FromStr for MismatchPolicy {
    type Err = ReconcileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "log" => Ok(Self::Log),
            "fail" => Ok(Self::Fail),
            other => Err(ReconcileError::UnknownPolicy(other.to_string())),
        }
    }
}

/// Corrective step derived from a finding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Repair {
    /// Push the workload's spec to the node under this container id.
    PushSpec {
        workload_id: String,
        container_id: String,
    },
    /// Inject a failure event into the workload's actor.
    Fail { workload_id: String },
    /// Nothing to do beyond logging.
    Ignore,
}

/// Map a finding onto the repair the policy asks for.
pub fn plan_repair(finding: &Finding, policy: MismatchPolicy) -> Repair {
    match finding {
        Finding::MissingBookkeeping {
            workload_id,
            container_id,
        } => Repair::PushSpec {
            workload_id: workload_id.clone(),
            container_id: container_id.clone(),
        },
        Finding::Crashed { workload_id, .. } => Repair::Fail {
            workload_id: workload_id.clone(),
        },
        Finding::ContainerMismatch { workload_id, .. } => match policy {
            MismatchPolicy::Log => Repair::Ignore,
            MismatchPolicy::Fail => Repair::Fail {
                workload_id: workload_id.clone(),
            },
        },
        Finding::Unexpected { .. } => Repair::Ignore,
    }
}

/// Restart budget tracker.
///
/// Counts failures per key inside a sliding window.
#[derive(Debug, Clone)]
pub struct RetryTracker {
    /// Maximum retries per key; zero means unlimited.
    max_retries: u32,

    /// Retry window duration.
    window: Duration,

    /// Tracked failures: key -> (count, first_failure_time).
    failures: BTreeMap<String, (u32, Instant)>,
}

impl RetryTracker {
    pub fn new(max_retries: u32, window: Duration) -> Self {
        Self {
            max_retries,
            window,
            failures: BTreeMap::new(),
        }
    }

    /// Record a failure for a key.
    ///
    /// Returns true if retries are exhausted.
    pub fn record_failure(&mut self, key: &str) -> bool {
        let now = Instant::now();

        let (count, first) = self.failures.entry(key.to_string()).or_insert((0, now));

        if now.duration_since(*first) > self.window {
            *count = 0;
            *first = now;
        }

        *count += 1;
        self.max_retries != 0 && *count > self.max_retries
    }

    /// Check if retries are exhausted for a key.
    pub fn is_exhausted(&self, key: &str) -> bool {
        let Some((count, first)) = self.failures.get(key) else {
            return false;
        };

        if Instant::now().duration_since(*first) > self.window {
            return false;
        }

        self.max_retries != 0 && *count > self.max_retries
    }

    /// Failures recorded for a key in the current window.
    pub fn count(&self, key: &str) -> u32 {
        self.failures.get(key).map(|(c, _)| *c).unwrap_or(0)
    }

    /// Clear failure tracking for a key (on success).
    pub fn clear(&mut self, key: &str) {
        self.failures.remove(key);
    }
}

/// Default node ticker interval.
pub const DEFAULT_NODE_TICK: Duration = Duration::from_secs(5);

/// Default period for retrying placement of unscheduled workloads.
pub const DEFAULT_SCHEDULE_RETRY: Duration = Duration::from_secs(15);

/// Default restart limit per workload inside [`DEFAULT_RESTART_WINDOW`].
pub const DEFAULT_MAX_RESTARTS: u32 = 5;

/// Default restart window.
pub const DEFAULT_RESTART_WINDOW: Duration = Duration::from_secs(10 * 60);

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn expected(id: &str, cid: &str) -> ExpectedWorkload {
        ExpectedWorkload {
            workload_id: id.to_string(),
            container_id: cid.to_string(),
        }
    }

    fn reported(id: &str, cid: &str) -> ReportedWorkload {
        ReportedWorkload {
            workload_id: id.to_string(),
            container_id: cid.to_string(),
        }
    }

    #[test]
    fn test_missing_workload_and_container_is_one_crash() {
        let findings = diff_node(&[expected("w1", "abc")], &[reported("w2", "zzz")]);

        let crashes: Vec<_> = findings
            .iter()
            .filter(|f| matches!(f, Finding::Crashed { .. }))
            .collect();
        assert_eq!(crashes.len(), 1);
        assert_eq!(crashes[0].workload_id(), Some("w1"));

        let fails: Vec<_> = findings
            .iter()
            .map(|f| plan_repair(f, MismatchPolicy::Log))
            .filter(|r| matches!(r, Repair::Fail { .. }))
            .collect();
        assert_eq!(
            fails,
            vec![Repair::Fail {
                workload_id: "w1".to_string()
            }]
        );
    }

    #[test]
    fn test_container_without_bookkeeping_pushes_spec() {
        let findings = diff_node(&[expected("w1", "abc")], &[reported("", "abc")]);
        assert_eq!(
            findings,
            vec![Finding::MissingBookkeeping {
                workload_id: "w1".to_string(),
                container_id: "abc".to_string(),
            }]
        );
        assert_eq!(
            plan_repair(&findings[0], MismatchPolicy::Log),
            Repair::PushSpec {
                workload_id: "w1".to_string(),
                container_id: "abc".to_string(),
            }
        );
    }

    #[rstest]
    #[case(MismatchPolicy::Log, Repair::Ignore)]
    #[case(MismatchPolicy::Fail, Repair::Fail { workload_id: "w1".to_string() })]
    fn test_container_mismatch_follows_policy(
        #[case] policy: MismatchPolicy,
        #[case] repair: Repair,
    ) {
        let findings = diff_node(&[expected("w1", "abc")], &[reported("w1", "def")]);
        assert_eq!(findings.len(), 1);
        assert!(matches!(findings[0], Finding::ContainerMismatch { .. }));
        assert_eq!(plan_repair(&findings[0], policy), repair);
    }

    #[test]
    fn test_healthy_node_has_no_findings() {
        let findings = diff_node(
            &[expected("w1", "abc"), expected("w2", "")],
            &[reported("w1", "abc")],
        );
        assert!(findings.is_empty());
    }

    #[test]
    fn test_unexpected_containers_are_reported() {
        let findings = diff_node(&[], &[reported("", "b"), reported("w9", "a")]);
        assert_eq!(
            findings,
            vec![
                Finding::Unexpected {
                    container_id: "a".to_string()
                },
                Finding::Unexpected {
                    container_id: "b".to_string()
                },
            ]
        );
    }

    #[rstest]
    #[case("log", MismatchPolicy::Log)]
    #[case("FAIL", MismatchPolicy::Fail)]
    fn test_policy_parse(#[case] raw: &str, #[case] policy: MismatchPolicy) {
        assert_eq!(raw.parse::<MismatchPolicy>().unwrap(), policy);
    }

    #[test]
    fn test_policy_parse_rejects_unknown() {
        assert!("repair".parse::<MismatchPolicy>().is_err());
    }

    #[test]
    fn test_retry_tracker() {
        let mut tracker = RetryTracker::new(3, Duration::from_secs(60));

        assert!(!tracker.record_failure("w1"));
        assert!(!tracker.record_failure("w1"));
        assert!(!tracker.record_failure("w1"));
        assert!(tracker.record_failure("w1"));

        assert!(tracker.is_exhausted("w1"));
        assert!(!tracker.is_exhausted("w2"));
        assert_eq!(tracker.count("w1"), 4);

        tracker.clear("w1");
        assert!(!tracker.is_exhausted("w1"));
    }

    #[test]
    fn test_retry_tracker_unlimited() {
        let mut tracker = RetryTracker::new(0, Duration::from_secs(60));
        for _ in 0..100 {
            assert!(!tracker.record_failure("w1"));
        }
    }
}
