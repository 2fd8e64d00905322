//! Workload lifecycle state machine.
//!
//! The happy path walks one step per agent RPC:
//!
//! ```text
//! created -schedule-> scheduled -createNet-> waitNet -createVol-> waitVol
//!   -pullImg-> waitImg -imgReady-> starting -start-> running
//! ```
//!
//! Each action queues the next event on success, so a failed step leaves
//! the workload parked in its current phase.

use std::fmt;
use std::str::FromStr;

use corral_fsm::{Event, Transition};
use serde::{Deserialize, Serialize};

use super::WorkloadError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WorkloadPhase {
    Created,
    Scheduled,
    WaitNet,
    WaitVol,
    WaitImg,
    Starting,
    Running,
    Stopped,
    Failed,
    Rescheduling,
}

impl WorkloadPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Scheduled => "scheduled",
            Self::WaitNet => "waitNet",
            Self::WaitVol => "waitVol",
            Self::WaitImg => "waitImg",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
            Self::Rescheduling => "rescheduling",
        }
    }

    /// Still waiting for a placement.
    pub fn is_unplaced(self) -> bool {
        matches!(self, Self::Created | Self::Rescheduling)
    }
}

impl fmt::Display for WorkloadPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkloadEvent {
    Schedule,
    CreateNet,
    CreateVol,
    PullImg,
    ImgReady,
    Start,
    Stop,
    Failure,
    Restart,
    NodeFailure,
}

impl WorkloadEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Schedule => "schedule",
            Self::CreateNet => "createNet",
            Self::CreateVol => "createVol",
            Self::PullImg => "pullImg",
            Self::ImgReady => "imgReady",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Failure => "failure",
            Self::Restart => "restart",
            Self::NodeFailure => "nodeFailure",
        }
    }
}

impl fmt::Display for WorkloadEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkloadEvent {
    type Err = WorkloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            Self::Schedule,
            Self::CreateNet,
            Self::CreateVol,
            Self::PullImg,
            Self::ImgReady,
            Self::Start,
            Self::Stop,
            Self::Failure,
            Self::Restart,
            Self::NodeFailure,
        ]
        .into_iter()
        .find(|e| e.as_str() == s)
        .ok_or_else(|| WorkloadError::UnsupportedEvent(s.to_string()))
    }
}

impl Event for WorkloadEvent {
    type Kind = WorkloadEvent;

    fn kind(&self) -> WorkloadEvent {
        *self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadAction {
    Schedule,
    CreateNetwork,
    MountVolumes,
    PullImage,
    CreateContainer,
    Start,
    Stop,
    HandleFailure,
    Restart,
    Reschedule,
    Absorb,
}

pub fn table() -> Vec<Transition<WorkloadPhase, WorkloadEvent, WorkloadAction>> {
    use WorkloadAction as A;
    use WorkloadEvent as E;
    use WorkloadPhase as P;

    let mut rows = vec![
        Transition::new(P::Created, E::Schedule, P::Scheduled, A::Schedule),
        Transition::new(P::Scheduled, E::CreateNet, P::WaitNet, A::CreateNetwork),
        Transition::new(P::WaitNet, E::CreateVol, P::WaitVol, A::MountVolumes),
        Transition::new(P::WaitVol, E::PullImg, P::WaitImg, A::PullImage),
        Transition::new(P::WaitImg, E::ImgReady, P::Starting, A::CreateContainer),
        Transition::new(P::Starting, E::Start, P::Running, A::Start),
        Transition::new(P::Running, E::Stop, P::Stopped, A::Stop),
        Transition::new(P::Running, E::Failure, P::Failed, A::HandleFailure),
        Transition::new(P::Stopped, E::Start, P::Running, A::Start),
        Transition::new(P::Failed, E::Restart, P::Running, A::Restart),
        Transition::new(P::Failed, E::Failure, P::Failed, A::Absorb),
        Transition::new(P::Rescheduling, E::Schedule, P::Scheduled, A::Schedule),
    ];

    // Losing the node sends every placed workload back to the scheduler.
    for phase in [
        P::Scheduled,
        P::WaitNet,
        P::WaitVol,
        P::WaitImg,
        P::Starting,
        P::Running,
        P::Failed,
    ] {
        rows.push(Transition::new(
            phase,
            E::NodeFailure,
            P::Rescheduling,
            A::Reschedule,
        ));
    }
    rows
}
