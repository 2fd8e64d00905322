//! Volume state machine.

use std::fmt;

use corral_fsm::{Event, Transition};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeState {
    Created,
    Inited,
    Mounted,
    Destroyed,
}

impl fmt::Display for VolumeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Inited => "inited",
            Self::Mounted => "mounted",
            Self::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

/// Volume events. `init` and `mount` name the node the RPC goes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeEvent {
    Init { node: String },
    Mount { node: String },
    Unmount,
    Destroy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VolumeEventKind {
    Init,
    Mount,
    Unmount,
    Destroy,
}

impl fmt::Display for VolumeEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Init => "init",
            Self::Mount => "mount",
            Self::Unmount => "unmount",
            Self::Destroy => "destroy",
        };
        f.write_str(s)
    }
}

impl Event for VolumeEvent {
    type Kind = VolumeEventKind;

    fn kind(&self) -> VolumeEventKind {
        match self {
            Self::Init { .. } => VolumeEventKind::Init,
            Self::Mount { .. } => VolumeEventKind::Mount,
            Self::Unmount => VolumeEventKind::Unmount,
            Self::Destroy => VolumeEventKind::Destroy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeAction {
    Create,
    Mount,
    Unmount,
    Forget,
}

pub fn table() -> Vec<Transition<VolumeState, VolumeEventKind, VolumeAction>> {
    use VolumeAction as A;
    use VolumeEventKind as E;
    use VolumeState as S;

    vec![
        Transition::new(S::Created, E::Init, S::Inited, A::Create),
        Transition::new(S::Inited, E::Mount, S::Mounted, A::Mount),
        Transition::new(S::Mounted, E::Unmount, S::Inited, A::Unmount),
        Transition::new(S::Inited, E::Destroy, S::Destroyed, A::Forget),
    ]
}
