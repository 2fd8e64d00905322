//! Node liveness state machine.

use std::fmt;

use corral_fsm::{Event, Transition};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Created,
    Alive,
    Unreachable,
    Down,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Alive => "alive",
            Self::Unreachable => "unreachable",
            Self::Down => "down",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeEvent {
    /// The node announced itself or answered a health check.
    Up,
    /// The node's registration disappeared.
    Down,
    /// Periodic tick.
    Ticker,
    /// A reconciliation call went unanswered.
    Timeout,
}

impl fmt::Display for NodeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Up => "up",
            Self::Down => "down",
            Self::Ticker => "ticker",
            Self::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

impl Event for NodeEvent {
    type Kind = NodeEvent;

    fn kind(&self) -> NodeEvent {
        *self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeAction {
    /// Fetch the node spec, declare its providers, exchange peers.
    Register,
    Noop,
    /// Diff the node's workloads against expectations.
    Reconcile,
    MarkUnreachable,
    /// Ask an unreachable node for its spec; `up` follows on success.
    Recheck,
    /// Fail the node's workloads and drop idle providers.
    NodeDown,
}

pub fn table() -> Vec<Transition<NodeState, NodeEvent, NodeAction>> {
    use NodeAction::*;
    use NodeEvent::*;
    use NodeState::*;

    vec![
        Transition::new(Created, Up, Alive, Register),
        Transition::new(Created, Ticker, Created, Noop),
        Transition::new(Created, NodeEvent::Down, NodeState::Down, Noop),
        Transition::new(Alive, Up, Alive, Register),
        Transition::new(Alive, Ticker, Alive, Reconcile),
        Transition::new(Alive, Timeout, Unreachable, MarkUnreachable),
        Transition::new(Alive, NodeEvent::Down, NodeState::Down, NodeDown),
        Transition::new(Unreachable, Ticker, Unreachable, Recheck),
        Transition::new(Unreachable, Up, Alive, Register),
        Transition::new(Unreachable, NodeEvent::Down, NodeState::Down, NodeDown),
        Transition::new(NodeState::Down, Up, Alive, Register),
        Transition::new(NodeState::Down, Ticker, NodeState::Down, Noop),
    ]
}

#[cfg(test)]
mod tests {
    use corral_fsm::Fsm;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(NodeState::Created, NodeEvent::Up, Some(NodeState::Alive))]
    #[case(NodeState::Created, NodeEvent::Timeout, None)]
    #[case(NodeState::Alive, NodeEvent::Ticker, Some(NodeState::Alive))]
    #[case(NodeState::Alive, NodeEvent::Timeout, Some(NodeState::Unreachable))]
    #[case(NodeState::Unreachable, NodeEvent::Up, Some(NodeState::Alive))]
    #[case(NodeState::Unreachable, NodeEvent::Down, Some(NodeState::Down))]
    #[case(NodeState::Down, NodeEvent::Up, Some(NodeState::Alive))]
    #[case(NodeState::Down, NodeEvent::Timeout, None)]
    fn test_table(
        #[case] from: NodeState,
        #[case] event: NodeEvent,
        #[case] to: Option<NodeState>,
    ) {
        let fsm = Fsm::with_state(table(), from);
        assert_eq!(fsm.lookup(event).map(|t| t.to), to);
    }

    #[test]
    fn test_every_state_handles_ticker() {
        for state in [
            NodeState::Created,
            NodeState::Alive,
            NodeState::Unreachable,
            NodeState::Down,
        ] {
            assert!(Fsm::with_state(table(), state).can_fire(NodeEvent::Ticker));
        }
    }
}
