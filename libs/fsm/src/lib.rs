//! Table-driven finite state machines.
//!
//! A machine is a list of [`Transition`] rows plus a current state. Firing
//! an event scans the table for the first row whose `(from, event)` pair
//! matches the current state and the event's kind, asks a [`Callbacks`]
//! implementation to perform the row's action, and moves to the row's target
//! state only if the action succeeded.
//!
//! The table holds plain data (state, event kind, action tag), never
//! closures. Side effects live in the `Callbacks` implementation, so a table
//! can be checked without any I/O and an actor can keep its machine and its
//! side-effect context in separate fields.
//!
//! Events are processed one at a time; serialization is the caller's job
//! (typically an actor mailbox).

use std::fmt::{Debug, Display};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, error, warn};

// =============================================================================
// Core Traits
// =============================================================================

/// An event delivered to a machine.
///
/// The kind is what the transition table matches on; the rest of the event
/// is payload for the action.
pub trait Event: Debug + Send + Sync {
    type Kind: Copy + Eq + Debug + Display + Send + Sync;

    fn kind(&self) -> Self::Kind;
}

/// Performs the action attached to a matched transition.
#[async_trait]
pub trait Callbacks<A, E>: Send
where
    A: Send + 'static,
    E: Event,
{
    type Error: std::error::Error + Send + Sync + 'static;

    async fn perform(&mut self, action: A, event: &E) -> Result<(), Self::Error>;
}

// =============================================================================
// Table
// =============================================================================

/// One row of a transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition<S, K, A> {
    pub from: S,
    pub event: K,
    pub to: S,
    pub action: A,
}

impl<S, K, A> Transition<S, K, A> {
    pub const fn new(from: S, event: K, to: S, action: A) -> Self {
        Self {
            from,
            event,
            to,
            action,
        }
    }
}

/// Result of firing an event that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome<S, K> {
    /// Action succeeded and the machine moved to a new state.
    Transitioned { from: S, to: S },
    /// Action succeeded; the row pointed back at the current state.
    Stayed(S),
    /// No row matched; nothing ran.
    Dropped { state: S, event: K },
}

impl<S: Copy, K> Outcome<S, K> {
    /// True when an action ran (the event was accepted).
    pub fn accepted(&self) -> bool {
        !matches!(self, Self::Dropped { .. })
    }
}

/// Errors from firing an event.
#[derive(Debug, Error)]
pub enum FsmError<S: Debug + Display, K: Debug + Display> {
    /// The action failed; the state was left unchanged.
    #[error("action for event {event} in state {state} failed: {source}")]
    Callback {
        state: S,
        event: K,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

// =============================================================================
// Machine
// =============================================================================

/// A state machine instance.
#[derive(Debug, Clone)]
pub struct Fsm<S, K, A> {
    table: Vec<Transition<S, K, A>>,
    state: S,
}

impl<S, K, A> Fsm<S, K, A>
where
    S: Copy + Eq + Debug + Display + Send + Sync + 'static,
    K: Copy + Eq + Debug + Display + Send + Sync + 'static,
    A: Copy + Debug + Send + Sync + 'static,
{
    /// Build a machine in its initial state.
    pub fn new(table: Vec<Transition<S, K, A>>, initial: S) -> Self {
        Self {
            table,
            state: initial,
        }
    }

    /// Build a machine directly in a previously persisted state.
    pub fn with_state(table: Vec<Transition<S, K, A>>, state: S) -> Self {
        Self::new(table, state)
    }

    pub fn state(&self) -> S {
        self.state
    }

    /// First row matching the current state and `kind`.
    pub fn lookup(&self, kind: K) -> Option<&Transition<S, K, A>> {
        self.table
            .iter()
            .find(|t| t.from == self.state && t.event == kind)
    }

    pub fn can_fire(&self, kind: K) -> bool {
        self.lookup(kind).is_some()
    }

    /// Fire an event.
    ///
    /// Unmatched events are logged and dropped. A failing action leaves the
    /// state untouched and is not retried.
    pub async fn fire<E, H>(
        &mut self,
        event: E,
        handler: &mut H,
    ) -> Result<Outcome<S, K>, FsmError<S, K>>
    where
        E: Event<Kind = K>,
        H: Callbacks<A, E>,
    {
        let kind = event.kind();
        let Some(row) = self.lookup(kind).copied() else {
            warn!(state = %self.state, event = %kind, "No transition for event, dropping");
            return Ok(Outcome::Dropped {
                state: self.state,
                event: kind,
            });
        };

        debug!(state = %self.state, event = %kind, action = ?row.action, "Firing transition");

        if let Err(e) = handler.perform(row.action, &event).await {
            error!(state = %self.state, event = %kind, error = %e, "Transition action failed");
            return Err(FsmError::Callback {
                state: self.state,
                event: kind,
                source: Box::new(e),
            });
        }

        let from = self.state;
        self.state = row.to;
        if from == row.to {
            Ok(Outcome::Stayed(from))
        } else {
            debug!(from = %from, to = %row.to, "State changed");
            Ok(Outcome::Transitioned { from, to: row.to })
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::fmt;

    use rstest::rstest;

    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum State {
        S0,
        S1,
    }

    impl fmt::Display for State {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            fmt::Debug::fmt(self, f)
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Kind {
        Go,
        Stay,
        Other,
    }

    impl fmt::Display for Kind {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            fmt::Debug::fmt(self, f)
        }
    }

    #[derive(Debug)]
    struct Ev(Kind);

    impl Event for Ev {
        type Kind = Kind;

        fn kind(&self) -> Kind {
            self.0
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Action {
        Cb,
        Noop,
        Shadowed,
    }

    #[derive(Debug, Error)]
    #[error("boom")]
    struct Boom;

    #[derive(Default)]
    struct Recorder {
        calls: Vec<Action>,
        fail: bool,
    }

    #[async_trait]
    impl Callbacks<Action, Ev> for Recorder {
        type Error = Boom;

        async fn perform(&mut self, action: Action, _event: &Ev) -> Result<(), Boom> {
            self.calls.push(action);
            if self.fail {
                Err(Boom)
            } else {
                Ok(())
            }
        }
    }

    fn table() -> Vec<Transition<State, Kind, Action>> {
        vec![
            Transition::new(State::S0, Kind::Go, State::S1, Action::Cb),
            Transition::new(State::S0, Kind::Go, State::S0, Action::Shadowed),
            Transition::new(State::S1, Kind::Stay, State::S1, Action::Noop),
        ]
    }

    #[tokio::test]
    async fn test_go_transitions_and_calls_once() {
        let mut fsm = Fsm::new(table(), State::S0);
        let mut rec = Recorder::default();

        let out = fsm.fire(Ev(Kind::Go), &mut rec).await.unwrap();

        assert_eq!(
            out,
            Outcome::Transitioned {
                from: State::S0,
                to: State::S1
            }
        );
        assert_eq!(fsm.state(), State::S1);
        assert_eq!(rec.calls, vec![Action::Cb]);
    }

    #[rstest]
    #[case(State::S0, Kind::Other)]
    #[case(State::S0, Kind::Stay)]
    #[case(State::S1, Kind::Go)]
    #[tokio::test]
    async fn test_unmatched_event_is_dropped(#[case] start: State, #[case] kind: Kind) {
        let mut fsm = Fsm::new(table(), start);
        let mut rec = Recorder::default();

        let out = fsm.fire(Ev(kind), &mut rec).await.unwrap();

        assert_eq!(out, Outcome::Dropped { state: start, event: kind });
        assert!(!out.accepted());
        assert_eq!(fsm.state(), start);
        assert!(rec.calls.is_empty());
    }

    #[tokio::test]
    async fn test_failed_action_keeps_state() {
        let mut fsm = Fsm::new(table(), State::S0);
        let mut rec = Recorder {
            fail: true,
            ..Default::default()
        };

        let err = fsm.fire(Ev(Kind::Go), &mut rec).await.unwrap_err();

        assert!(matches!(
            err,
            FsmError::Callback {
                state: State::S0,
                event: Kind::Go,
                ..
            }
        ));
        assert_eq!(fsm.state(), State::S0);
        // not retried
        assert_eq!(rec.calls, vec![Action::Cb]);
    }

    #[tokio::test]
    async fn test_self_transition_reports_stayed() {
        let mut fsm = Fsm::with_state(table(), State::S1);
        let mut rec = Recorder::default();

        let out = fsm.fire(Ev(Kind::Stay), &mut rec).await.unwrap();

        assert_eq!(out, Outcome::Stayed(State::S1));
        assert_eq!(rec.calls, vec![Action::Noop]);
    }

    #[test]
    fn test_first_matching_row_wins() {
        let fsm = Fsm::new(table(), State::S0);
        assert_eq!(fsm.lookup(Kind::Go).map(|t| t.action), Some(Action::Cb));
        assert!(fsm.can_fire(Kind::Go));
        assert!(!fsm.can_fire(Kind::Stay));
    }
}
