//! Actor framework for the control plane.
//!
//! Every long-lived entity (node, workload, volume) and every controller is
//! an actor: it owns its state, processes one message at a time from a
//! bounded mailbox, and talks to other actors only through messages.
//! Request/reply is a message carrying a `oneshot` sender.
//!
//! ## Deadlock discipline
//!
//! Controllers only ever `try_send` to the actors they own; entity actors
//! may `call` their controller and wait for the reply. A controller never
//! waits on one of its children, so a cycle of blocked mailboxes can't form.

mod framework;

pub use framework::{
    mailbox, Actor, ActorContext, ActorError, ActorHandle, Mailbox, Message, Supervisor,
};
