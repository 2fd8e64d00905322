//! Node agent RPC.
//!
//! Every node runs an agent that creates containers, networks and volumes
//! on the control plane's behalf. The agent speaks JSON over plain HTTP:
//! `GET` for queries, `POST` for commands. Any non-200 status or
//! undecodable body is an error.
//!
//! Each call carries a deadline and a cancellation token so a hung agent
//! can never wedge the actor that issued the call.

mod client;
mod types;

use thiserror::Error;

pub use client::{AgentConnector, NodeAgentClient};
pub use types::{
    ContainerCreated, NodeResource, NodeSpec, ReqSuccess, VolumeBind, VolumeSpec, WorkloadSpec,
};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("request to node agent {addr} failed: {source}")]
    Http {
        addr: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("node agent {addr} answered {path} with {status}: {body}")]
    Status {
        addr: String,
        path: String,
        status: u16,
        body: String,
    },

    #[error("undecodable response from {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("node agent {addr} rejected {path}")]
    Rejected { addr: String, path: String },

    #[error("request to {path} on {addr} timed out")]
    Timeout { addr: String, path: String },

    #[error("request cancelled")]
    Cancelled,

    #[error("invalid node address: {0}")]
    InvalidAddress(String),

    #[error("node {0} is not alive")]
    NodeDown(String),
}
