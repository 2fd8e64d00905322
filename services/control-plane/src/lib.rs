//! corral control plane library.
//!
//! This crate primarily ships the `corral` binary, but we expose the
//! controllers as a library to enable integration testing.

pub mod actors;
pub mod agent;
pub mod api;
pub mod config;
pub mod nodes;
pub mod persist;
pub mod resources;
pub mod scheduler;
pub mod state;
pub mod volumes;
pub mod workloads;
