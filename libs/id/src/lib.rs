//! # corral-id
//!
//! Typed identifiers for corral resources.
//!
//! ## ID Format
//!
//! Generated IDs are a fixed number of random bytes rendered as lowercase
//! hex, e.g. `3f9a0c1be47d2856` for a [`WorkloadId`]. Parsing is strict:
//! wrong length, uppercase digits or non-hex characters are rejected.
//!
//! Random IDs can collide. Callers that need uniqueness against a live
//! table use [`WorkloadId::generate_unique`].

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;
