//! Coordination store error types.

use thiserror::Error;

/// Errors returned by [`crate::CoordStore`] implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("key already exists: {0}")]
    KeyExists(String),

    /// Revision did not match in a compare-and-swap or compare-and-delete.
    #[error("compare failed on {key}: expected revision {expected}")]
    CompareFailed { key: String, expected: u64 },

    /// Network or server failure talking to a remote store.
    #[error("store transport error: {0}")]
    Transport(String),

    #[error("failed to decode store response: {0}")]
    Decode(String),

    /// The store has been shut down.
    #[error("store closed")]
    Closed,
}

impl StoreError {
    /// Transport failures are worth retrying; everything else is definitive.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Closed)
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Decode(e.to_string())
        } else {
            Self::Transport(e.to_string())
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}
