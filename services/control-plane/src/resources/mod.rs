//! Capacity accounting.
//!
//! Resources are a three-level map: resource type (`cpu`, `memory`, ...) →
//! provider (one per node, keyed by the node address) → user (keyed by the
//! consumer, a workload id). [`ResourceLedger`] holds the bookkeeping and
//! enforces its invariants; [`ResourceManager`] serializes every operation
//! on it through one task and persists each provider after it changes.
//!
//! # Invariants
//!
//! - `free == total - used` for every provider
//! - `used == Σ users.used`
//! - for discrete providers the set bits of the bitmap are exactly the union
//!   of the users' indexes
//! - a provider is only removed once it has no users

mod bitmap;
mod ledger;
mod manager;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use corral_store::StoreError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use bitmap::IndexBitmap;
pub use ledger::{AddOutcome, ResourceLedger};
pub use manager::ResourceManager;

/// Resource type consumed by workload cpu requests.
pub const CPU: &str = "cpu";

/// Resource type consumed by workload memory requests (MiB).
pub const MEMORY: &str = "memory";

/// How a provider's capacity is divided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitKind {
    /// An amount only; no unit identity.
    Fluid,
    /// Individually numbered units tracked in a bitmap.
    #[serde(alias = "descrete")]
    Discrete,
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fluid => write!(f, "fluid"),
            Self::Discrete => write!(f, "discrete"),
        }
    }
}

impl FromStr for UnitKind {
    type Err = ResourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fluid" => Ok(Self::Fluid),
            "discrete" | "descrete" => Ok(Self::Discrete),
            other => Err(ResourceError::UnknownUnitKind(other.to_string())),
        }
    }
}

/// Capacity declaration for one provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderDecl {
    pub resource_type: String,
    pub provider: String,
    pub unit_kind: UnitKind,
    pub total: u64,
}

/// Names one provider.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProviderRef {
    pub resource_type: String,
    pub provider: String,
}

impl ProviderRef {
    pub fn new(resource_type: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            provider: provider.into(),
        }
    }
}

/// What one user holds from one provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUser {
    pub used: u64,
    /// Allocated unit indexes; discrete providers only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub indexes: Vec<u64>,
}

/// A provider and its users. This is also the persisted document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provider {
    pub resource_type: String,
    pub provider: String,
    pub unit_kind: UnitKind,
    pub total: u64,
    pub used: u64,
    pub free: u64,
    #[serde(default)]
    pub users: BTreeMap<String, ResourceUser>,
    /// Rebuilt from `users` on restore.
    #[serde(skip)]
    bitmap: IndexBitmap,
}

impl Provider {
    pub fn new(decl: &ProviderDecl) -> Self {
        Self {
            resource_type: decl.resource_type.clone(),
            provider: decl.provider.clone(),
            unit_kind: decl.unit_kind,
            total: decl.total,
            used: 0,
            free: decl.total,
            users: BTreeMap::new(),
            bitmap: match decl.unit_kind {
                UnitKind::Fluid => IndexBitmap::default(),
                UnitKind::Discrete => IndexBitmap::new(decl.total),
            },
        }
    }

    pub fn bitmap(&self) -> &IndexBitmap {
        &self.bitmap
    }

    pub fn has_users(&self) -> bool {
        !self.users.is_empty()
    }
}

/// One line of an alloc or free request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequest {
    pub resource_type: String,
    pub provider: String,
    pub user_key: String,
    /// Ignored by `free`.
    pub amount: u64,
}

impl ResourceRequest {
    pub fn new(
        resource_type: impl Into<String>,
        provider: impl Into<String>,
        user_key: impl Into<String>,
        amount: u64,
    ) -> Self {
        Self {
            resource_type: resource_type.into(),
            provider: provider.into(),
            user_key: user_key.into(),
            amount,
        }
    }
}

/// What a user was granted (or gave back).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Grant {
    pub resource_type: String,
    pub provider: String,
    pub user_key: String,
    pub amount: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub indexes: Vec<u64>,
}

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("unknown resource type: {0}")]
    UnknownResourceType(String),

    #[error("unknown provider {provider} for resource {resource_type}")]
    UnknownProvider {
        resource_type: String,
        provider: String,
    },

    #[error("unknown unit kind: {0}")]
    UnknownUnitKind(String),

    #[error(
        "insufficient {resource_type} on {provider}: requested {requested}, free {free}"
    )]
    Insufficient {
        resource_type: String,
        provider: String,
        requested: u64,
        free: u64,
    },

    #[error("{user_key} holds no {resource_type} on {provider}")]
    NotAllocated {
        resource_type: String,
        provider: String,
        user_key: String,
    },

    #[error("provider {provider} of {resource_type} is already registered as {existing}")]
    DuplicateProvider {
        resource_type: String,
        provider: String,
        existing: UnitKind,
    },

    #[error("cannot shrink {resource_type} on {provider} to {total}: {used} in use")]
    BelowUsage {
        resource_type: String,
        provider: String,
        total: u64,
        used: u64,
    },

    /// Corrupted bookkeeping. The manager stops after reporting one.
    #[error("resource invariant violated: {0}")]
    InvariantViolation(String),

    #[error("resource persistence failed: {0}")]
    Persistence(#[from] StoreError),

    #[error("resource manager is not running")]
    Unavailable,
}

impl ResourceError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvariantViolation(_))
    }
}
