//! Resource keys and merge modes
//!
//! Keys are the symbolic names callers use to request content: a primary
//! address, a shared label, or a stable GUID. Keys are compared
//! structurally, never by identity.

use core::fmt;

use serde::{Deserialize, Serialize};

/// A symbolic key identifying one or more resources.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceKey {
    /// Primary string address assigned to a single resource
    Address(String),
    /// Secondary key; one resource may carry many labels
    Label(String),
    /// Stable GUID string
    Guid(String),
}

impl ResourceKey {
    /// Create an address key
    pub fn address(s: impl Into<String>) -> Self {
        Self::Address(s.into())
    }

    /// Create a label key
    pub fn label(s: impl Into<String>) -> Self {
        Self::Label(s.into())
    }

    /// Create a GUID key
    pub fn guid(s: impl Into<String>) -> Self {
        Self::Guid(s.into())
    }

    /// The underlying string value
    pub fn as_str(&self) -> &str {
        match self {
            Self::Address(s) | Self::Label(s) | Self::Guid(s) => s,
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Address(s) => write!(f, "{}", s),
            Self::Label(s) => write!(f, "label:{}", s),
            Self::Guid(s) => write!(f, "guid:{}", s),
        }
    }
}

impl From<&str> for ResourceKey {
    fn from(s: &str) -> Self {
        Self::Address(s.to_string())
    }
}

impl From<String> for ResourceKey {
    fn from(s: String) -> Self {
        Self::Address(s)
    }
}

/// Policy for combining resolution results across multiple keys.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeMode {
    /// Use the first key that resolves to a non-empty, type-compatible set
    UseFirst,
    /// Union of all type-compatible result sets
    Union,
    /// Only locations present in every key's result set
    Intersection,
}
