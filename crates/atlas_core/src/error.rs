//! Error taxonomy
//!
//! Errors are never thrown out of an async entry point: they are captured
//! on the owning handle (`Failed` status) and routed through the manager's
//! injected exception hook. Synchronous waits surface the same captured
//! error through the handle.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::key::MergeMode;
use crate::location::{ProviderId, ResourceType};

/// Top-level error carried by failed operations.
#[derive(Debug, Error)]
pub enum AtlasError {
    #[error(transparent)]
    InvalidKey(#[from] InvalidKeyError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Operation(#[from] OperationError),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Key resolution failed.
///
/// The message is composed from the merge-mode algebra: which keys had no
/// location, which resolved to an incompatible type, and which partial
/// results exist under a different type. Multi-key composition order is
/// content, not a stable string contract.
#[derive(Debug, Error)]
pub enum InvalidKeyError {
    #[error("no location found for key '{key}'{}", format_requested(.requested))]
    NoLocation {
        key: String,
        requested: Option<ResourceType>,
    },

    #[error("key '{key}' resolved to type {found:?}, which is not assignable to requested type {requested:?}")]
    TypeMismatch {
        key: String,
        requested: ResourceType,
        found: ResourceType,
    },

    #[error("{key_count} keys were supplied without a merge mode; choose UseFirst, Union, or Intersection")]
    MissingMergeMode { key_count: usize },

    #[error("unable to merge results for {mode:?}{}: {}", format_requested(.requested), .details.join("; "))]
    Merge {
        mode: MergeMode,
        requested: Option<ResourceType>,
        details: Vec<String>,
    },
}

fn format_requested(requested: &Option<ResourceType>) -> String {
    match requested {
        Some(t) => format!(" (requested type {:?})", t),
        None => String::new(),
    }
}

/// Transport-level fetch failure reported by the host's I/O layer.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("read error: {0}")]
    Read(String),
}

impl FetchError {
    /// Connection-level failures may succeed on retry; missing or
    /// unreadable content will not.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout(_))
    }
}

/// A provider failed to turn a location into an artifact.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("fetch failed for '{path}': {source}")]
    Fetch { path: String, source: FetchError },

    #[error("fetch failed for '{path}' after {attempts} attempts: {source}")]
    RetriesExhausted {
        path: String,
        attempts: u32,
        source: FetchError,
    },

    #[error("retry count {retry_count} set for '{path}' but cannot retry due to error: {source}")]
    RetryBlocked {
        path: String,
        retry_count: u32,
        source: FetchError,
    },

    #[error("cached bundle '{bundle}' failed to load: {reason}; cache entry removed")]
    CorruptCachedBundle { bundle: String, reason: String },

    #[error("no provider registered for {0:?}")]
    UnknownProvider(ProviderId),

    #[error("location '{0}' carries no bundle metadata")]
    MissingBundleData(String),

    #[error("provider {provider:?} is missing a required {expected:?} dependency for '{key}'")]
    BadDependency {
        provider: ProviderId,
        key: String,
        expected: ResourceType,
    },

    #[error("catalog '{path}' failed to parse: {reason}")]
    CatalogParse { path: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failure in the operation graph itself.
#[derive(Debug, Error)]
pub enum OperationError {
    #[error("dependency '{member}' of group operation failed: {source}")]
    GroupMemberFailed {
        member: String,
        source: Arc<AtlasError>,
    },

    #[error("handle is invalid: operation is no longer registered")]
    InvalidHandle,

    #[error("release called on an invalid handle to '{0}'")]
    InvalidRelease(String),

    #[error("reference count underflow on '{0}'")]
    RefCountUnderflow(String),

    #[error("scene activation is pending; completion requires a host-driven step")]
    ActivationPending,
}

/// Cache-maintenance failure. These are rejected up front and never leave
/// the cache partially modified.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("bundle caching is disabled in this configuration")]
    CachingDisabled,

    #[error("catalog '{0}' is not file-backed and cannot be used for cache maintenance")]
    CatalogNotFileBacked(String),

    #[error("catalog '{0}' is not registered")]
    UnknownCatalog(String),

    #[error("a bundle cache clean is already in progress")]
    CleanAlreadyRunning,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_error_recoverability() {
        assert!(FetchError::Connection("reset".into()).is_recoverable());
        assert!(FetchError::Timeout(Duration::from_secs(5)).is_recoverable());
        assert!(!FetchError::NotFound("x".into()).is_recoverable());
        assert!(!FetchError::Read("bad".into()).is_recoverable());
    }

    #[test]
    fn test_merge_diagnostic_contains_all_details() {
        let err = InvalidKeyError::Merge {
            mode: MergeMode::Union,
            requested: Some(ResourceType::Text),
            details: vec![
                "key 'k' resolved to incompatible type Prefab".to_string(),
                "key 'k2' resolved".to_string(),
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("Union"));
        assert!(msg.contains("key 'k' resolved to incompatible type Prefab"));
        assert!(msg.contains("key 'k2' resolved"));
    }

    #[test]
    fn test_retry_blocked_message() {
        let err = ProviderError::RetryBlocked {
            path: "remote/bundle_x".into(),
            retry_count: 3,
            source: FetchError::NotFound("remote/bundle_x".into()),
        };
        let msg = err.to_string();
        assert!(msg.contains("retry count 3 set"));
        assert!(msg.contains("cannot retry"));
    }
}
