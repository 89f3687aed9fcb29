//! Runtime configuration

use std::path::PathBuf;
use std::time::Duration;

use atlas_provider::BundleNaming;

/// Configuration for an [`Atlas`](crate::Atlas) instance.
#[derive(Clone, Debug)]
pub struct AtlasConfig {
    /// Maximum simultaneous low-level fetches; `0` means unbounded
    pub max_concurrent_requests: usize,
    /// Timeout applied to catalog hash and body fetches
    pub catalog_request_timeout: Option<Duration>,
    /// Retry budget for bundle locations that declare none
    pub default_retry_count: u32,
    /// Route local bundle loads through the request queue as well
    pub force_queued_local_loads: bool,
    /// Cache-key naming strategy for bundle versions
    pub bundle_naming: BundleNaming,
    /// Bundle cache directory; `None` disables bundle caching
    pub cache_dir: Option<PathBuf>,
    /// Catalog cache directory; `None` disables catalog caching
    pub catalog_cache_dir: Option<PathBuf>,
}

impl Default for AtlasConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 8,
            catalog_request_timeout: None,
            default_retry_count: 0,
            force_queued_local_loads: false,
            bundle_naming: BundleNaming::default(),
            cache_dir: None,
            catalog_cache_dir: None,
        }
    }
}

impl AtlasConfig {
    /// Config with both caches rooted under one directory.
    pub fn with_cache_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            cache_dir: Some(root.join("bundles")),
            catalog_cache_dir: Some(root.join("catalogs")),
            ..Self::default()
        }
    }
}
