//! Resource locations
//!
//! A `ResourceLocation` is the resolved form of a key: where the content
//! lives, which provider loads it, and which other locations must be
//! loaded first. Locations are immutable once produced by a locator;
//! dependency graphs are finite and acyclic.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Closed set of resource kinds the runtime can produce.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceType {
    /// Raw bytes
    Binary,
    /// UTF-8 text
    Text,
    /// A downloadable, cacheable bundle of resources
    Bundle,
    /// A content catalog
    Catalog,
    /// An instantiable object template
    Prefab,
    /// A loadable scene reference
    SceneRef,
}

impl ResourceType {
    /// Whether a location of this type satisfies a request for `requested`.
    ///
    /// `None` means the caller did not constrain the type.
    pub fn is_assignable_to(self, requested: Option<ResourceType>) -> bool {
        match requested {
            None => true,
            Some(t) => self == t,
        }
    }
}

/// Identifier of the provider that loads a location.
///
/// Providers are a closed set resolved into a typed table at registration
/// time; host-supplied providers register under one of these ids.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderId {
    /// Raw byte fetch
    Binary,
    /// UTF-8 text fetch
    Text,
    /// Bundle download (retry + disk cache)
    Bundle,
    /// Content catalog load (hash-cached)
    Catalog,
    /// Asset served out of a loaded bundle
    BundledAsset,
    /// Scene body load
    Scene,
}

/// Provider-specific options carried by a location.
///
/// For bundle locations this is the download metadata consulted by the
/// retry policy, the request queue, and download-size accounting.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LocationData {
    /// Bundle name; the unit tracked by the on-disk cache
    pub bundle_name: String,
    /// Content hash; a location without a hash can never be proven cached
    pub hash: Option<String>,
    /// Declared download size in bytes
    pub size: u64,
    /// Retry budget for recoverable download errors
    pub retry_count: u32,
    /// Route this fetch through the bounded request queue even when local
    pub use_request_queue: bool,
}

impl LocationData {
    /// Bundle metadata with a verifiable hash
    pub fn bundle(name: impl Into<String>, hash: impl Into<String>, size: u64) -> Self {
        Self {
            bundle_name: name.into(),
            hash: Some(hash.into()),
            size,
            retry_count: 0,
            use_request_queue: true,
        }
    }

    /// Set the retry budget
    pub fn with_retries(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }
}

/// Identity triple used for merge-mode set algebra and batch dedupe.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LocationIdentity {
    pub primary_key: String,
    pub internal_id: String,
    pub resource_type: ResourceType,
}

/// A resolved storage location for one resource.
#[derive(Debug)]
pub struct ResourceLocation {
    /// The address this location was published under
    pub primary_key: String,
    /// Concrete storage path or transport id
    pub internal_id: String,
    /// Provider that turns this location into an artifact
    pub provider: ProviderId,
    /// Type of the produced artifact
    pub resource_type: ResourceType,
    /// Provider-specific options
    pub data: Option<LocationData>,
    /// Locations that must be provided before this one
    pub dependencies: Vec<Arc<ResourceLocation>>,
}

impl ResourceLocation {
    /// A leaf location with no dependencies.
    pub fn new(
        primary_key: impl Into<String>,
        internal_id: impl Into<String>,
        provider: ProviderId,
        resource_type: ResourceType,
    ) -> Self {
        Self {
            primary_key: primary_key.into(),
            internal_id: internal_id.into(),
            provider,
            resource_type,
            data: None,
            dependencies: Vec::new(),
        }
    }

    /// Attach provider options
    pub fn with_data(mut self, data: LocationData) -> Self {
        self.data = Some(data);
        self
    }

    /// Attach dependency locations
    pub fn with_dependencies(mut self, deps: Vec<Arc<ResourceLocation>>) -> Self {
        self.dependencies = deps;
        self
    }

    /// Identity triple for set algebra
    pub fn identity(&self) -> LocationIdentity {
        LocationIdentity {
            primary_key: self.primary_key.clone(),
            internal_id: self.internal_id.clone(),
            resource_type: self.resource_type,
        }
    }

    /// All locations reachable through `dependencies`, each exactly once.
    ///
    /// A location may be reachable along several paths; the walk dedupes by
    /// identity so accounting passes count shared bundles once.
    pub fn dependency_closure(self: &Arc<Self>) -> Vec<Arc<ResourceLocation>> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        let mut stack: Vec<Arc<ResourceLocation>> = self.dependencies.clone();
        while let Some(loc) = stack.pop() {
            if seen.insert(loc.identity()) {
                stack.extend(loc.dependencies.iter().cloned());
                out.push(loc);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle_loc(name: &str) -> Arc<ResourceLocation> {
        Arc::new(
            ResourceLocation::new(name, format!("remote/{}", name), ProviderId::Bundle, ResourceType::Bundle)
                .with_data(LocationData::bundle(name, "h1", 100)),
        )
    }

    #[test]
    fn test_assignability() {
        assert!(ResourceType::Text.is_assignable_to(Some(ResourceType::Text)));
        assert!(!ResourceType::Prefab.is_assignable_to(Some(ResourceType::Text)));
        assert!(ResourceType::Prefab.is_assignable_to(None));
    }

    #[test]
    fn test_dependency_closure_dedupes_shared_bundle() {
        let shared = bundle_loc("bundle_x");
        let a = Arc::new(
            ResourceLocation::new("a", "a.asset", ProviderId::BundledAsset, ResourceType::Prefab)
                .with_dependencies(vec![shared.clone()]),
        );
        let b = Arc::new(
            ResourceLocation::new("b", "b.asset", ProviderId::BundledAsset, ResourceType::Prefab)
                .with_dependencies(vec![shared.clone(), a.clone()]),
        );

        let closure = b.dependency_closure();
        let bundles: Vec<_> = closure
            .iter()
            .filter(|l| l.resource_type == ResourceType::Bundle)
            .collect();
        assert_eq!(bundles.len(), 1);
        // `a` and its transitive bundle dep collapse onto the same identity
        assert_eq!(closure.len(), 2);
    }

    #[test]
    fn test_identity() {
        let a = bundle_loc("x");
        let b = bundle_loc("x");
        assert_eq!(a.identity(), b.identity());
    }
}
