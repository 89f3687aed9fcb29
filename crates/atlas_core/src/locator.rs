//! Locators - mapping keys to resource locations
//!
//! A locator resolves `(key, type)` pairs to zero or more locations.
//! Multiple locators are consulted in registration order. Locators built
//! from catalogs carry provenance used for cache-cleanup scoping.

use std::collections::HashMap;
use std::sync::Arc;

use crate::key::ResourceKey;
use crate::location::{ResourceLocation, ResourceType};

/// Where a locator's contents came from.
#[derive(Clone, Debug)]
pub struct CatalogProvenance {
    /// Stable id of the catalog that produced the locator
    pub locator_id: String,
    /// Remote or local path the catalog body was loaded from
    pub catalog_path: String,
    /// Sibling hash resource path, if the catalog participates in caching
    pub hash_path: Option<String>,
    /// Whether the catalog body exists as a file; in-memory/dev-mode
    /// locators are not file-backed and cannot scope cache cleanup
    pub file_backed: bool,
}

/// Resolves keys to resource locations.
pub trait Locator: Send + Sync {
    /// Stable identifier, used for cache-cleanup scoping and catalog updates
    fn locator_id(&self) -> &str;

    /// Locations for `key` whose type is assignable to `requested`.
    ///
    /// Passing `None` returns every location for the key regardless of
    /// type; resolution uses this to build incompatible-type diagnostics.
    fn locate(&self, key: &ResourceKey, requested: Option<ResourceType>) -> Vec<Arc<ResourceLocation>>;

    /// Every key this locator can resolve
    fn keys(&self) -> Vec<ResourceKey>;

    /// Catalog provenance, when this locator was built from a catalog
    fn catalog_provenance(&self) -> Option<&CatalogProvenance> {
        None
    }
}

/// In-memory locator over an explicit key→locations map.
///
/// The building block for catalog-built locators and for tests.
pub struct LocationMap {
    locator_id: String,
    map: HashMap<ResourceKey, Vec<Arc<ResourceLocation>>>,
    provenance: Option<CatalogProvenance>,
}

impl LocationMap {
    pub fn new(locator_id: impl Into<String>) -> Self {
        Self {
            locator_id: locator_id.into(),
            map: HashMap::new(),
            provenance: None,
        }
    }

    /// Attach catalog provenance
    pub fn with_provenance(mut self, provenance: CatalogProvenance) -> Self {
        self.provenance = Some(provenance);
        self
    }

    /// Register a location under a key. A key may map to many locations
    /// (labels), and one location may be registered under many keys.
    pub fn insert(&mut self, key: ResourceKey, location: Arc<ResourceLocation>) {
        self.map.entry(key).or_default().push(location);
    }

    /// Number of distinct keys
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl Locator for LocationMap {
    fn locator_id(&self) -> &str {
        &self.locator_id
    }

    fn locate(&self, key: &ResourceKey, requested: Option<ResourceType>) -> Vec<Arc<ResourceLocation>> {
        match self.map.get(key) {
            Some(locs) => locs
                .iter()
                .filter(|l| l.resource_type.is_assignable_to(requested))
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    fn keys(&self) -> Vec<ResourceKey> {
        self.map.keys().cloned().collect()
    }

    fn catalog_provenance(&self) -> Option<&CatalogProvenance> {
        self.provenance.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::ProviderId;

    fn text_loc(key: &str) -> Arc<ResourceLocation> {
        Arc::new(ResourceLocation::new(
            key,
            format!("remote/{}.txt", key),
            ProviderId::Text,
            ResourceType::Text,
        ))
    }

    #[test]
    fn test_locate_filters_by_type() {
        let mut map = LocationMap::new("main");
        map.insert(ResourceKey::address("a"), text_loc("a"));

        let key = ResourceKey::address("a");
        assert_eq!(map.locate(&key, Some(ResourceType::Text)).len(), 1);
        assert_eq!(map.locate(&key, Some(ResourceType::Prefab)).len(), 0);
        assert_eq!(map.locate(&key, None).len(), 1);
    }

    #[test]
    fn test_label_maps_to_many_locations() {
        let mut map = LocationMap::new("main");
        let label = ResourceKey::label("ui");
        map.insert(label.clone(), text_loc("a"));
        map.insert(label.clone(), text_loc("b"));

        assert_eq!(map.locate(&label, Some(ResourceType::Text)).len(), 2);
    }

    #[test]
    fn test_unknown_key_is_empty() {
        let map = LocationMap::new("main");
        assert!(map.locate(&ResourceKey::address("missing"), None).is_empty());
    }
}
