//! Content catalog data
//!
//! A catalog is a flattened, deduplicated encoding of many resource
//! locations that share provider, type, and dependency structure: string
//! and id tables plus index-based entries. One bucket per key lists the
//! entries that key resolves to; an entry's dependencies are expressed as
//! another bucket.
//!
//! After conversion into a live locator the tables are cleared to bound
//! peak memory; the catalog artifact stays alive only as a lifecycle
//! record.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use atlas_core::{
    CatalogProvenance, LocationData, LocationMap, ProviderError, ProviderId, ResourceKey,
    ResourceLocation, ResourceType,
};

/// One key's entry list.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CatalogBucket {
    pub entries: Vec<u32>,
}

/// One location, encoded as indices into the catalog tables.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Index into `internal_ids`
    #[serde(rename = "internalId")]
    pub internal_id: u32,
    /// Index into `keys`; the address this location is published under
    #[serde(rename = "primaryKey")]
    pub primary_key: u32,
    /// Index into `provider_ids`
    pub provider: u32,
    /// Index into `resource_types`
    #[serde(rename = "resourceType")]
    pub resource_type: u32,
    /// Bucket whose entries are this entry's dependencies
    #[serde(rename = "dependencyBucket", default)]
    pub dependency_bucket: Option<u32>,
    /// Provider-specific options (bundle metadata)
    #[serde(default)]
    pub data: Option<LocationData>,
}

/// Serialized catalog document.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ContentCatalogData {
    #[serde(rename = "locatorId")]
    pub locator_id: String,
    /// Key table; bucket `i` belongs to key `i`
    pub keys: Vec<ResourceKey>,
    pub buckets: Vec<CatalogBucket>,
    pub entries: Vec<CatalogEntry>,
    #[serde(rename = "providerIds")]
    pub provider_ids: Vec<ProviderId>,
    #[serde(rename = "internalIds")]
    pub internal_ids: Vec<String>,
    #[serde(rename = "resourceTypes")]
    pub resource_types: Vec<ResourceType>,
}

impl ContentCatalogData {
    pub fn from_json(path: &str, bytes: &[u8]) -> Result<Self, ProviderError> {
        let data: Self =
            serde_json::from_slice(bytes).map_err(|e| ProviderError::CatalogParse {
                path: path.to_string(),
                reason: e.to_string(),
            })?;
        if data.keys.len() != data.buckets.len() {
            return Err(ProviderError::CatalogParse {
                path: path.to_string(),
                reason: format!(
                    "bucket table length {} does not match key table length {}",
                    data.buckets.len(),
                    data.keys.len()
                ),
            });
        }
        Ok(data)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, ProviderError> {
        serde_json::to_vec_pretty(self).map_err(|e| ProviderError::CatalogParse {
            path: self.locator_id.clone(),
            reason: e.to_string(),
        })
    }

    /// Materialize the catalog into a live locator.
    ///
    /// Shared dependency entries collapse onto one `Arc` per entry index,
    /// so a bundle referenced by every asset exists once in memory.
    pub fn build_locator(&self, provenance: CatalogProvenance) -> Result<LocationMap, ProviderError> {
        let mut materialized: HashMap<u32, Arc<ResourceLocation>> = HashMap::new();
        let mut map = LocationMap::new(self.locator_id.clone()).with_provenance(provenance);

        for (key, bucket) in self.keys.iter().zip(&self.buckets) {
            for &entry_index in &bucket.entries {
                let location =
                    self.materialize(entry_index, &mut materialized, &mut Vec::new())?;
                map.insert(key.clone(), location);
            }
        }
        Ok(map)
    }

    fn materialize(
        &self,
        entry_index: u32,
        materialized: &mut HashMap<u32, Arc<ResourceLocation>>,
        visiting: &mut Vec<u32>,
    ) -> Result<Arc<ResourceLocation>, ProviderError> {
        if let Some(existing) = materialized.get(&entry_index) {
            return Ok(existing.clone());
        }
        if visiting.contains(&entry_index) {
            return Err(self.parse_error(format!(
                "dependency cycle through entry {entry_index}"
            )));
        }
        visiting.push(entry_index);

        let entry = self
            .entries
            .get(entry_index as usize)
            .ok_or_else(|| self.parse_error(format!("entry index {entry_index} out of range")))?;

        let mut dependencies = Vec::new();
        if let Some(dep_bucket) = entry.dependency_bucket {
            let bucket = self
                .buckets
                .get(dep_bucket as usize)
                .ok_or_else(|| self.parse_error(format!("bucket index {dep_bucket} out of range")))?;
            for &dep_entry in &bucket.entries {
                dependencies.push(self.materialize(dep_entry, materialized, visiting)?);
            }
        }

        let primary_key = self
            .keys
            .get(entry.primary_key as usize)
            .ok_or_else(|| self.parse_error(format!("key index {} out of range", entry.primary_key)))?;
        let internal_id = self
            .internal_ids
            .get(entry.internal_id as usize)
            .ok_or_else(|| self.parse_error(format!("internal id index {} out of range", entry.internal_id)))?;
        let provider = *self
            .provider_ids
            .get(entry.provider as usize)
            .ok_or_else(|| self.parse_error(format!("provider index {} out of range", entry.provider)))?;
        let resource_type = *self
            .resource_types
            .get(entry.resource_type as usize)
            .ok_or_else(|| self.parse_error(format!("type index {} out of range", entry.resource_type)))?;

        let mut location = ResourceLocation::new(
            primary_key.as_str(),
            internal_id.clone(),
            provider,
            resource_type,
        )
        .with_dependencies(dependencies);
        location.data = entry.data.clone();

        visiting.pop();
        let location = Arc::new(location);
        materialized.insert(entry_index, location.clone());
        Ok(location)
    }

    fn parse_error(&self, reason: String) -> ProviderError {
        ProviderError::CatalogParse {
            path: self.locator_id.clone(),
            reason,
        }
    }

    /// Drop the tables, keeping only the locator id. Called once the
    /// catalog has been converted into a live locator.
    pub fn clear(&mut self) {
        self.keys = Vec::new();
        self.buckets = Vec::new();
        self.entries = Vec::new();
        self.provider_ids = Vec::new();
        self.internal_ids = Vec::new();
        self.resource_types = Vec::new();
    }

    pub fn is_cleared(&self) -> bool {
        self.keys.is_empty() && self.entries.is_empty()
    }
}
