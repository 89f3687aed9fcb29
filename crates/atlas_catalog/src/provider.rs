//! Catalog provider
//!
//! Loads a remote catalog with hash-based local caching:
//! 1. fetch the sibling hash resource (always attempted);
//! 2. if it matches the locally cached hash and a cached body parses,
//!    use the cached body - no remote body fetch;
//! 3. otherwise fetch the remote body and write body + hash to the cache;
//! 4. if no hash resource exists, always fetch fresh and cache nothing.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use atlas_core::{
    FetchError, JobPoll, ProvideJob, Provider, ProviderError, ProviderId, ResourceLocation,
    ResourceValue,
};
use atlas_provider::{FetchPoll, FetchRequest, TicketId, Transport};

use crate::cache::{stable_key, CatalogCache};
use crate::data::ContentCatalogData;

/// Sibling hash resource path for a catalog path.
pub fn hash_sibling(catalog_path: &str) -> String {
    match catalog_path.rfind('.') {
        Some(idx) => format!("{}.hash", &catalog_path[..idx]),
        None => format!("{catalog_path}.hash"),
    }
}

/// Artifact of a catalog load.
///
/// Holds the parsed tables until they are converted into a live locator;
/// conversion takes the tables out, bounding peak memory no matter how
/// long the handle itself stays alive.
pub struct CatalogArtifact {
    pub catalog_path: String,
    pub hash_path: String,
    pub locator_id: String,
    /// Hash text of the remote hash resource, when one existed
    pub remote_hash: Option<String>,
    data: Mutex<Option<ContentCatalogData>>,
}

impl CatalogArtifact {
    fn new(
        catalog_path: String,
        hash_path: String,
        remote_hash: Option<String>,
        data: ContentCatalogData,
    ) -> Self {
        Self {
            catalog_path,
            hash_path,
            locator_id: data.locator_id.clone(),
            remote_hash,
            data: Mutex::new(Some(data)),
        }
    }

    /// Take the parsed tables for locator conversion, clearing them from
    /// the artifact.
    pub fn take_data(&self) -> Option<ContentCatalogData> {
        self.data.lock().take()
    }

    pub fn is_cleared(&self) -> bool {
        self.data.lock().is_none()
    }
}

/// Provides content catalogs with hash-based caching.
pub struct CatalogProvider {
    transport: Arc<dyn Transport>,
    cache: Arc<CatalogCache>,
    timeout: Option<Duration>,
}

impl CatalogProvider {
    pub fn new(transport: Arc<dyn Transport>, cache: Arc<CatalogCache>) -> Self {
        Self {
            transport,
            cache,
            timeout: None,
        }
    }

    /// Per-catalog request timeout applied to hash and body fetches.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Provider for CatalogProvider {
    fn provider_id(&self) -> ProviderId {
        ProviderId::Catalog
    }

    fn begin(
        &self,
        location: &Arc<ResourceLocation>,
        _deps: &[ResourceValue],
    ) -> Result<Box<dyn ProvideJob>, ProviderError> {
        let path = location.internal_id.clone();
        let hash_path = hash_sibling(&path);
        let ticket = self.transport.begin(
            FetchRequest::new(hash_path.clone()).with_timeout(self.timeout),
        );
        Ok(Box::new(CatalogJob {
            transport: self.transport.clone(),
            cache: self.cache.clone(),
            stable: stable_key(&hash_path),
            path,
            hash_path,
            timeout: self.timeout,
            state: CatalogState::FetchHash(ticket),
        }))
    }
}

enum CatalogState {
    FetchHash(TicketId),
    FetchBody {
        ticket: TicketId,
        remote_hash: Option<String>,
    },
    Finished,
}

struct CatalogJob {
    transport: Arc<dyn Transport>,
    cache: Arc<CatalogCache>,
    stable: String,
    path: String,
    hash_path: String,
    timeout: Option<Duration>,
    state: CatalogState,
}

impl CatalogJob {
    fn begin_body_fetch(&self, remote_hash: Option<String>) -> CatalogState {
        let ticket = self
            .transport
            .begin(FetchRequest::new(self.path.clone()).with_timeout(self.timeout));
        CatalogState::FetchBody { ticket, remote_hash }
    }

    fn finish(&self, remote_hash: Option<String>, data: ContentCatalogData) -> JobPoll {
        JobPoll::Ready(Arc::new(CatalogArtifact::new(
            self.path.clone(),
            self.hash_path.clone(),
            remote_hash,
            data,
        )))
    }
}

impl ProvideJob for CatalogJob {
    fn poll(&mut self) -> JobPoll {
        match std::mem::replace(&mut self.state, CatalogState::Finished) {
            CatalogState::FetchHash(ticket) => match self.transport.poll(ticket) {
                FetchPoll::Pending(p) => {
                    self.state = CatalogState::FetchHash(ticket);
                    JobPoll::Pending(0.3 * p)
                }
                FetchPoll::Done(bytes) => {
                    let remote_hash = String::from_utf8_lossy(&bytes).trim().to_string();
                    if self.cache.cached_hash(&self.stable).as_deref() == Some(remote_hash.as_str()) {
                        if let Some(body) = self.cache.cached_body(&self.stable) {
                            match ContentCatalogData::from_json(&self.path, &body) {
                                Ok(data) => {
                                    log::debug!(
                                        "catalog '{}' served from cache (hash {})",
                                        self.path,
                                        remote_hash
                                    );
                                    return self.finish(Some(remote_hash), data);
                                }
                                Err(e) => {
                                    log::warn!(
                                        "cached catalog body for '{}' failed to parse ({}); refetching",
                                        self.path,
                                        e
                                    );
                                }
                            }
                        }
                    }
                    self.state = self.begin_body_fetch(Some(remote_hash));
                    JobPoll::Pending(0.3)
                }
                FetchPoll::Failed(FetchError::NotFound(_)) => {
                    // no hash resource: always fetch fresh, never cache
                    log::debug!("catalog '{}' has no hash resource; caching disabled", self.path);
                    self.state = self.begin_body_fetch(None);
                    JobPoll::Pending(0.3)
                }
                FetchPoll::Failed(source) => JobPoll::Failed(ProviderError::Fetch {
                    path: self.hash_path.clone(),
                    source,
                }),
            },
            CatalogState::FetchBody { ticket, remote_hash } => {
                match self.transport.poll(ticket) {
                    FetchPoll::Pending(p) => {
                        self.state = CatalogState::FetchBody { ticket, remote_hash };
                        JobPoll::Pending(0.3 + 0.7 * p)
                    }
                    FetchPoll::Done(bytes) => match ContentCatalogData::from_json(&self.path, &bytes)
                    {
                        Ok(data) => {
                            if let Some(hash) = &remote_hash {
                                if let Err(e) = self.cache.store(&self.stable, hash, &bytes) {
                                    log::warn!("failed to cache catalog '{}': {}", self.path, e);
                                }
                            }
                            self.finish(remote_hash, data)
                        }
                        Err(e) => JobPoll::Failed(e),
                    },
                    FetchPoll::Failed(source) => JobPoll::Failed(ProviderError::Fetch {
                        path: self.path.clone(),
                        source,
                    }),
                }
            }
            CatalogState::Finished => JobPoll::Failed(ProviderError::Fetch {
                path: self.path.clone(),
                source: FetchError::Read("job already finished".to_string()),
            }),
        }
    }
}

impl Drop for CatalogJob {
    fn drop(&mut self) {
        match &self.state {
            CatalogState::FetchHash(ticket) => self.transport.cancel(*ticket),
            CatalogState::FetchBody { ticket, .. } => self.transport.cancel(*ticket),
            CatalogState::Finished => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atlas_core::{ResourceKey, ResourceType};
    use atlas_provider::MemoryTransport;
    use crate::data::{CatalogBucket, CatalogEntry};

    fn tiny_catalog(locator_id: &str) -> ContentCatalogData {
        ContentCatalogData {
            locator_id: locator_id.to_string(),
            keys: vec![ResourceKey::address("a")],
            buckets: vec![CatalogBucket { entries: vec![0] }],
            entries: vec![CatalogEntry {
                internal_id: 0,
                primary_key: 0,
                provider: 0,
                resource_type: 0,
                dependency_bucket: None,
                data: None,
            }],
            provider_ids: vec![ProviderId::Text],
            internal_ids: vec!["remote/a.txt".to_string()],
            resource_types: vec![ResourceType::Text],
        }
    }

    fn catalog_location(path: &str) -> Arc<ResourceLocation> {
        Arc::new(ResourceLocation::new(
            path,
            path,
            ProviderId::Catalog,
            ResourceType::Catalog,
        ))
    }

    fn drive(job: &mut Box<dyn ProvideJob>) -> JobPoll {
        for _ in 0..100 {
            match job.poll() {
                JobPoll::Pending(_) => continue,
                other => return other,
            }
        }
        panic!("catalog job did not finish");
    }

    fn load(provider: &CatalogProvider, path: &str) -> Arc<CatalogArtifact> {
        let mut job = provider.begin(&catalog_location(path), &[]).unwrap();
        match drive(&mut job) {
            JobPoll::Ready(v) => v.downcast::<CatalogArtifact>().unwrap(),
            JobPoll::Failed(e) => panic!("catalog load failed: {e}"),
            JobPoll::Pending(_) => unreachable!(),
        }
    }

    #[test]
    fn test_hash_sibling_paths() {
        assert_eq!(hash_sibling("remote/catalog.json"), "remote/catalog.hash");
        assert_eq!(hash_sibling("catalog"), "catalog.hash");
    }

    #[test]
    fn test_unchanged_hash_fetches_body_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(MemoryTransport::new());
        let cache = Arc::new(CatalogCache::new(dir.path()));
        let provider = CatalogProvider::new(transport.clone(), cache);

        transport.insert("remote/catalog.json", tiny_catalog("main").to_json().unwrap());
        transport.insert_text("remote/catalog.hash", "v1");

        let first = load(&provider, "remote/catalog.json");
        assert_eq!(first.locator_id, "main");
        assert_eq!(first.remote_hash.as_deref(), Some("v1"));

        let second = load(&provider, "remote/catalog.json");
        assert_eq!(second.locator_id, "main");

        // the body was fetched exactly once; the hash is checked each time
        assert_eq!(transport.begin_count("remote/catalog.json"), 1);
        assert_eq!(transport.begin_count("remote/catalog.hash"), 2);
    }

    #[test]
    fn test_changed_hash_refetches_and_updates_cache() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(MemoryTransport::new());
        let cache = Arc::new(CatalogCache::new(dir.path()));
        let provider = CatalogProvider::new(transport.clone(), cache.clone());

        transport.insert("remote/catalog.json", tiny_catalog("main").to_json().unwrap());
        transport.insert_text("remote/catalog.hash", "v1");
        load(&provider, "remote/catalog.json");

        transport.insert("remote/catalog.json", tiny_catalog("main-v2").to_json().unwrap());
        transport.insert_text("remote/catalog.hash", "v2");

        let updated = load(&provider, "remote/catalog.json");
        assert_eq!(updated.locator_id, "main-v2");
        assert_eq!(transport.begin_count("remote/catalog.json"), 2);

        let key = stable_key("remote/catalog.hash");
        assert_eq!(cache.cached_hash(&key).as_deref(), Some("v2"));
    }

    #[test]
    fn test_missing_hash_resource_disables_caching() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(MemoryTransport::new());
        let cache = Arc::new(CatalogCache::new(dir.path()));
        let provider = CatalogProvider::new(transport.clone(), cache.clone());

        transport.insert("remote/catalog.json", tiny_catalog("main").to_json().unwrap());
        // no hash sibling registered

        let first = load(&provider, "remote/catalog.json");
        assert_eq!(first.remote_hash, None);
        load(&provider, "remote/catalog.json");

        // fetched fresh every time, nothing written to the cache
        assert_eq!(transport.begin_count("remote/catalog.json"), 2);
        let key = stable_key("remote/catalog.hash");
        assert!(cache.cached_hash(&key).is_none());
        assert!(cache.cached_body(&key).is_none());
    }

    #[test]
    fn test_corrupt_cached_body_refetches() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(MemoryTransport::new());
        let cache = Arc::new(CatalogCache::new(dir.path()));
        let provider = CatalogProvider::new(transport.clone(), cache.clone());

        transport.insert("remote/catalog.json", tiny_catalog("main").to_json().unwrap());
        transport.insert_text("remote/catalog.hash", "v1");
        load(&provider, "remote/catalog.json");

        // corrupt the cached body while the hash still matches
        let key = stable_key("remote/catalog.hash");
        cache.store(&key, "v1", b"not json").unwrap();

        let reloaded = load(&provider, "remote/catalog.json");
        assert_eq!(reloaded.locator_id, "main");
        assert_eq!(transport.begin_count("remote/catalog.json"), 2);
    }

    #[test]
    fn test_take_data_clears_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(MemoryTransport::new());
        let cache = Arc::new(CatalogCache::new(dir.path()));
        let provider = CatalogProvider::new(transport.clone(), cache);

        transport.insert("remote/catalog.json", tiny_catalog("main").to_json().unwrap());
        let artifact = load(&provider, "remote/catalog.json");

        assert!(!artifact.is_cleared());
        let data = artifact.take_data().unwrap();
        assert_eq!(data.locator_id, "main");
        assert!(artifact.is_cleared());
        assert!(artifact.take_data().is_none());
    }
}
