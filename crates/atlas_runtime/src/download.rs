//! Download-size accounting and bundle-cache maintenance
//!
//! Download size walks dependency closures and counts each bundle
//! identity once per aggregate query, skipping versions already cached on
//! disk. Cache cleanup computes the set of versions referenced by the
//! scoped catalogs and removes everything else; it is single-flight and
//! rejects (without touching the cache) when caching is disabled or a
//! named catalog cannot scope the clean.

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use atlas_core::{
    AtlasError, CacheError, Locator, OpContext, OpHandle, OpPoll, Operation, ResourceKey,
    ResourceLocation,
};
use atlas_provider::{BundleCache, CachedBundle};

use crate::atlas::Atlas;
use crate::resolve;

impl Atlas {
    /// Total bytes a load of `keys` would still need to download.
    ///
    /// Each bundle identity is counted once across the whole batch; a
    /// cached `(bundle_name, hash)` contributes zero; a hash-less
    /// dependency can never be proven cached and always counts.
    pub fn get_download_size(&self, keys: &[ResourceKey]) -> OpHandle {
        let locators = self.locator_snapshot();
        let mut seen = HashSet::new();
        let mut total: u64 = 0;

        for key in keys {
            let locations = match resolve::resolve_key(&locators, key, None) {
                Ok(l) => l,
                Err(e) => {
                    return self
                        .manager()
                        .create_failed(AtlasError::InvalidKey(e), "download size")
                }
            };
            for location in &locations {
                for dep in location.dependency_closure() {
                    if !seen.insert(dep.identity()) {
                        continue;
                    }
                    total += self.pending_size(&dep);
                }
            }
        }
        self.manager()
            .create_completed(Arc::new(total), "download size")
    }

    fn pending_size(&self, location: &Arc<ResourceLocation>) -> u64 {
        let Some(data) = &location.data else {
            return 0;
        };
        match &data.hash {
            Some(hash) => {
                let name = self.config().bundle_naming.cache_name(&data.bundle_name, hash);
                if self.bundle_cache().is_cached(&name, hash) {
                    0
                } else {
                    data.size
                }
            }
            // no hash: cannot be proven cached
            None => data.size,
        }
    }

    /// Remove cached bundle versions for the dependency closures of
    /// `keys`. The handle's result is the number of versions removed.
    pub fn clear_dependency_cache(&self, keys: &[ResourceKey], auto_release: bool) -> OpHandle {
        let locators = self.locator_snapshot();
        let mut locations = Vec::new();
        for key in keys {
            match resolve::resolve_key(&locators, key, None) {
                Ok(found) => locations.extend(found),
                Err(e) => {
                    return self
                        .manager()
                        .create_failed(AtlasError::InvalidKey(e), "clear dependency cache")
                }
            }
        }
        self.clear_dependency_cache_for_locations(&locations, auto_release)
    }

    /// Location-list form of [`clear_dependency_cache`](Self::clear_dependency_cache).
    pub fn clear_dependency_cache_for_locations(
        &self,
        locations: &[Arc<ResourceLocation>],
        auto_release: bool,
    ) -> OpHandle {
        if !self.bundle_cache().is_enabled() {
            return self
                .manager()
                .create_failed(AtlasError::Cache(CacheError::CachingDisabled), "clear dependency cache");
        }

        let mut seen = HashSet::new();
        let mut removed: usize = 0;
        for location in locations {
            for target in std::iter::once(location.clone()).chain(location.dependency_closure()) {
                if !seen.insert(target.identity()) {
                    continue;
                }
                match self.remove_cached_version(&target) {
                    Ok(true) => removed += 1,
                    Ok(false) => {}
                    Err(e) => {
                        return self
                            .manager()
                            .create_failed(AtlasError::Cache(e), "clear dependency cache")
                    }
                }
            }
        }
        log::debug!("dependency cache clear removed {removed} version(s)");
        let handle = self
            .manager()
            .create_completed(Arc::new(removed), "clear dependency cache");
        if auto_release {
            handle.mark_auto_release();
        }
        handle
    }

    fn remove_cached_version(&self, location: &Arc<ResourceLocation>) -> Result<bool, CacheError> {
        let Some(data) = &location.data else {
            return Ok(false);
        };
        let Some(hash) = &data.hash else {
            return Ok(false);
        };
        let name = self.config().bundle_naming.cache_name(&data.bundle_name, hash);
        self.bundle_cache().remove_version(&name, hash)
    }

    /// Evict every cached bundle version not referenced by the scoped
    /// catalogs (all registered file-backed catalogs when `catalog_ids`
    /// is `None`). Single-flight: a concurrent clean is rejected. The
    /// handle's result is the `Vec<CachedBundle>` that was removed.
    pub fn clean_bundle_cache(&self, catalog_ids: Option<&[String]>) -> OpHandle {
        let name = "clean bundle cache";
        if !self.bundle_cache().is_enabled() {
            return self
                .manager()
                .create_failed(AtlasError::Cache(CacheError::CachingDisabled), name);
        }
        if self.clean_in_flight.swap(true, Ordering::SeqCst) {
            return self
                .manager()
                .create_failed(AtlasError::Cache(CacheError::CleanAlreadyRunning), name);
        }

        let locators = self.locator_snapshot();
        let selected: Vec<Arc<dyn Locator>> = match catalog_ids {
            None => locators
                .iter()
                .filter(|l| {
                    l.catalog_provenance()
                        .map(|p| p.file_backed)
                        .unwrap_or(false)
                })
                .cloned()
                .collect(),
            Some(ids) => {
                let mut selected = Vec::new();
                for id in ids {
                    let found = locators.iter().find(|l| l.locator_id() == id.as_str());
                    match found {
                        Some(locator)
                            if locator
                                .catalog_provenance()
                                .map(|p| p.file_backed)
                                .unwrap_or(false) =>
                        {
                            selected.push(locator.clone())
                        }
                        _ => {
                            self.clean_in_flight.store(false, Ordering::SeqCst);
                            return self.manager().create_failed(
                                AtlasError::Cache(CacheError::CatalogNotFileBacked(id.clone())),
                                name,
                            );
                        }
                    }
                }
                selected
            }
        };

        let mut keep: HashSet<CachedBundle> = HashSet::new();
        for locator in &selected {
            for key in locator.keys() {
                for location in locator.locate(&key, None) {
                    for target in
                        std::iter::once(location.clone()).chain(location.dependency_closure())
                    {
                        if let Some(data) = &target.data {
                            if let Some(hash) = &data.hash {
                                keep.insert(CachedBundle {
                                    bundle_name: self
                                        .config()
                                        .bundle_naming
                                        .cache_name(&data.bundle_name, hash),
                                    hash: hash.clone(),
                                });
                            }
                        }
                    }
                }
            }
        }

        self.manager().register(
            Box::new(CleanCacheOperation {
                cache: self.bundle_cache().clone(),
                keep: Some(keep),
                flag: self.clean_in_flight.clone(),
            }),
            name,
        )
    }
}

/// Performs the eviction on its first poll, holding the single-flight
/// flag from creation to completion.
struct CleanCacheOperation {
    cache: Arc<BundleCache>,
    keep: Option<HashSet<CachedBundle>>,
    flag: Arc<std::sync::atomic::AtomicBool>,
}

impl Operation for CleanCacheOperation {
    fn poll(&mut self, _ctx: &mut OpContext<'_>) -> OpPoll {
        let Some(keep) = self.keep.take() else {
            return OpPoll::Pending(1.0);
        };
        let result = self.cache.retain(&keep);
        self.flag.store(false, Ordering::SeqCst);
        match result {
            Ok(removed) => {
                log::info!("bundle cache clean removed {} stale version(s)", removed.len());
                OpPoll::Ready(Arc::new(removed))
            }
            Err(e) => OpPoll::Fault(Arc::new(AtlasError::Cache(e))),
        }
    }

    fn on_destroy(&mut self, _ctx: &mut OpContext<'_>) {
        // released before the clean ran
        if self.keep.is_some() {
            self.flag.store(false, Ordering::SeqCst);
        }
    }
}
