//! Atlas - the runtime facade
//!
//! Owns one resource manager, one provider table, one request queue, and
//! the caches; exposes the public load/instantiate/download surface. All
//! entry points return handles; errors are captured on the handle and
//! routed through the manager's exception hook, never thrown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use atlas_catalog::{CatalogArtifact, CatalogCache, CatalogProvider};
use atlas_core::{
    AtlasError, CacheError, CatalogProvenance, ExceptionHook, GroupResults, LocationIdentity,
    Locator, MergeMode, OpHandle, OperationStatus, Provider, ProviderError, ProviderId,
    ProviderRegistry, ResourceKey, ResourceLocation, ResourceManager, ResourceType,
};
use atlas_provider::{
    BinaryProvider, BundleCache, BundleProvider, BundledAssetProvider, RequestQueue, TextProvider,
    Transport,
};

use crate::config::AtlasConfig;
use crate::resolve;

/// A catalog currently backing a registered locator, tracked for update
/// checks and cache-cleanup scoping.
#[derive(Clone, Debug)]
pub struct TrackedCatalog {
    pub locator_id: String,
    pub catalog_path: String,
    pub hash_path: String,
    /// Hash the catalog was last loaded under; `None` when the catalog
    /// has no hash resource and cannot be update-checked
    pub remote_hash: Option<String>,
}

/// The Atlas runtime instance.
///
/// Everything is per-instance: independent runtimes never share the
/// request queue, caches, exception hook, or operation arena.
pub struct Atlas {
    manager: ResourceManager,
    config: AtlasConfig,
    locators: RwLock<Vec<Arc<dyn Locator>>>,
    providers: RwLock<ProviderRegistry>,
    queue: Arc<RequestQueue>,
    bundle_cache: Arc<BundleCache>,
    catalog_cache: Arc<CatalogCache>,
    /// One provide-operation per live location; consumers share it
    active_provides: Mutex<HashMap<LocationIdentity, OpHandle>>,
    tracked_catalogs: Mutex<Vec<TrackedCatalog>>,
    pub(crate) clean_in_flight: Arc<AtomicBool>,
    pub(crate) instance_counter: AtomicU64,
    pub(crate) scene_activations: Mutex<HashMap<atlas_core::OpId, (OpHandle, Arc<AtomicBool>)>>,
}

impl Atlas {
    pub fn new(transport: Arc<dyn Transport>, config: AtlasConfig) -> Arc<Self> {
        let queue = RequestQueue::new(config.max_concurrent_requests);
        let bundle_cache = Arc::new(match &config.cache_dir {
            Some(dir) => BundleCache::new(dir),
            None => BundleCache::disabled(),
        });
        let catalog_cache = Arc::new(match &config.catalog_cache_dir {
            Some(dir) => CatalogCache::new(dir),
            None => CatalogCache::disabled(),
        });

        let mut providers = ProviderRegistry::new();
        providers.register(Arc::new(BinaryProvider::new(transport.clone())));
        providers.register(Arc::new(TextProvider::new(transport.clone())));
        providers.register(Arc::new(
            BundleProvider::new(transport.clone(), queue.clone(), bundle_cache.clone())
                .with_default_retries(config.default_retry_count)
                .with_forced_queue(config.force_queued_local_loads)
                .with_naming(config.bundle_naming),
        ));
        providers.register(Arc::new(BundledAssetProvider));
        providers.register(Arc::new(
            CatalogProvider::new(transport, catalog_cache.clone())
                .with_timeout(config.catalog_request_timeout),
        ));

        Arc::new(Self {
            manager: ResourceManager::new(),
            config,
            locators: RwLock::new(Vec::new()),
            providers: RwLock::new(providers),
            queue,
            bundle_cache,
            catalog_cache,
            active_provides: Mutex::new(HashMap::new()),
            tracked_catalogs: Mutex::new(Vec::new()),
            clean_in_flight: Arc::new(AtomicBool::new(false)),
            instance_counter: AtomicU64::new(0),
            scene_activations: Mutex::new(HashMap::new()),
        })
    }

    pub fn manager(&self) -> &ResourceManager {
        &self.manager
    }

    pub fn config(&self) -> &AtlasConfig {
        &self.config
    }

    /// The on-disk bundle cache (shared with the bundle provider)
    pub fn bundle_cache(&self) -> &Arc<BundleCache> {
        &self.bundle_cache
    }

    /// The on-disk catalog cache (shared with the catalog provider)
    pub fn catalog_cache(&self) -> &Arc<CatalogCache> {
        &self.catalog_cache
    }

    pub fn request_queue(&self) -> &Arc<RequestQueue> {
        &self.queue
    }

    /// Replace the exception hook for this runtime instance
    pub fn set_exception_hook(&self, hook: ExceptionHook) {
        self.manager.set_exception_hook(hook);
    }

    /// One cooperative tick: advances every in-flight operation and runs
    /// the deferred callback queue.
    pub fn update(&self) {
        self.manager.update();
        self.active_provides.lock().retain(|_, h| h.is_valid());
        self.scene_activations.lock().retain(|_, (h, _)| h.is_valid());
    }

    /// Register a locator; locators are consulted in registration order.
    pub fn register_locator(&self, locator: Arc<dyn Locator>) {
        self.locators.write().push(locator);
    }

    /// Register or replace a locator by id (catalog updates swap in
    /// place, keeping consultation order).
    pub fn install_locator(&self, locator: Arc<dyn Locator>) {
        let mut locators = self.locators.write();
        match locators
            .iter()
            .position(|l| l.locator_id() == locator.locator_id())
        {
            Some(idx) => locators[idx] = locator,
            None => locators.push(locator),
        }
    }

    /// Register a host-supplied provider
    pub fn register_provider(&self, provider: Arc<dyn Provider>) {
        self.providers.write().register(provider);
    }

    pub(crate) fn locator_snapshot(&self) -> Vec<Arc<dyn Locator>> {
        self.locators.read().clone()
    }

    pub(crate) fn tracked_catalogs(&self) -> Vec<TrackedCatalog> {
        self.tracked_catalogs.lock().clone()
    }

    // ---- core provide machinery ------------------------------------------

    /// Schedule (or share) the provide-operation for a location. Every
    /// call returns a handle owning one reference.
    pub fn provide_location(&self, location: &Arc<ResourceLocation>) -> OpHandle {
        let identity = location.identity();
        {
            let provides = self.active_provides.lock();
            if let Some(existing) = provides.get(&identity) {
                if let Ok(shared) = existing.acquire() {
                    return shared;
                }
            }
        }

        let name = format!("provide {}", location.primary_key);
        let provider = match self.providers.read().get(location.provider) {
            Ok(p) => p,
            Err(e) => return self.manager.create_failed(AtlasError::Provider(e), name),
        };

        let dep_handles: Vec<OpHandle> = location
            .dependencies
            .iter()
            .map(|dep| self.provide_location(dep))
            .collect();

        let handle =
            match self
                .manager
                .create_provider_op(provider, location.clone(), &dep_handles, name.clone())
            {
                Ok(h) => h,
                Err(e) => {
                    for dep in &dep_handles {
                        dep.release();
                    }
                    return self.manager.create_failed(AtlasError::Operation(e), name);
                }
            };
        // the provider operation acquired its own dependency references
        for dep in &dep_handles {
            dep.release();
        }
        self.active_provides.lock().insert(identity, handle.clone());
        handle
    }

    // ---- public load surface ---------------------------------------------

    /// Resolve keys to locations without loading anything. The handle's
    /// result is the resolved `Vec<Arc<ResourceLocation>>`.
    pub fn load_resource_locations(
        &self,
        keys: &[ResourceKey],
        mode: Option<MergeMode>,
        requested: Option<ResourceType>,
    ) -> OpHandle {
        let locators = self.locator_snapshot();
        match resolve::resolve_keys(&locators, keys, mode, requested) {
            Ok(locations) => self
                .manager
                .create_completed(Arc::new(locations), "resource locations"),
            Err(e) => self
                .manager
                .create_failed(AtlasError::InvalidKey(e), "resource locations"),
        }
    }

    /// Load the artifact for a key's first location.
    pub fn load_asset(&self, key: &ResourceKey, requested: Option<ResourceType>) -> OpHandle {
        let locators = self.locator_snapshot();
        match resolve::resolve_key(&locators, key, requested) {
            Ok(locations) => self.provide_location(&locations[0]),
            Err(e) => self
                .manager
                .create_failed(AtlasError::InvalidKey(e), format!("load {key}")),
        }
    }

    /// Load every location the merged key set resolves to.
    ///
    /// `per_item` fires through the deferred callback queue as each
    /// member completes. With `release_dependencies_on_failure`, a failed
    /// group releases itself (and thereby every member) once reported.
    pub fn load_assets(
        &self,
        keys: &[ResourceKey],
        mode: Option<MergeMode>,
        requested: Option<ResourceType>,
        per_item: Option<Arc<dyn Fn(&OpHandle) + Send + Sync>>,
        release_dependencies_on_failure: bool,
    ) -> OpHandle {
        let locators = self.locator_snapshot();
        let locations = match resolve::resolve_keys(&locators, keys, mode, requested) {
            Ok(l) => l,
            Err(e) => {
                return self
                    .manager
                    .create_failed(AtlasError::InvalidKey(e), "load assets")
            }
        };

        let members: Vec<OpHandle> = locations
            .iter()
            .map(|location| self.provide_location(location))
            .collect();
        if let Some(cb) = per_item {
            for member in &members {
                let cb = cb.clone();
                member.on_complete(move |h| cb(h));
            }
        }
        let group = match self.manager.create_group(&members, "load assets") {
            Ok(g) => g,
            Err(e) => {
                for member in &members {
                    member.release();
                }
                return self
                    .manager
                    .create_failed(AtlasError::Operation(e), "load assets");
            }
        };
        for member in &members {
            member.release();
        }
        if release_dependencies_on_failure {
            let group_ref = group.clone();
            group.on_complete(move |h| {
                if h.status() == OperationStatus::Failed {
                    group_ref.release();
                }
            });
        }
        group
    }

    /// Download (and cache) every bundle in a key's dependency closure.
    pub fn download_dependencies(&self, key: &ResourceKey, auto_release: bool) -> OpHandle {
        let locators = self.locator_snapshot();
        let name = format!("download dependencies {key}");
        let locations = match resolve::resolve_key(&locators, key, None) {
            Ok(l) => l,
            Err(e) => return self.manager.create_failed(AtlasError::InvalidKey(e), name),
        };

        let mut seen = std::collections::HashSet::new();
        let mut members = Vec::new();
        for location in &locations {
            for dep in location.dependency_closure() {
                if seen.insert(dep.identity()) {
                    members.push(self.provide_location(&dep));
                }
            }
        }
        let group = match self.manager.create_group(&members, name.clone()) {
            Ok(g) => g,
            Err(e) => {
                for member in &members {
                    member.release();
                }
                return self.manager.create_failed(AtlasError::Operation(e), name);
            }
        };
        for member in &members {
            member.release();
        }
        if auto_release {
            group.mark_auto_release();
        }
        group
    }

    // ---- catalogs --------------------------------------------------------

    /// Load a content catalog and install it as a live locator. The
    /// handle's result is the catalog's locator id (`String`).
    pub fn load_content_catalog(self: &Arc<Self>, path: &str, auto_release: bool) -> OpHandle {
        let location = Arc::new(ResourceLocation::new(
            path,
            path,
            ProviderId::Catalog,
            ResourceType::Catalog,
        ));
        let provide = self.provide_location(&location);
        let this = self.clone();
        let name = format!("load catalog {path}");
        let chain = match self.manager.create_chain(
            &provide,
            name.clone(),
            Box::new(move |value| match value.downcast::<CatalogArtifact>() {
                Ok(artifact) => this.install_catalog(&artifact),
                Err(_) => this.manager.create_failed(
                    AtlasError::Provider(ProviderError::CatalogParse {
                        path: "<unknown>".to_string(),
                        reason: "catalog operation produced an unexpected artifact".to_string(),
                    }),
                    "install catalog",
                ),
            }),
        ) {
            Ok(c) => c,
            Err(e) => {
                provide.release();
                return self.manager.create_failed(AtlasError::Operation(e), name);
            }
        };
        provide.release();
        if auto_release {
            chain.mark_auto_release();
        }
        chain
    }

    fn install_catalog(&self, artifact: &Arc<CatalogArtifact>) -> OpHandle {
        match artifact.take_data() {
            // tables already converted by an earlier consumer
            None => self
                .manager
                .create_completed(Arc::new(artifact.locator_id.clone()), "install catalog"),
            Some(data) => {
                let provenance = CatalogProvenance {
                    locator_id: data.locator_id.clone(),
                    catalog_path: artifact.catalog_path.clone(),
                    hash_path: Some(artifact.hash_path.clone()),
                    file_backed: true,
                };
                match data.build_locator(provenance) {
                    Ok(map) => {
                        let locator_id = data.locator_id.clone();
                        self.install_locator(Arc::new(map));
                        self.track_catalog(TrackedCatalog {
                            locator_id: locator_id.clone(),
                            catalog_path: artifact.catalog_path.clone(),
                            hash_path: artifact.hash_path.clone(),
                            remote_hash: artifact.remote_hash.clone(),
                        });
                        log::info!(
                            "catalog '{}' installed as locator '{}'",
                            artifact.catalog_path,
                            locator_id
                        );
                        self.manager
                            .create_completed(Arc::new(locator_id), "install catalog")
                    }
                    Err(e) => self
                        .manager
                        .create_failed(AtlasError::Provider(e), "install catalog"),
                }
            }
        }
    }

    fn track_catalog(&self, catalog: TrackedCatalog) {
        let mut tracked = self.tracked_catalogs.lock();
        match tracked
            .iter()
            .position(|t| t.locator_id == catalog.locator_id)
        {
            Some(idx) => tracked[idx] = catalog,
            None => tracked.push(catalog),
        }
    }

    /// Re-fetch the remote hash of every hash-tracked catalog; the
    /// handle's result is the `Vec<String>` of locator ids whose remote
    /// hash changed.
    pub fn check_for_catalog_updates(self: &Arc<Self>, auto_release: bool) -> OpHandle {
        let candidates: Vec<TrackedCatalog> = self
            .tracked_catalogs()
            .into_iter()
            .filter(|t| t.remote_hash.is_some())
            .collect();
        if candidates.is_empty() {
            let handle = self
                .manager
                .create_completed(Arc::new(Vec::<String>::new()), "check catalog updates");
            if auto_release {
                handle.mark_auto_release();
            }
            return handle;
        }

        let members: Vec<OpHandle> = candidates
            .iter()
            .map(|t| {
                let location = Arc::new(ResourceLocation::new(
                    t.hash_path.clone(),
                    t.hash_path.clone(),
                    ProviderId::Text,
                    ResourceType::Text,
                ));
                self.provide_location(&location)
            })
            .collect();
        let group = match self.manager.create_group(&members, "fetch catalog hashes") {
            Ok(g) => g,
            Err(e) => {
                for member in &members {
                    member.release();
                }
                return self
                    .manager
                    .create_failed(AtlasError::Operation(e), "check catalog updates");
            }
        };
        for member in &members {
            member.release();
        }

        let this = self.clone();
        let chain = match self.manager.create_chain(
            &group,
            "check catalog updates",
            Box::new(move |value| {
                let mut changed = Vec::new();
                if let Ok(results) = value.downcast::<GroupResults>() {
                    for (catalog, result) in candidates.iter().zip(results.iter()) {
                        if let Ok(hash) = result.clone().downcast::<String>() {
                            let fetched = hash.trim().to_string();
                            if Some(&fetched) != catalog.remote_hash.as_ref() {
                                changed.push(catalog.locator_id.clone());
                            }
                        }
                    }
                }
                this.manager
                    .create_completed(Arc::new(changed), "catalog update list")
            }),
        ) {
            Ok(c) => c,
            Err(e) => {
                group.release();
                return self
                    .manager
                    .create_failed(AtlasError::Operation(e), "check catalog updates");
            }
        };
        group.release();
        if auto_release {
            chain.mark_auto_release();
        }
        chain
    }

    /// Reload the named catalogs, swapping their locators in place. The
    /// handle's result is the `Vec<String>` of updated locator ids.
    pub fn update_catalogs(self: &Arc<Self>, ids: &[String], auto_release: bool) -> OpHandle {
        let tracked = self.tracked_catalogs();
        let mut members = Vec::new();
        for id in ids {
            match tracked.iter().find(|t| &t.locator_id == id) {
                Some(t) => members.push(self.load_content_catalog(&t.catalog_path, false)),
                None => {
                    for member in &members {
                        member.release();
                    }
                    return self.manager.create_failed(
                        AtlasError::Cache(CacheError::UnknownCatalog(id.clone())),
                        "update catalogs",
                    );
                }
            }
        }
        let group = match self.manager.create_group(&members, "update catalogs") {
            Ok(g) => g,
            Err(e) => {
                for member in &members {
                    member.release();
                }
                return self
                    .manager
                    .create_failed(AtlasError::Operation(e), "update catalogs");
            }
        };
        for member in &members {
            member.release();
        }

        let updated: Vec<String> = ids.to_vec();
        let this = self.clone();
        let chain = match self.manager.create_chain(
            &group,
            "update catalogs",
            Box::new(move |_| {
                this.manager
                    .create_completed(Arc::new(updated), "updated catalog list")
            }),
        ) {
            Ok(c) => c,
            Err(e) => {
                group.release();
                return self
                    .manager
                    .create_failed(AtlasError::Operation(e), "update catalogs");
            }
        };
        group.release();
        if auto_release {
            chain.mark_auto_release();
        }
        chain
    }
}
