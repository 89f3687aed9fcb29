//! Bundle provider and on-disk bundle cache
//!
//! Bundles are the downloadable, cacheable unit of content. The cache
//! stores one file per `(bundle_name, hash)` version; a bundle is cached
//! iff a matching pair exists on disk. The provider serves cached
//! versions without touching the transport, downloads and write-through
//! caches the rest, and applies the location's retry budget to
//! recoverable download errors.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use atlas_core::{
    CacheError, FetchError, JobPoll, LocationData, ProvideJob, Provider, ProviderError,
    ProviderId, ResourceLocation, ResourceValue,
};

use crate::queue::{QueueSlot, RequestQueue};
use crate::transport::{FetchPoll, FetchRequest, TicketId, Transport};

/// One cached bundle version.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CachedBundle {
    pub bundle_name: String,
    pub hash: String,
}

/// On-disk bundle cache: `<root>/<bundle_name>/<hash>.bundle`.
///
/// All mutation goes through the accounting and cleanup paths; nothing
/// else deletes cache files.
pub struct BundleCache {
    root: Option<PathBuf>,
}

impl BundleCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    /// A cache that stores nothing; maintenance operations report
    /// `CachingDisabled`.
    pub fn disabled() -> Self {
        Self { root: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.root.is_some()
    }

    fn version_path(root: &Path, name: &str, hash: &str) -> PathBuf {
        root.join(name).join(format!("{hash}.bundle"))
    }

    pub fn is_cached(&self, name: &str, hash: &str) -> bool {
        match &self.root {
            Some(root) => Self::version_path(root, name, hash).is_file(),
            None => false,
        }
    }

    /// Store a downloaded bundle version. A disabled cache ignores the
    /// write.
    pub fn write(&self, name: &str, hash: &str, bytes: &[u8]) -> Result<(), CacheError> {
        let Some(root) = &self.root else {
            return Ok(());
        };
        let path = Self::version_path(root, name, hash);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(path, bytes)?;
        Ok(())
    }

    pub fn read(&self, name: &str, hash: &str) -> Result<Vec<u8>, CacheError> {
        let Some(root) = &self.root else {
            return Err(CacheError::CachingDisabled);
        };
        Ok(std::fs::read(Self::version_path(root, name, hash))?)
    }

    /// Remove one cached version; returns whether it existed.
    pub fn remove_version(&self, name: &str, hash: &str) -> Result<bool, CacheError> {
        let Some(root) = &self.root else {
            return Err(CacheError::CachingDisabled);
        };
        let path = Self::version_path(root, name, hash);
        if !path.is_file() {
            return Ok(false);
        }
        std::fs::remove_file(&path)?;
        if let Some(dir) = path.parent() {
            // drop the bundle directory once its last version is gone
            if std::fs::read_dir(dir)?.next().is_none() {
                std::fs::remove_dir(dir)?;
            }
        }
        Ok(true)
    }

    /// Every cached `(bundle_name, hash)` pair.
    pub fn list(&self) -> Result<Vec<CachedBundle>, CacheError> {
        let Some(root) = &self.root else {
            return Err(CacheError::CachingDisabled);
        };
        let mut out = Vec::new();
        let entries = match std::fs::read_dir(root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let bundle_name = entry.file_name().to_string_lossy().to_string();
            for version in std::fs::read_dir(entry.path())? {
                let version = version?;
                let file_name = version.file_name().to_string_lossy().to_string();
                if let Some(hash) = file_name.strip_suffix(".bundle") {
                    out.push(CachedBundle {
                        bundle_name: bundle_name.clone(),
                        hash: hash.to_string(),
                    });
                }
            }
        }
        Ok(out)
    }

    /// Remove every cached version not in `keep`; returns what was
    /// removed.
    pub fn retain(&self, keep: &HashSet<CachedBundle>) -> Result<Vec<CachedBundle>, CacheError> {
        let mut removed = Vec::new();
        for cached in self.list()? {
            if !keep.contains(&cached) {
                self.remove_version(&cached.bundle_name, &cached.hash)?;
                removed.push(cached);
            }
        }
        Ok(removed)
    }

    /// Remove everything; returns the number of versions removed.
    pub fn clear(&self) -> Result<usize, CacheError> {
        let all = self.list()?;
        for cached in &all {
            self.remove_version(&cached.bundle_name, &cached.hash)?;
        }
        Ok(all.len())
    }
}

/// Artifact produced by the bundle provider.
#[derive(Debug)]
pub struct BundleData {
    pub bundle_name: String,
    pub bytes: Vec<u8>,
    /// Whether this load was served from the on-disk cache
    pub from_cache: bool,
}

/// Hook deciding whether a recoverable download error is worth retrying.
pub type RetryFilter = Arc<dyn Fn(&FetchError) -> bool + Send + Sync>;

/// Naming strategy for cache entries. Affects cache-key derivation only.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BundleNaming {
    /// Cache under the declared bundle name
    #[default]
    Declared,
    /// Cache under the declared name plus a hash prefix, keeping versions
    /// of renamed-but-identical bundles apart
    AppendHash,
}

impl BundleNaming {
    pub fn cache_name(self, bundle_name: &str, hash: &str) -> String {
        match self {
            Self::Declared => bundle_name.to_string(),
            Self::AppendHash => {
                let prefix = &hash[..hash.len().min(8)];
                format!("{bundle_name}@{prefix}")
            }
        }
    }
}

/// Downloads bundles through the shared transport, gated by the request
/// queue, with per-location retry budgets and write-through caching.
pub struct BundleProvider {
    transport: Arc<dyn Transport>,
    queue: Arc<RequestQueue>,
    cache: Arc<BundleCache>,
    timeout: Option<Duration>,
    retry_filter: RetryFilter,
    default_retry_count: u32,
    force_queue: bool,
    naming: BundleNaming,
}

impl BundleProvider {
    pub fn new(
        transport: Arc<dyn Transport>,
        queue: Arc<RequestQueue>,
        cache: Arc<BundleCache>,
    ) -> Self {
        Self {
            transport,
            queue,
            cache,
            timeout: None,
            retry_filter: Arc::new(FetchError::is_recoverable),
            default_retry_count: 0,
            force_queue: false,
            naming: BundleNaming::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Retry budget applied to locations that declare none.
    pub fn with_default_retries(mut self, retry_count: u32) -> Self {
        self.default_retry_count = retry_count;
        self
    }

    /// Route every fetch through the request queue, even for locations
    /// that opted out (forced queued local loads).
    pub fn with_forced_queue(mut self, force: bool) -> Self {
        self.force_queue = force;
        self
    }

    pub fn with_naming(mut self, naming: BundleNaming) -> Self {
        self.naming = naming;
        self
    }

    /// Replace the retry decision hook. When the hook refuses an error,
    /// retries are skipped even with budget left and the failure is
    /// reported as retry-blocked.
    pub fn with_retry_filter(mut self, filter: RetryFilter) -> Self {
        self.retry_filter = filter;
        self
    }

    fn begin_cached(
        &self,
        data: &LocationData,
        cache_name: &str,
        hash: &str,
    ) -> Result<Box<dyn ProvideJob>, ProviderError> {
        match self.cache.read(cache_name, hash) {
            Ok(bytes) => {
                if data.size > 0 && bytes.len() as u64 != data.size {
                    let _ = self.cache.remove_version(cache_name, hash);
                    log::warn!(
                        "cached bundle '{}' has size {} (expected {}); entry removed",
                        data.bundle_name,
                        bytes.len(),
                        data.size
                    );
                    return Err(ProviderError::CorruptCachedBundle {
                        bundle: data.bundle_name.clone(),
                        reason: format!("size {} does not match expected {}", bytes.len(), data.size),
                    });
                }
                let value: ResourceValue = Arc::new(BundleData {
                    bundle_name: data.bundle_name.clone(),
                    bytes,
                    from_cache: true,
                });
                Ok(Box::new(ReadyJob { value: Some(value) }))
            }
            Err(e) => {
                let _ = self.cache.remove_version(cache_name, hash);
                Err(ProviderError::CorruptCachedBundle {
                    bundle: data.bundle_name.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }
}

impl Provider for BundleProvider {
    fn provider_id(&self) -> ProviderId {
        ProviderId::Bundle
    }

    fn begin(
        &self,
        location: &Arc<ResourceLocation>,
        _deps: &[ResourceValue],
    ) -> Result<Box<dyn ProvideJob>, ProviderError> {
        let mut data = location
            .data
            .clone()
            .ok_or_else(|| ProviderError::MissingBundleData(location.primary_key.clone()))?;
        data.retry_count = data.retry_count.max(self.default_retry_count);

        let cache_name = data
            .hash
            .as_ref()
            .map(|hash| self.naming.cache_name(&data.bundle_name, hash));
        if let (Some(hash), Some(name)) = (data.hash.clone(), cache_name.clone()) {
            if self.cache.is_cached(&name, &hash) {
                return self.begin_cached(&data, &name, &hash);
            }
        }

        let slot = if data.use_request_queue || self.force_queue {
            Some(self.queue.enqueue())
        } else {
            None
        };
        Ok(Box::new(BundleJob {
            transport: self.transport.clone(),
            cache: self.cache.clone(),
            retry_filter: self.retry_filter.clone(),
            path: location.internal_id.clone(),
            cache_name,
            data,
            timeout: self.timeout,
            attempts: 0,
            state: BundleState::Queued(slot),
        }))
    }
}

/// Job that already holds its artifact (cached fast path).
struct ReadyJob {
    value: Option<ResourceValue>,
}

impl ProvideJob for ReadyJob {
    fn poll(&mut self) -> JobPoll {
        match self.value.take() {
            Some(value) => JobPoll::Ready(value),
            None => JobPoll::Failed(ProviderError::Fetch {
                path: String::new(),
                source: FetchError::Read("job already finished".to_string()),
            }),
        }
    }
}

enum BundleState {
    /// Waiting for queue admission; `None` means the fetch is ungated
    Queued(Option<QueueSlot>),
    Fetching {
        ticket: TicketId,
        slot: Option<QueueSlot>,
    },
    Finished,
}

struct BundleJob {
    transport: Arc<dyn Transport>,
    cache: Arc<BundleCache>,
    retry_filter: RetryFilter,
    path: String,
    /// Cache entry name per the naming strategy; `None` when the location
    /// carries no hash and can never be cached
    cache_name: Option<String>,
    data: LocationData,
    timeout: Option<Duration>,
    attempts: u32,
    state: BundleState,
}

enum RetryDecision {
    Retry,
    Terminal(ProviderError),
}

impl BundleJob {
    fn classify_failure(&self, error: FetchError) -> RetryDecision {
        if self.data.retry_count == 0 {
            // no retry configured: report the raw error directly
            return RetryDecision::Terminal(ProviderError::Fetch {
                path: self.path.clone(),
                source: error,
            });
        }
        if !(self.retry_filter)(&error) {
            return RetryDecision::Terminal(ProviderError::RetryBlocked {
                path: self.path.clone(),
                retry_count: self.data.retry_count,
                source: error,
            });
        }
        if self.attempts <= self.data.retry_count {
            log::warn!(
                "download of '{}' failed ({}); retrying (attempt {}/{})",
                self.path,
                error,
                self.attempts,
                self.data.retry_count + 1
            );
            return RetryDecision::Retry;
        }
        RetryDecision::Terminal(ProviderError::RetriesExhausted {
            path: self.path.clone(),
            attempts: self.attempts,
            source: error,
        })
    }
}

impl ProvideJob for BundleJob {
    fn poll(&mut self) -> JobPoll {
        loop {
            match std::mem::replace(&mut self.state, BundleState::Finished) {
                BundleState::Queued(slot) => {
                    if let Some(s) = &slot {
                        if !s.ready() {
                            self.state = BundleState::Queued(slot);
                            return JobPoll::Pending(0.0);
                        }
                    }
                    self.attempts += 1;
                    let ticket = self.transport.begin(
                        FetchRequest::new(self.path.clone()).with_timeout(self.timeout),
                    );
                    self.state = BundleState::Fetching { ticket, slot };
                }
                BundleState::Fetching { ticket, slot } => {
                    match self.transport.poll(ticket) {
                        FetchPoll::Pending(p) => {
                            self.state = BundleState::Fetching { ticket, slot };
                            return JobPoll::Pending(p);
                        }
                        FetchPoll::Done(bytes) => {
                            if let (Some(hash), Some(name)) = (&self.data.hash, &self.cache_name) {
                                if let Err(e) = self.cache.write(name, hash, &bytes) {
                                    log::warn!(
                                        "failed to cache bundle '{}': {}",
                                        self.data.bundle_name,
                                        e
                                    );
                                }
                            }
                            return JobPoll::Ready(Arc::new(BundleData {
                                bundle_name: self.data.bundle_name.clone(),
                                bytes,
                                from_cache: false,
                            }));
                        }
                        FetchPoll::Failed(error) => match self.classify_failure(error) {
                            RetryDecision::Terminal(e) => return JobPoll::Failed(e),
                            RetryDecision::Retry => {
                                self.state = BundleState::Queued(slot);
                            }
                        },
                    }
                }
                BundleState::Finished => {
                    return JobPoll::Failed(ProviderError::Fetch {
                        path: self.path.clone(),
                        source: FetchError::Read("job already finished".to_string()),
                    });
                }
            }
        }
    }
}

impl Drop for BundleJob {
    fn drop(&mut self) {
        if let BundleState::Fetching { ticket, .. } = &self.state {
            self.transport.cancel(*ticket);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atlas_core::ResourceType;
    use crate::transport::MemoryTransport;

    fn bundle_location(name: &str, hash: Option<&str>, size: u64, retries: u32) -> Arc<ResourceLocation> {
        let data = LocationData {
            bundle_name: name.to_string(),
            hash: hash.map(|h| h.to_string()),
            size,
            retry_count: retries,
            use_request_queue: true,
        };
        Arc::new(
            ResourceLocation::new(
                name,
                format!("remote/{name}"),
                ProviderId::Bundle,
                ResourceType::Bundle,
            )
            .with_data(data),
        )
    }

    fn drive(job: &mut Box<dyn ProvideJob>) -> JobPoll {
        for _ in 0..1000 {
            match job.poll() {
                JobPoll::Pending(_) => continue,
                other => return other,
            }
        }
        panic!("job did not finish");
    }

    fn setup(dir: &Path) -> (Arc<MemoryTransport>, BundleProvider, Arc<BundleCache>) {
        let transport = Arc::new(MemoryTransport::new());
        let cache = Arc::new(BundleCache::new(dir));
        let provider = BundleProvider::new(
            transport.clone(),
            RequestQueue::new(4),
            cache.clone(),
        );
        (transport, provider, cache)
    }

    #[test]
    fn test_download_writes_cache() {
        let dir = tempfile::tempdir().unwrap();
        let (transport, provider, cache) = setup(dir.path());
        transport.insert("remote/bundle_x", vec![1, 2, 3]);

        let loc = bundle_location("bundle_x", Some("h1"), 3, 0);
        let mut job = provider.begin(&loc, &[]).unwrap();
        match drive(&mut job) {
            JobPoll::Ready(v) => {
                let bundle = v.downcast::<BundleData>().unwrap();
                assert!(!bundle.from_cache);
                assert_eq!(bundle.bytes, vec![1, 2, 3]);
            }
            _ => panic!("expected success"),
        }
        assert!(cache.is_cached("bundle_x", "h1"));
    }

    #[test]
    fn test_cached_bundle_skips_transport() {
        let dir = tempfile::tempdir().unwrap();
        let (transport, provider, cache) = setup(dir.path());
        cache.write("bundle_x", "h1", &[9, 9, 9]).unwrap();
        // nothing registered on the transport: a fetch would fail

        let loc = bundle_location("bundle_x", Some("h1"), 3, 0);
        let mut job = provider.begin(&loc, &[]).unwrap();
        match drive(&mut job) {
            JobPoll::Ready(v) => {
                let bundle = v.downcast::<BundleData>().unwrap();
                assert!(bundle.from_cache);
            }
            _ => panic!("expected cached success"),
        }
        assert_eq!(transport.begin_count("remote/bundle_x"), 0);
    }

    #[test]
    fn test_corrupt_cached_bundle_removed_before_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (_transport, provider, cache) = setup(dir.path());
        // wrong size on disk
        cache.write("bundle_x", "h1", &[1]).unwrap();

        let loc = bundle_location("bundle_x", Some("h1"), 3, 0);
        let err = provider.begin(&loc, &[]).err().unwrap();
        assert!(matches!(err, ProviderError::CorruptCachedBundle { .. }));
        // the wedged entry is gone; the next attempt can re-download
        assert!(!cache.is_cached("bundle_x", "h1"));
    }

    #[test]
    fn test_retry_count_zero_is_single_attempt_raw_error() {
        let dir = tempfile::tempdir().unwrap();
        let (transport, provider, _cache) = setup(dir.path());
        transport.insert("remote/bundle_x", vec![1, 2, 3]);
        transport.fail_next("remote/bundle_x", FetchError::Connection("reset".to_string()));

        let loc = bundle_location("bundle_x", Some("h1"), 3, 0);
        let mut job = provider.begin(&loc, &[]).unwrap();
        match drive(&mut job) {
            JobPoll::Failed(ProviderError::Fetch { source, .. }) => {
                assert!(matches!(source, FetchError::Connection(_)));
            }
            _ => panic!("expected raw fetch error"),
        }
        assert_eq!(transport.begin_count("remote/bundle_x"), 1);
    }

    #[test]
    fn test_nonretryable_error_with_budget_is_retry_blocked() {
        let dir = tempfile::tempdir().unwrap();
        let (transport, provider, _cache) = setup(dir.path());
        transport.fail_next("remote/bundle_x", FetchError::NotFound("remote/bundle_x".to_string()));

        let loc = bundle_location("bundle_x", Some("h1"), 3, 3);
        let mut job = provider.begin(&loc, &[]).unwrap();
        match drive(&mut job) {
            JobPoll::Failed(ProviderError::RetryBlocked { retry_count, .. }) => {
                assert_eq!(retry_count, 3);
            }
            _ => panic!("expected retry-blocked error"),
        }
        assert_eq!(transport.begin_count("remote/bundle_x"), 1);
    }

    #[test]
    fn test_recoverable_error_retries_until_success() {
        let dir = tempfile::tempdir().unwrap();
        let (transport, provider, _cache) = setup(dir.path());
        transport.insert("remote/bundle_x", vec![5]);
        transport.fail_next("remote/bundle_x", FetchError::Connection("reset".to_string()));

        let loc = bundle_location("bundle_x", Some("h1"), 1, 2);
        let mut job = provider.begin(&loc, &[]).unwrap();
        assert!(matches!(drive(&mut job), JobPoll::Ready(_)));
        assert_eq!(transport.begin_count("remote/bundle_x"), 2);
    }

    #[test]
    fn test_retries_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let (transport, provider, _cache) = setup(dir.path());
        for _ in 0..3 {
            transport.fail_next("remote/bundle_x", FetchError::Connection("reset".to_string()));
        }

        let loc = bundle_location("bundle_x", Some("h1"), 1, 2);
        let mut job = provider.begin(&loc, &[]).unwrap();
        match drive(&mut job) {
            JobPoll::Failed(ProviderError::RetriesExhausted { attempts, .. }) => {
                assert_eq!(attempts, 3);
            }
            _ => panic!("expected exhaustion"),
        }
        assert_eq!(transport.begin_count("remote/bundle_x"), 3);
    }

    #[test]
    fn test_cache_retain_removes_only_unreferenced() {
        let dir = tempfile::tempdir().unwrap();
        let cache = BundleCache::new(dir.path());
        cache.write("a", "h1", &[1]).unwrap();
        cache.write("a", "h2", &[2]).unwrap();
        cache.write("b", "h1", &[3]).unwrap();

        let keep: HashSet<CachedBundle> = [CachedBundle {
            bundle_name: "a".to_string(),
            hash: "h2".to_string(),
        }]
        .into_iter()
        .collect();
        let removed = cache.retain(&keep).unwrap();

        assert_eq!(removed.len(), 2);
        assert!(cache.is_cached("a", "h2"));
        assert!(!cache.is_cached("a", "h1"));
        assert!(!cache.is_cached("b", "h1"));
    }

    #[test]
    fn test_disabled_cache() {
        let cache = BundleCache::disabled();
        assert!(!cache.is_enabled());
        assert!(!cache.is_cached("a", "h"));
        assert!(cache.write("a", "h", &[1]).is_ok());
        assert!(matches!(cache.list(), Err(CacheError::CachingDisabled)));
    }

    #[test]
    fn test_bundle_naming_cache_keys() {
        assert_eq!(BundleNaming::Declared.cache_name("ui", "0123456789ab"), "ui");
        assert_eq!(
            BundleNaming::AppendHash.cache_name("ui", "0123456789ab"),
            "ui@01234567"
        );
        // short hashes are used whole
        assert_eq!(BundleNaming::AppendHash.cache_name("ui", "ab"), "ui@ab");
    }
}
