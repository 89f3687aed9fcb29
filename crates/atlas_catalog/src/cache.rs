//! Catalog disk cache
//!
//! Stores `{stable}.json` / `{stable}.hash` pairs in one cache directory.
//! The stable key is derived from the remote hash-path (content hash of
//! the full path plus its original extension), so catalogs with identical
//! filenames under different folders never collide.

use std::path::{Path, PathBuf};

use atlas_core::CacheError;

/// Stable cache key for a remote hash path.
pub fn stable_key(hash_path: &str) -> String {
    let digest = blake3::hash(hash_path.as_bytes()).to_hex();
    let extension = Path::new(hash_path)
        .extension()
        .map(|e| e.to_string_lossy().to_string())
        .unwrap_or_else(|| "hash".to_string());
    format!("{}_{}", &digest.as_str()[..16], extension)
}

/// On-disk cache for catalog bodies and their hashes.
pub struct CatalogCache {
    root: Option<PathBuf>,
}

impl CatalogCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    /// A cache that stores nothing; every catalog load fetches fresh.
    pub fn disabled() -> Self {
        Self { root: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.root.is_some()
    }

    fn body_path(root: &Path, key: &str) -> PathBuf {
        root.join(format!("{key}.json"))
    }

    fn hash_file_path(root: &Path, key: &str) -> PathBuf {
        root.join(format!("{key}.hash"))
    }

    /// The hash the cached body was written under, if any.
    pub fn cached_hash(&self, key: &str) -> Option<String> {
        let root = self.root.as_ref()?;
        std::fs::read_to_string(Self::hash_file_path(root, key))
            .ok()
            .map(|s| s.trim().to_string())
    }

    pub fn cached_body(&self, key: &str) -> Option<Vec<u8>> {
        let root = self.root.as_ref()?;
        std::fs::read(Self::body_path(root, key)).ok()
    }

    /// Write a body and its hash together.
    pub fn store(&self, key: &str, hash: &str, body: &[u8]) -> Result<(), CacheError> {
        let Some(root) = &self.root else {
            return Ok(());
        };
        std::fs::create_dir_all(root)?;
        std::fs::write(Self::body_path(root, key), body)?;
        std::fs::write(Self::hash_file_path(root, key), hash)?;
        Ok(())
    }

    /// Remove a cached pair; returns whether anything existed.
    pub fn remove(&self, key: &str) -> Result<bool, CacheError> {
        let Some(root) = &self.root else {
            return Ok(false);
        };
        let mut removed = false;
        for path in [Self::body_path(root, key), Self::hash_file_path(root, key)] {
            if path.is_file() {
                std::fs::remove_file(path)?;
                removed = true;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_key_disambiguates_folders() {
        let a = stable_key("remote/a/catalog.hash");
        let b = stable_key("remote/b/catalog.hash");
        assert_ne!(a, b);
        assert!(a.ends_with("_hash"));
    }

    #[test]
    fn test_stable_key_is_stable() {
        assert_eq!(stable_key("remote/catalog.hash"), stable_key("remote/catalog.hash"));
    }

    #[test]
    fn test_store_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CatalogCache::new(dir.path());
        let key = stable_key("remote/catalog.hash");

        assert!(cache.cached_hash(&key).is_none());
        cache.store(&key, "abc123", b"{\"locatorId\":\"main\"}").unwrap();

        assert_eq!(cache.cached_hash(&key).as_deref(), Some("abc123"));
        assert_eq!(cache.cached_body(&key).unwrap(), b"{\"locatorId\":\"main\"}");

        cache.store(&key, "def456", b"{}").unwrap();
        assert_eq!(cache.cached_hash(&key).as_deref(), Some("def456"));
    }

    #[test]
    fn test_disabled_cache_stores_nothing() {
        let cache = CatalogCache::disabled();
        let key = stable_key("remote/catalog.hash");
        cache.store(&key, "abc", b"body").unwrap();
        assert!(cache.cached_hash(&key).is_none());
        assert!(cache.cached_body(&key).is_none());
    }
}
