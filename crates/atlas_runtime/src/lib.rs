//! # atlas_runtime - The Atlas content runtime facade
//!
//! Ties the operation graph, locators, providers, and caches into one
//! runtime instance:
//! - Key resolution with merge-mode set algebra and composed diagnostics
//! - Shared provide-operations with explicit reference counting
//! - Catalog loading, update checking, and in-place locator swaps
//! - Download-size accounting and bundle-cache cleanup
//! - Scene and instance lifecycle tracking
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use atlas_runtime::prelude::*;
//!
//! let transport = Arc::new(MemoryTransport::new());
//! let atlas = Atlas::new(transport, AtlasConfig::default());
//!
//! let catalog = atlas.load_content_catalog("remote/catalog.json", true);
//! catalog.wait_for_completion();
//!
//! let handle = atlas.load_asset(&ResourceKey::address("hero"), None);
//! // drive once per frame
//! atlas.update();
//! ```

pub mod atlas;
pub mod config;
pub mod download;
pub mod resolve;
pub mod scene;

pub use atlas::{Atlas, TrackedCatalog};
pub use config::AtlasConfig;
pub use resolve::{resolve_key, resolve_keys};
pub use scene::{
    InstanceData, LoadSceneMode, SceneInstance, UnloadSceneOptions, SCENE_ACTIVATION_CHECKPOINT,
};

/// Prelude - commonly used types
pub mod prelude {
    pub use crate::atlas::Atlas;
    pub use crate::config::AtlasConfig;
    pub use crate::scene::{LoadSceneMode, UnloadSceneOptions};
    pub use atlas_core::prelude::*;
    pub use atlas_provider::MemoryTransport;
}
