//! # atlas_core - Resource runtime core
//!
//! Core building blocks of the Atlas content runtime:
//! - Symbolic keys and merge modes
//! - Resource locations with dependency graphs
//! - Locators mapping keys to locations
//! - Ref-counted handles over a pooled operation arena
//! - The cooperative operation graph (chain/group/provider operations)
//!
//! ## Example
//!
//! ```ignore
//! use atlas_core::prelude::*;
//!
//! let mgr = ResourceManager::new();
//! let handle = mgr.create_completed(std::sync::Arc::new(42i32), "answer");
//!
//! // drive the graph once per frame
//! mgr.update();
//!
//! assert_eq!(handle.status(), OperationStatus::Succeeded);
//! handle.release();
//! ```

pub mod chain;
pub mod error;
pub mod group;
pub mod handle;
pub mod key;
pub mod location;
pub mod locator;
pub mod manager;
pub mod operation;
pub mod provider;

pub use error::{AtlasError, CacheError, FetchError, InvalidKeyError, OperationError, ProviderError};
pub use group::GroupResults;
pub use handle::{Handle, OpHandle, WaitResult};
pub use key::{MergeMode, ResourceKey};
pub use location::{LocationData, LocationIdentity, ProviderId, ResourceLocation, ResourceType};
pub use locator::{CatalogProvenance, LocationMap, Locator};
pub use manager::{
    ChainContinuation, CompletionCallback, ExceptionHook, OpContext, OpId, ResourceManager,
};
pub use operation::{OpPoll, Operation, OperationStatus, ResourceValue};
pub use provider::{JobPoll, ProvideJob, Provider, ProviderRegistry};

/// Prelude - commonly used types
pub mod prelude {
    pub use crate::error::AtlasError;
    pub use crate::handle::{Handle, OpHandle, WaitResult};
    pub use crate::key::{MergeMode, ResourceKey};
    pub use crate::location::{LocationData, ProviderId, ResourceLocation, ResourceType};
    pub use crate::locator::{LocationMap, Locator};
    pub use crate::manager::ResourceManager;
    pub use crate::operation::OperationStatus;
    pub use crate::provider::{Provider, ProviderRegistry};
}
