//! # atlas_provider - Providers, transport, and request queueing
//!
//! The I/O-facing layer of the Atlas runtime:
//! - Pluggable transport abstraction (in-memory and worker-thread
//!   implementations included)
//! - Bounded FIFO request queue, owned per runtime instance
//! - Bundle provider with retry policy and on-disk bundle cache
//! - Binary, text, and bundled-asset providers
//!
//! Providers never block: they hand out jobs that the operation graph
//! polls once per tick, and I/O completion is observed by the next poll.

pub mod asset;
pub mod bundle;
pub mod queue;
pub mod text;
pub mod transport;

pub use asset::{BundledAssetProvider, LoadedAsset};
pub use bundle::{BundleCache, BundleData, BundleNaming, BundleProvider, CachedBundle, RetryFilter};
pub use queue::{QueueSlot, RequestQueue};
pub use text::{BinaryProvider, TextProvider};
pub use transport::{FetchPoll, FetchRequest, IoFn, MemoryTransport, TicketId, Transport, WorkerTransport};
