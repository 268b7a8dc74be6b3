//! Chunked download-and-cache engine for media fetched over HTTP.
//!
//! [`DownloadRegistry`] is the entry point: it keeps at most one transfer per URL, fans
//! lifecycle events out to every caller interested in that URL, and hands the actual work
//! to a [`DownloadCoordinator`], which probes the origin for range support, downloads the
//! resource as one stream or as several concurrent byte ranges, and merges the ranges into
//! a single verified cache file.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod event;
pub mod fetcher;
pub mod hashing;
pub mod key;
pub mod merger;
pub mod plan;
pub mod pool;
pub mod probe;
pub mod registry;
pub mod request;
pub mod state;
pub mod store;
pub mod utils;
pub mod writer;

pub use config::EngineConfig;
pub use coordinator::{ChunkResult, DownloadCoordinator};
pub use error::{EnqueueError, FailureKind, MergeError, TransferError};
pub use event::{subscriber, DownloadEvent, DownloadOutcome, Subscriber};
pub use key::DownloadKey;
pub use plan::{ChunkPlan, ChunkRange, MIN_CHUNK_SIZE};
pub use probe::{CapabilityProbe, CapabilityVerdict};
pub use registry::{DownloadRegistry, EnqueueOptions, Enqueued};
pub use request::{DownloadHandle, ExtraInfo};
pub use state::CoordinatorState;
pub use store::{CacheStore, DirCacheStore, FileStore, LocalFileStore};
