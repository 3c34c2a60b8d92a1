//! The delta-and-apply engine.
//!
//! For each sync subject the engine concurrently enumerates the desired
//! state (cache) and the actual state (database), partitions the keys into
//! create/update/delete, and applies the partitions with bounded fan-out
//! under one cancellable scope. The first error from any stage cancels the
//! scope; re-running a failed sync converges, so nothing is rolled back.
use sift_cache::CacheError;
use sift_store::StoreError;

pub mod config;
pub mod delta;
pub mod scope;
pub mod signals;
pub mod sync;

pub use config::SyncConfig;
pub use delta::Delta;
pub use scope::TaskScope;
pub use signals::DumpSignals;
pub use sync::Syncer;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The enclosing scope was cancelled before the sync finished.
    #[error("sync cancelled")]
    Cancelled,

    #[error(transparent)]
    Cache(CacheError),

    #[error(transparent)]
    Store(StoreError),
}

impl From<CacheError> for SyncError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::Cancelled => Self::Cancelled,
            other => Self::Cache(other),
        }
    }
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Cancelled => Self::Cancelled,
            other => Self::Store(other),
        }
    }
}
