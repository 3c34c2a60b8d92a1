//! Cache seam and the streaming read side of the sync engine.
//!
//! `CacheApi` is the collaborator boundary: a hash-of-hashes key/value
//! store with paged scans and multi-field fetches. `CacheReader` turns that
//! seam into the bounded streams the delta and apply stages consume, and
//! the hydrator/binder pools materialize full entities for the keys that
//! actually need writing.
use async_trait::async_trait;
use bytes::Bytes;
use sift_common::DecodeError;
use std::fmt::Debug;

pub mod hydrate;
pub mod memory;
pub mod reader;

pub use hydrate::{create_entities, set_checksums};
pub use memory::MemoryCache;
pub use reader::CacheReader;

/// One raw (entity id, payload) pair fetched from the cache.
pub type RawEntity = (String, Bytes);

/// A page of (field, value) pairs plus the cursor for the next call.
/// A returned cursor of zero means the scan is complete.
pub type ScanPage = (u64, Vec<(String, Bytes)>);

pub(crate) const PAYLOAD_PREFIX: &str = "icinga:";
pub(crate) const CHECKSUM_PREFIX: &str = "icinga:checksum:";

// Page size for enumeration scans and the depth of every bounded stream
// the readers and worker pools hand out.
pub(crate) const SCAN_COUNT: usize = 4096;
pub(crate) const QUEUE_DEPTH: usize = 1024;

/// Top-level hash holding one JSON payload per entity id.
pub fn payload_key(subject_key: &str) -> String {
    format!("{PAYLOAD_PREFIX}{subject_key}")
}

/// Parallel enumeration hash holding one hex checksum per entity id.
pub fn checksum_key(subject_key: &str) -> String {
    format!("{CHECKSUM_PREFIX}{subject_key}")
}

/// Minimal client surface the readers need. Connection handling and command
/// encoding live behind this trait; implementations must be safe to share
/// across tasks.
#[async_trait]
pub trait CacheApi: Debug + Send + Sync {
    /// One page of (field, value) pairs from the hash at `key`, starting at
    /// `cursor` (zero starts a scan) and returning at most `count` pairs.
    async fn hscan(&self, key: &str, cursor: u64, count: usize) -> Result<ScanPage, CacheError>;

    /// Values for `fields` in the hash at `key`, in field order. Missing
    /// fields yield `None`.
    async fn hmget(&self, key: &str, fields: &[String]) -> Result<Vec<Option<Bytes>>, CacheError>;

    async fn hset(&self, key: &str, field: &str, value: Bytes) -> Result<(), CacheError>;

    async fn hdel(&self, key: &str, field: &str) -> Result<(), CacheError>;

    async fn hlen(&self, key: &str) -> Result<usize, CacheError>;
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache backend: {0}")]
    Backend(String),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("checksum text for {id}: {source}")]
    BadChecksum {
        id: String,
        #[source]
        source: hex::FromHexError,
    },

    /// A hydrated entity had no checksum in the delta partition.
    #[error("no checksum bound for {0}")]
    ChecksumMissing(String),

    /// A delta partition key had no payload in the cache.
    #[error("no cache payload for {0}")]
    PayloadMissing(String),

    #[error("cache read cancelled")]
    Cancelled,
}
