//! Relational seam of the sync engine.
//!
//! `Store` is the collaborator boundary the apply pipeline writes through:
//! a streaming (id, fingerprint) reader plus batched create/update/delete
//! writers. `PgStore` is the Postgres implementation; `MemoryStore` backs
//! tests and records the write traffic it receives.
use async_trait::async_trait;
use sift_common::{Entity, KeyedChecksum, SyncSubject};
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub mod memory;
pub mod postgres;

pub use memory::{MemoryStore, WriteOp};
pub use postgres::PgStore;

/// Rows buffered per write statement. Batches near this size keep one
/// round-trip's statement under common server packet limits.
pub const DEFAULT_WRITE_BATCH: usize = 500;

pub(crate) const QUEUE_DEPTH: usize = 1024;

#[async_trait]
pub trait Store: Debug + Send + Sync {
    /// Stream the (id, fingerprint) pairs of every row the store holds for
    /// `subject`. Finite, not restartable, unordered; an error terminates
    /// the data stream.
    fn yield_all(
        &self,
        subject: &Arc<SyncSubject>,
        cancel: CancellationToken,
    ) -> (mpsc::Receiver<KeyedChecksum>, mpsc::Receiver<StoreError>);

    /// Insert every entity from the stream, overwriting rows that already
    /// exist so re-runs converge.
    async fn create_streamed(
        &self,
        entities: mpsc::Receiver<Box<dyn Entity>>,
        cancel: CancellationToken,
    ) -> Result<(), StoreError>;

    /// Update every entity from the stream by id. Rows that no longer
    /// exist are left alone.
    async fn update_streamed(
        &self,
        entities: mpsc::Receiver<Box<dyn Entity>>,
        cancel: CancellationToken,
    ) -> Result<(), StoreError>;

    /// Delete the given ids from the subject's table.
    async fn delete(
        &self,
        subject: &Arc<SyncSubject>,
        ids: Vec<String>,
        cancel: CancellationToken,
    ) -> Result<(), StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database: {0}")]
    Backend(String),

    #[error("database: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("store operation cancelled")]
    Cancelled,
}

/// Pull up to `limit` entities off the stream, honoring cancellation.
/// Returns `None` once the stream is exhausted.
pub(crate) async fn next_batch(
    entities: &mut mpsc::Receiver<Box<dyn Entity>>,
    limit: usize,
    cancel: &CancellationToken,
) -> Result<Option<Vec<Box<dyn Entity>>>, StoreError> {
    let mut batch = Vec::new();
    while batch.len() < limit {
        let next = tokio::select! {
            _ = cancel.cancelled() => return Err(StoreError::Cancelled),
            next = entities.recv() => next,
        };
        match next {
            Some(entity) => batch.push(entity),
            None => break,
        }
    }
    if batch.is_empty() {
        Ok(None)
    } else {
        Ok(Some(batch))
    }
}
