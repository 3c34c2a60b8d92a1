use crate::{DEFAULT_WRITE_BATCH, QUEUE_DEPTH, Store, StoreError, next_batch};
use async_trait::async_trait;
use sift_common::{Checksum, Entity, FieldValue, KeyedChecksum, SyncSubject};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;

/// In-memory store keyed table → id → row.
///
/// Applies the same batching discipline as the Postgres implementation and
/// records every write operation it receives, so tests can assert on the
/// traffic as well as the end state.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    tables: RwLock<HashMap<String, BTreeMap<String, StoredRow>>>,
    ops: Mutex<Vec<WriteOp>>,
    write_batch: Option<usize>,
}

#[derive(Debug, Clone)]
struct StoredRow {
    fingerprint: Option<Checksum>,
    values: Vec<FieldValue>,
}

/// One batch of writes as the store observed it.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Create(Vec<String>),
    Update(Vec<String>),
    Delete(Vec<String>),
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_write_batch(write_batch: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                write_batch: Some(write_batch),
                ..Inner::default()
            }),
        }
    }

    fn write_batch(&self) -> usize {
        self.inner.write_batch.unwrap_or(DEFAULT_WRITE_BATCH)
    }

    /// Seed one row directly, bypassing the write path.
    pub async fn seed_row(&self, table: &str, id: &str, fingerprint: Option<Checksum>) {
        self.inner
            .tables
            .write()
            .await
            .entry(table.to_string())
            .or_default()
            .insert(
                id.to_string(),
                StoredRow {
                    fingerprint,
                    values: Vec::new(),
                },
            );
    }

    pub async fn ids(&self, table: &str) -> Vec<String> {
        self.inner
            .tables
            .read()
            .await
            .get(table)
            .map(|rows| rows.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn fingerprint(&self, table: &str, id: &str) -> Option<Checksum> {
        self.inner
            .tables
            .read()
            .await
            .get(table)
            .and_then(|rows| rows.get(id))
            .and_then(|row| row.fingerprint.clone())
    }

    pub async fn values(&self, table: &str, id: &str) -> Option<Vec<FieldValue>> {
        self.inner
            .tables
            .read()
            .await
            .get(table)
            .and_then(|rows| rows.get(id))
            .map(|row| row.values.clone())
    }

    /// Every write batch observed so far, in arrival order.
    pub fn operations(&self) -> Vec<WriteOp> {
        self.inner.ops.lock().expect("ops lock").clone()
    }

    fn record(&self, op: WriteOp) {
        self.inner.ops.lock().expect("ops lock").push(op);
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn yield_all(
        &self,
        subject: &Arc<SyncSubject>,
        cancel: CancellationToken,
    ) -> (mpsc::Receiver<KeyedChecksum>, mpsc::Receiver<StoreError>) {
        let (out_tx, out_rx) = mpsc::channel(QUEUE_DEPTH);
        let (err_tx, err_rx) = mpsc::channel(1);
        let inner = Arc::clone(&self.inner);
        let table = subject.new_shell("").table();

        tokio::spawn(async move {
            // Only the compact pairs are snapshotted; payload-sized data
            // never sits in this task.
            let pairs: Vec<KeyedChecksum> = {
                let guard = inner.tables.read().await;
                guard
                    .get(table)
                    .map(|rows| {
                        rows.iter()
                            .map(|(id, row)| KeyedChecksum::new(id.clone(), row.fingerprint.clone()))
                            .collect()
                    })
                    .unwrap_or_default()
            };
            for pair in pairs {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = err_tx.try_send(StoreError::Cancelled);
                        return;
                    }
                    sent = out_tx.send(pair) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        (out_rx, err_rx)
    }

    async fn create_streamed(
        &self,
        mut entities: mpsc::Receiver<Box<dyn Entity>>,
        cancel: CancellationToken,
    ) -> Result<(), StoreError> {
        while let Some(batch) = next_batch(&mut entities, self.write_batch(), &cancel).await? {
            let ids: Vec<String> = batch.iter().map(|entity| entity.id().to_string()).collect();
            let mut guard = self.inner.tables.write().await;
            for entity in batch {
                guard.entry(entity.table().to_string()).or_default().insert(
                    entity.id().to_string(),
                    StoredRow {
                        fingerprint: entity.fingerprint().cloned(),
                        values: entity.values(),
                    },
                );
            }
            drop(guard);
            self.record(WriteOp::Create(ids));
        }
        Ok(())
    }

    async fn update_streamed(
        &self,
        mut entities: mpsc::Receiver<Box<dyn Entity>>,
        cancel: CancellationToken,
    ) -> Result<(), StoreError> {
        while let Some(batch) = next_batch(&mut entities, self.write_batch(), &cancel).await? {
            let ids: Vec<String> = batch.iter().map(|entity| entity.id().to_string()).collect();
            let mut guard = self.inner.tables.write().await;
            for entity in batch {
                if let Some(row) = guard
                    .get_mut(entity.table())
                    .and_then(|rows| rows.get_mut(entity.id()))
                {
                    row.fingerprint = entity.fingerprint().cloned();
                    row.values = entity.values();
                }
            }
            drop(guard);
            self.record(WriteOp::Update(ids));
        }
        Ok(())
    }

    async fn delete(
        &self,
        subject: &Arc<SyncSubject>,
        ids: Vec<String>,
        cancel: CancellationToken,
    ) -> Result<(), StoreError> {
        let table = subject.new_shell("").table();
        for chunk in ids.chunks(self.write_batch().max(1)) {
            if cancel.is_cancelled() {
                return Err(StoreError::Cancelled);
            }
            let mut guard = self.inner.tables.write().await;
            if let Some(rows) = guard.get_mut(table) {
                for id in chunk {
                    rows.remove(id);
                }
            }
            drop(guard);
            self.record(WriteOp::Delete(chunk.to_vec()));
        }
        Ok(())
    }
}
