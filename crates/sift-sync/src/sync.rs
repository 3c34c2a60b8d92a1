//! Per-subject orchestration: wire the two enumeration streams into the
//! delta, then fan the partitions out to the cache hydration pipeline and
//! the batched store writers.
use crate::config::SYNC_QUEUE_DEPTH;
use crate::{Delta, DumpSignals, SyncConfig, SyncError, TaskScope};
use metrics::{counter, histogram};
use sift_cache::{CacheApi, CacheReader, create_entities, payload_key, set_checksums};
use sift_common::SyncSubject;
use sift_store::Store;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::time::interval_at;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Reconciles one subject at a time from the cache into the store.
///
/// Cheap to clone; the cache client and store handle are shared and never
/// mutated.
#[derive(Debug, Clone)]
pub struct Syncer {
    db: Arc<dyn Store>,
    cache: CacheReader,
    config: SyncConfig,
}

impl Syncer {
    pub fn new(db: Arc<dyn Store>, cache: Arc<dyn CacheApi>, config: SyncConfig) -> Self {
        Self {
            db,
            cache: CacheReader::new(cache),
            config,
        }
    }

    /// Wait for the subject's dump-done signal, then run `sync`. While
    /// parked, a periodic log line reports the subject and elapsed time.
    pub async fn sync_after_dump(
        &self,
        subject: &Arc<SyncSubject>,
        signals: &DumpSignals,
        cancel: CancellationToken,
    ) -> Result<(), SyncError> {
        let key = payload_key(subject.key());
        let started = Instant::now();
        let mut done = signals.done(&key);
        let mut ticker = interval_at(
            tokio::time::Instant::now() + self.config.progress_log_interval,
            self.config.progress_log_interval,
        );
        let mut logged_waiting = false;

        // The dump may have finished before anyone waited.
        if !*done.borrow_and_update() {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                    _ = ticker.tick() => {
                        info!(
                            subject = %subject.key(),
                            key = %key,
                            elapsed = ?started.elapsed(),
                            "waiting for dump done signal"
                        );
                        logged_waiting = true;
                    }
                    changed = done.changed() => {
                        if changed.is_err() {
                            return Err(SyncError::Cancelled);
                        }
                        if *done.borrow_and_update() {
                            break;
                        }
                    }
                }
            }
        }

        if logged_waiting {
            info!(subject = %subject.key(), key = %key, waited = ?started.elapsed(), "starting sync");
        } else {
            debug!(subject = %subject.key(), key = %key, waited = ?started.elapsed(), "starting sync");
        }
        self.sync(subject, cancel).await
    }

    /// Fully reconcile one subject. Returns when every partition has been
    /// applied or the first error has cancelled the scope.
    pub async fn sync(
        &self,
        subject: &Arc<SyncSubject>,
        cancel: CancellationToken,
    ) -> Result<(), SyncError> {
        info!(subject = %subject.key(), "syncing");
        let started = Instant::now();

        let mut scope = TaskScope::new(&cancel);
        let token = scope.token();

        let (desired, cache_errs) = self.cache.yield_all(subject, token.clone());
        scope.forward_errors(cache_errs);

        let (actual, store_errs) = self.db.yield_all(subject, token.clone());
        scope.forward_errors(store_errs);

        {
            let this = self.clone();
            let subject = Arc::clone(subject);
            let token = token.clone();
            scope.spawn(async move {
                let delta =
                    Delta::compute(Arc::clone(&subject), desired, actual, token.clone()).await?;
                this.apply_delta(delta, token).await
            });
        }

        let result = scope.wait().await;
        histogram!("sync_duration_seconds").record(started.elapsed().as_secs_f64());
        match &result {
            Ok(()) => debug!(subject = %subject.key(), elapsed = ?started.elapsed(), "sync finished"),
            Err(err) => warn!(subject = %subject.key(), elapsed = ?started.elapsed(), %err, "sync failed"),
        }
        result
    }

    /// Apply a computed delta: subtasks are launched only for non-empty
    /// partitions and run in parallel under one scope.
    pub async fn apply_delta(
        &self,
        delta: Delta,
        cancel: CancellationToken,
    ) -> Result<(), SyncError> {
        let mut scope = TaskScope::new(&cancel);
        let token = scope.token();
        let Delta {
            subject,
            create,
            update,
            delete,
        } = delta;
        let namespace = payload_key(subject.key());

        if !create.is_empty() {
            counter!("sync_rows_created").increment(create.len() as u64);
            debug!(subject = %subject.key(), rows = create.len(), "creating rows");

            let entities = if subject.with_checksum() {
                // Only the keys that need writing are rehydrated from the
                // cache; everything else never leaves (id, checksum) form.
                let keys: Vec<String> = create.keys().cloned().collect();
                let (pairs, errs) = self.cache.hm_yield(
                    namespace.clone(),
                    keys,
                    self.config.multi_fetch_batch_size,
                    self.config.multi_fetch_concurrency,
                    token.clone(),
                );
                scope.forward_errors(errs);

                let (hydrated, errs) = create_entities(
                    Arc::clone(&subject),
                    pairs,
                    self.config.hydrator_workers,
                    token.clone(),
                );
                scope.forward_errors(errs);

                let (bound, errs) = set_checksums(
                    hydrated,
                    Arc::new(create),
                    self.config.binder_workers,
                    token.clone(),
                );
                scope.forward_errors(errs);
                bound
            } else {
                // The delta already holds everything a shell needs.
                let (tx, rx) = mpsc::channel(SYNC_QUEUE_DEPTH);
                let subject = Arc::clone(&subject);
                let token = token.clone();
                let ids: Vec<String> = create.into_keys().collect();
                scope.spawn(async move {
                    for id in ids {
                        let shell = subject.new_shell(&id);
                        tokio::select! {
                            _ = token.cancelled() => return Err(SyncError::Cancelled),
                            sent = tx.send(shell) => {
                                if sent.is_err() {
                                    return Ok(());
                                }
                            }
                        }
                    }
                    Ok(())
                });
                rx
            };

            let db = Arc::clone(&self.db);
            let token = token.clone();
            scope.spawn(async move { db.create_streamed(entities, token).await.map_err(Into::into) });
        }

        if !update.is_empty() {
            counter!("sync_rows_updated").increment(update.len() as u64);
            info!(subject = %subject.key(), rows = update.len(), "updating rows");

            let keys: Vec<String> = update.keys().cloned().collect();
            let (pairs, errs) = self.cache.hm_yield(
                namespace,
                keys,
                self.config.multi_fetch_batch_size,
                self.config.multi_fetch_concurrency,
                token.clone(),
            );
            scope.forward_errors(errs);

            let (hydrated, errs) = create_entities(
                Arc::clone(&subject),
                pairs,
                self.config.hydrator_workers,
                token.clone(),
            );
            scope.forward_errors(errs);

            let (bound, errs) = set_checksums(
                hydrated,
                Arc::new(update),
                self.config.binder_workers,
                token.clone(),
            );
            scope.forward_errors(errs);

            let db = Arc::clone(&self.db);
            let token = token.clone();
            scope.spawn(async move { db.update_streamed(bound, token).await.map_err(Into::into) });
        }

        if !delete.is_empty() {
            counter!("sync_rows_deleted").increment(delete.len() as u64);
            info!(subject = %subject.key(), rows = delete.len(), "deleting rows");

            let db = Arc::clone(&self.db);
            let subject = Arc::clone(&subject);
            let token = token.clone();
            scope.spawn(async move { db.delete(&subject, delete, token).await.map_err(Into::into) });
        }

        scope.wait().await
    }
}
