//! Streaming reads against the cache seam.
//!
//! Every operation returns one bounded data stream and one error stream.
//! A producer that hits an error reports it and then parks until the
//! enclosing scope cancels, so a half-fed consumer can never mistake the
//! failure for a clean end of stream.
use crate::{
    CacheApi, CacheError, QUEUE_DEPTH, RawEntity, SCAN_COUNT, checksum_key, payload_key,
};
use async_channel as chan;
use bytes::Bytes;
use sift_common::{Checksum, KeyedChecksum, SyncSubject};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct CacheReader {
    cache: Arc<dyn CacheApi>,
}

impl CacheReader {
    pub fn new(cache: Arc<dyn CacheApi>) -> Self {
        Self { cache }
    }

    /// Stream every (id, checksum) pair the cache holds for `subject`.
    ///
    /// Subjects with checksums are enumerated from their checksum hash
    /// (values are hex text); subjects without are enumerated from the
    /// payload hash with `checksum: None`. The stream is finite and not
    /// restartable; ordering is unspecified.
    pub fn yield_all(
        &self,
        subject: &Arc<SyncSubject>,
        cancel: CancellationToken,
    ) -> (mpsc::Receiver<KeyedChecksum>, mpsc::Receiver<CacheError>) {
        let (out_tx, out_rx) = mpsc::channel(QUEUE_DEPTH);
        let (err_tx, err_rx) = mpsc::channel(1);
        let cache = Arc::clone(&self.cache);
        let subject = Arc::clone(subject);

        tokio::spawn(async move {
            let with_checksum = subject.with_checksum();
            let key = if with_checksum {
                checksum_key(subject.key())
            } else {
                payload_key(subject.key())
            };

            let mut cursor = 0;
            let mut emitted = 0usize;
            loop {
                let page = tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = err_tx.try_send(CacheError::Cancelled);
                        return;
                    }
                    page = cache.hscan(&key, cursor, SCAN_COUNT) => page,
                };
                let (next_cursor, pairs) = match page {
                    Ok(page) => page,
                    Err(err) => {
                        report_and_park(&err_tx, err, &cancel).await;
                        return;
                    }
                };

                for (id, value) in pairs {
                    let keyed = if with_checksum {
                        match parse_checksum(&id, &value) {
                            Ok(sum) => KeyedChecksum::new(id, Some(sum)),
                            Err(err) => {
                                report_and_park(&err_tx, err, &cancel).await;
                                return;
                            }
                        }
                    } else {
                        KeyedChecksum::new(id, None)
                    };
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        sent = out_tx.send(keyed) => {
                            if sent.is_err() {
                                return;
                            }
                        }
                    }
                    emitted += 1;
                }

                if next_cursor == 0 {
                    debug!(key = %key, pairs = emitted, "cache enumeration complete");
                    return;
                }
                cursor = next_cursor;
            }
        });

        (out_rx, err_rx)
    }

    /// Fetch the payloads for `keys` from the hash at `namespace`,
    /// `batch_size` fields per request with at most `concurrency` requests
    /// in flight. Emits one (id, payload) pair per present key; missing
    /// keys are skipped, the downstream stages decide policy.
    pub fn hm_yield(
        &self,
        namespace: String,
        keys: Vec<String>,
        batch_size: usize,
        concurrency: usize,
        cancel: CancellationToken,
    ) -> (chan::Receiver<RawEntity>, mpsc::Receiver<CacheError>) {
        let (out_tx, out_rx) = chan::bounded(QUEUE_DEPTH);
        let (err_tx, err_rx) = mpsc::channel(1);
        let cache = Arc::clone(&self.cache);

        tokio::spawn(async move {
            let mut batches: VecDeque<Vec<String>> = keys
                .chunks(batch_size.max(1))
                .map(<[String]>::to_vec)
                .collect();
            let mut inflight = JoinSet::new();

            loop {
                while inflight.len() < concurrency.max(1) {
                    let Some(batch) = batches.pop_front() else {
                        break;
                    };
                    let cache = Arc::clone(&cache);
                    let namespace = namespace.clone();
                    let out_tx = out_tx.clone();
                    let cancel = cancel.clone();
                    inflight.spawn(fetch_batch(cache, namespace, batch, out_tx, cancel));
                }

                match inflight.join_next().await {
                    Some(Ok(Ok(()))) => {}
                    Some(Ok(Err(err))) => {
                        // Dropping the set aborts the in-flight siblings.
                        let _ = err_tx.try_send(err);
                        return;
                    }
                    Some(Err(join_err)) => {
                        if join_err.is_panic() {
                            std::panic::resume_unwind(join_err.into_panic());
                        }
                        return;
                    }
                    None => return,
                }
            }
        });

        (out_rx, err_rx)
    }
}

async fn fetch_batch(
    cache: Arc<dyn CacheApi>,
    namespace: String,
    batch: Vec<String>,
    out_tx: chan::Sender<RawEntity>,
    cancel: CancellationToken,
) -> Result<(), CacheError> {
    let values = tokio::select! {
        _ = cancel.cancelled() => return Err(CacheError::Cancelled),
        values = cache.hmget(&namespace, &batch) => values?,
    };

    for (id, value) in batch.into_iter().zip(values) {
        let Some(value) = value else {
            continue;
        };
        tokio::select! {
            _ = cancel.cancelled() => return Err(CacheError::Cancelled),
            sent = out_tx.send((id, value)) => {
                if sent.is_err() {
                    return Ok(());
                }
            }
        }
    }
    Ok(())
}

fn parse_checksum(id: &str, value: &Bytes) -> Result<Checksum, CacheError> {
    let text = std::str::from_utf8(value).map_err(|_| CacheError::BadChecksum {
        id: id.to_string(),
        source: hex::FromHexError::InvalidStringLength,
    })?;
    Checksum::from_hex(text.trim()).map_err(|source| CacheError::BadChecksum {
        id: id.to_string(),
        source,
    })
}

// Deliver the error, then hold the data stream open until the scope reacts.
// Closing it early would let a concurrent consumer treat the partial stream
// as complete before the cancellation lands.
async fn report_and_park(
    err_tx: &mpsc::Sender<CacheError>,
    err: CacheError,
    cancel: &CancellationToken,
) {
    if err_tx.try_send(err).is_err() {
        return;
    }
    cancel.cancelled().await;
}
