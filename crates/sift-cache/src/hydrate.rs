//! Worker pools that turn raw cache payloads into writable entities.
//!
//! Both pools pull from a shared MPMC channel so the fan-out width is just
//! the number of identical workers spawned. Decoding is CPU-bound, so the
//! caller sizes the pools to the host's core count.
use crate::{CacheError, QUEUE_DEPTH, RawEntity};
use async_channel as chan;
use sift_common::{Checksum, Entity, SyncSubject};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Materialize entities from raw (id, payload) pairs with `workers`
/// parallel decoders. A decode failure propagates on the error stream and
/// terminates that worker; the scope's cancellation stops the rest.
/// Output order is unspecified.
pub fn create_entities(
    subject: Arc<SyncSubject>,
    raw: chan::Receiver<RawEntity>,
    workers: usize,
    cancel: CancellationToken,
) -> (chan::Receiver<Box<dyn Entity>>, mpsc::Receiver<CacheError>) {
    let (out_tx, out_rx) = chan::bounded(QUEUE_DEPTH);
    let (err_tx, err_rx) = mpsc::channel(1);

    for _ in 0..workers.max(1) {
        let subject = Arc::clone(&subject);
        let raw = raw.clone();
        let out_tx = out_tx.clone();
        let err_tx = err_tx.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let (id, payload) = tokio::select! {
                    _ = cancel.cancelled() => return,
                    next = raw.recv() => match next {
                        Ok(pair) => pair,
                        Err(_) => return,
                    },
                };
                let entity = match subject.decode(&id, &payload) {
                    Ok(entity) => entity,
                    Err(err) => {
                        let _ = err_tx.try_send(CacheError::Decode(err));
                        return;
                    }
                };
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    sent = out_tx.send(entity) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
        });
    }

    (out_rx, err_rx)
}

/// Attach the desired checksum from `checksums` to each incoming entity
/// with `workers` parallel binders.
///
/// Two drift conditions surface as errors: an entity whose id has no entry
/// in the map, and, once the input closes, a map entry no entity ever
/// arrived for. Either means the cache moved between the delta and the
/// fetch.
pub fn set_checksums(
    entities: chan::Receiver<Box<dyn Entity>>,
    checksums: Arc<HashMap<String, Option<Checksum>>>,
    workers: usize,
    cancel: CancellationToken,
) -> (mpsc::Receiver<Box<dyn Entity>>, mpsc::Receiver<CacheError>) {
    let (out_tx, out_rx) = mpsc::channel(QUEUE_DEPTH);
    let (err_tx, err_rx) = mpsc::channel(1);
    let seen = Arc::new(Mutex::new(HashSet::new()));

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            let mut pool = JoinSet::new();
            for _ in 0..workers.max(1) {
                let entities = entities.clone();
                let checksums = Arc::clone(&checksums);
                let seen = Arc::clone(&seen);
                let out_tx = out_tx.clone();
                let err_tx = err_tx.clone();
                let cancel = cancel.clone();
                pool.spawn(async move {
                    loop {
                        let mut entity = tokio::select! {
                            _ = cancel.cancelled() => return,
                            next = entities.recv() => match next {
                                Ok(entity) => entity,
                                Err(_) => return,
                            },
                        };
                        match checksums.get(entity.id()) {
                            Some(Some(sum)) => entity.set_fingerprint(sum.clone()),
                            _ => {
                                let _ = err_tx
                                    .try_send(CacheError::ChecksumMissing(entity.id().to_string()));
                                return;
                            }
                        }
                        seen.lock().expect("seen lock").insert(entity.id().to_string());
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            sent = out_tx.send(entity) => {
                                if sent.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                });
            }
            drop(out_tx);

            while pool.join_next().await.is_some() {}
            if cancel.is_cancelled() {
                return;
            }
            let seen = seen.lock().expect("seen lock");
            for id in checksums.keys() {
                if !seen.contains(id) {
                    let _ = err_tx.try_send(CacheError::PayloadMissing(id.clone()));
                    return;
                }
            }
        }
    });

    (out_rx, err_rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use serde::Deserialize;
    use sift_common::FieldValue;

    #[derive(Debug, Default, Deserialize)]
    struct Row {
        #[serde(skip)]
        id: String,
        #[serde(default)]
        name: String,
        #[serde(skip)]
        checksum: Option<Checksum>,
    }

    impl Entity for Row {
        fn id(&self) -> &str {
            &self.id
        }
        fn set_id(&mut self, id: String) {
            self.id = id;
        }
        fn fingerprint(&self) -> Option<&Checksum> {
            self.checksum.as_ref()
        }
        fn set_fingerprint(&mut self, checksum: Checksum) {
            self.checksum = Some(checksum);
        }
        fn table(&self) -> &'static str {
            "row"
        }
        fn columns(&self) -> &'static [&'static str] {
            &["name", "properties_checksum"]
        }
        fn values(&self) -> Vec<FieldValue> {
            vec![
                FieldValue::Text(self.name.clone()),
                match &self.checksum {
                    Some(sum) => FieldValue::Bytes(sum.as_bytes().to_vec()),
                    None => FieldValue::Null,
                },
            ]
        }
    }

    fn raw_channel(pairs: Vec<(&str, &[u8])>) -> chan::Receiver<RawEntity> {
        let (tx, rx) = chan::bounded(pairs.len().max(1));
        for (id, payload) in pairs {
            tx.try_send((id.to_string(), Bytes::copy_from_slice(payload)))
                .expect("seed channel");
        }
        rx
    }

    #[tokio::test]
    async fn hydrates_every_payload() {
        let subject = Arc::new(SyncSubject::new::<Row>("row"));
        let raw = raw_channel(vec![
            ("a", br#"{"name":"one"}"#),
            ("b", br#"{"name":"two"}"#),
        ]);
        let (out, _errs) =
            create_entities(subject, raw, 4, CancellationToken::new());

        let mut ids = Vec::new();
        while let Ok(entity) = out.recv().await {
            ids.push(entity.id().to_string());
        }
        ids.sort();
        assert_eq!(ids, ["a", "b"]);
    }

    #[tokio::test]
    async fn decode_failure_reaches_the_error_stream() {
        let subject = Arc::new(SyncSubject::new::<Row>("row"));
        let raw = raw_channel(vec![("bad", b"not json")]);
        let (_out, mut errs) = create_entities(subject, raw, 1, CancellationToken::new());

        let err = errs.recv().await.expect("decode error");
        assert!(matches!(err, CacheError::Decode(ref inner) if inner.id == "bad"));
    }

    fn entity_channel(ids: &[&str]) -> chan::Receiver<Box<dyn Entity>> {
        let (tx, rx) = chan::bounded(ids.len().max(1));
        for id in ids {
            let mut row = Row::default();
            row.set_id((*id).to_string());
            tx.try_send(Box::new(row) as Box<dyn Entity>)
                .expect("seed channel");
        }
        rx
    }

    #[tokio::test]
    async fn binds_checksums_from_the_partition() {
        let sum = Checksum::from_hex("aa").expect("hex");
        let checksums = Arc::new(HashMap::from([
            ("a".to_string(), Some(sum.clone())),
            ("b".to_string(), Some(sum.clone())),
        ]));
        let (mut out, _errs) = set_checksums(
            entity_channel(&["a", "b"]),
            checksums,
            2,
            CancellationToken::new(),
        );

        let mut bound = 0;
        while let Some(entity) = out.recv().await {
            assert_eq!(entity.fingerprint(), Some(&sum));
            bound += 1;
        }
        assert_eq!(bound, 2);
    }

    #[tokio::test]
    async fn unknown_entity_id_is_an_inconsistency() {
        let checksums = Arc::new(HashMap::from([(
            "expected".to_string(),
            Some(Checksum::from_hex("aa").expect("hex")),
        )]));
        let (_out, mut errs) = set_checksums(
            entity_channel(&["stranger"]),
            checksums,
            1,
            CancellationToken::new(),
        );

        let err = errs.recv().await.expect("inconsistency");
        assert!(matches!(err, CacheError::ChecksumMissing(ref id) if id == "stranger"));
    }

    #[tokio::test]
    async fn absent_payload_is_detected_when_the_input_closes() {
        let checksums = Arc::new(HashMap::from([
            (
                "present".to_string(),
                Some(Checksum::from_hex("aa").expect("hex")),
            ),
            (
                "ghost".to_string(),
                Some(Checksum::from_hex("bb").expect("hex")),
            ),
        ]));
        let (mut out, mut errs) = set_checksums(
            entity_channel(&["present"]),
            checksums,
            2,
            CancellationToken::new(),
        );

        // Drain the bound entity so the pool can finish.
        assert!(out.recv().await.is_some());
        assert!(out.recv().await.is_none());

        let err = errs.recv().await.expect("inconsistency");
        assert!(matches!(err, CacheError::PayloadMissing(ref id) if id == "ghost"));
    }
}
