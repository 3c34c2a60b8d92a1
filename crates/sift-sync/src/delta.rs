//! Key partitioning between desired and actual state.
//!
//! Both input streams carry only compact (id, checksum) pairs, so this is
//! the one stage allowed to materialize its input. Pairs are classified
//! the moment both sides of an id have been seen: whichever side arrives
//! second resolves it, and whatever is left when the streams close becomes
//! Create (desired leftovers) or Delete (actual leftovers).
use crate::SyncError;
use sift_common::{Checksum, KeyedChecksum, SyncSubject};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// The three-way partition of one subject's keys. Immutable once computed;
/// the apply stage only reads it.
#[derive(Debug)]
pub struct Delta {
    pub(crate) subject: Arc<SyncSubject>,
    pub(crate) create: HashMap<String, Option<Checksum>>,
    pub(crate) update: HashMap<String, Option<Checksum>>,
    pub(crate) delete: Vec<String>,
}

impl Delta {
    /// Drain both streams and partition the keys. Returns when both have
    /// closed or the scope is cancelled, whichever comes first.
    pub async fn compute(
        subject: Arc<SyncSubject>,
        mut desired: mpsc::Receiver<KeyedChecksum>,
        mut actual: mpsc::Receiver<KeyedChecksum>,
        cancel: CancellationToken,
    ) -> Result<Self, SyncError> {
        let with_checksum = subject.with_checksum();
        let mut desired_pending: HashMap<String, Option<Checksum>> = HashMap::new();
        let mut actual_pending: HashMap<String, Option<Checksum>> = HashMap::new();
        let mut update: HashMap<String, Option<Checksum>> = HashMap::new();
        let mut desired_open = true;
        let mut actual_open = true;

        while desired_open || actual_open {
            tokio::select! {
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                next = desired.recv(), if desired_open => match next {
                    Some(pair) => match actual_pending.remove(&pair.id) {
                        Some(actual_sum) => {
                            if with_checksum && !checksums_equal(&pair.checksum, &actual_sum) {
                                update.insert(pair.id, pair.checksum);
                            }
                        }
                        None => {
                            desired_pending.insert(pair.id, pair.checksum);
                        }
                    },
                    None => desired_open = false,
                },
                next = actual.recv(), if actual_open => match next {
                    Some(pair) => match desired_pending.remove(&pair.id) {
                        Some(desired_sum) => {
                            if with_checksum && !checksums_equal(&desired_sum, &pair.checksum) {
                                update.insert(pair.id, desired_sum);
                            }
                        }
                        None => {
                            actual_pending.insert(pair.id, pair.checksum);
                        }
                    },
                    None => actual_open = false,
                },
            }
        }

        let delta = Self {
            subject,
            create: desired_pending,
            update,
            delete: actual_pending.into_keys().collect(),
        };
        debug!(
            subject = %delta.subject.key(),
            create = delta.create.len(),
            update = delta.update.len(),
            delete = delta.delete.len(),
            "delta computed"
        );
        Ok(delta)
    }

    pub fn subject(&self) -> &Arc<SyncSubject> {
        &self.subject
    }

    pub fn create(&self) -> &HashMap<String, Option<Checksum>> {
        &self.create
    }

    pub fn update(&self) -> &HashMap<String, Option<Checksum>> {
        &self.update
    }

    pub fn delete(&self) -> &[String] {
        &self.delete
    }

    pub fn is_empty(&self) -> bool {
        self.create.is_empty() && self.update.is_empty() && self.delete.is_empty()
    }
}

// Bytewise comparison; a missing checksum never equals anything.
fn checksums_equal(a: &Option<Checksum>, b: &Option<Checksum>) -> bool {
    matches!((a, b), (Some(a), Some(b)) if a == b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use sift_common::{Entity, FieldValue};
    use std::collections::BTreeSet;

    #[derive(Debug, Default, Deserialize)]
    struct Row {
        #[serde(skip)]
        id: String,
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
            &["properties_checksum"]
        }
        fn values(&self) -> Vec<FieldValue> {
            Vec::new()
        }
    }

    fn subject(with_checksum: bool) -> Arc<SyncSubject> {
        let subject = SyncSubject::new::<Row>("row");
        Arc::new(if with_checksum {
            subject.checksummed()
        } else {
            subject
        })
    }

    fn sum(text: &str) -> Option<Checksum> {
        Some(Checksum::from_hex(text).expect("hex"))
    }

    fn feed(pairs: &[(&str, Option<Checksum>)]) -> mpsc::Receiver<KeyedChecksum> {
        let (tx, rx) = mpsc::channel(pairs.len().max(1));
        for (id, checksum) in pairs {
            tx.try_send(KeyedChecksum::new(*id, checksum.clone()))
                .expect("seed stream");
        }
        rx
    }

    async fn compute(
        with_checksum: bool,
        desired: &[(&str, Option<Checksum>)],
        actual: &[(&str, Option<Checksum>)],
    ) -> Delta {
        Delta::compute(
            subject(with_checksum),
            feed(desired),
            feed(actual),
            CancellationToken::new(),
        )
        .await
        .expect("delta")
    }

    fn keys(map: &HashMap<String, Option<Checksum>>) -> BTreeSet<String> {
        map.keys().cloned().collect()
    }

    #[tokio::test]
    async fn partitions_are_disjoint_and_complete() {
        let delta = compute(
            true,
            &[("x", sum("aa")), ("y", sum("bb")), ("z", sum("cc"))],
            &[("y", sum("bb")), ("z", sum("c0")), ("w", sum("dd"))],
        )
        .await;

        assert_eq!(keys(&delta.create), BTreeSet::from(["x".to_string()]));
        assert_eq!(keys(&delta.update), BTreeSet::from(["z".to_string()]));
        assert_eq!(delta.delete, vec!["w".to_string()]);
        // The desired checksum wins in the update partition.
        assert_eq!(delta.update["z"], sum("cc"));
    }

    #[tokio::test]
    async fn without_checksums_membership_alone_decides() {
        let delta = compute(
            false,
            &[("a", None), ("b", None)],
            &[("b", sum("01")), ("c", sum("02"))],
        )
        .await;

        assert_eq!(keys(&delta.create), BTreeSet::from(["a".to_string()]));
        assert!(delta.update.is_empty());
        assert_eq!(delta.delete, vec!["c".to_string()]);
    }

    #[tokio::test]
    async fn equal_checksums_produce_no_work() {
        let delta = compute(true, &[("a", sum("aa"))], &[("a", sum("aa"))]).await;
        assert!(delta.is_empty());
    }

    #[tokio::test]
    async fn absent_checksum_never_equals_a_value() {
        let delta = compute(true, &[("a", sum("aa"))], &[("a", None)]).await;
        assert_eq!(keys(&delta.update), BTreeSet::from(["a".to_string()]));
    }

    #[tokio::test]
    async fn classification_is_order_independent() {
        // Same inputs, one run with desired buffered first, one with actual
        // buffered first. Both streams are fully seeded before compute runs,
        // so select polls drain them in whatever interleaving it likes.
        let desired = [("x", sum("aa")), ("y", sum("bb"))];
        let actual = [("y", sum("b0")), ("w", sum("dd"))];

        let first = compute(true, &desired, &actual).await;
        let second = compute(true, &desired, &actual).await;

        assert_eq!(keys(&first.create), keys(&second.create));
        assert_eq!(keys(&first.update), keys(&second.update));
        let mut a = first.delete.clone();
        let mut b = second.delete.clone();
        a.sort();
        b.sort();
        assert_eq!(a, b);
        assert_eq!(keys(&first.create), BTreeSet::from(["x".to_string()]));
        assert_eq!(keys(&first.update), BTreeSet::from(["y".to_string()]));
    }

    #[tokio::test]
    async fn cancellation_interrupts_the_merge() {
        let (_desired_tx, desired_rx) = mpsc::channel(1);
        let (_actual_tx, actual_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = Delta::compute(subject(true), desired_rx, actual_rx, cancel)
            .await
            .expect_err("cancelled");
        assert!(matches!(err, SyncError::Cancelled));
    }
}
