use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::watch;

/// Registry of per-subject "snapshot done" signals.
///
/// An external snapshot producer calls `signal` once the cache holds a
/// fresh, complete snapshot for a key; `sync_after_dump` parks on the
/// matching receiver. Signalling before anyone waits is fine, the flag is
/// latched.
#[derive(Debug, Default)]
pub struct DumpSignals {
    inner: Mutex<HashMap<String, watch::Sender<bool>>>,
}

impl DumpSignals {
    pub fn new() -> Self {
        Self::default()
    }

    /// A receiver that reads `true` once the dump for `key` has finished.
    pub fn done(&self, key: &str) -> watch::Receiver<bool> {
        self.sender(key).subscribe()
    }

    /// Mark the dump for `key` as finished.
    pub fn signal(&self, key: &str) {
        self.sender(key).send_replace(true);
    }

    fn sender(&self, key: &str) -> watch::Sender<bool> {
        self.inner
            .lock()
            .expect("signals lock")
            .entry(key.to_string())
            .or_insert_with(|| watch::channel(false).0)
            .clone()
    }
}
