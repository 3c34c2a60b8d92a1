use std::time::Duration;

pub(crate) const DEFAULT_MULTI_FETCH_BATCH: usize = 4096;
pub(crate) const DEFAULT_MULTI_FETCH_CONCURRENCY: usize = 8;
pub(crate) const DEFAULT_PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(20);

// Depth of the shell feeder channel on the no-checksum create path.
pub(crate) const SYNC_QUEUE_DEPTH: usize = 1024;

/// Tuning knobs of one sync engine instance.
///
/// Cache multi-fetches are latency-bound, so their width is a fixed small
/// number of in-flight requests; decoding and checksum binding are
/// CPU-bound and default to the host's core count.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Max keys per cache multi-fetch request.
    pub multi_fetch_batch_size: usize,
    /// Parallel in-flight multi-fetch requests.
    pub multi_fetch_concurrency: usize,
    /// Parallel payload-decode workers.
    pub hydrator_workers: usize,
    /// Parallel checksum-binding workers.
    pub binder_workers: usize,
    /// Period for "still waiting" log lines while parked on a dump signal.
    pub progress_log_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism().map_or(1, |n| n.get());
        Self {
            multi_fetch_batch_size: DEFAULT_MULTI_FETCH_BATCH,
            multi_fetch_concurrency: DEFAULT_MULTI_FETCH_CONCURRENCY,
            hydrator_workers: cpus,
            binder_workers: cpus,
            progress_log_interval: DEFAULT_PROGRESS_LOG_INTERVAL,
        }
    }
}
