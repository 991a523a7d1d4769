//! Blob synchronizer: blocking waits over an eventually visible blob store.
//!
//! Agents upload bulk data through a separate path from their replies, so a
//! reply can reference blobs that aren't readable yet. The synchronizer
//! polls for the still-outstanding ids at a fixed interval until they all
//! resolve or the deadline passes. Arrival is normally sub-second; the
//! timeout only bounds staleness.
//!
//! Polls are not retried past the deadline: if the next poll could not
//! start before `timeout`, the wait gives up instead of sleeping.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use drover_core::{BlobId, BlobStoreError};

use crate::blob_store::BlobStore;

const LATENCY_BINS_SECS: &[f64] = &[0.05, 0.1, 0.2, 0.5, 1.0, 2.0, 5.0, 10.0, 20.0, 50.0];
const ITERATION_BINS: &[f64] = &[1.0, 2.0, 5.0, 10.0, 20.0, 50.0];

/// Fixed-bin histogram. The last bucket collects everything above the
/// highest bin.
pub struct Histogram {
    bins: &'static [f64],
    counts: Vec<AtomicU64>,
}

impl Histogram {
    fn new(bins: &'static [f64]) -> Self {
        Self {
            bins,
            counts: (0..=bins.len()).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    pub fn record(&self, value: f64) {
        let idx = self
            .bins
            .iter()
            .position(|upper| value <= *upper)
            .unwrap_or(self.bins.len());
        self.counts[idx].fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.counts.iter().map(|c| c.load(Ordering::Relaxed)).sum()
    }

    /// (upper bound, count) per bucket; the overflow bucket has `f64::INFINITY`.
    pub fn buckets(&self) -> Vec<(f64, u64)> {
        self.bins
            .iter()
            .copied()
            .chain(std::iter::once(f64::INFINITY))
            .zip(self.counts.iter().map(|c| c.load(Ordering::Relaxed)))
            .collect()
    }
}

/// Observability for blob polling: for every blob that resolves, how long
/// after the wait began it was seen, and on which poll.
pub struct PollStats {
    pub hit_latency: Histogram,
    pub hit_iteration: Histogram,
    timeouts: AtomicU64,
}

impl Default for PollStats {
    fn default() -> Self {
        Self {
            hit_latency: Histogram::new(LATENCY_BINS_SECS),
            hit_iteration: Histogram::new(ITERATION_BINS),
            timeouts: AtomicU64::new(0),
        }
    }
}

impl PollStats {
    fn record_hit(&self, elapsed: Duration, iteration: u32) {
        self.hit_latency.record(elapsed.as_secs_f64());
        self.hit_iteration.record(f64::from(iteration));
    }

    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    pub fn print_stats(&self) {
        let hits = self.hit_latency.count();
        if hits == 0 && self.timeouts() == 0 {
            return;
        }
        tracing::info!(
            hits,
            timeouts = self.timeouts(),
            latency = ?self.hit_latency.buckets(),
            iterations = ?self.hit_iteration.buckets(),
            "blob poll stats"
        );
    }
}

#[derive(Clone)]
pub struct BlobSynchronizer {
    store: Arc<dyn BlobStore>,
    poll_interval: Duration,
    stats: Arc<PollStats>,
}

impl BlobSynchronizer {
    pub fn new(store: Arc<dyn BlobStore>, poll_interval: Duration) -> Self {
        Self {
            store,
            poll_interval,
            stats: Arc::new(PollStats::default()),
        }
    }

    pub fn stats(&self) -> &PollStats {
        &self.stats
    }

    /// Block until every id exists, or fail with `Timeout`.
    pub fn wait_for_blobs(&self, ids: &[BlobId], timeout: Duration) -> Result<(), BlobStoreError> {
        let mut remaining: HashSet<BlobId> = ids.iter().copied().collect();
        if remaining.is_empty() {
            return Ok(());
        }

        let start = Instant::now();
        let mut ticks = 0u32;

        loop {
            let query: Vec<BlobId> = remaining.iter().copied().collect();
            let exists = self.store.check_blobs_exist(&query)?;
            let elapsed = start.elapsed();
            ticks += 1;

            for (id, present) in exists {
                if present && remaining.remove(&id) {
                    self.stats.record_hit(elapsed, ticks);
                }
            }

            if remaining.is_empty() {
                tracing::debug!(blobs = ids.len(), polls = ticks, ?elapsed, "blobs available");
                return Ok(());
            }

            if elapsed + self.poll_interval >= timeout {
                self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    missing = remaining.len(),
                    requested = ids.len(),
                    polls = ticks,
                    ?elapsed,
                    "timed out waiting for blobs"
                );
                return Err(BlobStoreError::Timeout {
                    missing: remaining.len(),
                    waited: elapsed,
                });
            }

            std::thread::sleep(self.poll_interval);
        }
    }

    /// Read blobs, polling for the missing ones until they appear or the
    /// deadline passes. Never fails because of absence: the returned map has
    /// an entry for every requested id, `None` for blobs never observed.
    ///
    /// `timeout` bounds the start of the last poll, not the end of the call.
    pub fn read_and_wait_for_blobs(
        &self,
        ids: &[BlobId],
        timeout: Duration,
    ) -> Result<HashMap<BlobId, Option<Bytes>>, BlobStoreError> {
        let mut remaining: HashSet<BlobId> = ids.iter().copied().collect();
        let mut results: HashMap<BlobId, Option<Bytes>> =
            remaining.iter().map(|id| (*id, None)).collect();

        let start = Instant::now();
        let mut polls = 0u32;

        while !remaining.is_empty() {
            let query: Vec<BlobId> = remaining.iter().copied().collect();
            let current = self.store.read_blobs(&query)?;
            let elapsed = start.elapsed();
            polls += 1;

            for (id, blob) in current {
                let Some(blob) = blob else { continue };
                if remaining.remove(&id) {
                    results.insert(id, Some(blob));
                    self.stats.record_hit(elapsed, polls);
                }
            }

            if remaining.is_empty() || elapsed + self.poll_interval >= timeout {
                break;
            }

            std::thread::sleep(self.poll_interval);
        }

        if !remaining.is_empty() {
            self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                missing = remaining.len(),
                requested = results.len(),
                polls,
                "returning partial blob read"
            );
        }
        Ok(results)
    }

    pub fn read_and_wait_for_blob(
        &self,
        id: BlobId,
        timeout: Duration,
    ) -> Result<Option<Bytes>, BlobStoreError> {
        Ok(self
            .read_and_wait_for_blobs(&[id], timeout)?
            .remove(&id)
            .flatten())
    }
}
