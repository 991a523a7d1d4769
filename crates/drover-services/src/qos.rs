//! Admission pacing for hunts: a token bucket whose level is derived from
//! persisted facts instead of held in memory.
//!
//! The bucket starts with one token at the hunt's first start and refills
//! at `client_rate` tokens per minute. Each admitted client costs one
//! token. Because the level is recomputed from `init_start_time` and the
//! admitted count on every check, restarting a worker cannot hand out
//! extra admissions.
//!
//! A rate of 0 means unlimited.

const BURST: f64 = 1.0;
const MS_PER_MINUTE: f64 = 60_000.0;

#[derive(Debug, Clone, Copy)]
pub struct AdmissionPacer {
    rate_per_minute: f64,
}

impl AdmissionPacer {
    pub fn new(rate_per_minute: f64) -> Self {
        Self { rate_per_minute }
    }

    pub fn unlimited(&self) -> bool {
        self.rate_per_minute <= 0.0
    }

    /// Tokens available at `now` after `admitted` admissions since
    /// `started_at`.
    pub fn tokens(&self, started_at: u64, admitted: u64, now: u64) -> f64 {
        if self.unlimited() {
            return f64::INFINITY;
        }
        let minutes = now.saturating_sub(started_at) as f64 / MS_PER_MINUTE;
        BURST + minutes * self.rate_per_minute - admitted as f64
    }

    /// Returns true if one more client may be admitted now.
    pub fn allow(&self, started_at: u64, admitted: u64, now: u64) -> bool {
        self.tokens(started_at, admitted, now) >= 1.0
    }

    /// Earliest time the next admission is allowed, `None` when unlimited.
    pub fn next_slot(&self, started_at: u64, admitted: u64) -> Option<u64> {
        if self.unlimited() {
            return None;
        }
        let needed = (admitted as f64 + 1.0 - BURST).max(0.0);
        let wait_ms = (needed / self.rate_per_minute * MS_PER_MINUTE).ceil();
        Some(started_at.saturating_add(wait_ms as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_rate_always_allows() {
        let pacer = AdmissionPacer::new(0.0);
        assert!(pacer.allow(0, 1_000_000, 0));
        assert_eq!(pacer.next_slot(0, 5), None);
    }

    #[test]
    fn first_client_admitted_immediately() {
        let pacer = AdmissionPacer::new(2.0);
        assert!(pacer.allow(1_000, 0, 1_000));
        assert!(!pacer.allow(1_000, 1, 1_000));
    }

    #[test]
    fn refills_at_rate_per_minute() {
        // 2 per minute: one slot every 30 s after the first.
        let pacer = AdmissionPacer::new(2.0);
        assert!(!pacer.allow(0, 1, 29_999));
        assert!(pacer.allow(0, 1, 30_000));
        assert!(!pacer.allow(0, 3, 60_000));
        assert!(pacer.allow(0, 2, 60_000));
        assert_eq!(pacer.next_slot(0, 1), Some(30_000));
        assert_eq!(pacer.next_slot(0, 0), Some(0));
    }

    #[test]
    fn admitted_total_never_exceeds_rate_times_elapsed() {
        let pacer = AdmissionPacer::new(20.5);
        let mut admitted = 0u64;
        // A client knocks every 100 ms for ten minutes.
        for now in (0..600_000u64).step_by(100) {
            if pacer.allow(0, admitted, now) {
                admitted += 1;
            }
        }
        assert!(admitted as f64 <= 1.0 + 20.5 * 10.0);
        assert!(admitted >= 200);
    }
}
