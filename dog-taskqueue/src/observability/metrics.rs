use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Duration;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::PriorityTier;

const MAX_SAMPLES: usize = 1000;

#[derive(Debug, Default)]
struct TierCounters {
    submitted: AtomicU64,
    leased: AtomicU64,
    succeeded: AtomicU64,
}

/// Live metrics collector for queue operations
#[derive(Debug, Default)]
pub struct LiveMetrics {
    jobs_submitted: AtomicU64,
    jobs_rate_limited: AtomicU64,
    cycles_rejected: AtomicU64,
    jobs_leased: AtomicU64,
    jobs_succeeded: AtomicU64,
    jobs_retried: AtomicU64,
    jobs_dead_lettered: AtomicU64,
    jobs_canceled: AtomicU64,
    leases_reaped: AtomicU64,

    // Indexed by PriorityTier::index
    tiers: [TierCounters; 3],

    performance: Mutex<PerformanceMetrics>,
}

impl LiveMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_submitted(&self, tier: PriorityTier) {
        self.jobs_submitted.fetch_add(1, Ordering::Relaxed);
        self.tiers[tier.index()]
            .submitted
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limited(&self) {
        self.jobs_rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cycle_rejected(&self) {
        self.cycles_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_leased(&self, tier: PriorityTier) {
        self.jobs_leased.fetch_add(1, Ordering::Relaxed);
        self.tiers[tier.index()].leased.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a success and, when known, how long the run took
    pub fn record_succeeded(&self, tier: PriorityTier, run_time: Option<Duration>) {
        self.jobs_succeeded.fetch_add(1, Ordering::Relaxed);
        self.tiers[tier.index()]
            .succeeded
            .fetch_add(1, Ordering::Relaxed);

        if let Some(run_time) = run_time {
            self.performance.lock().record_run_time(tier, run_time);
        }
    }

    pub fn record_retried(&self) {
        self.jobs_retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_lettered(&self) {
        self.jobs_dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_canceled(&self) {
        self.jobs_canceled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reaped(&self) {
        self.leases_reaped.fetch_add(1, Ordering::Relaxed);
    }

    // Getters for global metrics
    pub fn jobs_submitted(&self) -> u64 {
        self.jobs_submitted.load(Ordering::Relaxed)
    }

    pub fn jobs_succeeded(&self) -> u64 {
        self.jobs_succeeded.load(Ordering::Relaxed)
    }

    pub fn jobs_retried(&self) -> u64 {
        self.jobs_retried.load(Ordering::Relaxed)
    }

    pub fn jobs_dead_lettered(&self) -> u64 {
        self.jobs_dead_lettered.load(Ordering::Relaxed)
    }

    /// Counters for one priority tier
    pub fn tier_metrics(&self, tier: PriorityTier) -> TierMetrics {
        let counters = &self.tiers[tier.index()];
        TierMetrics {
            tier,
            submitted: counters.submitted.load(Ordering::Relaxed),
            leased: counters.leased.load(Ordering::Relaxed),
            succeeded: counters.succeeded.load(Ordering::Relaxed),
        }
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> GlobalMetrics {
        GlobalMetrics {
            jobs_submitted: self.jobs_submitted(),
            jobs_rate_limited: self.jobs_rate_limited.load(Ordering::Relaxed),
            cycles_rejected: self.cycles_rejected.load(Ordering::Relaxed),
            jobs_leased: self.jobs_leased.load(Ordering::Relaxed),
            jobs_succeeded: self.jobs_succeeded(),
            jobs_retried: self.jobs_retried(),
            jobs_dead_lettered: self.jobs_dead_lettered(),
            jobs_canceled: self.jobs_canceled.load(Ordering::Relaxed),
            leases_reaped: self.leases_reaped.load(Ordering::Relaxed),
            tiers: PriorityTier::all()
                .iter()
                .map(|tier| self.tier_metrics(*tier))
                .collect(),
        }
    }

    /// Get performance metrics
    pub fn performance_metrics(&self) -> PerformanceMetrics {
        self.performance.lock().clone()
    }
}

/// Counters for one priority tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierMetrics {
    pub tier: PriorityTier,
    pub submitted: u64,
    pub leased: u64,
    pub succeeded: u64,
}

/// Global queue metrics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalMetrics {
    pub jobs_submitted: u64,
    pub jobs_rate_limited: u64,
    pub cycles_rejected: u64,
    pub jobs_leased: u64,
    pub jobs_succeeded: u64,
    pub jobs_retried: u64,
    pub jobs_dead_lettered: u64,
    pub jobs_canceled: u64,
    pub leases_reaped: u64,
    pub tiers: Vec<TierMetrics>,
}

impl GlobalMetrics {
    /// Calculate overall success rate
    pub fn success_rate(&self) -> f64 {
        let total_finished = self.jobs_succeeded + self.jobs_dead_lettered;
        if total_finished == 0 {
            100.0
        } else {
            (self.jobs_succeeded as f64 / total_finished as f64) * 100.0
        }
    }

    /// Calculate overall retry rate
    pub fn retry_rate(&self) -> f64 {
        if self.jobs_submitted == 0 {
            0.0
        } else {
            (self.jobs_retried as f64 / self.jobs_submitted as f64) * 100.0
        }
    }

    /// Admitted jobs not yet in a terminal state
    pub fn jobs_in_flight(&self) -> u64 {
        self.jobs_submitted
            .saturating_sub(self.jobs_succeeded + self.jobs_dead_lettered + self.jobs_canceled)
    }
}

/// Run times of recent successful jobs, per tier
#[derive(Debug, Clone, Default)]
pub struct PerformanceMetrics {
    run_times: [VecDeque<Duration>; 3],
}

impl PerformanceMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a run time, keeping the last 1000 per tier
    pub fn record_run_time(&mut self, tier: PriorityTier, duration: Duration) {
        let times = &mut self.run_times[tier.index()];
        times.push_back(duration);
        if times.len() > MAX_SAMPLES {
            times.pop_front();
        }
    }

    pub fn average_run_time(&self, tier: PriorityTier) -> Option<Duration> {
        let times = &self.run_times[tier.index()];
        if times.is_empty() {
            return None;
        }

        let total_ms: i64 = times.iter().map(|d| d.num_milliseconds()).sum();
        Some(Duration::milliseconds(total_ms / times.len() as i64))
    }

    /// Nearest-rank percentile (0-100)
    pub fn percentile_run_time(&self, tier: PriorityTier, percentile: f64) -> Option<Duration> {
        let times = &self.run_times[tier.index()];
        if times.is_empty() {
            return None;
        }

        let mut sorted: Vec<_> = times.iter().copied().collect();
        sorted.sort();

        let index = ((percentile / 100.0) * (sorted.len() - 1) as f64).round() as usize;
        sorted.get(index).copied()
    }

    pub fn samples(&self, tier: PriorityTier) -> usize {
        self.run_times[tier.index()].len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_live_metrics() {
        let metrics = LiveMetrics::new();

        metrics.record_submitted(PriorityTier::High);
        metrics.record_submitted(PriorityTier::Low);
        metrics.record_leased(PriorityTier::High);
        metrics.record_succeeded(PriorityTier::High, Some(Duration::milliseconds(40)));

        assert_eq!(metrics.jobs_submitted(), 2);
        assert_eq!(metrics.jobs_succeeded(), 1);

        let high = metrics.tier_metrics(PriorityTier::High);
        assert_eq!((high.submitted, high.leased, high.succeeded), (1, 1, 1));
        assert_eq!(metrics.tier_metrics(PriorityTier::Low).leased, 0);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.tiers.len(), 3);
        assert_eq!(snapshot.jobs_in_flight(), 1);
        assert_eq!(metrics.performance_metrics().samples(PriorityTier::High), 1);
    }

    #[test]
    fn test_performance_metrics() {
        let mut perf = PerformanceMetrics::new();

        perf.record_run_time(PriorityTier::Medium, Duration::milliseconds(100));
        perf.record_run_time(PriorityTier::Medium, Duration::milliseconds(300));
        perf.record_run_time(PriorityTier::Medium, Duration::milliseconds(200));

        let avg = perf.average_run_time(PriorityTier::Medium).unwrap();
        assert_eq!(avg.num_milliseconds(), 200);

        let p50 = perf.percentile_run_time(PriorityTier::Medium, 50.0).unwrap();
        assert_eq!(p50.num_milliseconds(), 200);
        assert!(perf.average_run_time(PriorityTier::High).is_none());
    }

    #[test]
    fn test_samples_are_bounded() {
        let mut perf = PerformanceMetrics::new();
        for ms in 0..1500 {
            perf.record_run_time(PriorityTier::Low, Duration::milliseconds(ms));
        }
        assert_eq!(perf.samples(PriorityTier::Low), 1000);
    }

    #[test]
    fn test_global_metrics() {
        let global = GlobalMetrics {
            jobs_submitted: 100,
            jobs_rate_limited: 7,
            cycles_rejected: 1,
            jobs_leased: 95,
            jobs_succeeded: 80,
            jobs_retried: 5,
            jobs_dead_lettered: 10,
            jobs_canceled: 5,
            leases_reaped: 2,
            tiers: Vec::new(),
        };

        assert_eq!(global.success_rate(), 88.88888888888889); // 80/(80+10) * 100
        assert_eq!(global.retry_rate(), 5.0); // 5/100 * 100
        assert_eq!(global.jobs_in_flight(), 5); // 100 - 80 - 10 - 5
    }
}
