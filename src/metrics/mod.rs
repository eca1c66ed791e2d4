//! Metrics for lock acquisition and recovery.
//!
//! Prometheus-style counters, gauges and histograms:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       LockMetrics                            │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────┐  │
//! │  │  Counters    │  │   Gauges     │  │   Histograms     │  │
//! │  │ - acquired   │  │ - waiting    │  │ - wait time      │  │
//! │  │ - timeouts   │  │              │  │                  │  │
//! │  │ - cleanups   │  │              │  │                  │  │
//! │  └──────────────┘  └──────────────┘  └──────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod counters;
mod gauges;
mod histograms;

pub use counters::Counter;
pub use gauges::Gauge;
pub use histograms::{Histogram, HistogramSnapshot};

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Buckets for time spent waiting on a contended lock (in seconds).
pub const LOCK_WAIT_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 60.0,
];

/// Metrics shared by every lock handle of a member.
#[derive(Debug)]
pub struct LockMetrics {
    /// Successful acquisitions that reached the store.
    pub acquisitions: Counter,
    /// Acquisitions that had to wait.
    pub contended: Counter,
    /// Timed acquisitions that gave up.
    pub timeouts: Counter,
    /// Acquisitions abandoned through cancellation.
    pub interruptions: Counter,
    /// Final releases sent to the store.
    pub releases: Counter,
    /// Releases attempted by a non-owner.
    pub illegal_unlocks: Counter,
    /// Holder entries changed by member departure or reconciliation.
    pub member_cleanups: Counter,
    /// Threads currently blocked waiting for a lock.
    pub waiting: Gauge,
    /// Time spent waiting for contended locks.
    pub wait_time: Histogram,
    enabled: AtomicBool,
}

impl LockMetrics {
    /// Create a new metrics instance.
    pub fn new() -> Self {
        Self {
            acquisitions: Counter::new("lock_acquisitions_total", "Locks acquired"),
            contended: Counter::new("lock_contended_total", "Acquisitions that had to wait"),
            timeouts: Counter::new("lock_timeouts_total", "Timed acquisitions that gave up"),
            interruptions: Counter::new("lock_interruptions_total", "Cancelled acquisitions"),
            releases: Counter::new("lock_releases_total", "Locks released"),
            illegal_unlocks: Counter::new("lock_illegal_unlocks_total", "Unlocks by non-owners"),
            member_cleanups: Counter::new(
                "lock_member_cleanups_total",
                "Holders changed by member cleanup",
            ),
            waiting: Gauge::new("lock_waiting_threads", "Threads waiting for a lock"),
            wait_time: Histogram::with_buckets(
                "lock_wait_seconds",
                "Time spent waiting for contended locks",
                LOCK_WAIT_BUCKETS.to_vec(),
            ),
            enabled: AtomicBool::new(true),
        }
    }

    /// Create a metrics instance that records nothing.
    pub fn disabled() -> Self {
        let metrics = Self::new();
        metrics.enabled.store(false, Ordering::Relaxed);
        metrics
    }

    /// Whether metrics are being recorded.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub(crate) fn record_acquired(&self, waited: Option<Duration>) {
        if !self.is_enabled() {
            return;
        }
        self.acquisitions.inc();
        if let Some(waited) = waited {
            self.contended.inc();
            self.wait_time.observe_duration(waited);
        }
    }

    pub(crate) fn record_timeout(&self) {
        if self.is_enabled() {
            self.timeouts.inc();
        }
    }

    pub(crate) fn record_interrupted(&self) {
        if self.is_enabled() {
            self.interruptions.inc();
        }
    }

    pub(crate) fn record_released(&self) {
        if self.is_enabled() {
            self.releases.inc();
        }
    }

    pub(crate) fn record_illegal_unlock(&self) {
        if self.is_enabled() {
            self.illegal_unlocks.inc();
        }
    }

    pub(crate) fn record_cleanup(&self, changed: usize) {
        if self.is_enabled() {
            self.member_cleanups.inc_by(changed as u64);
        }
    }

    pub(crate) fn wait_started(&self) {
        if self.is_enabled() {
            self.waiting.inc();
        }
    }

    pub(crate) fn wait_finished(&self) {
        if self.is_enabled() {
            self.waiting.dec();
        }
    }

    /// Render every metric in the Prometheus text exposition format.
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();
        for counter in [
            &self.acquisitions,
            &self.contended,
            &self.timeouts,
            &self.interruptions,
            &self.releases,
            &self.illegal_unlocks,
            &self.member_cleanups,
        ] {
            push_header(&mut output, counter.name(), counter.help(), "counter");
            output.push_str(&format!("{} {}\n", counter.name(), counter.get()));
        }

        push_header(&mut output, self.waiting.name(), self.waiting.help(), "gauge");
        output.push_str(&format!("{} {}\n", self.waiting.name(), self.waiting.get()));

        let name = self.wait_time.name();
        let wait = self.wait_time.snapshot();
        push_header(&mut output, name, self.wait_time.help(), "histogram");
        for (upper, count) in wait.buckets.iter().zip(&wait.bucket_counts) {
            output.push_str(&format!("{}_bucket{{le=\"{}\"}} {}\n", name, upper, count));
        }
        output.push_str(&format!("{}_bucket{{le=\"+Inf\"}} {}\n", name, wait.count));
        output.push_str(&format!("{}_sum {}\n", name, wait.sum));
        output.push_str(&format!("{}_count {}\n", name, wait.count));
        output
    }

    /// Get a snapshot of the current values.
    pub fn snapshot(&self) -> LockMetricsSnapshot {
        LockMetricsSnapshot {
            acquisitions: self.acquisitions.get(),
            contended: self.contended.get(),
            timeouts: self.timeouts.get(),
            interruptions: self.interruptions.get(),
            releases: self.releases.get(),
            illegal_unlocks: self.illegal_unlocks.get(),
            member_cleanups: self.member_cleanups.get(),
            waiting: self.waiting.get(),
            wait_time: self.wait_time.snapshot(),
        }
    }
}

impl Default for LockMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn push_header(output: &mut String, name: &str, help: &str, kind: &str) {
    output.push_str(&format!("# HELP {} {}\n# TYPE {} {}\n", name, help, name, kind));
}

/// Point-in-time copy of [`LockMetrics`].
#[derive(Debug, Clone, Default)]
pub struct LockMetricsSnapshot {
    pub acquisitions: u64,
    pub contended: u64,
    pub timeouts: u64,
    pub interruptions: u64,
    pub releases: u64,
    pub illegal_unlocks: u64,
    pub member_cleanups: u64,
    pub waiting: i64,
    pub wait_time: HistogramSnapshot,
}

impl std::fmt::Display for LockMetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "acquired={} contended={} timeouts={} interrupted={} released={} \
             illegal_unlocks={} cleanups={} waiting={} mean_wait={:.3}s",
            self.acquisitions,
            self.contended,
            self.timeouts,
            self.interruptions,
            self.releases,
            self.illegal_unlocks,
            self.member_cleanups,
            self.waiting,
            self.wait_time.mean()
        )
    }
}
