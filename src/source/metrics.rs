//! Request counters for the source client.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestOutcome {
    Answered,
    /// The node no longer serves the height.
    Unavailable,
    Failed,
    TimedOut,
}

#[derive(Debug, Default)]
pub(crate) struct SourceMetrics {
    requests: AtomicU64,
    unavailable: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
    latency_ns: AtomicU64,
    slowest_ns: AtomicU64,
}

impl SourceMetrics {
    pub(crate) fn record(&self, outcome: RequestOutcome, latency: Duration) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        match outcome {
            RequestOutcome::Answered => {}
            RequestOutcome::Unavailable => {
                self.unavailable.fetch_add(1, Ordering::Relaxed);
            }
            RequestOutcome::Failed => {
                self.failures.fetch_add(1, Ordering::Relaxed);
            }
            RequestOutcome::TimedOut => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                self.timeouts.fetch_add(1, Ordering::Relaxed);
            }
        }

        let nanos = u64::try_from(latency.as_nanos()).unwrap_or(u64::MAX);
        self.latency_ns.fetch_add(nanos, Ordering::Relaxed);
        self.slowest_ns.fetch_max(nanos, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> SourceMetricsSnapshot {
        let requests = self.requests.load(Ordering::Relaxed);
        let average_latency = match requests {
            0 => Duration::ZERO,
            n => Duration::from_nanos(self.latency_ns.load(Ordering::Relaxed) / n),
        };

        SourceMetricsSnapshot {
            requests,
            unavailable: self.unavailable.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            average_latency,
            slowest: Duration::from_nanos(self.slowest_ns.load(Ordering::Relaxed)),
        }
    }
}

/// Totals since the client was built. `failures` includes `timeouts`;
/// unavailable heights are counted separately.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct SourceMetricsSnapshot {
    pub requests: u64,
    pub unavailable: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub average_latency: Duration,
    pub slowest: Duration,
}
