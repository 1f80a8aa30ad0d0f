//! Probe counters, timers and request context.
//!
//! Logging itself goes through `tracing`; this module holds the counters
//! that `SmtpVerificationService` and the pool update, and the context that
//! ties the log lines of one batch together.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::types::Verdict;

/// Probe metrics collector.
#[derive(Debug, Default)]
pub struct ProbeMetrics {
    /// Verifications that reached the SMTP stage.
    pub probes: AtomicU64,
    /// Connection attempts.
    pub connection_attempts: AtomicU64,
    /// Failed connection attempts.
    pub connection_failures: AtomicU64,
    /// Connections served from the pool.
    pub pool_reuses: AtomicU64,
    /// STARTTLS upgrades.
    pub tls_upgrades: AtomicU64,
    /// MX hosts tried after the first one failed.
    pub host_fallbacks: AtomicU64,
    /// Valid verdicts.
    pub valid: AtomicU64,
    /// Invalid verdicts.
    pub invalid: AtomicU64,
    /// Unknown verdicts.
    pub unknown: AtomicU64,
    /// Greylisted replies.
    pub greylisted: AtomicU64,
}

impl ProbeMetrics {
    /// Creates a new metrics collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the start of an SMTP probe.
    pub fn record_probe(&self) {
        self.probes.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a connection attempt.
    pub fn record_connection_attempt(&self, success: bool) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.connection_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records a pooled connection reuse.
    pub fn record_pool_reuse(&self) {
        self.pool_reuses.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a TLS upgrade.
    pub fn record_tls_upgrade(&self) {
        self.tls_upgrades.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a fallback to the next MX host.
    pub fn record_host_fallback(&self) {
        self.host_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a greylisting reply.
    pub fn record_greylisted(&self) {
        self.greylisted.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a final verdict.
    pub fn record_verdict(&self, verdict: Verdict) {
        let counter = match verdict {
            Verdict::Valid => &self.valid,
            Verdict::Invalid => &self.invalid,
            Verdict::Unknown => &self.unknown,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            probes: self.probes.load(Ordering::Relaxed),
            connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
            connection_failures: self.connection_failures.load(Ordering::Relaxed),
            pool_reuses: self.pool_reuses.load(Ordering::Relaxed),
            tls_upgrades: self.tls_upgrades.load(Ordering::Relaxed),
            host_fallbacks: self.host_fallbacks.load(Ordering::Relaxed),
            valid: self.valid.load(Ordering::Relaxed),
            invalid: self.invalid.load(Ordering::Relaxed),
            unknown: self.unknown.load(Ordering::Relaxed),
            greylisted: self.greylisted.load(Ordering::Relaxed),
        }
    }

    /// Resets all metrics.
    pub fn reset(&self) {
        for counter in [
            &self.probes,
            &self.connection_attempts,
            &self.connection_failures,
            &self.pool_reuses,
            &self.tls_upgrades,
            &self.host_fallbacks,
            &self.valid,
            &self.invalid,
            &self.unknown,
            &self.greylisted,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Verifications that reached the SMTP stage.
    pub probes: u64,
    /// Connection attempts.
    pub connection_attempts: u64,
    /// Failed connection attempts.
    pub connection_failures: u64,
    /// Connections served from the pool.
    pub pool_reuses: u64,
    /// STARTTLS upgrades.
    pub tls_upgrades: u64,
    /// MX hosts tried after the first one failed.
    pub host_fallbacks: u64,
    /// Valid verdicts.
    pub valid: u64,
    /// Invalid verdicts.
    pub invalid: u64,
    /// Unknown verdicts.
    pub unknown: u64,
    /// Greylisted replies.
    pub greylisted: u64,
}

impl MetricsSnapshot {
    /// Share of connection attempts that succeeded.
    pub fn connection_success_rate(&self) -> f64 {
        if self.connection_attempts == 0 {
            1.0
        } else {
            (self.connection_attempts - self.connection_failures) as f64
                / self.connection_attempts as f64
        }
    }

    /// Share of probes that ended in a conclusive verdict.
    pub fn conclusive_rate(&self) -> f64 {
        let total = self.valid + self.invalid + self.unknown;
        if total == 0 {
            0.0
        } else {
            (self.valid + self.invalid) as f64 / total as f64
        }
    }
}

/// Timer for measuring operation duration.
#[derive(Debug)]
pub struct Timer {
    start: Instant,
    name: &'static str,
}

impl Timer {
    /// Creates and starts a new timer.
    pub fn start(name: &'static str) -> Self {
        Self {
            start: Instant::now(),
            name,
        }
    }

    /// Returns the elapsed time.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Elapsed whole milliseconds.
    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.start.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Stops the timer and returns the duration.
    pub fn stop(self) -> Duration {
        let elapsed = self.start.elapsed();
        tracing::trace!(timer = self.name, duration_ms = elapsed.as_millis() as u64, "Timer stopped");
        elapsed
    }
}

/// Context of one batch request, carried into its log lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    /// Caller-supplied or generated request ID.
    pub request_id: String,
    /// Addresses submitted.
    pub submitted: usize,
    /// Addresses left after de-duplication.
    pub unique: usize,
}

impl RequestContext {
    /// Creates a context, generating a request ID if none is given.
    pub fn new(request_id: Option<&str>, submitted: usize) -> Self {
        Self {
            request_id: request_id
                .map(str::to_string)
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            submitted,
            unique: submitted,
        }
    }

    /// Sets the de-duplicated count.
    pub fn with_unique(mut self, unique: usize) -> Self {
        self.unique = unique;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics() {
        let metrics = ProbeMetrics::new();

        metrics.record_connection_attempt(true);
        metrics.record_connection_attempt(false);
        metrics.record_verdict(Verdict::Valid);
        metrics.record_verdict(Verdict::Unknown);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connection_attempts, 2);
        assert_eq!(snapshot.connection_failures, 1);
        assert_eq!(snapshot.connection_success_rate(), 0.5);
        assert_eq!(snapshot.conclusive_rate(), 0.5);

        metrics.reset();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn test_timer() {
        let timer = Timer::start("test");
        std::thread::sleep(Duration::from_millis(10));
        assert!(timer.elapsed_ms() >= 10);
        assert!(timer.stop() >= Duration::from_millis(10));
    }

    #[test]
    fn test_request_context() {
        let ctx = RequestContext::new(Some("req-1"), 5).with_unique(4);
        assert_eq!(ctx.request_id, "req-1");
        assert_eq!(ctx.unique, 4);

        let generated = RequestContext::new(None, 1);
        assert_eq!(generated.request_id.len(), 36);
    }
}
