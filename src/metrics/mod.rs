//! Prometheus metrics for monitoring.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Metrics collector.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Total requests dispatched
    pub requests_total: AtomicU64,
    /// Requests answered with a result
    pub requests_success: AtomicU64,
    /// Requests answered with an error other than cancellation
    pub requests_failed: AtomicU64,
    /// Requests answered with a cancellation
    pub requests_cancelled: AtomicU64,
    /// Tool invocations
    pub tool_calls: AtomicU64,
    /// Sessions opened since start
    pub sessions_opened: AtomicU64,
    /// Live sessions
    pub active_sessions: AtomicU64,
    /// Requests currently executing
    pub in_flight: AtomicU64,
}

impl Metrics {
    /// Create a new metrics collector.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn inc_requests(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_success(&self) {
        self.requests_success.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_failed(&self) {
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cancelled(&self) {
        self.requests_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_tool_calls(&self) {
        self.tool_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_opened(&self) {
        self.sessions_opened.fetch_add(1, Ordering::Relaxed);
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_closed(&self) {
        let _ = self
            .active_sessions
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn request_started(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_finished(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    /// Get all metrics as a snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_success: self.requests_success.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            requests_cancelled: self.requests_cancelled.load(Ordering::Relaxed),
            tool_calls: self.tool_calls.load(Ordering::Relaxed),
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
        }
    }

    /// Export metrics in Prometheus format.
    pub fn to_prometheus(&self) -> String {
        let s = self.snapshot();
        format!(
            r#"# HELP streamable_mcp_requests_total Total number of requests
# TYPE streamable_mcp_requests_total counter
streamable_mcp_requests_total {}

# HELP streamable_mcp_requests_success Requests answered with a result
# TYPE streamable_mcp_requests_success counter
streamable_mcp_requests_success {}

# HELP streamable_mcp_requests_failed Requests answered with an error
# TYPE streamable_mcp_requests_failed counter
streamable_mcp_requests_failed {}

# HELP streamable_mcp_requests_cancelled Requests answered with a cancellation
# TYPE streamable_mcp_requests_cancelled counter
streamable_mcp_requests_cancelled {}

# HELP streamable_mcp_tool_calls Tool invocations
# TYPE streamable_mcp_tool_calls counter
streamable_mcp_tool_calls {}

# HELP streamable_mcp_sessions_opened Sessions opened since start
# TYPE streamable_mcp_sessions_opened counter
streamable_mcp_sessions_opened {}

# HELP streamable_mcp_active_sessions Live sessions
# TYPE streamable_mcp_active_sessions gauge
streamable_mcp_active_sessions {}

# HELP streamable_mcp_in_flight Requests currently executing
# TYPE streamable_mcp_in_flight gauge
streamable_mcp_in_flight {}
"#,
            s.requests_total,
            s.requests_success,
            s.requests_failed,
            s.requests_cancelled,
            s.tool_calls,
            s.sessions_opened,
            s.active_sessions,
            s.in_flight
        )
    }
}

/// Metrics snapshot.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub requests_success: u64,
    pub requests_failed: u64,
    pub requests_cancelled: u64,
    pub tool_calls: u64,
    pub sessions_opened: u64,
    pub active_sessions: u64,
    pub in_flight: u64,
}

/// Timer for measuring durations.
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Start a new timer.
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed time in milliseconds.
    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = Metrics::new();
        metrics.inc_requests();
        metrics.inc_requests();
        metrics.inc_success();
        metrics.inc_cancelled();
        metrics.session_opened();

        let s = metrics.snapshot();
        assert_eq!(s.requests_total, 2);
        assert_eq!(s.requests_success, 1);
        assert_eq!(s.requests_cancelled, 1);
        assert_eq!(s.active_sessions, 1);
    }

    #[test]
    fn test_gauges_do_not_underflow() {
        let metrics = Metrics::new();
        metrics.session_closed();
        metrics.request_finished();

        let s = metrics.snapshot();
        assert_eq!(s.active_sessions, 0);
        assert_eq!(s.in_flight, 0);
    }

    #[test]
    fn test_prometheus_export() {
        let metrics = Metrics::new();
        metrics.inc_tool_calls();

        let text = metrics.to_prometheus();
        assert!(text.contains("# TYPE streamable_mcp_tool_calls counter"));
        assert!(text.contains("streamable_mcp_tool_calls 1"));
        assert!(text.contains("streamable_mcp_active_sessions 0"));
    }
}
