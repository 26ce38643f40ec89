//! Metrics for endpoint connections and tool calls
//!
//! Recorded through the `metrics` facade; nothing is exported unless the
//! embedding application installs a recorder (or the binary is built with
//! the `prometheus` feature).
//!
//! # Metrics
//!
//! - `mcphub_tool_calls_total`: Counter of tool calls by endpoint
//! - `mcphub_tool_call_failures_total`: Counter of failed calls by endpoint and kind
//! - `mcphub_tool_call_duration_seconds`: Histogram of call latency by endpoint
//! - `mcphub_connect_failures_total`: Counter of failed connects by endpoint

use std::cell::Cell;
use std::time::Instant;

use metrics::{histogram, increment_counter};

/// Metrics for a single routed call.
///
/// Counts the call on creation. Exactly one of [`CallMetrics::record_success`]
/// or [`CallMetrics::record_failure`] takes effect; a guard dropped without
/// either records nothing further.
#[derive(Debug)]
pub struct CallMetrics {
    endpoint: String,
    start: Instant,
    recorded: Cell<bool>,
}

impl CallMetrics {
    /// Start tracking a call routed to `endpoint`.
    ///
    /// # Examples
    ///
    /// ```
    /// use mcphub::mcp::metrics::CallMetrics;
    ///
    /// let metrics = CallMetrics::new("files");
    /// metrics.record_success();
    /// assert_eq!(metrics.endpoint(), "files");
    /// ```
    pub fn new(endpoint: &str) -> Self {
        increment_counter!("mcphub_tool_calls_total", "endpoint" => endpoint.to_string());
        Self {
            endpoint: endpoint.to_string(),
            start: Instant::now(),
            recorded: Cell::new(false),
        }
    }

    /// Record a completed call.
    pub fn record_success(&self) {
        if self.recorded.replace(true) {
            return;
        }
        histogram!(
            "mcphub_tool_call_duration_seconds",
            self.start.elapsed().as_secs_f64(),
            "endpoint" => self.endpoint.clone()
        );
    }

    /// Record a failed call with its failure kind.
    pub fn record_failure(&self, kind: &str) {
        if self.recorded.replace(true) {
            return;
        }
        increment_counter!(
            "mcphub_tool_call_failures_total",
            "endpoint" => self.endpoint.clone(),
            "kind" => kind.to_string()
        );
        histogram!(
            "mcphub_tool_call_duration_seconds",
            self.start.elapsed().as_secs_f64(),
            "endpoint" => self.endpoint.clone()
        );
    }

    /// Endpoint the call was routed to.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// Count a failed connect attempt.
pub fn record_connect_failure(endpoint: &str) {
    increment_counter!("mcphub_connect_failures_total", "endpoint" => endpoint.to_string());
}

/// Install the Prometheus exporter when built with the `prometheus` feature.
///
/// A no-op otherwise.
pub fn init_metrics_exporter() {
    #[cfg(feature = "prometheus")]
    {
        use metrics_exporter_prometheus::PrometheusBuilder;
        let _ = PrometheusBuilder::new().install().map_err(|e| {
            tracing::warn!("Failed to install Prometheus exporter: {}", e);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_then_failure_records_once() {
        let metrics = CallMetrics::new("a");
        metrics.record_success();
        metrics.record_failure("timeout");
        assert!(metrics.recorded.get());
    }

    #[test]
    fn test_drop_without_recording() {
        let _metrics = CallMetrics::new("a");
    }

    #[test]
    fn test_connect_failure_counter_without_recorder() {
        record_connect_failure("a");
        init_metrics_exporter();
    }
}
