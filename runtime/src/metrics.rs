//! Prometheus metrics for the relay.
//!
//! Counters and histograms are recorded through the `metrics` facade and are
//! no-ops until a recorder is installed. The binary installs the Prometheus
//! exporter with [`MetricsServer`] when `METRICS_ADDR` is set.
//!
//! # Example
//!
//! ```rust,no_run
//! use order_relay_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use order_relay_core::error::RelayError;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub use metrics::{counter, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus scrape endpoint.
#[derive(Debug, Clone, Copy)]
pub struct MetricsServer {
    addr: SocketAddr,
}

impl MetricsServer {
    /// Create a server that will listen on `addr`.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    /// Address the scrape endpoint listens on
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Install the global recorder and start serving `/metrics`.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if the exporter cannot be built or a recorder
    /// is already installed.
    pub fn start(&self) -> Result<(), MetricsError> {
        register_metrics();

        exporter_builder()?
            .with_http_listener(self.addr)
            .install()
            .map_err(|e| MetricsError::Install(e.to_string()))?;

        tracing::info!(addr = %self.addr, "Metrics exporter listening on http://{}/metrics", self.addr);
        Ok(())
    }
}

fn exporter_builder() -> Result<PrometheusBuilder, MetricsError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Suffix("duration_seconds".to_string()),
            &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
        )
        .map_err(|e| MetricsError::Build(e.to_string()))
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(
        "relay_events_processed_total",
        "Deliveries persisted, published and handed back for acknowledgment"
    );
    describe_counter!(
        "relay_events_malformed_total",
        "Deliveries rejected because the payload failed validation"
    );
    describe_counter!(
        "relay_store_failures_total",
        "Record store writes that failed"
    );
    describe_counter!(
        "relay_publish_failures_total",
        "Stream publishes that failed after the record was stored"
    );
    describe_counter!(
        "relay_timeouts_total",
        "External steps that exceeded their timeout, by step"
    );
    describe_counter!(
        "relay_redeliveries_total",
        "In-process redeliveries of a failed delivery"
    );
    describe_counter!(
        "relay_dead_lettered_total",
        "Deliveries written to the dead-letter sink, by reason"
    );
    describe_counter!(
        "relay_ack_failures_total",
        "Broker acknowledgments that failed"
    );
    describe_histogram!(
        "relay_handle_duration_seconds",
        "Time spent in one relay cycle, by outcome"
    );
}

/// Relay metrics recorder.
pub struct RelayMetrics;

impl RelayMetrics {
    /// Record a successful relay cycle.
    pub fn record_processed(duration: Duration) {
        counter!("relay_events_processed_total").increment(1);
        histogram!("relay_handle_duration_seconds", "outcome" => "ok")
            .record(duration.as_secs_f64());
    }

    /// Record a failed relay cycle.
    pub fn record_failure(error: &RelayError, duration: Duration) {
        match error {
            RelayError::MalformedEvent(_) => {
                counter!("relay_events_malformed_total").increment(1);
            },
            RelayError::StoreWriteFailed(_) => {
                counter!("relay_store_failures_total").increment(1);
            },
            RelayError::PublishFailed(_) => {
                counter!("relay_publish_failures_total").increment(1);
            },
            RelayError::Timeout { step, .. } => {
                counter!("relay_timeouts_total", "step" => step.as_str()).increment(1);
            },
        }
        histogram!("relay_handle_duration_seconds", "outcome" => error.kind())
            .record(duration.as_secs_f64());
    }

    /// Record an in-process redelivery.
    pub fn record_redelivery() {
        counter!("relay_redeliveries_total").increment(1);
    }

    /// Record a dead-lettered delivery.
    pub fn record_dead_lettered(reason: &'static str) {
        counter!("relay_dead_lettered_total", "reason" => reason).increment(1);
    }

    /// Record a failed acknowledgment.
    pub fn record_ack_failure() {
        counter!("relay_ack_failures_total").increment(1);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use order_relay_core::error::RelayStep;
    use order_relay_core::record_store::StoreError;

    #[test]
    fn recording_without_recorder_is_a_no_op() {
        RelayMetrics::record_processed(Duration::from_millis(5));
        RelayMetrics::record_redelivery();
        RelayMetrics::record_ack_failure();
    }

    #[test]
    fn relay_metrics_render_in_prometheus_format() {
        let recorder = exporter_builder().unwrap().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            register_metrics();
            RelayMetrics::record_processed(Duration::from_millis(20));
            RelayMetrics::record_failure(
                &RelayError::StoreWriteFailed(StoreError::DatabaseError("down".to_string())),
                Duration::from_millis(3),
            );
            RelayMetrics::record_failure(
                &RelayError::Timeout {
                    step: RelayStep::Publish,
                    timeout: Duration::from_secs(5),
                },
                Duration::from_secs(5),
            );
            RelayMetrics::record_dead_lettered("malformed_event");
        });

        let rendered = handle.render();
        assert!(rendered.contains("relay_events_processed_total 1"));
        assert!(rendered.contains("relay_store_failures_total 1"));
        assert!(rendered.contains("relay_timeouts_total{step=\"publish\"} 1"));
        assert!(rendered.contains("relay_dead_lettered_total{reason=\"malformed_event\"} 1"));
        assert!(rendered.contains("relay_handle_duration_seconds_bucket"));
    }
}
