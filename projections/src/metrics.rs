//! Prometheus metrics for projection progress.
//!
//! Every metric is labelled with `projection`:
//!
//! - `projection_events_applied_total` - events applied and checkpointed
//! - `projection_events_skipped_total` - events skipped by an operator
//! - `projection_conflicts_total` - checkpoint advances lost to another writer
//! - `projection_apply_failures_total` - events that halted the projection
//! - `projection_transient_retries_total` - transient errors that were retried
//! - `projection_checkpoint` - last applied sequence
//! - `projection_lag` - head minus checkpoint
//! - `projection_apply_duration_seconds` - begin-to-commit time per event
//!
//! # Example
//!
//! ```rust,no_run
//! use projector_projections::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub use metrics::{counter, gauge, histogram};

/// Events applied and checkpointed.
pub const EVENTS_APPLIED: &str = "projection_events_applied_total";
/// Events skipped by an operator.
pub const EVENTS_SKIPPED: &str = "projection_events_skipped_total";
/// Checkpoint advances that lost to another writer.
pub const CONFLICTS: &str = "projection_conflicts_total";
/// Events that halted a projection.
pub const APPLY_FAILURES: &str = "projection_apply_failures_total";
/// Transient failures that were retried.
pub const TRANSIENT_RETRIES: &str = "projection_transient_retries_total";
/// Last applied sequence.
pub const CHECKPOINT: &str = "projection_checkpoint";
/// Head of the log minus checkpoint.
pub const LAG: &str = "projection_lag";
/// Begin-to-commit time for one event.
pub const APPLY_DURATION: &str = "projection_apply_duration_seconds";

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

/// Prometheus metrics server.
///
/// Exposes metrics on an HTTP endpoint for Prometheus scraping.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Socket address to bind to (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Install the Prometheus recorder and start the HTTP listener.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let (recorder, exporter) = builder
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;
        let handle = recorder.handle();

        metrics::set_global_recorder(recorder).map_err(|e| MetricsError::Install(e.to_string()))?;
        tokio::spawn(async move {
            if exporter.await.is_err() {
                tracing::error!("Metrics HTTP listener stopped");
            }
        });

        self.handle = Some(handle);
        tracing::info!(
            addr = %self.addr,
            "Metrics server started - available at http://{}/metrics",
            self.addr
        );
        Ok(())
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if server hasn't been started.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    describe_counter!(EVENTS_APPLIED, "Events applied and checkpointed per projection");
    describe_counter!(EVENTS_SKIPPED, "Events skipped by an operator per projection");
    describe_counter!(CONFLICTS, "Checkpoint advances lost to a concurrent writer");
    describe_counter!(APPLY_FAILURES, "Events that halted a projection");
    describe_counter!(
        TRANSIENT_RETRIES,
        "Transient store errors retried by the runner"
    );
    describe_gauge!(CHECKPOINT, "Last applied global sequence");
    describe_gauge!(LAG, "Committed events not yet applied");
    describe_histogram!(APPLY_DURATION, "Time from begin to commit for one event");
}

/// Record a committed event for `projection`.
pub fn record_applied(projection: &str, duration: Duration) {
    counter!(EVENTS_APPLIED, "projection" => projection.to_string()).increment(1);
    histogram!(APPLY_DURATION, "projection" => projection.to_string())
        .record(duration.as_secs_f64());
}

/// Record an operator skip for `projection`.
pub fn record_skipped(projection: &str) {
    counter!(EVENTS_SKIPPED, "projection" => projection.to_string()).increment(1);
}

/// Record a lost checkpoint race for `projection`.
pub fn record_conflict(projection: &str) {
    counter!(CONFLICTS, "projection" => projection.to_string()).increment(1);
}

/// Record a halting failure for `projection`.
pub fn record_apply_failure(projection: &str) {
    counter!(APPLY_FAILURES, "projection" => projection.to_string()).increment(1);
}

/// Record a retried transient error for `projection`.
pub fn record_transient_retry(projection: &str) {
    counter!(TRANSIENT_RETRIES, "projection" => projection.to_string()).increment(1);
}

/// Publish checkpoint and lag gauges for `projection`.
#[allow(clippy::cast_precision_loss)]
pub fn record_position(projection: &str, checkpoint: u64, head: u64) {
    gauge!(CHECKPOINT, "projection" => projection.to_string()).set(checkpoint as f64);
    gauge!(LAG, "projection" => projection.to_string())
        .set(head.saturating_sub(checkpoint) as f64);
}
