//! Driver Metrics
//!
//! Prometheus collectors for appliance traffic and lifecycle operations.
//! Each driver instance owns its registry so several instances (and tests)
//! can coexist in one process.

use crate::error::Result;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::time::Duration;

/// Metric namespace
const NAMESPACE: &str = "truenas_driver";

/// Prometheus collectors for one driver instance
pub struct DriverMetrics {
    registry: Registry,
    /// Appliance requests by command and outcome
    requests: IntCounterVec,
    /// Appliance request latency by command
    request_duration: HistogramVec,
    /// Retries of transient failures by command
    retries: IntCounterVec,
    /// Session re-authentications
    reauthentications: IntCounter,
    /// Lifecycle operations by operation and outcome
    operations: IntCounterVec,
}

impl DriverMetrics {
    /// Create and register all collectors
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let requests = IntCounterVec::new(
            Opts::new("appliance_requests_total", "Appliance API requests")
                .namespace(NAMESPACE),
            &["command", "outcome"],
        )?;
        let request_duration = HistogramVec::new(
            HistogramOpts::new(
                "appliance_request_duration_seconds",
                "Appliance API request latency",
            )
            .namespace(NAMESPACE),
            &["command"],
        )?;
        let retries = IntCounterVec::new(
            Opts::new("appliance_retries_total", "Retries after transient failures")
                .namespace(NAMESPACE),
            &["command"],
        )?;
        let reauthentications = IntCounter::with_opts(
            Opts::new("appliance_reauthentications_total", "Session re-authentications")
                .namespace(NAMESPACE),
        )?;
        let operations = IntCounterVec::new(
            Opts::new("operations_total", "Volume and snapshot lifecycle operations")
                .namespace(NAMESPACE),
            &["operation", "outcome"],
        )?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(request_duration.clone()))?;
        registry.register(Box::new(retries.clone()))?;
        registry.register(Box::new(reauthentications.clone()))?;
        registry.register(Box::new(operations.clone()))?;

        Ok(Self {
            registry,
            requests,
            request_duration,
            retries,
            reauthentications,
            operations,
        })
    }

    /// Record one appliance request
    pub fn record_request(&self, command: &str, outcome: &str, elapsed: Duration) {
        self.requests.with_label_values(&[command, outcome]).inc();
        self.request_duration
            .with_label_values(&[command])
            .observe(elapsed.as_secs_f64());
    }

    /// Record a retry of a transient failure
    pub fn record_retry(&self, command: &str) {
        self.retries.with_label_values(&[command]).inc();
    }

    /// Record a session re-authentication
    pub fn record_reauthentication(&self) {
        self.reauthentications.inc();
    }

    /// Record the outcome of a lifecycle operation
    pub fn record_operation<T>(&self, operation: &str, result: &Result<T>) {
        let outcome = match result {
            Ok(_) => "success".to_string(),
            Err(e) => e.kind().to_string(),
        };
        self.operations
            .with_label_values(&[operation, outcome.as_str()])
            .inc();
    }

    /// Number of requests recorded for a command and outcome
    pub fn request_count(&self, command: &str, outcome: &str) -> u64 {
        self.requests.with_label_values(&[command, outcome]).get()
    }

    /// Number of retries recorded for a command
    pub fn retry_count(&self, command: &str) -> u64 {
        self.retries.with_label_values(&[command]).get()
    }

    /// Number of re-authentications recorded
    pub fn reauthentication_count(&self) -> u64 {
        self.reauthentications.get()
    }

    /// Render all metrics in the Prometheus text format
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}
