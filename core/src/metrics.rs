//! Prometheus metrics for the LDAP gateway
//!
//! - Operation counters (binds by result, searches by intent)
//! - Latency histogram per operation
//! - Session and TLS handshake counters
//! - Upstream failover, step-up and directory reload counters

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;
use std::time::Instant;

/// Gateway metrics registry
#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    // Operation metrics
    pub binds_total: CounterVec,
    pub searches_total: CounterVec,
    pub entries_sent_total: CounterVec,
    pub operation_duration_seconds: HistogramVec,
    pub operations_in_flight: Gauge,

    // Session metrics
    pub sessions_active: IntGauge,
    pub connections_total: Counter,
    pub tls_handshakes_total: CounterVec,

    // Backend metrics
    pub upstream_attempts_total: CounterVec,
    pub upstream_failed_servers: IntGauge,
    pub step_up_total: CounterVec,
    pub directory_reloads_total: CounterVec,
}

impl Metrics {
    /// Create new metrics registry with all metrics registered
    pub fn new() -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let registry = Registry::new();

        let binds_total = CounterVec::new(
            Opts::new("ldap_gateway_binds_total", "Total bind operations"),
            &["result"],
        )?;
        registry.register(Box::new(binds_total.clone()))?;

        let searches_total = CounterVec::new(
            Opts::new("ldap_gateway_searches_total", "Total search operations"),
            &["intent", "result"],
        )?;
        registry.register(Box::new(searches_total.clone()))?;

        let entries_sent_total = CounterVec::new(
            Opts::new(
                "ldap_gateway_entries_sent_total",
                "Search result entries sent to clients",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(entries_sent_total.clone()))?;

        let operation_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "ldap_gateway_operation_duration_seconds",
                "LDAP operation duration in seconds",
            )
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
            ]),
            &["operation"],
        )?;
        registry.register(Box::new(operation_duration_seconds.clone()))?;

        let operations_in_flight = Gauge::new(
            "ldap_gateway_operations_in_flight",
            "Number of operations currently being processed",
        )?;
        registry.register(Box::new(operations_in_flight.clone()))?;

        let sessions_active = IntGauge::new(
            "ldap_gateway_sessions_active",
            "Number of open client sessions",
        )?;
        registry.register(Box::new(sessions_active.clone()))?;

        let connections_total = Counter::new(
            "ldap_gateway_connections_total",
            "Total accepted client connections",
        )?;
        registry.register(Box::new(connections_total.clone()))?;

        let tls_handshakes_total = CounterVec::new(
            Opts::new("ldap_gateway_tls_handshakes_total", "Total TLS handshakes"),
            &["status"],
        )?;
        registry.register(Box::new(tls_handshakes_total.clone()))?;

        let upstream_attempts_total = CounterVec::new(
            Opts::new(
                "ldap_gateway_upstream_attempts_total",
                "Upstream LDAP bind attempts",
            ),
            &["server", "result"],
        )?;
        registry.register(Box::new(upstream_attempts_total.clone()))?;

        let upstream_failed_servers = IntGauge::new(
            "ldap_gateway_upstream_failed_servers",
            "Upstream servers currently in the failure table",
        )?;
        registry.register(Box::new(upstream_failed_servers.clone()))?;

        let step_up_total = CounterVec::new(
            Opts::new("ldap_gateway_step_up_total", "Step-up approval outcomes"),
            &["outcome"],
        )?;
        registry.register(Box::new(step_up_total.clone()))?;

        let directory_reloads_total = CounterVec::new(
            Opts::new(
                "ldap_gateway_directory_reloads_total",
                "File-backed directory reloads",
            ),
            &["source", "result"],
        )?;
        registry.register(Box::new(directory_reloads_total.clone()))?;

        Ok(Metrics {
            registry,
            binds_total,
            searches_total,
            entries_sent_total,
            operation_duration_seconds,
            operations_in_flight,
            sessions_active,
            connections_total,
            tls_handshakes_total,
            upstream_attempts_total,
            upstream_failed_servers,
            step_up_total,
            directory_reloads_total,
        })
    }

    /// Export metrics in Prometheus text format
    pub fn export(&self) -> Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync>> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(buffer)
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("Failed to create metrics")
    }
}

/// Records one operation's duration and result when finished
pub struct OperationGuard {
    metrics: Arc<Metrics>,
    start: Instant,
    operation: &'static str,
}

impl OperationGuard {
    pub fn new(metrics: Arc<Metrics>, operation: &'static str) -> Self {
        metrics.operations_in_flight.inc();
        Self {
            metrics,
            start: Instant::now(),
            operation,
        }
    }

    pub fn finish_bind(self, result: &str) {
        self.metrics.binds_total.with_label_values(&[result]).inc();
    }

    pub fn finish_search(self, intent: &str, result: &str) {
        self.metrics
            .searches_total
            .with_label_values(&[intent, result])
            .inc();
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.metrics.operations_in_flight.dec();
        self.metrics
            .operation_duration_seconds
            .with_label_values(&[self.operation])
            .observe(self.start.elapsed().as_secs_f64());
    }
}
