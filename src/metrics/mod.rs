//! Prometheus metrics for the session layer
//!
//! The embedding proxy exposes `metrics().gather()` however it serves
//! its other metrics.

use prometheus::{IntCounterVec, IntGauge, Opts, Registry};
use std::sync::OnceLock;

/// Global metrics registry
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Get the global metrics instance
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

/// Session metrics collection
pub struct Metrics {
    /// Registry for all metrics
    pub registry: Registry,

    /// Commands handled, by command kind
    pub commands_total: IntCounterVec,
    /// Commands that returned an error, by command kind
    pub command_errors_total: IntCounterVec,

    /// Finished transactions by outcome (committed, rolled_back, abandoned)
    pub transactions_total: IntCounterVec,
    /// Transactions currently pinned to a connection
    pub active_transactions: IntGauge,
    /// Prepared statements currently registered
    pub prepared_statements: IntGauge,
}

impl Metrics {
    /// Create a new metrics collection
    pub fn new() -> Self {
        let registry = Registry::new();

        let commands_total = IntCounterVec::new(
            Opts::new("session_commands_total", "Total number of session commands handled"),
            &["kind"], // begin, commit, rollback, prepare, execute, deallocate, query
        )
        .unwrap();

        let command_errors_total = IntCounterVec::new(
            Opts::new(
                "session_command_errors_total",
                "Total number of session commands that failed",
            ),
            &["kind"],
        )
        .unwrap();

        let transactions_total = IntCounterVec::new(
            Opts::new("session_transactions_total", "Total number of finished transactions"),
            &["outcome"],
        )
        .unwrap();

        let active_transactions = IntGauge::new(
            "session_active_transactions",
            "Current number of transactions pinned to a connection",
        )
        .unwrap();

        let prepared_statements = IntGauge::new(
            "session_prepared_statements",
            "Current number of registered prepared statements",
        )
        .unwrap();

        registry.register(Box::new(commands_total.clone())).unwrap();
        registry
            .register(Box::new(command_errors_total.clone()))
            .unwrap();
        registry
            .register(Box::new(transactions_total.clone()))
            .unwrap();
        registry
            .register(Box::new(active_transactions.clone()))
            .unwrap();
        registry
            .register(Box::new(prepared_statements.clone()))
            .unwrap();

        Self {
            registry,
            commands_total,
            command_errors_total,
            transactions_total,
            active_transactions,
            prepared_statements,
        }
    }

    /// Record a handled command
    pub fn record_command(&self, kind: &str) {
        self.commands_total.with_label_values(&[kind]).inc();
    }

    /// Record a failed command
    pub fn record_command_error(&self, kind: &str) {
        self.command_errors_total.with_label_values(&[kind]).inc();
    }

    /// Record a transaction pinned to a connection
    pub fn record_transaction_started(&self) {
        self.active_transactions.inc();
    }

    /// Record a transaction leaving the table
    pub fn record_transaction_finished(&self, outcome: &str) {
        self.active_transactions.dec();
        self.transactions_total.with_label_values(&[outcome]).inc();
    }

    pub fn record_statement_prepared(&self) {
        self.prepared_statements.inc();
    }

    pub fn record_statement_released(&self) {
        self.prepared_statements.dec();
    }

    /// Get metrics as Prometheus text format
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
