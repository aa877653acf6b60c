//! Prometheus metrics for the fnhost sandbox.
//!
//! This module is only compiled when the `metrics` feature is enabled.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;
use std::sync::atomic::AtomicI64;

/// Label set for execution metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ExecutionLabels {
    /// `success` or the error kind label.
    pub outcome: String,
}

/// Label set for error metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    /// The error kind, e.g. `runtime_error` or `resource_exceeded`.
    pub error_kind: String,
}

/// Prometheus metrics for sandbox invocations.
pub struct FnhostMetrics {
    /// Total number of invocations by outcome.
    pub executions_total: Family<ExecutionLabels, Counter>,
    /// Invocation duration in seconds by outcome.
    pub execution_duration_seconds: Family<ExecutionLabels, Histogram>,
    /// Total number of errors by kind.
    pub errors_total: Family<ErrorLabels, Counter>,
    /// Sandbox contexts currently alive.
    pub contexts_alive: Gauge<i64, AtomicI64>,
}

impl FnhostMetrics {
    /// Create the metrics and register them with the given registry.
    pub fn new(registry: &mut Registry) -> Self {
        let executions_total = Family::default();
        registry.register(
            "fnhost_executions_total",
            "Total function executions",
            executions_total.clone(),
        );

        let execution_duration_seconds =
            Family::<ExecutionLabels, Histogram>::new_with_constructor(|| {
                Histogram::new([0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0].into_iter())
            });
        registry.register(
            "fnhost_execution_duration_seconds",
            "Function execution duration",
            execution_duration_seconds.clone(),
        );

        let errors_total = Family::default();
        registry.register(
            "fnhost_errors_total",
            "Total function execution errors by kind",
            errors_total.clone(),
        );

        let contexts_alive = Gauge::default();
        registry.register(
            "fnhost_contexts_alive",
            "Sandbox contexts currently alive",
            contexts_alive.clone(),
        );

        Self {
            executions_total,
            execution_duration_seconds,
            errors_total,
            contexts_alive,
        }
    }

    /// Record a finished invocation. `error_kind` is `None` on success.
    pub fn record_execution(&self, error_kind: Option<&str>, duration_secs: f64) {
        let labels = ExecutionLabels {
            outcome: error_kind.unwrap_or("success").to_string(),
        };
        self.executions_total.get_or_create(&labels).inc();
        self.execution_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
        if let Some(kind) = error_kind {
            self.errors_total
                .get_or_create(&ErrorLabels {
                    error_kind: kind.to_string(),
                })
                .inc();
        }
    }
}
