//! Prometheus metrics for the controller
//!
//! Exposed on `/metrics` by the health server.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

/// Metrics shared between the reconciler and the health server
pub type SharedMetrics = Arc<ControllerMetrics>;

pub struct ControllerMetrics {
    registry: Registry,
    reconciliations: IntCounterVec,
    reconciliation_duration: HistogramVec,
    skipped: IntCounter,
    conflicts: IntCounter,
    persist_failures: IntCounter,
    invariant_violations: IntCounter,
    candidate_weight: IntGaugeVec,
}

impl ControllerMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("vaaka".to_string()), None)?;

        let reconciliations = IntCounterVec::new(
            Opts::new("reconciliations_total", "Reconcile ticks by result"),
            &["result", "kind"],
        )?;
        let reconciliation_duration = HistogramVec::new(
            HistogramOpts::new(
                "reconciliation_duration_seconds",
                "Duration of reconcile ticks",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
            &["result"],
        )?;
        let skipped = IntCounter::new(
            "reconciliations_skipped_total",
            "Reconciles skipped because this replica is not the leader",
        )?;
        let conflicts = IntCounter::new(
            "status_conflicts_total",
            "Status writes rejected by a concurrent update",
        )?;
        let persist_failures = IntCounter::new(
            "status_persist_failures_total",
            "Status writes that failed for reasons other than a conflict",
        )?;
        let invariant_violations = IntCounter::new(
            "invariant_violations_total",
            "Traffic backend reported a split other than the one requested",
        )?;
        let candidate_weight = IntGaugeVec::new(
            Opts::new(
                "experiment_candidate_weight",
                "Candidate traffic weight recorded in Experiment status",
            ),
            &["namespace", "experiment"],
        )?;

        registry.register(Box::new(reconciliations.clone()))?;
        registry.register(Box::new(reconciliation_duration.clone()))?;
        registry.register(Box::new(skipped.clone()))?;
        registry.register(Box::new(conflicts.clone()))?;
        registry.register(Box::new(persist_failures.clone()))?;
        registry.register(Box::new(invariant_violations.clone()))?;
        registry.register(Box::new(candidate_weight.clone()))?;

        Ok(Self {
            registry,
            reconciliations,
            reconciliation_duration,
            skipped,
            conflicts,
            persist_failures,
            invariant_violations,
            candidate_weight,
        })
    }

    pub fn record_reconciliation_success(&self, duration_secs: f64) {
        self.reconciliations
            .with_label_values(&["success", "none"])
            .inc();
        self.reconciliation_duration
            .with_label_values(&["success"])
            .observe(duration_secs);
    }

    /// `kind` is the error label from `ReconcileError::kind`
    pub fn record_reconciliation_error(&self, kind: &str, duration_secs: f64) {
        self.reconciliations
            .with_label_values(&["error", kind])
            .inc();
        self.reconciliation_duration
            .with_label_values(&["error"])
            .observe(duration_secs);
    }

    pub fn record_reconciliation_skipped(&self) {
        self.skipped.inc();
    }

    pub fn record_conflict(&self) {
        self.conflicts.inc();
    }

    pub fn record_persist_failure(&self) {
        self.persist_failures.inc();
    }

    pub fn record_invariant_violation(&self) {
        self.invariant_violations.inc();
    }

    pub fn set_candidate_weight(&self, namespace: &str, experiment: &str, weight: i64) {
        self.candidate_weight
            .with_label_values(&[namespace, experiment])
            .set(weight);
    }

    /// Render every registered metric in the Prometheus text format
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Create the controller metrics registry
pub fn create_metrics() -> Result<SharedMetrics, prometheus::Error> {
    Ok(Arc::new(ControllerMetrics::new()?))
}
