//! Prometheus metrics for the controller
//!
//! - `kanary_reconciliations_total{result}` - reconcile passes by outcome
//! - `kanary_reconciliation_duration_seconds` - time spent per pass
//! - `kanary_traffic_weight{namespace,experiment,version}` - weight last routed

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

pub struct ControllerMetrics {
    registry: Registry,
    reconciliations: IntCounterVec,
    reconcile_duration: Histogram,
    traffic_weight: IntGaugeVec,
}

pub type SharedMetrics = Arc<ControllerMetrics>;

impl ControllerMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let reconciliations = IntCounterVec::new(
            Opts::new(
                "kanary_reconciliations_total",
                "Experiment reconciliations by result",
            ),
            &["result"],
        )?;
        let reconcile_duration = Histogram::with_opts(
            HistogramOpts::new(
                "kanary_reconciliation_duration_seconds",
                "Duration of successful experiment reconciliations",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 30.0]),
        )?;
        let traffic_weight = IntGaugeVec::new(
            Opts::new(
                "kanary_traffic_weight",
                "Traffic weight currently routed to each experiment version",
            ),
            &["namespace", "experiment", "version"],
        )?;

        registry.register(Box::new(reconciliations.clone()))?;
        registry.register(Box::new(reconcile_duration.clone()))?;
        registry.register(Box::new(traffic_weight.clone()))?;

        Ok(Self {
            registry,
            reconciliations,
            reconcile_duration,
            traffic_weight,
        })
    }

    pub fn record_reconciliation_success(&self, duration_secs: f64) {
        self.reconciliations.with_label_values(&["success"]).inc();
        self.reconcile_duration.observe(duration_secs);
    }

    pub fn record_reconciliation_error(&self) {
        self.reconciliations.with_label_values(&["error"]).inc();
    }

    pub fn set_traffic_weight(&self, namespace: &str, experiment: &str, version: &str, weight: i32) {
        self.traffic_weight
            .with_label_values(&[namespace, experiment, version])
            .set(i64::from(weight));
    }

    /// Text exposition format for `/metrics`
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

pub fn create_metrics() -> Result<SharedMetrics, prometheus::Error> {
    ControllerMetrics::new().map(Arc::new)
}
