use prometheus::{histogram_opts, opts, HistogramVec, IntCounter, IntCounterVec, Registry};
use tokio::time::Instant;

#[derive(Clone)]
pub struct Metrics {
    pub reconciliations: IntCounter,
    pub failures: IntCounterVec,
    pub reconcile_duration: HistogramVec,
    pub throttled: IntCounter,
    pub deletions_confirmed: IntCounter,
    pub drift_detected: IntCounter,
    pub convergence_intents: IntCounterVec,
}

impl Default for Metrics {
    fn default() -> Self {
        let reconcile_duration = HistogramVec::new(
            histogram_opts!(
                "actuator_reconcile_duration_seconds",
                "The duration of a resource reconcile in seconds",
            )
            .buckets(vec![0.01, 0.1, 0.25, 0.5, 1., 5., 15., 60.]),
            &["source"],
        )
        .unwrap();
        let failures = IntCounterVec::new(
            opts!("actuator_reconciliation_errors_total", "reconciliation errors"),
            &["source", "error"],
        )
        .unwrap();
        let reconciliations =
            IntCounter::new("actuator_reconciliations_total", "reconciliations").unwrap();
        let throttled = IntCounter::new(
            "actuator_reconciliations_throttled_total",
            "relist reconciles skipped inside the min reconcile gap",
        )
        .unwrap();
        let deletions_confirmed = IntCounter::new(
            "actuator_deletions_confirmed_total",
            "documents whose absence both upstreams confirmed",
        )
        .unwrap();
        let drift_detected = IntCounter::new(
            "actuator_drift_detected_total",
            "missing documents with live upstream state",
        )
        .unwrap();
        let convergence_intents = IntCounterVec::new(
            opts!("actuator_convergence_intents_total", "emitted convergence intents"),
            &["intent"],
        )
        .unwrap();
        Metrics {
            reconciliations,
            failures,
            reconcile_duration,
            throttled,
            deletions_confirmed,
            drift_detected,
            convergence_intents,
        }
    }
}

impl Metrics {
    /// Register API metrics to start tracking them.
    pub fn register(self, registry: &Registry) -> Result<Self, prometheus::Error> {
        registry.register(Box::new(self.reconcile_duration.clone()))?;
        registry.register(Box::new(self.failures.clone()))?;
        registry.register(Box::new(self.reconciliations.clone()))?;
        registry.register(Box::new(self.throttled.clone()))?;
        registry.register(Box::new(self.deletions_confirmed.clone()))?;
        registry.register(Box::new(self.drift_detected.clone()))?;
        registry.register(Box::new(self.convergence_intents.clone()))?;
        Ok(self)
    }

    pub fn reconcile_failure(&self, source: &str, error_label: &str) {
        self.failures.with_label_values(&[source, error_label]).inc()
    }

    pub fn count_and_measure(&self, source: &str) -> ReconcileMeasurer {
        self.reconciliations.inc();
        ReconcileMeasurer {
            start: Instant::now(),
            metric: self.reconcile_duration.clone(),
            source: source.to_string(),
        }
    }
}

/// Smart function duration measurer
///
/// Relies on Drop to calculate duration and register the observation in the histogram
pub struct ReconcileMeasurer {
    start: Instant,
    metric: HistogramVec,
    source: String,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        #[allow(clippy::cast_precision_loss)]
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        self.metric
            .with_label_values(&[self.source.as_str()])
            .observe(duration);
    }
}
