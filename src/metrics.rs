use crate::Error;
use prometheus::{
    histogram_opts, opts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Registry,
};
use tokio::time::Instant;

/// Units of work the engine measures
pub mod kind {
    pub const DEPLOYMENT: &str = "deployment";
    pub const ADDON: &str = "addon";
    pub const FUNCTION: &str = "function";
    pub const DRIFT_SYNC: &str = "drift_sync";
}

#[derive(Clone)]
pub struct Metrics {
    pub reconciliations: IntCounter,
    pub failures: IntCounterVec,
    pub reconcile_duration: HistogramVec,
    pub work_queue_depth: IntGauge,
    pub retry_queue_depth: IntGauge,
    pub dropped_work: IntCounter,
}

impl Default for Metrics {
    fn default() -> Self {
        let reconcile_duration = HistogramVec::new(
            histogram_opts!(
                "switchyard_reconcile_duration_seconds",
                "The duration of reconcile to complete in seconds"
            )
            .buckets(vec![0.01, 0.1, 0.25, 0.5, 1., 5., 15., 60.]),
            &["kind"],
        )
        .unwrap();
        let failures = IntCounterVec::new(
            opts!(
                "switchyard_reconciliation_errors_total",
                "reconciliation errors",
            ),
            &["kind", "error"],
        )
        .unwrap();
        let reconciliations =
            IntCounter::new("switchyard_reconciliations_total", "reconciliations").unwrap();
        let work_queue_depth = IntGauge::new(
            "switchyard_work_queue_depth",
            "items waiting in the bounded work queue",
        )
        .unwrap();
        let retry_queue_depth = IntGauge::new(
            "switchyard_retry_queue_depth",
            "items parked in the overflow retry queue",
        )
        .unwrap();
        let dropped_work = IntCounter::new(
            "switchyard_dropped_work_total",
            "work items the bounded queue could not admit",
        )
        .unwrap();
        Metrics {
            reconciliations,
            failures,
            reconcile_duration,
            work_queue_depth,
            retry_queue_depth,
            dropped_work,
        }
    }
}

impl Metrics {
    /// Register API metrics to start tracking them.
    pub fn register(self, registry: &Registry) -> Result<Self, prometheus::Error> {
        registry.register(Box::new(self.reconcile_duration.clone()))?;
        registry.register(Box::new(self.failures.clone()))?;
        registry.register(Box::new(self.reconciliations.clone()))?;
        registry.register(Box::new(self.work_queue_depth.clone()))?;
        registry.register(Box::new(self.retry_queue_depth.clone()))?;
        registry.register(Box::new(self.dropped_work.clone()))?;
        Ok(self)
    }

    pub fn reconcile_failure(&self, kind: &str, e: &Error) {
        self.failures
            .with_label_values(&[kind, e.metric_label()])
            .inc()
    }

    pub fn count_and_measure(&self, kind: &'static str) -> ReconcileMeasurer {
        self.reconciliations.inc();
        ReconcileMeasurer {
            start: Instant::now(),
            metric: self.reconcile_duration.clone(),
            kind,
        }
    }

    pub fn set_queue_depths(&self, work: usize, retry: usize) {
        self.work_queue_depth.set(work as i64);
        self.retry_queue_depth.set(retry as i64);
    }
}

/// Smart function duration measurer
///
/// Relies on Drop to calculate duration and register the observation in the histogram
pub struct ReconcileMeasurer {
    start: Instant,
    metric: HistogramVec,
    kind: &'static str,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        #[allow(clippy::cast_precision_loss)]
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        self.metric.with_label_values(&[self.kind]).observe(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_and_counts() {
        let registry = Registry::new();
        let metrics = Metrics::default().register(&registry).unwrap();

        {
            let _timer = metrics.count_and_measure(kind::ADDON);
        }
        metrics.reconcile_failure(kind::DEPLOYMENT, &Error::QueueFull);
        metrics.set_queue_depths(3, 7);

        assert_eq!(metrics.reconciliations.get(), 1);
        assert_eq!(
            metrics
                .failures
                .with_label_values(&[kind::DEPLOYMENT, "QueueFull"])
                .get(),
            1
        );
        assert_eq!(metrics.retry_queue_depth.get(), 7);
        assert_eq!(
            metrics
                .reconcile_duration
                .with_label_values(&[kind::ADDON])
                .get_sample_count(),
            1
        );
        assert!(Metrics::default().register(&registry).is_err());
    }
}
