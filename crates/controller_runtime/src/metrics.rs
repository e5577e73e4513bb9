use prometheus::{Gauge, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry};

/// Per-queue metrics in the client-go workqueue convention. Every metric
/// carries a `name` const label identifying the queue.
#[derive(Clone)]
pub struct QueueMetrics {
    pub depth: IntGauge,
    pub adds_total: IntCounter,
    pub retries_total: IntCounter,
    pub work_duration: Histogram,
    pub unfinished_work_seconds: Gauge,
    pub longest_running_processor_seconds: Gauge,
}

impl QueueMetrics {
    pub fn new(name: &str) -> Self {
        let label = |opts: Opts| opts.const_label("name", name);
        let depth = IntGauge::with_opts(label(Opts::new(
            "workqueue_depth",
            "Current number of keys waiting in the queue",
        )))
        .unwrap();
        let adds_total = IntCounter::with_opts(label(Opts::new(
            "workqueue_adds_total",
            "Total number of adds handled by the queue",
        )))
        .unwrap();
        let retries_total = IntCounter::with_opts(label(Opts::new(
            "workqueue_retries_total",
            "Total number of rate-limited requeues",
        )))
        .unwrap();
        let work_duration = Histogram::with_opts(
            HistogramOpts::new(
                "workqueue_work_duration_seconds",
                "How long processing a key took, from Get to Done",
            )
            .const_label("name", name)
            .buckets(vec![0.01, 0.1, 0.25, 0.5, 1., 5., 15., 60.]),
        )
        .unwrap();
        let unfinished_work_seconds = Gauge::with_opts(label(Opts::new(
            "workqueue_unfinished_work_seconds",
            "Accumulated seconds of in-flight work that has not been Done yet",
        )))
        .unwrap();
        let longest_running_processor_seconds = Gauge::with_opts(label(Opts::new(
            "workqueue_longest_running_processor_seconds",
            "Seconds the oldest in-flight key has been processing",
        )))
        .unwrap();
        QueueMetrics {
            depth,
            adds_total,
            retries_total,
            work_duration,
            unfinished_work_seconds,
            longest_running_processor_seconds,
        }
    }

    /// Register the queue metrics with a shared registry.
    pub fn register(&self, registry: &Registry) -> Result<(), prometheus::Error> {
        registry.register(Box::new(self.depth.clone()))?;
        registry.register(Box::new(self.adds_total.clone()))?;
        registry.register(Box::new(self.retries_total.clone()))?;
        registry.register(Box::new(self.work_duration.clone()))?;
        registry.register(Box::new(self.unfinished_work_seconds.clone()))?;
        registry.register(Box::new(self.longest_running_processor_seconds.clone()))?;
        Ok(())
    }
}
