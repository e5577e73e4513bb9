use prometheus::{histogram_opts, opts, HistogramVec, IntCounterVec, Registry};
use tokio::time::Instant;

/// Proxy request metrics labeled by (method, status, route). The route label
/// is the matched pattern, never the raw path.
#[derive(Clone)]
pub struct HttpMetrics {
    pub requests: IntCounterVec,
    pub duration: HistogramVec,
}

impl Default for HttpMetrics {
    fn default() -> Self {
        let requests = IntCounterVec::new(
            opts!("sessiongate_proxy_requests_total", "proxied requests"),
            &["method", "status", "route"],
        )
        .unwrap();
        let duration = HistogramVec::new(
            histogram_opts!(
                "sessiongate_proxy_request_duration_seconds",
                "proxied request duration in seconds",
            )
            .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1., 5., 30., 300., 3600.]),
            &["method", "status", "route"],
        )
        .unwrap();
        HttpMetrics { requests, duration }
    }
}

impl HttpMetrics {
    pub fn register(self, registry: &Registry) -> Result<Self, prometheus::Error> {
        registry.register(Box::new(self.requests.clone()))?;
        registry.register(Box::new(self.duration.clone()))?;
        Ok(self)
    }

    pub fn count(&self, method: &str, status: u16, route: &str) {
        self.requests
            .with_label_values(&[method, &status.to_string(), route])
            .inc();
    }

    pub fn observe_duration(&self, method: &str, status: u16, route: &str, started: Instant) {
        self.duration
            .with_label_values(&[method, &status.to_string(), route])
            .observe(started.elapsed().as_secs_f64());
    }

    /// Count and record duration for a request that completed normally.
    pub fn observe_completed(&self, method: &str, status: u16, route: &str, started: Instant) {
        self.count(method, status, route);
        self.observe_duration(method, status, route, started);
    }

    /// Duration measurer for an upgraded tunnel; observes when the tunnel
    /// closes.
    pub fn tunnel_measurer(&self, method: String, route: &'static str, started: Instant) -> TunnelMeasurer {
        TunnelMeasurer {
            metrics: self.clone(),
            method,
            route,
            started,
        }
    }
}

pub struct TunnelMeasurer {
    metrics: HttpMetrics,
    method: String,
    route: &'static str,
    started: Instant,
}

impl Drop for TunnelMeasurer {
    fn drop(&mut self) {
        self.metrics
            .observe_duration(&self.method, 101, self.route, self.started);
    }
}
