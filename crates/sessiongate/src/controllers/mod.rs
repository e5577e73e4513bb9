use std::sync::Arc;

use chrono::{DateTime, Utc};
use kube::runtime::events::Reporter;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::util::metrics::Metrics;

pub mod session_controller;
pub use session_controller::SessionControllerConfig;

pub mod dataplane_controller;

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            reporter: "sessiongate-controller".into(),
        }
    }
}

/// State shared between the controllers and the web server
#[derive(Clone)]
pub struct State {
    /// Diagnostics populated by the reconcilers
    diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    registry: prometheus::Registry,
    /// Controller metrics, registered once
    metrics: Metrics,
}

impl Default for State {
    fn default() -> Self {
        let registry = prometheus::Registry::default();
        let metrics = Metrics::default().register(&registry).unwrap();
        State {
            diagnostics: Arc::new(RwLock::new(Diagnostics::default())),
            registry,
            metrics,
        }
    }
}

impl State {
    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    pub fn registry(&self) -> &prometheus::Registry {
        &self.registry
    }

    pub fn controller_metrics(&self) -> Metrics {
        self.metrics.clone()
    }

    pub fn diagnostics_handle(&self) -> Arc<RwLock<Diagnostics>> {
        Arc::clone(&self.diagnostics)
    }
}
