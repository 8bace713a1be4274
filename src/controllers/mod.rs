use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::Metrics;

pub mod addon;
pub mod function;
pub mod reconciliation;

pub use reconciliation::{Controller, ControllerConfig};

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
        }
    }
}

/// State shared between the reconcilers and the web server
#[derive(Clone, Default)]
pub struct State {
    /// Diagnostics populated by the reconcilers
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    pub registry: prometheus::Registry,
    /// The reconciliation controller, once one is running
    controller: Option<Arc<Controller>>,
}

/// State wrapper around the controller outputs for the web server
impl State {
    pub fn with_controller(self, controller: Arc<Controller>) -> Self {
        Self {
            controller: Some(controller),
            ..self
        }
    }

    /// Metrics registered against this state's registry
    pub fn register_metrics(&self) -> Result<Metrics, prometheus::Error> {
        Metrics::default().register(&self.registry)
    }

    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    pub fn controller(&self) -> Option<&Arc<Controller>> {
        self.controller.as_ref()
    }

    /// Fails when no controller is attached or the attached one is unhealthy
    pub fn health(&self) -> crate::Result<()> {
        match &self.controller {
            Some(controller) => controller.health_check(),
            None => Err(crate::Error::NotStarted),
        }
    }
}
