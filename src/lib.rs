use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("The {kind} {id} does not exist")]
    NotFound { kind: &'static str, id: String },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("A service cannot depend on itself ({0})")]
    SelfDependency(Uuid),

    #[error("Circular dependency detected in service graph: {}", format_ids(.services))]
    CircularDependency { services: Vec<Uuid> },

    #[error("Deployment group {id} is not pending, current status: {status}")]
    GroupNotPending { id: Uuid, status: String },

    #[error("Work queue is full")]
    QueueFull,

    #[error("Controller already started")]
    AlreadyStarted,

    #[error("Controller not started")]
    NotStarted,

    #[error("{0} queue is full")]
    QueueSaturated(&'static str),

    #[error("No previous release available for service {0}")]
    NoPreviousRelease(Uuid),

    #[error("No ready release found for service {0}")]
    NoReadyRelease(Uuid),

    #[error("Invalid port configuration: {0}")]
    InvalidPort(String),

    #[error("Invalid quantity {value} for {field}")]
    InvalidQuantity { field: String, value: String },

    #[error("Environment {0} has no kubernetes namespace configured")]
    MissingNamespace(String),

    #[error("Workload has a fatal error that will not self-heal: {0}")]
    FatalPodCondition(String),

}

fn format_ids(ids: &[Uuid]) -> String {
    ids.iter()
        .map(Uuid::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::SerializationError(_) => "SerializationError",
            Error::KubeError(_) => "KubeError",
            Error::NotFound { .. } => "NotFound",
            Error::Validation(_) => "Validation",
            Error::SelfDependency(_) => "SelfDependency",
            Error::CircularDependency { .. } => "CircularDependency",
            Error::GroupNotPending { .. } => "GroupNotPending",
            Error::QueueFull => "QueueFull",
            Error::AlreadyStarted => "AlreadyStarted",
            Error::NotStarted => "NotStarted",
            Error::QueueSaturated(_) => "QueueSaturated",
            Error::NoPreviousRelease(_) => "NoPreviousRelease",
            Error::NoReadyRelease(_) => "NoReadyRelease",
            Error::InvalidPort(_) => "InvalidPort",
            Error::InvalidQuantity { .. } => "InvalidQuantity",
            Error::MissingNamespace(_) => "MissingNamespace",
            Error::FatalPodCondition(_) => "FatalPodCondition",
        }
    }

    pub(crate) fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Error::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Whether the orchestrator may accept the same request later.
    ///
    /// Server errors, throttling, write conflicts and transport failures are
    /// transient; other API rejections and local validation errors are not.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::KubeError(kube::Error::Api(response)) => {
                response.code >= 500 || response.code == 429 || response.code == 409
            }
            Error::KubeError(kube::Error::HyperError(_) | kube::Error::Service(_)) => true,
            _ => false,
        }
    }

    /// True when the error came from the orchestrator reporting a missing object
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::NotFound { .. }
                | Error::KubeError(kube::Error::Api(kube::error::ErrorResponse { code: 404, .. }))
        )
    }
}

/// Platform entities and their state enums
pub mod types;

/// Persistence seam
pub mod repository;

/// Orchestrator client seam
pub mod orchestrator;

/// Deployment event delivery
pub mod notifications;

pub mod controllers;
pub use controllers::{Diagnostics, State};

/// Multi-service deployment groups
pub mod groups;

/// Resource generation for a single service
pub mod reconcilers;

/// Log and trace integrations
pub mod telemetry;

/// Metrics
mod metrics;

pub use metrics::Metrics;

/// External CRDs
pub mod resources;

#[cfg(test)]
mod fixtures;
