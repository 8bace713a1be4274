use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// KEDA HTTP add-on autoscaler routing host traffic to a scale-to-zero workload
/// API: http.keda.sh/v1alpha1
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "http.keda.sh",
    version = "v1alpha1",
    kind = "HTTPScaledObject",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct HTTPScaledObjectSpec {
    pub hosts: Vec<String>,
    /// Pending requests per replica before scaling out
    pub target_pending_requests: i32,
    /// Seconds without traffic before scaling to the minimum
    pub scaledown_period: i32,
    pub scale_target_ref: ScaleTargetRef,
    pub replicas: ReplicaBounds,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct ScaleTargetRef {
    pub name: String,
    pub service: String,
    pub port: i32,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct ReplicaBounds {
    pub min: i32,
    pub max: i32,
}
