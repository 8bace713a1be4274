use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// CloudNativePG database cluster backing a postgres addon
/// API: postgresql.cnpg.io/v1
///
/// Only the fields read by the addon reconciler are modelled.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "postgresql.cnpg.io",
    version = "v1",
    kind = "Cluster",
    namespaced
)]
#[kube(status = "ClusterStatus")]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Number of instances requested
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instances: Option<i64>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// Human readable phase, e.g. "Cluster in healthy state"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instances: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_instances: Option<i64>,

    /// Name of the read-write service fronting the primary
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_service: Option<String>,
}
