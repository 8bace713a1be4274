//! Namespaced access to the container orchestrator.
//!
//! Reads return `Ok(None)` when the object is absent and deletes succeed when
//! the object is already gone. Writes are idempotent applies.

pub mod kubernetes;
pub mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Secret, Service};
use k8s_openapi::api::networking::v1::{Ingress, NetworkPolicy};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::resources::cnpg::Cluster;
use crate::resources::keda::HTTPScaledObject;
use crate::{Error, Result};

pub use self::kubernetes::KubeOrchestrator;
pub use self::memory::InMemoryOrchestrator;

#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Creates the namespace if missing and merges `labels` onto it.
    async fn ensure_namespace(&self, name: &str, labels: BTreeMap<String, String>) -> Result<()>;

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    async fn apply_secret(&self, namespace: &str, secret: Secret) -> Result<()>;

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>>;

    async fn list_deployments(&self, namespace: &str) -> Result<Vec<Deployment>>;

    async fn apply_deployment(&self, namespace: &str, deployment: Deployment) -> Result<()>;

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<()>;

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>>;

    async fn apply_service(&self, namespace: &str, service: Service) -> Result<()>;

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<()>;

    async fn apply_ingress(&self, namespace: &str, ingress: Ingress) -> Result<()>;

    async fn delete_ingress(&self, namespace: &str, name: &str) -> Result<()>;

    async fn get_network_policy(&self, namespace: &str, name: &str)
        -> Result<Option<NetworkPolicy>>;

    async fn apply_network_policy(&self, namespace: &str, policy: NetworkPolicy) -> Result<()>;

    async fn delete_network_policy(&self, namespace: &str, name: &str) -> Result<()>;

    async fn get_pvc(&self, namespace: &str, name: &str) -> Result<Option<PersistentVolumeClaim>>;

    async fn apply_pvc(&self, namespace: &str, pvc: PersistentVolumeClaim) -> Result<()>;

    /// `selector` uses the `key=value,key=value` label selector syntax.
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>>;

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>>;

    async fn get_stateful_set(&self, namespace: &str, name: &str) -> Result<Option<StatefulSet>>;

    async fn get_postgres_cluster(&self, namespace: &str, name: &str) -> Result<Option<Cluster>>;

    async fn apply_http_scaled_object(
        &self,
        namespace: &str,
        object: HTTPScaledObject,
    ) -> Result<()>;

    async fn delete_http_scaled_object(&self, namespace: &str, name: &str) -> Result<()>;

    /// Literal environment of the first container of a pod.
    async fn get_pod_env_vars(
        &self,
        namespace: &str,
        pod: &str,
    ) -> Result<BTreeMap<String, String>> {
        let pod = self
            .get_pod(namespace, pod)
            .await?
            .ok_or_else(|| Error::not_found("pod", format!("{namespace}/{pod}")))?;

        let env = pod
            .spec
            .and_then(|spec| spec.containers.into_iter().next())
            .and_then(|container| container.env)
            .unwrap_or_default();

        Ok(env
            .into_iter()
            .filter_map(|var| var.value.map(|value| (var.name, value)))
            .collect())
    }
}

/// Name of an object about to be written
pub(crate) fn object_name(meta: &ObjectMeta) -> Result<&str> {
    meta.name
        .as_deref()
        .ok_or_else(|| Error::Validation("orchestrator object has no name".into()))
}

/// Parses `key=value,key=value` into pairs, ignoring malformed terms
pub(crate) fn parse_selector(selector: &str) -> Vec<(&str, &str)> {
    selector
        .split(',')
        .filter_map(|term| term.split_once('='))
        .map(|(k, v)| (k.trim(), v.trim()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_terms_are_split() {
        assert_eq!(
            parse_selector("app=api, enclii.dev/service=api"),
            vec![("app", "api"), ("enclii.dev/service", "api")]
        );
        assert!(parse_selector("").is_empty());
    }
}
