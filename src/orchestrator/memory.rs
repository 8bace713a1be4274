//! In-process [`Orchestrator`] used by tests and dry runs.
//!
//! Applies replace the stored object, except that server-owned fields
//! (workload status, PVC spec on update) are kept.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentStatus, StatefulSet};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Secret, Service};
use k8s_openapi::api::networking::v1::{Ingress, NetworkPolicy};

use super::{object_name, parse_selector, Orchestrator};
use crate::resources::cnpg::Cluster;
use crate::resources::keda::HTTPScaledObject;
use crate::{Error, Result};

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

#[derive(Default)]
struct Objects {
    namespaces: BTreeMap<String, BTreeMap<String, String>>,
    secrets: BTreeMap<Key, Secret>,
    deployments: BTreeMap<Key, Deployment>,
    services: BTreeMap<Key, Service>,
    ingresses: BTreeMap<Key, Ingress>,
    network_policies: BTreeMap<Key, NetworkPolicy>,
    pvcs: BTreeMap<Key, PersistentVolumeClaim>,
    pods: BTreeMap<Key, Pod>,
    stateful_sets: BTreeMap<Key, StatefulSet>,
    postgres_clusters: BTreeMap<Key, Cluster>,
    scaled_objects: BTreeMap<Key, HTTPScaledObject>,
}

#[derive(Default)]
pub struct InMemoryOrchestrator {
    objects: RwLock<Objects>,
    write_failure: RwLock<Option<fn() -> Error>>,
}

impl InMemoryOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Objects> {
        self.objects.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Objects> {
        self.objects.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes every write fail with the error `failure` builds, until cleared with `None`
    pub fn fail_writes(&self, failure: Option<fn() -> Error>) {
        *self
            .write_failure
            .write()
            .unwrap_or_else(PoisonError::into_inner) = failure;
    }

    fn check_write(&self) -> Result<()> {
        match *self
            .write_failure
            .read()
            .unwrap_or_else(PoisonError::into_inner)
        {
            Some(failure) => Err(failure()),
            None => Ok(()),
        }
    }

    pub fn insert_deployment(&self, namespace: &str, deployment: Deployment) {
        let name = deployment.metadata.name.clone().unwrap_or_default();
        self.write()
            .deployments
            .insert(key(namespace, &name), deployment);
    }

    /// Overwrites the status the "cluster" reports for a workload
    pub fn set_deployment_status(&self, namespace: &str, name: &str, status: DeploymentStatus) {
        if let Some(d) = self.write().deployments.get_mut(&key(namespace, name)) {
            d.status = Some(status);
        }
    }

    pub fn insert_secret(&self, namespace: &str, secret: Secret) {
        let name = secret.metadata.name.clone().unwrap_or_default();
        self.write().secrets.insert(key(namespace, &name), secret);
    }

    pub fn insert_pod(&self, namespace: &str, pod: Pod) {
        let name = pod.metadata.name.clone().unwrap_or_default();
        self.write().pods.insert(key(namespace, &name), pod);
    }

    pub fn insert_stateful_set(&self, namespace: &str, set: StatefulSet) {
        let name = set.metadata.name.clone().unwrap_or_default();
        self.write().stateful_sets.insert(key(namespace, &name), set);
    }

    pub fn insert_postgres_cluster(&self, namespace: &str, cluster: Cluster) {
        let name = cluster.metadata.name.clone().unwrap_or_default();
        self.write()
            .postgres_clusters
            .insert(key(namespace, &name), cluster);
    }

    pub fn namespace_labels(&self, name: &str) -> Option<BTreeMap<String, String>> {
        self.read().namespaces.get(name).cloned()
    }

    pub fn deployment(&self, namespace: &str, name: &str) -> Option<Deployment> {
        self.read().deployments.get(&key(namespace, name)).cloned()
    }

    pub fn service(&self, namespace: &str, name: &str) -> Option<Service> {
        self.read().services.get(&key(namespace, name)).cloned()
    }

    pub fn ingress(&self, namespace: &str, name: &str) -> Option<Ingress> {
        self.read().ingresses.get(&key(namespace, name)).cloned()
    }

    pub fn network_policy(&self, namespace: &str, name: &str) -> Option<NetworkPolicy> {
        self.read()
            .network_policies
            .get(&key(namespace, name))
            .cloned()
    }

    pub fn pvc(&self, namespace: &str, name: &str) -> Option<PersistentVolumeClaim> {
        self.read().pvcs.get(&key(namespace, name)).cloned()
    }

    pub fn secret(&self, namespace: &str, name: &str) -> Option<Secret> {
        self.read().secrets.get(&key(namespace, name)).cloned()
    }

    pub fn scaled_object(&self, namespace: &str, name: &str) -> Option<HTTPScaledObject> {
        self.read().scaled_objects.get(&key(namespace, name)).cloned()
    }
}

#[async_trait]
impl Orchestrator for InMemoryOrchestrator {
    async fn ensure_namespace(&self, name: &str, labels: BTreeMap<String, String>) -> Result<()> {
        self.check_write()?;
        self.write()
            .namespaces
            .entry(name.to_string())
            .or_default()
            .extend(labels);
        Ok(())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        Ok(self.secret(namespace, name))
    }

    async fn apply_secret(&self, namespace: &str, secret: Secret) -> Result<()> {
        self.check_write()?;
        let k = key(namespace, object_name(&secret.metadata)?);
        self.write().secrets.insert(k, secret);
        Ok(())
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        Ok(self.deployment(namespace, name))
    }

    async fn list_deployments(&self, namespace: &str) -> Result<Vec<Deployment>> {
        Ok(self
            .read()
            .deployments
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, d)| d.clone())
            .collect())
    }

    async fn apply_deployment(&self, namespace: &str, mut deployment: Deployment) -> Result<()> {
        self.check_write()?;
        let k = key(namespace, object_name(&deployment.metadata)?);
        let mut objects = self.write();
        if let Some(existing) = objects.deployments.get(&k) {
            deployment.status = existing.status.clone();
        }
        objects.deployments.insert(k, deployment);
        Ok(())
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<()> {
        self.write().deployments.remove(&key(namespace, name));
        Ok(())
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        Ok(self.service(namespace, name))
    }

    async fn apply_service(&self, namespace: &str, service: Service) -> Result<()> {
        self.check_write()?;
        let k = key(namespace, object_name(&service.metadata)?);
        self.write().services.insert(k, service);
        Ok(())
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<()> {
        self.write().services.remove(&key(namespace, name));
        Ok(())
    }

    async fn apply_ingress(&self, namespace: &str, ingress: Ingress) -> Result<()> {
        self.check_write()?;
        let k = key(namespace, object_name(&ingress.metadata)?);
        self.write().ingresses.insert(k, ingress);
        Ok(())
    }

    async fn delete_ingress(&self, namespace: &str, name: &str) -> Result<()> {
        self.write().ingresses.remove(&key(namespace, name));
        Ok(())
    }

    async fn get_network_policy(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<NetworkPolicy>> {
        Ok(self.network_policy(namespace, name))
    }

    async fn apply_network_policy(&self, namespace: &str, policy: NetworkPolicy) -> Result<()> {
        self.check_write()?;
        let k = key(namespace, object_name(&policy.metadata)?);
        self.write().network_policies.insert(k, policy);
        Ok(())
    }

    async fn delete_network_policy(&self, namespace: &str, name: &str) -> Result<()> {
        self.write().network_policies.remove(&key(namespace, name));
        Ok(())
    }

    async fn get_pvc(&self, namespace: &str, name: &str) -> Result<Option<PersistentVolumeClaim>> {
        Ok(self.pvc(namespace, name))
    }

    async fn apply_pvc(&self, namespace: &str, mut pvc: PersistentVolumeClaim) -> Result<()> {
        self.check_write()?;
        let k = key(namespace, object_name(&pvc.metadata)?);
        let mut objects = self.write();
        if let Some(existing) = objects.pvcs.get(&k) {
            if pvc.spec.is_none() {
                pvc.spec = existing.spec.clone();
            }
        }
        objects.pvcs.insert(k, pvc);
        Ok(())
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>> {
        let terms = parse_selector(selector);
        Ok(self
            .read()
            .pods
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, pod)| pod)
            .filter(|pod| {
                let labels = pod.metadata.labels.as_ref();
                terms.iter().all(|(k, v)| {
                    labels
                        .and_then(|l| l.get(*k))
                        .is_some_and(|value| value == v)
                })
            })
            .cloned()
            .collect())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        Ok(self.read().pods.get(&key(namespace, name)).cloned())
    }

    async fn get_stateful_set(&self, namespace: &str, name: &str) -> Result<Option<StatefulSet>> {
        Ok(self.read().stateful_sets.get(&key(namespace, name)).cloned())
    }

    async fn get_postgres_cluster(&self, namespace: &str, name: &str) -> Result<Option<Cluster>> {
        Ok(self
            .read()
            .postgres_clusters
            .get(&key(namespace, name))
            .cloned())
    }

    async fn apply_http_scaled_object(
        &self,
        namespace: &str,
        object: HTTPScaledObject,
    ) -> Result<()> {
        self.check_write()?;
        let k = key(namespace, object_name(&object.metadata)?);
        self.write().scaled_objects.insert(k, object);
        Ok(())
    }

    async fn delete_http_scaled_object(&self, namespace: &str, name: &str) -> Result<()> {
        self.write().scaled_objects.remove(&key(namespace, name));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::{Container, EnvVar, PodSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;

    fn pod(name: &str, app: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.into()),
                labels: Some(BTreeMap::from([("app".to_string(), app.to_string())])),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "main".into(),
                    env: Some(vec![
                        EnvVar {
                            name: "PORT".into(),
                            value: Some("4104".into()),
                            ..Default::default()
                        },
                        EnvVar {
                            name: "FROM_SECRET".into(),
                            value: None,
                            ..Default::default()
                        },
                    ]),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn list_pods_filters_on_labels() {
        let orchestrator = InMemoryOrchestrator::new();
        orchestrator.insert_pod("prod", pod("api-1", "api"));
        orchestrator.insert_pod("prod", pod("web-1", "web"));
        orchestrator.insert_pod("staging", pod("api-2", "api"));

        let pods = orchestrator.list_pods("prod", "app=api").await.unwrap();
        assert_eq!(pods.len(), 1);
        assert_eq!(pods[0].metadata.name.as_deref(), Some("api-1"));
    }

    #[tokio::test]
    async fn pod_env_skips_references() {
        let orchestrator = InMemoryOrchestrator::new();
        orchestrator.insert_pod("prod", pod("api-1", "api"));

        let env = orchestrator.get_pod_env_vars("prod", "api-1").await.unwrap();
        assert_eq!(env, BTreeMap::from([("PORT".to_string(), "4104".to_string())]));

        let missing = orchestrator.get_pod_env_vars("prod", "nope").await;
        assert!(missing.unwrap_err().is_not_found());
    }
}
