use std::collections::BTreeMap;
use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{Namespace, PersistentVolumeClaim, Pod, Secret, Service};
use k8s_openapi::api::networking::v1::{Ingress, NetworkPolicy};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::{object_name, Orchestrator};
use crate::resources::cnpg::Cluster;
use crate::resources::keda::HTTPScaledObject;
use crate::Result;

/// Field manager for every server-side apply
const FIELD_MANAGER: &str = "switchyard";

/// [`Orchestrator`] backed by a live cluster through server-side apply
#[derive(Clone)]
pub struct KubeOrchestrator {
    client: Client,
}

impl KubeOrchestrator {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Uses the in-cluster config or the local kubeconfig
    pub async fn try_default() -> Result<Self> {
        Ok(Self::new(Client::try_default().await?))
    }

    fn namespaced<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

async fn apply<K>(namespace: &str, api: &Api<K>, object: K) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug,
    <K as Resource>::DynamicType: Default,
{
    let name = object_name(object.meta())?;
    debug!(
        "Applying {} {} in namespace {}",
        K::kind(&Default::default()),
        name,
        namespace
    );
    let params = PatchParams::apply(FIELD_MANAGER).force();
    api.patch(name, &params, &Patch::Apply(&object)).await?;
    Ok(())
}

async fn delete<K>(namespace: &str, api: &Api<K>, name: &str) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + Debug,
    <K as Resource>::DynamicType: Default,
{
    debug!(
        "Ensuring {} {} in namespace {} does not exist",
        K::kind(&Default::default()),
        name,
        namespace
    );
    match api.delete(name, &DeleteParams::default()).await {
        Err(kube::Error::Api(kube::error::ErrorResponse { code: 404, .. })) => Ok(()),
        Err(err) => Err(err.into()),
        Ok(_) => Ok(()),
    }
}

#[async_trait]
impl Orchestrator for KubeOrchestrator {
    async fn ensure_namespace(&self, name: &str, labels: BTreeMap<String, String>) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(name.into()),
                labels: Some(labels),
                ..Default::default()
            },
            ..Default::default()
        };
        let params = PatchParams::apply(FIELD_MANAGER).force();
        api.patch(name, &params, &Patch::Apply(&namespace)).await?;
        Ok(())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        Ok(self.namespaced::<Secret>(namespace).get_opt(name).await?)
    }

    async fn apply_secret(&self, namespace: &str, secret: Secret) -> Result<()> {
        apply(namespace, &self.namespaced(namespace), secret).await
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        Ok(self.namespaced::<Deployment>(namespace).get_opt(name).await?)
    }

    async fn list_deployments(&self, namespace: &str) -> Result<Vec<Deployment>> {
        let list = self
            .namespaced::<Deployment>(namespace)
            .list(&ListParams::default())
            .await?;
        Ok(list.items)
    }

    async fn apply_deployment(&self, namespace: &str, deployment: Deployment) -> Result<()> {
        apply(namespace, &self.namespaced(namespace), deployment).await
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<()> {
        delete(namespace, &self.namespaced::<Deployment>(namespace), name).await
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        Ok(self.namespaced::<Service>(namespace).get_opt(name).await?)
    }

    async fn apply_service(&self, namespace: &str, service: Service) -> Result<()> {
        apply(namespace, &self.namespaced(namespace), service).await
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<()> {
        delete(namespace, &self.namespaced::<Service>(namespace), name).await
    }

    async fn apply_ingress(&self, namespace: &str, ingress: Ingress) -> Result<()> {
        apply(namespace, &self.namespaced(namespace), ingress).await
    }

    async fn delete_ingress(&self, namespace: &str, name: &str) -> Result<()> {
        delete(namespace, &self.namespaced::<Ingress>(namespace), name).await
    }

    async fn get_network_policy(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<NetworkPolicy>> {
        Ok(self
            .namespaced::<NetworkPolicy>(namespace)
            .get_opt(name)
            .await?)
    }

    async fn apply_network_policy(&self, namespace: &str, policy: NetworkPolicy) -> Result<()> {
        apply(namespace, &self.namespaced(namespace), policy).await
    }

    async fn delete_network_policy(&self, namespace: &str, name: &str) -> Result<()> {
        delete(namespace, &self.namespaced::<NetworkPolicy>(namespace), name).await
    }

    async fn get_pvc(&self, namespace: &str, name: &str) -> Result<Option<PersistentVolumeClaim>> {
        Ok(self
            .namespaced::<PersistentVolumeClaim>(namespace)
            .get_opt(name)
            .await?)
    }

    async fn apply_pvc(&self, namespace: &str, pvc: PersistentVolumeClaim) -> Result<()> {
        apply(namespace, &self.namespaced(namespace), pvc).await
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>> {
        let list = self
            .namespaced::<Pod>(namespace)
            .list(&ListParams::default().labels(selector))
            .await?;
        Ok(list.items)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        Ok(self.namespaced::<Pod>(namespace).get_opt(name).await?)
    }

    async fn get_stateful_set(&self, namespace: &str, name: &str) -> Result<Option<StatefulSet>> {
        Ok(self
            .namespaced::<StatefulSet>(namespace)
            .get_opt(name)
            .await?)
    }

    async fn get_postgres_cluster(&self, namespace: &str, name: &str) -> Result<Option<Cluster>> {
        Ok(self.namespaced::<Cluster>(namespace).get_opt(name).await?)
    }

    async fn apply_http_scaled_object(
        &self,
        namespace: &str,
        object: HTTPScaledObject,
    ) -> Result<()> {
        apply(namespace, &self.namespaced(namespace), object).await
    }

    async fn delete_http_scaled_object(&self, namespace: &str, name: &str) -> Result<()> {
        delete(
            namespace,
            &self.namespaced::<HTTPScaledObject>(namespace),
            name,
        )
        .await
    }
}
