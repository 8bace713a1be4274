use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use k8s_openapi::api::apps::v1::Deployment as Workload;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::Controller;
use crate::metrics::kind;
use crate::reconcilers::{is_managed, reconcile_disabled};
use crate::types::{
    Deployment, DeploymentStatus, Environment, HealthStatus, Release, ReleaseStatus, Service,
};
use crate::Result;

/// Platform namespaces synced even when no environment points at them
const CORE_NAMESPACES: [&str; 4] = ["enclii", "janua", "data", "monitoring"];

const VERSION_LEN: usize = 12;

/// Health implied by a workload's replica counts
pub fn observed_health(desired: i32, available: i32) -> HealthStatus {
    if available == desired && desired > 0 {
        HealthStatus::Healthy
    } else if available > 0 {
        HealthStatus::Unhealthy
    } else {
        HealthStatus::Unknown
    }
}

/// Tag of an image reference; registry ports and digests are not tags
fn image_tag(image: &str) -> Option<&str> {
    let reference = image.split_once('@').map_or(image, |(name, _)| name);
    let last_segment = reference.rsplit('/').next().unwrap_or(reference);
    last_segment
        .split_once(':')
        .map(|(_, tag)| tag)
        .filter(|tag| !tag.is_empty())
}

/// Release version for an imported image: its tag, cut to 12 characters
pub fn image_version(image: &str) -> String {
    match image_tag(image) {
        Some(tag) => tag.chars().take(VERSION_LEN).collect(),
        None => "unknown".to_string(),
    }
}

/// Git SHA for an imported image: its full tag
pub fn image_git_sha(image: &str) -> String {
    image_tag(image).unwrap_or_default().to_string()
}

impl Controller {
    pub(super) async fn run_drift_sync(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.drift_sync_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => self.sync_drift().await,
            }
        }
        debug!("Drift sync stopped");
    }

    /// Brings persisted deployment state in line with managed workloads.
    ///
    /// Workloads without the ownership label are never read into the
    /// repository.
    pub async fn sync_drift(&self) {
        let _timer = self.metrics.count_and_measure(kind::DRIFT_SYNC);
        self.diagnostics.write().await.last_event = Utc::now();

        let namespaces = self.drift_namespaces().await;
        let mut inspected = 0;
        for namespace in &namespaces {
            let workloads = match self.orchestrator.list_deployments(namespace).await {
                Ok(workloads) => workloads,
                Err(err) => {
                    warn!(namespace = %namespace, error = %err, "Failed to list workloads");
                    continue;
                }
            };
            for workload in &workloads {
                inspected += 1;
                if let Err(err) = self.sync_workload(namespace, workload).await {
                    warn!(namespace = %namespace, error = %err, "Failed to sync workload");
                    self.metrics.reconcile_failure(kind::DRIFT_SYNC, &err);
                }
            }
        }
        info!(
            namespaces = namespaces.len(),
            workloads = inspected,
            "Drift sync complete"
        );
    }

    async fn drift_namespaces(&self) -> BTreeSet<String> {
        let mut namespaces: BTreeSet<String> =
            CORE_NAMESPACES.iter().map(|ns| ns.to_string()).collect();
        match self.repo.list_environments().await {
            Ok(environments) => namespaces.extend(
                environments
                    .into_iter()
                    .map(|env| env.kube_namespace)
                    .filter(|ns| !ns.is_empty()),
            ),
            Err(err) => warn!(error = %err, "Failed to list environments, syncing core namespaces only"),
        }
        namespaces
    }

    async fn sync_workload(&self, namespace: &str, workload: &Workload) -> Result<()> {
        let meta = &workload.metadata;
        let Some(name) = meta.name.as_deref() else {
            return Ok(());
        };
        if !is_managed(meta) {
            debug!(namespace, workload = name, "Skipping workload not managed by switchyard");
            return Ok(());
        }
        if reconcile_disabled(meta) {
            debug!(namespace, workload = name, "Workload has reconciliation disabled, skipping");
            return Ok(());
        }

        let Some(environment) = self.repo.get_environment_by_namespace(namespace).await? else {
            debug!(namespace, workload = name, "No environment owns namespace, skipping");
            return Ok(());
        };
        let Some(service) = self
            .repo
            .get_service_by_name(environment.project_id, name)
            .await?
        else {
            warn!(namespace, workload = name, "Managed workload has no matching service");
            return Ok(());
        };

        let desired = workload
            .spec
            .as_ref()
            .and_then(|spec| spec.replicas)
            .unwrap_or(1);
        let available = workload
            .status
            .as_ref()
            .and_then(|status| status.available_replicas)
            .unwrap_or(0);

        match self
            .repo
            .get_latest_deployment_by_service(service.id, environment.id)
            .await?
        {
            Some(deployment) => self.refresh_health(&deployment, desired, available).await,
            None => {
                self.import_workload(&service, &environment, workload, desired, available)
                    .await
            }
        }
    }

    /// Updates health, recovering pending or failed deployments that run healthy
    async fn refresh_health(
        &self,
        deployment: &Deployment,
        desired: i32,
        available: i32,
    ) -> Result<()> {
        let health = observed_health(desired, available);
        let status = match deployment.status {
            DeploymentStatus::Pending | DeploymentStatus::Failed
                if health == HealthStatus::Healthy =>
            {
                info!(
                    deployment_id = %deployment.id,
                    old_status = %deployment.status,
                    "Workload is healthy, moving deployment to running"
                );
                DeploymentStatus::Running
            }
            current => current,
        };

        if status == deployment.status && health == deployment.health {
            return Ok(());
        }
        self.repo
            .update_deployment_status(
                deployment.id,
                status,
                health,
                deployment.error_message.clone(),
            )
            .await?;
        debug!(
            deployment_id = %deployment.id,
            old_health = %deployment.health,
            new_health = %health,
            new_status = %status,
            "Updated deployment from workload state"
        );
        Ok(())
    }

    /// Records a release and running deployment for a workload nobody recorded
    async fn import_workload(
        &self,
        service: &Service,
        environment: &Environment,
        workload: &Workload,
        desired: i32,
        available: i32,
    ) -> Result<()> {
        let Some(image) = workload
            .spec
            .as_ref()
            .and_then(|spec| spec.template.spec.as_ref())
            .and_then(|pod| pod.containers.first())
            .and_then(|container| container.image.clone())
        else {
            debug!(
                namespace = %environment.kube_namespace,
                service = %service.name,
                "Workload has no container image, skipping"
            );
            return Ok(());
        };

        let now = Utc::now();
        let release = Release {
            id: Uuid::new_v4(),
            service_id: service.id,
            version: image_version(&image),
            git_sha: image_git_sha(&image),
            image_uri: image,
            status: ReleaseStatus::Ready,
            created_at: now,
        };
        self.repo.create_release(&release).await?;

        let deployment = Deployment {
            status: DeploymentStatus::Running,
            health: observed_health(desired, available),
            ..Deployment::pending(release.id, environment.id, desired)
        };
        self.repo.create_deployment(&deployment).await?;

        info!(
            namespace = %environment.kube_namespace,
            service = %service.name,
            release_id = %release.id,
            deployment_id = %deployment.id,
            version = %release.version,
            "Created missing deployment record from workload state"
        );
        Ok(())
    }
}
