use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::apps::v1::StatefulSet;
use tokio::sync::{watch, RwLock};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, field, info, instrument, warn, Span};

use crate::controllers::Diagnostics;
use crate::metrics::kind;
use crate::orchestrator::Orchestrator;
use crate::repository::Repository;
use crate::resources::cnpg::Cluster;
use crate::types::{AddonStatus, AddonType, DatabaseAddon};
use crate::{telemetry, Metrics, Result};

#[derive(Clone, Debug)]
pub struct AddonReconcilerConfig {
    pub interval: Duration,
}

impl Default for AddonReconcilerConfig {
    fn default() -> Self {
        AddonReconcilerConfig {
            interval: Duration::from_secs(30),
        }
    }
}

/// What the backing resource says about an addon
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AddonObservation {
    pub status: Option<AddonStatus>,
    pub message: String,
    pub host: String,
    pub port: i32,
    pub database_name: String,
    pub username: String,
    pub ready: bool,
}

impl AddonObservation {
    fn provisioning(message: impl Into<String>) -> Self {
        AddonObservation {
            status: Some(AddonStatus::Provisioning),
            message: message.into(),
            ..Default::default()
        }
    }
}

/// Maps a CloudNativePG cluster's reported status onto the addon lifecycle
pub fn addon_status_from_cluster(cluster: &Cluster, namespace: &str) -> AddonObservation {
    let Some(status) = cluster.status.as_ref() else {
        return AddonObservation::provisioning("Cluster status not yet available");
    };

    let ready_instances = status.ready_instances.unwrap_or(0);
    let instances = status.instances.unwrap_or(0);
    let phase = status.phase.as_deref().unwrap_or_default();

    let mut observation = AddonObservation {
        database_name: "app".into(),
        username: "app".into(),
        ..Default::default()
    };
    if let Some(write_service) = status.write_service.as_deref().filter(|s| !s.is_empty()) {
        observation.host = format!("{write_service}.{namespace}.svc.cluster.local");
        observation.port = AddonType::Postgres.default_port();
    }

    let (status, message) = match phase {
        "Cluster in healthy state" if ready_instances > 0 => (
            AddonStatus::Ready,
            format!("Cluster healthy with {ready_instances}/{instances} instances"),
        ),
        "Cluster in healthy state" => (
            AddonStatus::Provisioning,
            "Cluster healthy but no ready instances".to_string(),
        ),
        "Setting up primary" => (
            AddonStatus::Provisioning,
            "Setting up primary instance".to_string(),
        ),
        "Creating replica" => (
            AddonStatus::Provisioning,
            "Creating replica instances".to_string(),
        ),
        "Failed" => (
            AddonStatus::Failed,
            "Cluster provisioning failed".to_string(),
        ),
        other if ready_instances > 0 && ready_instances == instances => {
            (AddonStatus::Ready, format!("Cluster ready ({other})"))
        }
        other => (AddonStatus::Provisioning, format!("Provisioning ({other})")),
    };
    observation.ready = status == AddonStatus::Ready;
    observation.status = Some(status);
    observation.message = message;
    observation
}

/// Maps a redis StatefulSet's replica counts onto the addon lifecycle
pub fn addon_status_from_stateful_set(
    set: &StatefulSet,
    namespace: &str,
    name: &str,
) -> AddonObservation {
    let desired = set
        .spec
        .as_ref()
        .and_then(|spec| spec.replicas)
        .unwrap_or(1);
    let ready = set
        .status
        .as_ref()
        .and_then(|status| status.ready_replicas)
        .unwrap_or(0);

    let (status, message) = if ready == desired {
        (AddonStatus::Ready, format!("Redis ready with {ready} replicas"))
    } else {
        (
            AddonStatus::Provisioning,
            format!("Redis provisioning: {ready}/{desired} replicas ready"),
        )
    };
    AddonObservation {
        status: Some(status),
        message,
        host: format!("{name}.{namespace}.svc.cluster.local"),
        port: AddonType::Redis.default_port(),
        database_name: "0".into(),
        username: String::new(),
        ready: status == AddonStatus::Ready,
    }
}

fn changed(addon: &DatabaseAddon, observation: &AddonObservation) -> bool {
    observation.status != Some(addon.status)
        || addon.host != observation.host
        || addon.port != observation.port
        || addon.status_message != observation.message
}

/// Polls pending, provisioning and deleting addons against their backing resources
pub struct AddonReconciler {
    repo: Arc<dyn Repository>,
    orchestrator: Arc<dyn Orchestrator>,
    metrics: Metrics,
    diagnostics: Arc<RwLock<Diagnostics>>,
    config: AddonReconcilerConfig,
}

impl AddonReconciler {
    pub fn new(
        repo: Arc<dyn Repository>,
        orchestrator: Arc<dyn Orchestrator>,
        config: AddonReconcilerConfig,
    ) -> Self {
        AddonReconciler {
            repo,
            orchestrator,
            metrics: Metrics::default(),
            diagnostics: Arc::default(),
            config,
        }
    }

    pub fn with_metrics(self, metrics: Metrics) -> Self {
        Self { metrics, ..self }
    }

    pub fn with_diagnostics(self, diagnostics: Arc<RwLock<Diagnostics>>) -> Self {
        Self {
            diagnostics,
            ..self
        }
    }

    /// Reconciles immediately, then on every interval until shutdown
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval = ?self.config.interval, "Starting addon reconciler");
        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => self.reconcile_all().await,
            }
        }
        info!("Addon reconciler stopped");
    }

    pub async fn reconcile_all(&self) {
        let addons = match self.repo.list_pending_addons().await {
            Ok(addons) => addons,
            Err(err) => {
                error!(error = %err, "Failed to list pending addons");
                return;
            }
        };
        if addons.is_empty() {
            return;
        }

        debug!(count = addons.len(), "Reconciling addons");
        for addon in addons {
            if let Err(err) = self.reconcile_addon(addon).await {
                self.metrics.reconcile_failure(kind::ADDON, &err);
            }
        }
    }

    #[instrument(skip(self, addon), fields(
        addon_id = %addon.id,
        addon_type = %addon.addon_type,
        status = %addon.status,
        trace_id,
    ))]
    async fn reconcile_addon(&self, addon: DatabaseAddon) -> Result<()> {
        if let Some(trace_id) = telemetry::get_trace_id() {
            Span::current().record("trace_id", field::display(&trace_id));
        }
        let _timer = self.metrics.count_and_measure(kind::ADDON);
        self.diagnostics.write().await.last_event = Utc::now();

        if addon.k8s_namespace.is_empty() || addon.k8s_resource_name.is_empty() {
            debug!("Addon has no backing resource yet, skipping");
            return Ok(());
        }

        let namespace = addon.k8s_namespace.as_str();
        let name = addon.k8s_resource_name.as_str();
        let observation = match addon.addon_type {
            AddonType::Postgres => self
                .orchestrator
                .get_postgres_cluster(namespace, name)
                .await
                .inspect_err(|err| warn!(error = %err, "Failed to get CloudNativePG cluster"))?
                .map(|cluster| addon_status_from_cluster(&cluster, namespace)),
            AddonType::Redis => self
                .orchestrator
                .get_stateful_set(namespace, name)
                .await
                .inspect_err(|err| warn!(error = %err, "Failed to get Redis StatefulSet"))?
                .map(|set| addon_status_from_stateful_set(&set, namespace, name)),
            AddonType::Mysql => {
                debug!("No status source for mysql addons, skipping");
                return Ok(());
            }
        };

        match observation {
            None if addon.status == AddonStatus::Deleting => {
                self.repo.soft_delete_addon(addon.id).await?;
                info!("Backing resource gone, addon marked as deleted");
            }
            None => warn!(namespace, resource = name, "Backing resource not found"),
            Some(_) if addon.status == AddonStatus::Deleting => {
                debug!("Waiting for backing resource to be removed");
            }
            Some(observation) if changed(&addon, &observation) => {
                self.apply_observation(addon, observation).await?;
            }
            Some(_) => {}
        }
        Ok(())
    }

    async fn apply_observation(
        &self,
        mut addon: DatabaseAddon,
        observation: AddonObservation,
    ) -> Result<()> {
        let old_status = addon.status;
        if let Some(status) = observation.status {
            addon.status = status;
        }
        addon.status_message = observation.message;
        addon.host = observation.host;
        addon.port = observation.port;
        addon.database_name = observation.database_name;
        addon.username = observation.username;
        addon.updated_at = Utc::now();
        if observation.ready && addon.provisioned_at.is_none() {
            addon.provisioned_at = Some(addon.updated_at);
        }

        self.repo.update_addon(&addon).await?;
        info!(old_status = %old_status, new_status = %addon.status, "Addon status updated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::apps::v1::{StatefulSetSpec, StatefulSetStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use rstest::rstest;
    use uuid::Uuid;

    use super::*;
    use crate::fixtures::Fixture;
    use crate::resources::cnpg::{ClusterSpec, ClusterStatus};

    fn cluster(phase: &str, instances: i64, ready: i64) -> Cluster {
        let mut cluster = Cluster::new("orders-db", ClusterSpec::default());
        cluster.status = Some(ClusterStatus {
            phase: Some(phase.into()),
            instances: Some(instances),
            ready_instances: Some(ready),
            write_service: Some("orders-db-rw".into()),
        });
        cluster
    }

    fn addon(fx: &Fixture, addon_type: AddonType, status: AddonStatus) -> DatabaseAddon {
        let addon = DatabaseAddon {
            id: Uuid::new_v4(),
            project_id: fx.project.id,
            name: "orders-db".into(),
            addon_type,
            status,
            status_message: String::new(),
            k8s_namespace: "shop-data".into(),
            k8s_resource_name: "orders-db".into(),
            connection_secret: None,
            host: String::new(),
            port: 0,
            database_name: String::new(),
            username: String::new(),
            provisioned_at: None,
            updated_at: Utc::now(),
        };
        fx.repo.insert_addon(addon.clone());
        addon
    }

    #[rstest]
    #[case("Cluster in healthy state", 3, 3, AddonStatus::Ready, "Cluster healthy with 3/3 instances")]
    #[case("Cluster in healthy state", 3, 0, AddonStatus::Provisioning, "Cluster healthy but no ready instances")]
    #[case("Setting up primary", 1, 0, AddonStatus::Provisioning, "Setting up primary instance")]
    #[case("Creating replica", 3, 1, AddonStatus::Provisioning, "Creating replica instances")]
    #[case("Failed", 1, 0, AddonStatus::Failed, "Cluster provisioning failed")]
    #[case("Switchover in progress", 2, 2, AddonStatus::Ready, "Cluster ready (Switchover in progress)")]
    #[case("Switchover in progress", 2, 1, AddonStatus::Provisioning, "Provisioning (Switchover in progress)")]
    fn cluster_phases(
        #[case] phase: &str,
        #[case] instances: i64,
        #[case] ready: i64,
        #[case] expected: AddonStatus,
        #[case] message: &str,
    ) {
        let observation = addon_status_from_cluster(&cluster(phase, instances, ready), "shop-data");
        assert_eq!(observation.status, Some(expected));
        assert_eq!(observation.message, message);
        assert_eq!(observation.ready, expected == AddonStatus::Ready);
        assert_eq!(observation.host, "orders-db-rw.shop-data.svc.cluster.local");
        assert_eq!(observation.port, 5432);
        assert_eq!(observation.database_name, "app");
    }

    #[test]
    fn cluster_without_status_is_provisioning() {
        let observation =
            addon_status_from_cluster(&Cluster::new("orders-db", ClusterSpec::default()), "shop-data");
        assert_eq!(observation.status, Some(AddonStatus::Provisioning));
        assert_eq!(observation.message, "Cluster status not yet available");
        assert!(observation.host.is_empty());
    }

    fn redis(desired: i32, ready: i32) -> StatefulSet {
        StatefulSet {
            metadata: ObjectMeta {
                name: Some("orders-db".into()),
                ..Default::default()
            },
            spec: Some(StatefulSetSpec {
                replicas: Some(desired),
                ..Default::default()
            }),
            status: Some(StatefulSetStatus {
                replicas: desired,
                ready_replicas: Some(ready),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn redis_readiness_follows_replicas() {
        let ready = addon_status_from_stateful_set(&redis(1, 1), "shop-data", "orders-db");
        assert_eq!(ready.status, Some(AddonStatus::Ready));
        assert_eq!(ready.host, "orders-db.shop-data.svc.cluster.local");
        assert_eq!(ready.port, 6379);
        assert_eq!(ready.database_name, "0");

        let partial = addon_status_from_stateful_set(&redis(3, 1), "shop-data", "orders-db");
        assert_eq!(partial.status, Some(AddonStatus::Provisioning));
        assert_eq!(partial.message, "Redis provisioning: 1/3 replicas ready");
    }

    #[tokio::test]
    async fn ready_cluster_stamps_provisioned_at_once() {
        let fx = Fixture::new();
        let reconciler = AddonReconciler::new(
            fx.repo.clone(),
            fx.orchestrator.clone(),
            AddonReconcilerConfig::default(),
        );
        let addon = addon(&fx, AddonType::Postgres, AddonStatus::Provisioning);
        fx.orchestrator
            .insert_postgres_cluster("shop-data", cluster("Cluster in healthy state", 1, 1));

        reconciler.reconcile_all().await;
        let ready = fx.repo.get_addon(addon.id).await.unwrap();
        assert_eq!(ready.status, AddonStatus::Ready);
        assert_eq!(ready.host, "orders-db-rw.shop-data.svc.cluster.local");
        let provisioned_at = ready.provisioned_at.unwrap();

        // ready addons are no longer polled, so force one more pass directly
        reconciler.reconcile_addon(ready.clone()).await.unwrap();
        let again = fx.repo.get_addon(addon.id).await.unwrap();
        assert_eq!(again.provisioned_at, Some(provisioned_at));
        assert_eq!(again.updated_at, ready.updated_at);
    }

    #[tokio::test]
    async fn deleting_addon_is_soft_deleted_once_resource_is_gone() {
        let fx = Fixture::new();
        let reconciler = AddonReconciler::new(
            fx.repo.clone(),
            fx.orchestrator.clone(),
            AddonReconcilerConfig::default(),
        );
        let deleting = addon(&fx, AddonType::Redis, AddonStatus::Deleting);
        let missing = addon(&fx, AddonType::Postgres, AddonStatus::Pending);

        reconciler.reconcile_all().await;

        assert_eq!(
            fx.repo.get_addon(deleting.id).await.unwrap().status,
            AddonStatus::Deleted
        );
        assert_eq!(
            fx.repo.get_addon(missing.id).await.unwrap().status,
            AddonStatus::Pending
        );
    }

    #[tokio::test]
    async fn deleting_addon_waits_while_resource_exists() {
        let fx = Fixture::new();
        let reconciler = AddonReconciler::new(
            fx.repo.clone(),
            fx.orchestrator.clone(),
            AddonReconcilerConfig::default(),
        );
        let deleting = addon(&fx, AddonType::Redis, AddonStatus::Deleting);
        fx.orchestrator.insert_stateful_set("shop-data", redis(1, 1));

        reconciler.reconcile_all().await;

        assert_eq!(
            fx.repo.get_addon(deleting.id).await.unwrap().status,
            AddonStatus::Deleting
        );
    }
}
