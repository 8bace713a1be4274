use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStatus};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, HTTPGetAction, PodSpec, PodTemplateSpec, Probe,
    ResourceRequirements, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use tokio::sync::{watch, RwLock};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, field, info, instrument, warn, Span};

use crate::controllers::Diagnostics;
use crate::metrics::kind;
use crate::orchestrator::Orchestrator;
use crate::reconcilers::object_meta;
use crate::reconcilers::quantity::parse_quantity;
use crate::reconcilers::workload::preserve_service_fields;
use crate::repository::Repository;
use crate::resources::keda::{HTTPScaledObject, HTTPScaledObjectSpec, ReplicaBounds, ScaleTargetRef};
use crate::types::{Function, FunctionStatus};
use crate::{telemetry, Metrics, Result};

const CONTAINER_NAME: &str = "function";
const CONTAINER_PORT: i32 = 8080;
const SERVICE_PORT: i32 = 80;
const DEFAULT_MEMORY: &str = "128Mi";
const DEFAULT_CPU: &str = "100m";
const DEFAULT_CONCURRENCY: i32 = 100;
const DEFAULT_COOLDOWN_SECS: i32 = 300;
const DEFAULT_MAX_REPLICAS: i32 = 10;

const FUNCTION_LABEL: &str = "enclii.dev/function";
const FUNCTION_ID_LABEL: &str = "enclii.dev/function-id";
const NAMESPACE_TYPE_LABEL: &str = "enclii.dev/type";

#[derive(Clone, Debug)]
pub struct FunctionReconcilerConfig {
    pub interval: Duration,
    /// Functions are served at `<name>.<base_domain>`
    pub base_domain: String,
}

impl Default for FunctionReconcilerConfig {
    fn default() -> Self {
        FunctionReconcilerConfig {
            interval: Duration::from_secs(30),
            base_domain: "fn.enclii.dev".into(),
        }
    }
}

pub fn function_namespace(project_slug: &str) -> String {
    format!("fn-{project_slug}")
}

pub fn function_resource_name(function_name: &str) -> String {
    format!("fn-{function_name}")
}

fn function_labels(function: &Function) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), function.k8s_resource_name.clone()),
        (FUNCTION_LABEL.to_string(), function.name.clone()),
        (FUNCTION_ID_LABEL.to_string(), function.id.to_string()),
    ])
}

fn function_probe(initial_delay: i32, period: i32, timeout: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some("/health".into()),
            port: IntOrString::Int(CONTAINER_PORT),
            ..Default::default()
        }),
        initial_delay_seconds: Some(initial_delay),
        period_seconds: Some(period),
        timeout_seconds: Some(timeout),
        ..Default::default()
    }
}

/// Same quantities as requests and limits so a function gets a fixed slice
fn function_resources(function: &Function) -> Result<ResourceRequirements> {
    let non_empty = |v: &Option<String>, default: &str| {
        v.as_deref()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(default)
            .to_string()
    };
    let memory = parse_quantity("memory", &non_empty(&function.config.memory, DEFAULT_MEMORY))?;
    let cpu = parse_quantity("cpu", &non_empty(&function.config.cpu, DEFAULT_CPU))?;
    let quantities = BTreeMap::from([("memory".to_string(), memory), ("cpu".to_string(), cpu)]);
    Ok(ResourceRequirements {
        limits: Some(quantities.clone()),
        requests: Some(quantities),
        ..Default::default()
    })
}

/// Workload running the function image behind port 8080
pub fn build_function_deployment(function: &Function) -> Result<Deployment> {
    let labels = function_labels(function);
    let mut env = vec![
        EnvVar {
            name: "FUNCTION_NAME".into(),
            value: Some(function.name.clone()),
            ..Default::default()
        },
        EnvVar {
            name: "FUNCTION_HANDLER".into(),
            value: Some(function.config.handler.clone()),
            ..Default::default()
        },
        EnvVar {
            name: "FUNCTION_TIMEOUT".into(),
            value: Some(function.config.timeout.to_string()),
            ..Default::default()
        },
    ];
    env.extend(function.config.env.iter().map(|var| EnvVar {
        name: var.name.clone(),
        value: Some(var.value.clone()),
        ..Default::default()
    }));

    Ok(Deployment {
        metadata: object_meta(
            function.k8s_resource_name.clone(),
            &function.k8s_namespace,
            labels.clone(),
        ),
        spec: Some(DeploymentSpec {
            replicas: Some(function.config.min_replicas.max(0)),
            selector: LabelSelector {
                match_labels: Some(BTreeMap::from([(
                    "app".to_string(),
                    function.k8s_resource_name.clone(),
                )])),
                match_expressions: None,
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: CONTAINER_NAME.into(),
                        image: function.image_uri.clone(),
                        ports: Some(vec![ContainerPort {
                            name: Some("http".into()),
                            container_port: CONTAINER_PORT,
                            protocol: Some("TCP".into()),
                            ..Default::default()
                        }]),
                        env: Some(env),
                        resources: Some(function_resources(function)?),
                        readiness_probe: Some(function_probe(2, 5, 3)),
                        liveness_probe: Some(function_probe(10, 10, 5)),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

pub fn build_function_service(function: &Function) -> Service {
    Service {
        metadata: object_meta(
            function.k8s_resource_name.clone(),
            &function.k8s_namespace,
            function_labels(function),
        ),
        spec: Some(ServiceSpec {
            selector: Some(BTreeMap::from([(
                "app".to_string(),
                function.k8s_resource_name.clone(),
            )])),
            ports: Some(vec![ServicePort {
                name: Some("http".into()),
                port: SERVICE_PORT,
                target_port: Some(IntOrString::Int(CONTAINER_PORT)),
                protocol: Some("TCP".into()),
                ..Default::default()
            }]),
            type_: Some("ClusterIP".into()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// KEDA HTTP autoscaler that wakes the function on traffic and idles it to `min_replicas`
pub fn build_scaled_object(function: &Function, base_domain: &str) -> HTTPScaledObject {
    let positive = |v: i32, default: i32| if v > 0 { v } else { default };
    let config = &function.config;
    let mut object = HTTPScaledObject::new(
        &function.k8s_resource_name,
        HTTPScaledObjectSpec {
            hosts: vec![format!("{}.{base_domain}", function.name)],
            target_pending_requests: positive(config.concurrency, DEFAULT_CONCURRENCY),
            scaledown_period: positive(config.cooldown_period, DEFAULT_COOLDOWN_SECS),
            scale_target_ref: ScaleTargetRef {
                name: function.k8s_resource_name.clone(),
                service: function.k8s_resource_name.clone(),
                port: SERVICE_PORT,
            },
            replicas: ReplicaBounds {
                min: config.min_replicas.max(0),
                max: positive(config.max_replicas, DEFAULT_MAX_REPLICAS),
            },
        },
    );
    object.metadata.namespace = Some(function.k8s_namespace.clone());
    object.metadata.labels = Some(BTreeMap::from([
        (FUNCTION_LABEL.to_string(), function.name.clone()),
        (FUNCTION_ID_LABEL.to_string(), function.id.to_string()),
    ]));
    object
}

/// Where a deploying function stands according to its workload
#[derive(Clone, Debug, PartialEq)]
pub enum RolloutState {
    Ready { available: i32 },
    ScaledToZero,
    Failed(String),
    InProgress,
}

/// Reads the rollout state of a function workload.
///
/// No replicas with a zero minimum counts as ready: the autoscaler starts
/// one on the first request.
pub fn rollout_state(status: Option<&DeploymentStatus>, min_replicas: i32) -> RolloutState {
    let default = DeploymentStatus::default();
    let status = status.unwrap_or(&default);
    let ready = status.ready_replicas.unwrap_or(0);
    let available = status.available_replicas.unwrap_or(0);
    if ready > 0 || available > 0 {
        return RolloutState::Ready {
            available: available.max(ready),
        };
    }

    if status.unavailable_replicas.unwrap_or(0) > 0 {
        let failure = status.conditions.iter().flatten().find(|c| {
            c.type_ == "ReplicaFailure" && c.status == "True"
        });
        if let Some(condition) = failure {
            return RolloutState::Failed(
                condition
                    .message
                    .clone()
                    .unwrap_or_else(|| "Replica failure".to_string()),
            );
        }
    }

    if min_replicas <= 0 && status.replicas.unwrap_or(0) == 0 {
        return RolloutState::ScaledToZero;
    }
    RolloutState::InProgress
}

/// Drives functions from pending to ready and tears down deleted ones
pub struct FunctionReconciler {
    repo: Arc<dyn Repository>,
    orchestrator: Arc<dyn Orchestrator>,
    metrics: Metrics,
    diagnostics: Arc<RwLock<Diagnostics>>,
    config: FunctionReconcilerConfig,
}

impl FunctionReconciler {
    pub fn new(
        repo: Arc<dyn Repository>,
        orchestrator: Arc<dyn Orchestrator>,
        config: FunctionReconcilerConfig,
    ) -> Self {
        FunctionReconciler {
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
        info!(interval = ?self.config.interval, "Starting function reconciler");
        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => self.reconcile_all().await,
            }
        }
        info!("Function reconciler stopped");
    }

    pub async fn reconcile_all(&self) {
        for status in [
            FunctionStatus::Pending,
            FunctionStatus::Building,
            FunctionStatus::Deploying,
            FunctionStatus::Deleting,
        ] {
            let functions = match self.repo.list_functions_by_status(status).await {
                Ok(functions) => functions,
                Err(err) => {
                    error!(status = %status, error = %err, "Failed to list functions");
                    continue;
                }
            };
            for function in functions {
                if let Err(err) = self.reconcile_function(function).await {
                    self.metrics.reconcile_failure(kind::FUNCTION, &err);
                }
            }
        }
        self.refresh_ready_replicas().await;
    }

    #[instrument(skip(self, function), fields(
        function_id = %function.id,
        function = %function.name,
        status = %function.status,
        trace_id,
    ))]
    async fn reconcile_function(&self, function: Function) -> Result<()> {
        if let Some(trace_id) = telemetry::get_trace_id() {
            Span::current().record("trace_id", field::display(&trace_id));
        }
        let _timer = self.metrics.count_and_measure(kind::FUNCTION);
        self.diagnostics.write().await.last_event = Utc::now();

        match function.status {
            FunctionStatus::Pending => self.reconcile_pending(function).await,
            FunctionStatus::Building => self.reconcile_building(function).await,
            FunctionStatus::Deploying => self.reconcile_deploying(function).await,
            FunctionStatus::Deleting => self.reconcile_deleting(function).await,
            FunctionStatus::Ready | FunctionStatus::Failed => Ok(()),
        }
    }

    /// Places the function in its project namespace and deploys it if an image exists
    async fn reconcile_pending(&self, mut function: Function) -> Result<()> {
        let project = match self.repo.get_project(function.project_id).await {
            Ok(project) => project,
            Err(err) if err.is_not_found() => {
                warn!(project_id = %function.project_id, "Function project not found");
                return self
                    .set_status(&function, FunctionStatus::Failed, "Project not found")
                    .await;
            }
            Err(err) => return Err(err),
        };

        function.k8s_namespace = function_namespace(&project.slug);
        function.k8s_resource_name = function_resource_name(&function.name);

        let labels = BTreeMap::from([(NAMESPACE_TYPE_LABEL.to_string(), "function".to_string())]);
        if let Err(err) = self
            .orchestrator
            .ensure_namespace(&function.k8s_namespace, labels)
            .await
        {
            warn!(namespace = %function.k8s_namespace, error = %err, "Failed to create function namespace");
            return self
                .save(function, FunctionStatus::Failed, "Failed to create namespace")
                .await;
        }

        if function.image_uri.is_none() {
            debug!("Function has no image yet, waiting for build");
            return self
                .save(function, FunctionStatus::Building, "Waiting for build")
                .await;
        }
        self.start_deploy(function).await
    }

    async fn reconcile_building(&self, function: Function) -> Result<()> {
        if function.image_uri.is_none() {
            return Ok(());
        }
        info!("Function image available, deploying");
        self.start_deploy(function).await
    }

    async fn start_deploy(&self, function: Function) -> Result<()> {
        match self.deploy(&function).await {
            Ok(()) => {
                info!(namespace = %function.k8s_namespace, "Function resources applied");
                self.save(function, FunctionStatus::Deploying, "Deploying function")
                    .await
            }
            Err(err) => {
                error!(error = %err, "Failed to deploy function");
                let message = err.to_string();
                self.save(function, FunctionStatus::Failed, &message).await
            }
        }
    }

    async fn reconcile_deploying(&self, mut function: Function) -> Result<()> {
        if function.k8s_namespace.is_empty() || function.k8s_resource_name.is_empty() {
            warn!("Deploying function has no workload coordinates, skipping");
            return Ok(());
        }

        let Some(workload) = self
            .orchestrator
            .get_deployment(&function.k8s_namespace, &function.k8s_resource_name)
            .await?
        else {
            warn!("Function workload missing, recreating");
            if let Err(err) = self.deploy(&function).await {
                error!(error = %err, "Failed to recreate function workload");
                let message = err.to_string();
                return self
                    .set_status(&function, FunctionStatus::Failed, &message)
                    .await;
            }
            return Ok(());
        };

        match rollout_state(workload.status.as_ref(), function.config.min_replicas) {
            RolloutState::Ready { available } => {
                let now = Utc::now();
                function.available_replicas = available;
                function.endpoint = Some(format!(
                    "https://{}.{}",
                    function.name, self.config.base_domain
                ));
                function.deployed_at = Some(now);
                info!(available, "Function ready");
                self.save(function, FunctionStatus::Ready, "Function deployed and ready")
                    .await
            }
            RolloutState::ScaledToZero => {
                function.available_replicas = 0;
                function.endpoint = Some(format!(
                    "https://{}.{}",
                    function.name, self.config.base_domain
                ));
                function.deployed_at = Some(Utc::now());
                info!("Function deployed and scaled to zero");
                self.save(
                    function,
                    FunctionStatus::Ready,
                    "Function deployed (scaled to zero)",
                )
                .await
            }
            RolloutState::Failed(message) => {
                warn!(reason = %message, "Function rollout failed");
                self.set_status(&function, FunctionStatus::Failed, &message)
                    .await
            }
            RolloutState::InProgress => {
                debug!("Function rollout in progress");
                Ok(())
            }
        }
    }

    /// Removes autoscaler, service and workload, then the row itself
    async fn reconcile_deleting(&self, function: Function) -> Result<()> {
        if !function.k8s_namespace.is_empty() && !function.k8s_resource_name.is_empty() {
            let (namespace, name) = (&function.k8s_namespace, &function.k8s_resource_name);
            if let Err(err) = self.orchestrator.delete_http_scaled_object(namespace, name).await {
                warn!(error = %err, "Failed to delete HTTPScaledObject");
            }
            if let Err(err) = self.orchestrator.delete_service(namespace, name).await {
                warn!(error = %err, "Failed to delete function service");
            }
            if let Err(err) = self.orchestrator.delete_deployment(namespace, name).await {
                warn!(error = %err, "Failed to delete function workload");
            }
        }
        self.repo.delete_function(function.id).await?;
        info!("Function deleted");
        Ok(())
    }

    async fn deploy(&self, function: &Function) -> Result<()> {
        let namespace = function.k8s_namespace.as_str();
        let workload = build_function_deployment(function)?;
        self.orchestrator.apply_deployment(namespace, workload).await?;

        let mut service = build_function_service(function);
        if let Some(existing) = self
            .orchestrator
            .get_service(namespace, &function.k8s_resource_name)
            .await?
        {
            preserve_service_fields(&mut service, &existing);
        }
        self.orchestrator.apply_service(namespace, service).await?;

        let scaler = build_scaled_object(function, &self.config.base_domain);
        if let Err(err) = self.orchestrator.apply_http_scaled_object(namespace, scaler).await {
            warn!(error = %err, "Failed to apply HTTPScaledObject, function will not autoscale");
        }
        Ok(())
    }

    /// Moves the function to `status` without touching any other column
    async fn set_status(
        &self,
        function: &Function,
        status: FunctionStatus,
        message: &str,
    ) -> Result<()> {
        self.repo
            .update_function_status(function.id, status, message)
            .await?;
        info!(old_status = %function.status, new_status = %status, message, "Function status updated");
        Ok(())
    }

    /// Persists the whole row along with the new status
    async fn save(&self, mut function: Function, status: FunctionStatus, message: &str) -> Result<()> {
        let old_status = function.status;
        function.status = status;
        function.status_message = message.to_string();
        function.updated_at = Utc::now();
        self.repo.update_function(&function).await?;
        info!(old_status = %old_status, new_status = %status, message, "Function status updated");
        Ok(())
    }

    /// Copies live available replicas onto ready functions when they moved
    async fn refresh_ready_replicas(&self) {
        let functions = match self.repo.list_functions_by_status(FunctionStatus::Ready).await {
            Ok(functions) => functions,
            Err(err) => {
                error!(error = %err, "Failed to list ready functions");
                return;
            }
        };
        for function in functions {
            if function.k8s_namespace.is_empty() || function.k8s_resource_name.is_empty() {
                continue;
            }
            let workload = match self
                .orchestrator
                .get_deployment(&function.k8s_namespace, &function.k8s_resource_name)
                .await
            {
                Ok(Some(workload)) => workload,
                Ok(None) => continue,
                Err(err) => {
                    debug!(function_id = %function.id, error = %err, "Failed to read function workload");
                    continue;
                }
            };
            let available = workload
                .status
                .and_then(|status| status.available_replicas)
                .unwrap_or(0);
            if available == function.available_replicas {
                continue;
            }
            if let Err(err) = self.repo.update_function_replicas(function.id, available).await {
                warn!(function_id = %function.id, error = %err, "Failed to update function replicas");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_json_diff::assert_json_include;
    use k8s_openapi::api::apps::v1::DeploymentCondition;
    use rstest::rstest;
    use serde_json::json;
    use uuid::Uuid;

    use super::*;
    use crate::fixtures::Fixture;
    use crate::types::{FunctionConfig, FunctionEnvVar, FunctionRuntime};

    fn function(fx: &Fixture, status: FunctionStatus, image: Option<&str>) -> Function {
        let function = Function {
            id: Uuid::new_v4(),
            project_id: fx.project.id,
            name: "resize".into(),
            config: FunctionConfig {
                runtime: FunctionRuntime::Node,
                handler: "index.handler".into(),
                memory: None,
                cpu: None,
                timeout: 30,
                min_replicas: 0,
                max_replicas: 0,
                concurrency: 0,
                cooldown_period: 0,
                env: vec![FunctionEnvVar {
                    name: "BUCKET".into(),
                    value: "thumbs".into(),
                }],
            },
            status,
            status_message: String::new(),
            image_uri: image.map(String::from),
            endpoint: None,
            k8s_namespace: String::new(),
            k8s_resource_name: String::new(),
            available_replicas: 0,
            invocation_count: 0,
            deployed_at: None,
            updated_at: Utc::now(),
        };
        fx.repo.insert_function(function.clone());
        function
    }

    fn reconciler(fx: &Fixture) -> FunctionReconciler {
        FunctionReconciler::new(
            fx.repo.clone(),
            fx.orchestrator.clone(),
            FunctionReconcilerConfig::default(),
        )
    }

    fn deploying(fx: &Fixture, min_replicas: i32) -> Function {
        let mut f = function(fx, FunctionStatus::Deploying, Some("ghcr.io/shop/resize:1"));
        f.config.min_replicas = min_replicas;
        f.k8s_namespace = "fn-shop".into();
        f.k8s_resource_name = "fn-resize".into();
        fx.repo.insert_function(f.clone());
        f
    }

    fn workload_status(replicas: i32, ready: i32, unavailable: i32) -> DeploymentStatus {
        DeploymentStatus {
            replicas: Some(replicas),
            ready_replicas: Some(ready),
            available_replicas: Some(ready),
            unavailable_replicas: Some(unavailable),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn pending_without_image_waits_for_build() {
        let fx = Fixture::new();
        let f = function(&fx, FunctionStatus::Pending, None);

        reconciler(&fx).reconcile_all().await;

        let stored = fx.repo.function(f.id).unwrap();
        assert_eq!(stored.status, FunctionStatus::Building);
        assert_eq!(stored.status_message, "Waiting for build");
        assert_eq!(stored.k8s_namespace, "fn-shop");
        assert_eq!(stored.k8s_resource_name, "fn-resize");
        assert_eq!(
            fx.orchestrator.namespace_labels("fn-shop").unwrap()["enclii.dev/type"],
            "function"
        );
        assert!(fx.orchestrator.deployment("fn-shop", "fn-resize").is_none());
    }

    #[tokio::test]
    async fn pending_with_image_deploys_workload_service_and_autoscaler() {
        let fx = Fixture::new();
        let mut f = function(&fx, FunctionStatus::Pending, Some("ghcr.io/shop/resize:1"));
        f.config.min_replicas = 1;
        fx.repo.insert_function(f.clone());

        reconciler(&fx).reconcile_all().await;

        let stored = fx.repo.function(f.id).unwrap();
        assert_eq!(stored.status, FunctionStatus::Deploying);
        assert_eq!(stored.status_message, "Deploying function");

        let workload = fx.orchestrator.deployment("fn-shop", "fn-resize").unwrap();
        assert_json_include!(
            actual: serde_json::to_value(&workload).unwrap(),
            expected: json!({
                "metadata": {"labels": {"app": "fn-resize", "enclii.dev/function": "resize"}},
                "spec": {
                    "replicas": 1,
                    "template": {"spec": {"containers": [{
                        "name": "function",
                        "image": "ghcr.io/shop/resize:1",
                        "ports": [{"containerPort": 8080}],
                        "env": [
                            {"name": "FUNCTION_NAME", "value": "resize"},
                            {"name": "FUNCTION_HANDLER", "value": "index.handler"},
                            {"name": "FUNCTION_TIMEOUT", "value": "30"},
                            {"name": "BUCKET", "value": "thumbs"},
                        ],
                        "resources": {
                            "limits": {"cpu": "100m", "memory": "128Mi"},
                            "requests": {"cpu": "100m", "memory": "128Mi"},
                        },
                        "readinessProbe": {"httpGet": {"path": "/health"}, "initialDelaySeconds": 2},
                        "livenessProbe": {"initialDelaySeconds": 10, "timeoutSeconds": 5},
                    }]}},
                },
            })
        );

        let service = fx.orchestrator.service("fn-shop", "fn-resize").unwrap();
        assert_json_include!(
            actual: serde_json::to_value(&service).unwrap(),
            expected: json!({"spec": {"ports": [{"port": 80, "targetPort": 8080}]}})
        );

        let scaler = fx.orchestrator.scaled_object("fn-shop", "fn-resize").unwrap();
        assert_eq!(scaler.spec.hosts, vec!["resize.fn.enclii.dev".to_string()]);
    }

    #[tokio::test]
    async fn building_function_deploys_once_image_arrives() {
        let fx = Fixture::new();
        let mut f = function(&fx, FunctionStatus::Pending, None);
        f.config.min_replicas = 1;
        fx.repo.insert_function(f.clone());
        let reconciler = reconciler(&fx);
        reconciler.reconcile_all().await;

        let mut built = fx.repo.function(f.id).unwrap();
        built.image_uri = Some("ghcr.io/shop/resize:2".into());
        fx.repo.insert_function(built);
        reconciler.reconcile_all().await;

        assert_eq!(fx.repo.function(f.id).unwrap().status, FunctionStatus::Deploying);
        assert!(fx.orchestrator.deployment("fn-shop", "fn-resize").is_some());
    }

    #[tokio::test]
    async fn scale_to_zero_function_is_ready_after_one_pass() {
        let fx = Fixture::new();
        let f = function(&fx, FunctionStatus::Pending, Some("ghcr.io/shop/resize:1"));

        reconciler(&fx).reconcile_all().await;

        let stored = fx.repo.function(f.id).unwrap();
        assert_eq!(stored.status, FunctionStatus::Ready);
        assert_eq!(stored.status_message, "Function deployed (scaled to zero)");
        assert_eq!(stored.endpoint.as_deref(), Some("https://resize.fn.enclii.dev"));
        let workload = fx.orchestrator.deployment("fn-shop", "fn-resize").unwrap();
        assert_eq!(workload.spec.unwrap().replicas, Some(0));
    }

    #[tokio::test]
    async fn missing_project_fails_function() {
        let fx = Fixture::new();
        let mut f = function(&fx, FunctionStatus::Pending, None);
        f.project_id = Uuid::new_v4();
        fx.repo.insert_function(f.clone());

        reconciler(&fx).reconcile_all().await;

        let stored = fx.repo.function(f.id).unwrap();
        assert_eq!(stored.status, FunctionStatus::Failed);
        assert_eq!(stored.status_message, "Project not found");
    }

    #[tokio::test]
    async fn invalid_memory_fails_deploy() {
        let fx = Fixture::new();
        let mut f = function(&fx, FunctionStatus::Pending, Some("ghcr.io/shop/resize:1"));
        f.config.memory = Some("lots".into());
        fx.repo.insert_function(f.clone());

        reconciler(&fx).reconcile_all().await;

        let stored = fx.repo.function(f.id).unwrap();
        assert_eq!(stored.status, FunctionStatus::Failed);
        assert!(stored.status_message.contains("lots"));
    }

    #[tokio::test]
    async fn ready_replicas_make_function_ready() {
        let fx = Fixture::new();
        let f = deploying(&fx, 1);
        let mut workload = build_function_deployment(&f).unwrap();
        workload.status = Some(workload_status(1, 1, 0));
        fx.orchestrator.insert_deployment("fn-shop", workload);

        reconciler(&fx).reconcile_all().await;

        let stored = fx.repo.function(f.id).unwrap();
        assert_eq!(stored.status, FunctionStatus::Ready);
        assert_eq!(stored.status_message, "Function deployed and ready");
        assert_eq!(stored.endpoint.as_deref(), Some("https://resize.fn.enclii.dev"));
        assert_eq!(stored.available_replicas, 1);
        assert!(stored.deployed_at.is_some());
    }

    #[tokio::test]
    async fn failed_rollout_only_moves_status() {
        let fx = Fixture::new();
        let f = deploying(&fx, 1);
        let mut workload = build_function_deployment(&f).unwrap();
        workload.status = Some(DeploymentStatus {
            replicas: Some(1),
            unavailable_replicas: Some(1),
            conditions: Some(vec![DeploymentCondition {
                type_: "ReplicaFailure".into(),
                status: "True".into(),
                message: Some("exceeded quota".into()),
                ..Default::default()
            }]),
            ..Default::default()
        });
        fx.orchestrator.insert_deployment("fn-shop", workload);

        reconciler(&fx).reconcile_all().await;

        let stored = fx.repo.function(f.id).unwrap();
        assert_eq!(stored.status, FunctionStatus::Failed);
        assert_eq!(stored.status_message, "exceeded quota");
        assert_eq!(stored.k8s_namespace, "fn-shop");
        assert_eq!(stored.endpoint, None);
    }

    #[tokio::test]
    async fn scaled_to_zero_function_is_ready() {
        let fx = Fixture::new();
        let f = deploying(&fx, 0);
        let mut workload = build_function_deployment(&f).unwrap();
        workload.status = Some(workload_status(0, 0, 0));
        fx.orchestrator.insert_deployment("fn-shop", workload);

        reconciler(&fx).reconcile_all().await;

        let stored = fx.repo.function(f.id).unwrap();
        assert_eq!(stored.status, FunctionStatus::Ready);
        assert_eq!(stored.status_message, "Function deployed (scaled to zero)");
    }

    #[tokio::test]
    async fn missing_workload_is_recreated_while_deploying() {
        let fx = Fixture::new();
        let f = deploying(&fx, 1);

        reconciler(&fx).reconcile_all().await;

        assert!(fx.orchestrator.deployment("fn-shop", "fn-resize").is_some());
        assert_eq!(fx.repo.function(f.id).unwrap().status, FunctionStatus::Deploying);
    }

    #[tokio::test]
    async fn deleting_tears_down_resources_and_row() {
        let fx = Fixture::new();
        let mut f = deploying(&fx, 0);
        let reconciler = reconciler(&fx);
        reconciler.deploy(&f).await.unwrap();
        f.status = FunctionStatus::Deleting;
        fx.repo.insert_function(f.clone());

        reconciler.reconcile_all().await;

        assert!(fx.repo.function(f.id).is_none());
        assert!(fx.orchestrator.deployment("fn-shop", "fn-resize").is_none());
        assert!(fx.orchestrator.service("fn-shop", "fn-resize").is_none());
        assert!(fx.orchestrator.scaled_object("fn-shop", "fn-resize").is_none());
    }

    #[tokio::test]
    async fn ready_functions_track_available_replicas() {
        let fx = Fixture::new();
        let mut f = deploying(&fx, 0);
        f.status = FunctionStatus::Ready;
        fx.repo.insert_function(f.clone());
        let mut workload = build_function_deployment(&f).unwrap();
        workload.status = Some(workload_status(3, 3, 0));
        fx.orchestrator.insert_deployment("fn-shop", workload);

        reconciler(&fx).reconcile_all().await;

        assert_eq!(fx.repo.function(f.id).unwrap().available_replicas, 3);
    }

    #[test]
    fn replica_failure_condition_fails_rollout() {
        let status = DeploymentStatus {
            replicas: Some(1),
            unavailable_replicas: Some(1),
            conditions: Some(vec![DeploymentCondition {
                type_: "ReplicaFailure".into(),
                status: "True".into(),
                message: Some("exceeded quota".into()),
                ..Default::default()
            }]),
            ..Default::default()
        };
        assert_eq!(
            rollout_state(Some(&status), 1),
            RolloutState::Failed("exceeded quota".into())
        );
        assert_eq!(rollout_state(Some(&workload_status(1, 0, 1)), 1), RolloutState::InProgress);
        assert_eq!(rollout_state(None, 0), RolloutState::ScaledToZero);
    }

    #[rstest]
    #[case(0, 0, 0, 100, 300, 10)]
    #[case(25, 60, 4, 25, 60, 4)]
    #[case(-1, -5, -2, 100, 300, 10)]
    fn scaler_defaults(
        #[case] concurrency: i32,
        #[case] cooldown: i32,
        #[case] max_replicas: i32,
        #[case] pending: i32,
        #[case] scaledown: i32,
        #[case] max: i32,
    ) {
        let fx = Fixture::new();
        let mut f = deploying(&fx, 0);
        f.config.concurrency = concurrency;
        f.config.cooldown_period = cooldown;
        f.config.max_replicas = max_replicas;

        let scaler = build_scaled_object(&f, "fn.example.com");
        assert_eq!(scaler.spec.hosts, vec!["resize.fn.example.com".to_string()]);
        assert_eq!(scaler.spec.target_pending_requests, pending);
        assert_eq!(scaler.spec.scaledown_period, scaledown);
        assert_eq!(scaler.spec.replicas, ReplicaBounds { min: 0, max });
        assert_eq!(scaler.spec.scale_target_ref.port, 80);
        assert_eq!(scaler.metadata.namespace.as_deref(), Some("fn-shop"));
    }
}
