//! Drives one service deployment into its namespace.
//!
//! Every step is an idempotent apply; objects that already exist keep their
//! server-assigned fields (selector, cluster IP, claim spec).

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::core::v1::Secret;
use tracing::{debug, error, info, instrument, warn};

use super::ingress::build_ingress;
use super::network_policies::{
    egress_policy, egress_policy_name, ingress_policy, ingress_policy_name, ingress_port,
};
use super::port::{resolve_port, PortSource};
use super::readiness::{deployment_ready, fatal_pod_condition};
use super::storage::{apply_pvc, build_pvcs};
use super::workload::{
    build_deployment, build_service, env_secret, preserve_selector, preserve_service_fields,
};
use super::{object_meta, MANAGED_BY_LABEL, PLATFORM_NAMESPACE, REGISTRY_SECRET};
use crate::orchestrator::{object_name, Orchestrator};
use crate::types::{
    env_map, CustomDomain, Deployment, EnvVar, Environment, HttpRoute, Release,
    ResolvedAddonBinding, Service,
};
use crate::{Error, Result};

/// Seconds before a not-yet-ready workload is looked at again
pub const READINESS_RECHECK_SECS: i64 = 30;

fn next_readiness_check() -> DateTime<Utc> {
    Utc::now() + Duration::seconds(READINESS_RECHECK_SECS)
}

/// Everything needed to converge one deployment
#[derive(Clone, Debug)]
pub struct ReconcileRequest {
    pub service: Service,
    pub release: Release,
    pub deployment: Deployment,
    pub environment: Environment,
    pub env_vars: Vec<EnvVar>,
    pub addon_bindings: Vec<ResolvedAddonBinding>,
    pub custom_domains: Vec<CustomDomain>,
    pub routes: Vec<HttpRoute>,
}

/// Outcome of a reconcile pass.
///
/// A failure with `next_check` set is retryable; without it, permanent.
#[derive(Debug)]
pub struct ReconcileResult {
    pub success: bool,
    pub message: String,
    pub error: Option<Error>,
    pub next_check: Option<DateTime<Utc>>,
}

impl ReconcileResult {
    pub fn succeeded(message: impl Into<String>) -> Self {
        ReconcileResult {
            success: true,
            message: message.into(),
            error: None,
            next_check: None,
        }
    }

    pub fn failed(message: impl Into<String>, error: Error) -> Self {
        ReconcileResult {
            success: false,
            message: message.into(),
            error: Some(error),
            next_check: None,
        }
    }

    pub fn retry(message: impl Into<String>, next_check: DateTime<Utc>) -> Self {
        ReconcileResult {
            success: false,
            message: message.into(),
            error: None,
            next_check: Some(next_check),
        }
    }

    /// A failed step; transient orchestrator errors are retried at the next readiness check
    pub fn from_error(message: impl Into<String>, error: Error) -> Self {
        if !error.is_transient() {
            return Self::failed(message, error);
        }
        let message = message.into();
        warn!(step = %message, error = %error, "Orchestrator unavailable, will retry");
        ReconcileResult {
            success: false,
            message,
            error: Some(error),
            next_check: Some(next_readiness_check()),
        }
    }

    pub fn is_retryable(&self) -> bool {
        !self.success && self.next_check.is_some()
    }

    /// Message plus the underlying error, for persisting and notifying
    pub fn describe(&self) -> String {
        match &self.error {
            Some(err) => format!("{}: {err}", self.message),
            None => self.message.clone(),
        }
    }
}

/// Converts a failed step into a result with `message`: retryable when the
/// orchestrator may recover on its own, permanent otherwise
macro_rules! step {
    ($expr:expr, $message:expr) => {
        match $expr {
            Ok(value) => value,
            Err(err) => return ReconcileResult::from_error($message, err),
        }
    };
}

pub struct ServiceReconciler {
    orchestrator: Arc<dyn Orchestrator>,
}

impl ServiceReconciler {
    pub fn new(orchestrator: Arc<dyn Orchestrator>) -> Self {
        ServiceReconciler { orchestrator }
    }

    #[instrument(skip(self, req), fields(
        service = %req.service.name,
        release = %req.release.version,
        deployment_id = %req.deployment.id,
    ))]
    pub async fn reconcile(&self, req: &ReconcileRequest) -> ReconcileResult {
        info!("Starting service reconciliation");

        let namespace = req.environment.kube_namespace.as_str();
        if namespace.is_empty() {
            error!(environment = %req.environment.name, "Environment has no namespace");
            return ReconcileResult::failed(
                "Environment has no kubernetes namespace configured",
                Error::MissingNamespace(format!(
                    "{} ({})",
                    req.environment.name, req.environment.id
                )),
            );
        }

        step!(
            self.ensure_namespace(namespace).await,
            "Failed to ensure namespace"
        );

        let pvcs = step!(
            build_pvcs(&req.service, namespace),
            "Failed to generate PVCs"
        );
        for pvc in pvcs {
            let name = pvc.metadata.name.clone().unwrap_or_default();
            step!(
                apply_pvc(self.orchestrator.as_ref(), namespace, pvc).await,
                format!("Failed to apply PVC {name}")
            );
        }

        if let Some(secret) = env_secret(req, namespace) {
            step!(
                self.orchestrator.apply_secret(namespace, secret).await,
                "Failed to create environment secrets"
            );
        }

        let port = resolve_port(&env_map(&req.env_vars));
        if let Some(err) = &port.error {
            warn!(error = %err, port = port.port, "Port parsing error, using default port");
        }
        if port.source == PortSource::Default {
            warn!(
                namespace,
                port = port.port,
                "Using default port, consider setting ENCLII_PORT or PORT"
            );
        }
        debug!(port = port.port, source = %port.source, "Resolved container port");

        let workload = step!(
            build_deployment(req, namespace, port.port),
            "Failed to generate manifests"
        );
        step!(
            self.apply_workload(namespace, workload).await,
            "Failed to apply deployment"
        );
        step!(
            self.apply_cluster_service(namespace, build_service(req, namespace, port.port))
                .await,
            "Failed to apply service"
        );

        if let Some(ingress) =
            build_ingress(&req.service, namespace, &req.custom_domains, &req.routes)
        {
            step!(
                self.orchestrator.apply_ingress(namespace, ingress).await,
                "Failed to apply ingress"
            );
        }

        let policies = [
            ingress_policy(&req.service, namespace, port.port),
            egress_policy(&req.service, namespace, &req.addon_bindings),
        ];
        for policy in policies {
            let name = policy.metadata.name.clone().unwrap_or_default();
            step!(
                self.apply_network_policy(namespace, policy).await,
                format!("Failed to apply network policy {name}")
            );
        }

        self.check_readiness(namespace, &req.service.name).await
    }

    async fn ensure_namespace(&self, namespace: &str) -> Result<()> {
        let labels = BTreeMap::from([
            (MANAGED_BY_LABEL.to_string(), "enclii".to_string()),
            ("enclii.dev/platform".to_string(), "enclii".to_string()),
        ]);
        self.orchestrator.ensure_namespace(namespace, labels).await?;

        if let Err(err) = self.ensure_registry_credentials(namespace).await {
            warn!(namespace, error = %err, "Failed to ensure registry credentials in namespace");
        }
        Ok(())
    }

    /// Copies the platform pull secret into `namespace` when it is missing there
    async fn ensure_registry_credentials(&self, namespace: &str) -> Result<()> {
        if namespace == PLATFORM_NAMESPACE
            || self
                .orchestrator
                .get_secret(namespace, REGISTRY_SECRET)
                .await?
                .is_some()
        {
            return Ok(());
        }

        let Some(source) = self
            .orchestrator
            .get_secret(PLATFORM_NAMESPACE, REGISTRY_SECRET)
            .await?
        else {
            warn!(
                source_namespace = PLATFORM_NAMESPACE,
                "Source registry credentials not found, skipping copy"
            );
            return Ok(());
        };

        let labels = BTreeMap::from([
            (
                MANAGED_BY_LABEL.to_string(),
                "switchyard-reconciler".to_string(),
            ),
            (
                "enclii.dev/copied-from".to_string(),
                PLATFORM_NAMESPACE.to_string(),
            ),
        ]);
        let copy = Secret {
            metadata: object_meta(REGISTRY_SECRET, namespace, labels),
            type_: source.type_,
            data: source.data,
            ..Default::default()
        };
        self.orchestrator.apply_secret(namespace, copy).await?;
        info!(namespace, secret = REGISTRY_SECRET, "Copied registry credentials");
        Ok(())
    }

    async fn apply_workload(
        &self,
        namespace: &str,
        mut workload: k8s_openapi::api::apps::v1::Deployment,
    ) -> Result<()> {
        let name = object_name(&workload.metadata)?.to_string();
        match self.orchestrator.get_deployment(namespace, &name).await? {
            Some(existing) => {
                preserve_selector(&mut workload, &existing);
                self.orchestrator.apply_deployment(namespace, workload).await?;
                info!(deployment = %name, "Updated existing deployment");
            }
            None => {
                self.orchestrator.apply_deployment(namespace, workload).await?;
                info!(deployment = %name, "Created new deployment");
            }
        }
        Ok(())
    }

    async fn apply_cluster_service(
        &self,
        namespace: &str,
        mut service: k8s_openapi::api::core::v1::Service,
    ) -> Result<()> {
        let name = object_name(&service.metadata)?.to_string();
        if let Some(existing) = self.orchestrator.get_service(namespace, &name).await? {
            preserve_service_fields(&mut service, &existing);
        }
        self.orchestrator.apply_service(namespace, service).await?;
        debug!(service = %name, "Applied service");
        Ok(())
    }

    async fn apply_network_policy(
        &self,
        namespace: &str,
        policy: k8s_openapi::api::networking::v1::NetworkPolicy,
    ) -> Result<()> {
        let name = object_name(&policy.metadata)?.to_string();
        if let Some(existing) = self.orchestrator.get_network_policy(namespace, &name).await? {
            if let (Some(old), Some(new)) = (ingress_port(&existing), ingress_port(&policy)) {
                if old != new {
                    warn!(
                        network_policy = %name,
                        namespace,
                        existing_port = old,
                        new_port = new,
                        "NetworkPolicy port mismatch detected, updating to resolved port"
                    );
                }
            }
        }
        self.orchestrator.apply_network_policy(namespace, policy).await
    }

    async fn check_readiness(&self, namespace: &str, name: &str) -> ReconcileResult {
        let workload = match self.orchestrator.get_deployment(namespace, name).await {
            Ok(Some(workload)) => workload,
            Ok(None) => {
                return ReconcileResult::retry(
                    "Deployment not found after apply, will retry",
                    next_readiness_check(),
                )
            }
            Err(err) => return ReconcileResult::from_error("Failed to read deployment status", err),
        };

        if deployment_ready(&workload) {
            info!("Service reconciliation completed successfully");
            return ReconcileResult::succeeded("Service deployed successfully");
        }

        match self
            .orchestrator
            .list_pods(namespace, &format!("app={name}"))
            .await
        {
            Ok(pods) => {
                for pod in &pods {
                    if let Some(condition) = fatal_pod_condition(pod) {
                        error!(
                            pod = pod.metadata.name.as_deref().unwrap_or_default(),
                            error = %condition,
                            "Pod has fatal error that won't self-heal"
                        );
                        return ReconcileResult::failed(
                            "Deployment has a fatal pod condition",
                            Error::FatalPodCondition(condition),
                        );
                    }
                }
            }
            Err(err) => debug!(error = %err, "Could not list pods for fatal condition check"),
        }

        ReconcileResult::retry(
            "Deployment not ready, will retry",
            next_readiness_check(),
        )
    }

    /// Removes everything generated for `service_name`; absent objects are fine.
    #[instrument(skip(self))]
    pub async fn delete(&self, namespace: &str, service_name: &str) -> Result<()> {
        self.orchestrator
            .delete_deployment(namespace, service_name)
            .await?;
        self.orchestrator.delete_service(namespace, service_name).await?;
        self.orchestrator.delete_ingress(namespace, service_name).await?;
        self.orchestrator
            .delete_network_policy(namespace, &ingress_policy_name(service_name))
            .await?;
        self.orchestrator
            .delete_network_policy(namespace, &egress_policy_name(service_name))
            .await?;
        info!("Deleted service resources");
        Ok(())
    }
}
