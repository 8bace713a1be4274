use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{Duration, Utc};
use futures::FutureExt;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, field, info, instrument, warn, Span};
use uuid::Uuid;

use super::results::WorkOutcome;
use super::{Controller, ReconcileWork};
use crate::metrics::kind;
use crate::reconcilers::{reconcile_disabled, ReconcileRequest, ReconcileResult};
use crate::telemetry;
use crate::types::{AddonStatus, ResolvedAddonBinding};

/// Delay before a work item whose reconcile panicked is tried again
const PANIC_RETRY_SECS: i64 = 30;

fn panic_reason(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

impl Controller {
    pub(super) async fn run_worker(
        self: Arc<Self>,
        worker_id: usize,
        mut shutdown: watch::Receiver<bool>,
    ) {
        debug!(worker_id, "Worker started");
        loop {
            let work = tokio::select! {
                _ = shutdown.changed() => break,
                work = self.queue.next() => match work {
                    Some(work) => work,
                    None => break,
                },
            };
            self.record_queue_depths();

            let result = self.process_guarded(&work).await;
            tokio::select! {
                _ = shutdown.changed() => break,
                sent = self.results_tx.send(WorkOutcome { work, result }) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }
        debug!(worker_id, "Worker stopped");
    }

    /// Runs one work item, turning a panic into a retryable failure.
    async fn process_guarded(&self, work: &ReconcileWork) -> ReconcileResult {
        match AssertUnwindSafe(self.process_work(work)).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => {
                let reason = panic_reason(payload.as_ref());
                error!(
                    deployment_id = %work.deployment_id,
                    attempt = work.attempt,
                    reason = %reason,
                    "Reconciliation panicked"
                );
                ReconcileResult::retry(
                    format!("reconciliation panicked: {reason}"),
                    Utc::now() + Duration::seconds(PANIC_RETRY_SECS),
                )
            }
        }
    }

    #[instrument(skip(self, work), fields(
        deployment_id = %work.deployment_id,
        attempt = work.attempt,
        trace_id,
    ))]
    pub(super) async fn process_work(&self, work: &ReconcileWork) -> ReconcileResult {
        if let Some(trace_id) = telemetry::get_trace_id() {
            Span::current().record("trace_id", field::display(&trace_id));
        }
        let _timer = self.metrics.count_and_measure(kind::DEPLOYMENT);
        self.diagnostics.write().await.last_event = Utc::now();
        info!("Processing reconciliation work");
        let started = Instant::now();

        let result = match self.resolve_request(work.deployment_id).await {
            Ok(Some(request)) => self.reconciler.reconcile(&request).await,
            Ok(None) => ReconcileResult::succeeded("Reconciliation disabled on workload, skipped"),
            Err(result) => result,
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        if result.success {
            info!(duration_ms, message = %result.message, "Reconciliation succeeded");
        } else if result.is_retryable() {
            info!(duration_ms, message = %result.message, "Reconciliation not yet converged");
        } else {
            error!(duration_ms, error = %result.describe(), "Reconciliation failed");
            if let Some(err) = &result.error {
                self.metrics.reconcile_failure(kind::DEPLOYMENT, err);
            }
        }
        result
    }

    /// Loads everything the service reconciler needs for one deployment.
    ///
    /// `Ok(None)` means the live workload opted out of reconciliation. A
    /// missing row is returned as a permanent failure.
    #[allow(clippy::result_large_err)]
    async fn resolve_request(
        &self,
        deployment_id: Uuid,
    ) -> Result<Option<ReconcileRequest>, ReconcileResult> {
        let repo = self.repo.as_ref();
        let deployment = repo
            .get_deployment(deployment_id)
            .await
            .map_err(|e| ReconcileResult::failed("Failed to retrieve deployment", e))?;
        let release = repo
            .get_release(deployment.release_id)
            .await
            .map_err(|e| ReconcileResult::failed("Failed to retrieve release", e))?;
        let service = repo
            .get_service(release.service_id)
            .await
            .map_err(|e| ReconcileResult::failed("Failed to retrieve service", e))?;
        let environment = repo
            .get_environment(deployment.environment_id)
            .await
            .map_err(|e| ReconcileResult::failed("Failed to retrieve environment", e))?;

        if self
            .workload_opted_out(&environment.kube_namespace, &service.name)
            .await
        {
            info!(service = %service.name, "Workload has reconciliation disabled");
            return Ok(None);
        }

        let env_vars = repo
            .get_env_vars(service.id, environment.id)
            .await
            .unwrap_or_else(|err| {
                warn!(error = %err, "Failed to get environment variables, continuing without them");
                Vec::new()
            });
        let addon_bindings = self.ready_addon_bindings(service.id).await;
        let custom_domains = repo
            .list_custom_domains(service.id, environment.id)
            .await
            .unwrap_or_else(|err| {
                warn!(error = %err, "Failed to get custom domains, continuing without them");
                Vec::new()
            });
        let routes = repo
            .list_routes(service.id, environment.id)
            .await
            .unwrap_or_else(|err| {
                warn!(error = %err, "Failed to get routes, continuing without them");
                Vec::new()
            });

        Ok(Some(ReconcileRequest {
            service,
            release,
            deployment,
            environment,
            env_vars,
            addon_bindings,
            custom_domains,
            routes,
        }))
    }

    async fn workload_opted_out(&self, namespace: &str, name: &str) -> bool {
        if namespace.is_empty() {
            return false;
        }
        match self.orchestrator.get_deployment(namespace, name).await {
            Ok(Some(workload)) => reconcile_disabled(&workload.metadata),
            Ok(None) => false,
            Err(err) => {
                debug!(error = %err, "Could not read live workload for opt-out check");
                false
            }
        }
    }

    /// Bindings of `service_id` whose addon is ready
    async fn ready_addon_bindings(&self, service_id: Uuid) -> Vec<ResolvedAddonBinding> {
        let bindings = match self.repo.list_addon_bindings(service_id).await {
            Ok(bindings) => bindings,
            Err(err) => {
                warn!(error = %err, "Failed to get addon bindings, continuing without them");
                return Vec::new();
            }
        };

        let mut resolved = Vec::with_capacity(bindings.len());
        for binding in bindings {
            match self.repo.get_addon(binding.addon_id).await {
                Ok(addon) if addon.status == AddonStatus::Ready => {
                    resolved.push(ResolvedAddonBinding {
                        env_var_name: binding.env_var_name,
                        addon_type: addon.addon_type,
                        k8s_namespace: addon.k8s_namespace,
                        k8s_resource_name: addon.k8s_resource_name,
                        connection_secret: addon.connection_secret,
                    })
                }
                Ok(addon) => debug!(
                    addon_id = %addon.id,
                    status = %addon.status,
                    "Skipping non-ready addon binding"
                ),
                Err(err) => warn!(
                    addon_id = %binding.addon_id,
                    error = %err,
                    "Failed to get addon for binding"
                ),
            }
        }
        resolved
    }
}
