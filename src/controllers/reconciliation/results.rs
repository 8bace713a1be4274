use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{Controller, ReconcileWork};
use crate::notifications::DeploymentEvent;
use crate::reconcilers::ReconcileResult;
use crate::types::{DeploymentStatus, HealthStatus};

/// A finished work item on its way to the result processor
#[derive(Debug)]
pub(super) struct WorkOutcome {
    pub work: ReconcileWork,
    pub result: ReconcileResult,
}

impl Controller {
    pub(super) async fn process_results(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let retry_shutdown = shutdown.clone();
        let mut results = self.results_rx.lock().await;
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                outcome = results.recv() => match outcome {
                    Some(outcome) => self.handle_result(outcome, &retry_shutdown).await,
                    None => break,
                },
            }
        }
        debug!("Result processor stopped");
    }

    /// Persists the outcome of one attempt and decides what happens next.
    pub(super) async fn handle_result(
        self: &Arc<Self>,
        outcome: WorkOutcome,
        shutdown: &watch::Receiver<bool>,
    ) {
        let WorkOutcome { work, result } = outcome;
        if self.inflight().get(&work.deployment_id) != Some(&work.attempt) {
            debug!(
                deployment_id = %work.deployment_id,
                attempt = work.attempt,
                "Discarding outcome of a superseded attempt"
            );
            return;
        }
        let result = self.apply_retry_ceiling(&work, result);

        let (status, health, error_message) = if result.success {
            info!(deployment_id = %work.deployment_id, "Deployment reconciled successfully");
            (DeploymentStatus::Running, HealthStatus::Healthy, None)
        } else if let Some(next_check) = result.next_check {
            self.schedule_retry(&work, next_check, shutdown.clone());
            info!(
                deployment_id = %work.deployment_id,
                attempt = work.attempt,
                next_check = %next_check,
                "Scheduled reconciliation retry"
            );
            (DeploymentStatus::Pending, HealthStatus::Unknown, None)
        } else {
            let message = result.describe();
            error!(
                deployment_id = %work.deployment_id,
                attempt = work.attempt,
                error = %message,
                "Deployment reconciliation failed"
            );
            (DeploymentStatus::Failed, HealthStatus::Unhealthy, Some(message))
        };

        if let Err(err) = self
            .repo
            .update_deployment_status(work.deployment_id, status, health, error_message.clone())
            .await
        {
            error!(deployment_id = %work.deployment_id, error = %err, "Failed to update deployment status");
        }

        if status != DeploymentStatus::Pending {
            self.inflight().remove(&work.deployment_id);
        }
        if status.is_terminal() {
            self.notify(work.deployment_id, status, error_message);
        }
    }

    /// Turns a retryable result into a permanent one once attempts run out
    fn apply_retry_ceiling(&self, work: &ReconcileWork, result: ReconcileResult) -> ReconcileResult {
        if !result.is_retryable() || work.attempt < self.config.max_attempts {
            return result;
        }
        warn!(
            deployment_id = %work.deployment_id,
            attempt = work.attempt,
            "Retries exhausted, marking deployment failed"
        );
        ReconcileResult {
            success: false,
            message: format!(
                "{} (retries exhausted after {} attempts)",
                result.message, work.attempt
            ),
            error: result.error,
            next_check: None,
        }
    }

    /// Re-admits the deployment once `next_check` has passed.
    ///
    /// The chain advances to the next attempt right away so that nothing else
    /// schedules the deployment in the meantime.
    fn schedule_retry(
        self: &Arc<Self>,
        work: &ReconcileWork,
        next_check: DateTime<Utc>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let retry = ReconcileWork {
            deployment_id: work.deployment_id,
            priority: work.priority + 1,
            attempt: work.attempt + 1,
            scheduled_at: next_check,
        };
        self.inflight().insert(retry.deployment_id, retry.attempt);
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            let wait = (next_check - Utc::now()).to_std().unwrap_or_default();
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(wait) => {}
            }
            if *shutdown.borrow() {
                return;
            }
            let (deployment_id, attempt) = (retry.deployment_id, retry.attempt);
            if controller.enqueue(retry).is_err() {
                debug!(deployment_id = %deployment_id, attempt, "Retry deferred to retry queue");
            }
        });
    }

    /// Delivers the terminal-state event on a detached task
    fn notify(&self, deployment_id: Uuid, status: DeploymentStatus, error: Option<String>) {
        let repo = self.repo.clone();
        let notifier = self.notifier.clone();
        tokio::spawn(async move {
            let event = match DeploymentEvent::resolve(
                repo.as_ref(),
                deployment_id,
                status,
                error.as_deref(),
            )
            .await
            {
                Ok(event) => event,
                Err(err) => {
                    warn!(deployment_id = %deployment_id, error = %err, "Failed to build deployment notification");
                    return;
                }
            };
            let project_id = event.project_id;
            match notifier.send_event(project_id, event).await {
                Ok(()) => debug!(deployment_id = %deployment_id, status = %status, "Sent deployment notification"),
                Err(err) => warn!(deployment_id = %deployment_id, error = %err, "Failed to send deployment notification"),
            }
        });
    }
}
