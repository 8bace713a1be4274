use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::repository::Repository;
use crate::types::DeploymentStatus;
use crate::Result;

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    #[serde(rename = "deployment.succeeded")]
    DeploymentSucceeded,
    #[serde(rename = "deployment.failed")]
    DeploymentFailed,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct ProjectInfo {
    pub id: Uuid,
    pub name: String,
    pub slug: String,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct DeploymentInfo {
    pub id: Uuid,
    pub service_name: String,
    pub environment: String,
    pub status: DeploymentStatus,
    pub commit_sha: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Event fired when a deployment reaches running or failed
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct DeploymentEvent {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub project_id: Uuid,
    pub project: ProjectInfo,
    pub deployment: DeploymentInfo,
}

impl DeploymentEvent {
    /// Resolves the deployment's release, service, project and environment.
    ///
    /// The error text is only carried for failed deployments.
    pub async fn resolve(
        repo: &dyn Repository,
        deployment_id: Uuid,
        status: DeploymentStatus,
        error: Option<&str>,
    ) -> Result<Self> {
        let deployment = repo.get_deployment(deployment_id).await?;
        let release = repo.get_release(deployment.release_id).await?;
        let service = repo.get_service(release.service_id).await?;
        let project = repo.get_project(service.project_id).await?;
        let environment = repo.get_environment(deployment.environment_id).await?;

        let kind = match status {
            DeploymentStatus::Running => EventKind::DeploymentSucceeded,
            _ => EventKind::DeploymentFailed,
        };

        Ok(DeploymentEvent {
            id: Uuid::new_v4(),
            kind,
            timestamp: Utc::now(),
            project_id: project.id,
            project: ProjectInfo {
                id: project.id,
                name: project.name,
                slug: project.slug,
            },
            deployment: DeploymentInfo {
                id: deployment.id,
                service_name: service.name,
                environment: environment.name,
                status,
                commit_sha: release.git_sha,
                error: match status {
                    DeploymentStatus::Failed => error.map(str::to_string),
                    _ => None,
                },
            },
        })
    }
}

/// Outbound delivery of platform events
#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send_event(&self, project_id: Uuid, event: DeploymentEvent) -> Result<()>;
}

/// Writes events to the log instead of delivering them
#[derive(Clone, Copy, Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl NotificationSender for LogNotifier {
    async fn send_event(&self, project_id: Uuid, event: DeploymentEvent) -> Result<()> {
        info!(
            project_id = %project_id,
            deployment_id = %event.deployment.id,
            event = %serde_json::to_string(&event.kind)?,
            "Deployment event"
        );
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Keeps every event it is given
    #[derive(Default)]
    pub struct RecordingNotifier {
        pub events: Mutex<Vec<DeploymentEvent>>,
    }

    impl RecordingNotifier {
        pub fn kinds(&self) -> Vec<EventKind> {
            self.events.lock().unwrap().iter().map(|e| e.kind).collect()
        }
    }

    #[async_trait]
    impl NotificationSender for RecordingNotifier {
        async fn send_event(&self, _project_id: Uuid, event: DeploymentEvent) -> Result<()> {
            self.events.lock().unwrap().push(event);
            Ok(())
        }
    }
}
