use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::GroupOrchestrator;
use crate::types::{Deployment, GroupStatus, ReleaseStatus};
use crate::{Error, Result};

/// What a group rollback managed to do
#[derive(Debug)]
pub struct GroupRollback {
    pub group_id: Uuid,
    pub status: GroupStatus,
    pub rolled_back: Vec<Deployment>,
    pub errors: Vec<(Uuid, Error)>,
}

impl GroupOrchestrator {
    /// Points a fresh pending deployment at the previous ready release.
    ///
    /// The original deployment row is left untouched.
    #[instrument(skip(self))]
    pub async fn rollback_deployment(&self, deployment_id: Uuid) -> Result<Deployment> {
        let current = self.repo.get_deployment(deployment_id).await?;
        let release = self.repo.get_release(current.release_id).await?;
        let previous = self
            .repo
            .list_releases_by_service(release.service_id)
            .await?
            .into_iter()
            .find(|r| r.id != release.id && r.status == ReleaseStatus::Ready)
            .ok_or(Error::NoPreviousRelease(release.service_id))?;

        let rollback = Deployment::pending(previous.id, current.environment_id, current.replicas);
        self.repo.create_deployment(&rollback).await?;
        info!(
            current_release = %release.id,
            previous_release = %previous.id,
            rollback_deployment = %rollback.id,
            "Rolling back deployment"
        );
        self.schedule(&rollback);
        Ok(rollback)
    }

    /// Rolls back every deployment of the group, last deployed first
    #[instrument(skip(self))]
    pub async fn rollback_group(&self, group_id: Uuid) -> Result<GroupRollback> {
        let group = self.repo.get_group(group_id).await?;
        info!(status = %group.status, "Rolling back deployment group");

        let deployments = self.repo.list_deployments_by_group(group_id).await?;
        let mut rolled_back = Vec::with_capacity(deployments.len());
        let mut errors = Vec::new();
        for deployment in deployments.iter().rev() {
            match self.rollback_deployment(deployment.id).await {
                Ok(rollback) => rolled_back.push(rollback),
                Err(err) => {
                    warn!(deployment_id = %deployment.id, error = %err, "Failed to roll back deployment");
                    errors.push((deployment.id, err));
                }
            }
        }

        let (status, message) = if errors.is_empty() {
            (GroupStatus::RolledBack, None)
        } else {
            (
                GroupStatus::Failed,
                Some(format!(
                    "Rollback partially failed: {} succeeded, {} failed",
                    rolled_back.len(),
                    errors.len()
                )),
            )
        };
        if let Err(err) = self
            .repo
            .update_group_status(group_id, status, message)
            .await
        {
            warn!(error = %err, "Failed to update group rollback status");
        }

        Ok(GroupRollback {
            group_id,
            status,
            rolled_back,
            errors,
        })
    }
}
