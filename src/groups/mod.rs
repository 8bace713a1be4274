//! Coordinated multi-service deployments.
//!
//! A deployment group deploys the services of a project into one
//! environment. Services are ranked into layers by their dependency edges
//! and the group's strategy decides how much of that order is enforced.

use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::controllers::Controller;
use crate::repository::Repository;
use crate::types::{
    DependencyType, Deployment, DeploymentGroup, GroupStatus, GroupStrategy, ReleaseStatus,
    ServiceDependency,
};
use crate::{Error, Result};

mod rollback;
pub mod topology;

pub use rollback::GroupRollback;
pub use topology::{dependency_layers, deploy_layers};

#[derive(Clone, Debug)]
pub struct CreateGroupRequest {
    pub project_id: Uuid,
    pub environment_id: Uuid,
    /// Every service of the project when empty
    pub service_ids: Vec<Uuid>,
    pub strategy: GroupStrategy,
    pub triggered_by: Option<String>,
    pub git_sha: Option<String>,
    pub pr_url: Option<String>,
}

impl CreateGroupRequest {
    pub fn new(project_id: Uuid, environment_id: Uuid, strategy: GroupStrategy) -> Self {
        CreateGroupRequest {
            project_id,
            environment_id,
            service_ids: Vec::new(),
            strategy,
            triggered_by: None,
            git_sha: None,
            pr_url: None,
        }
    }
}

/// A persisted group and the layers its services were ranked into
#[derive(Clone, Debug)]
pub struct GroupPlan {
    pub group: DeploymentGroup,
    pub layers: Vec<Vec<Uuid>>,
}

#[derive(Debug)]
pub struct GroupExecution {
    pub group: DeploymentGroup,
    pub deployments: Vec<Deployment>,
    /// Services whose deployment could not be created
    pub errors: Vec<(Uuid, Error)>,
}

type Outcomes = (Vec<Deployment>, Vec<(Uuid, Error)>);

pub struct GroupOrchestrator {
    repo: Arc<dyn Repository>,
    controller: Option<Arc<Controller>>,
}

impl GroupOrchestrator {
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        GroupOrchestrator {
            repo,
            controller: None,
        }
    }

    /// Created deployments are scheduled on `controller` straight away
    pub fn with_controller(self, controller: Arc<Controller>) -> Self {
        Self {
            controller: Some(controller),
            ..self
        }
    }

    #[instrument(skip(self, request), fields(
        project_id = %request.project_id,
        environment_id = %request.environment_id,
        strategy = %request.strategy,
    ))]
    pub async fn create_group(&self, request: CreateGroupRequest) -> Result<GroupPlan> {
        let project = self.repo.get_project(request.project_id).await?;
        let service_ids = if request.service_ids.is_empty() {
            self.repo
                .list_services_by_project(project.id)
                .await?
                .into_iter()
                .map(|s| s.id)
                .collect()
        } else {
            request.service_ids.clone()
        };
        if service_ids.is_empty() {
            return Err(Error::Validation("No services to deploy".into()));
        }

        let layers = dependency_layers(self.repo.as_ref(), &service_ids).await?;

        let now = Utc::now();
        let group = DeploymentGroup {
            id: Uuid::new_v4(),
            project_id: project.id,
            environment_id: request.environment_id,
            name: format!("deploy-{}-{}", project.slug, now.format("%Y%m%d-%H%M%S")),
            strategy: request.strategy,
            status: GroupStatus::Pending,
            triggered_by: request.triggered_by,
            git_sha: request.git_sha,
            pr_url: request.pr_url,
            error_message: None,
            created_at: now,
            started_at: None,
            completed_at: None,
        };
        self.repo.create_group(&group).await?;
        info!(
            group_id = %group.id,
            services = service_ids.len(),
            layers = layers.len(),
            "Created deployment group"
        );
        Ok(GroupPlan { group, layers })
    }

    #[instrument(skip(self))]
    pub async fn execute_group(&self, group_id: Uuid) -> Result<GroupExecution> {
        let group = self.repo.get_group(group_id).await?;
        if group.status != GroupStatus::Pending {
            return Err(Error::GroupNotPending {
                id: group_id,
                status: group.status.to_string(),
            });
        }
        self.repo.mark_group_started(group_id).await?;
        info!(strategy = %group.strategy, "Executing deployment group");

        let service_ids: Vec<Uuid> = self
            .repo
            .list_services_by_project(group.project_id)
            .await?
            .into_iter()
            .map(|s| s.id)
            .collect();
        let layers = match dependency_layers(self.repo.as_ref(), &service_ids).await {
            Ok(layers) => layers,
            Err(err) => {
                if let Err(update) = self
                    .repo
                    .complete_group(group_id, GroupStatus::Failed, Some(err.to_string()))
                    .await
                {
                    warn!(error = %update, "Failed to mark group failed");
                }
                return Err(err);
            }
        };

        let (deployments, errors) = match group.strategy {
            GroupStrategy::Parallel => self.execute_parallel(&group, &layers).await,
            GroupStrategy::Sequential => self.execute_sequential(&group, &layers).await,
            GroupStrategy::DependencyOrdered => {
                self.execute_dependency_ordered(&group, &layers).await
            }
        };

        let (status, message) = if errors.is_empty() {
            (GroupStatus::Succeeded, None)
        } else {
            (
                GroupStatus::Failed,
                Some(format!("{} deployments failed", errors.len())),
            )
        };
        if let Err(err) = self.repo.complete_group(group_id, status, message).await {
            warn!(error = %err, "Failed to update group completion");
        }
        info!(
            status = %status,
            deployments = deployments.len(),
            errors = errors.len(),
            "Deployment group finished"
        );

        Ok(GroupExecution {
            group: self.repo.get_group(group_id).await?,
            deployments,
            errors,
        })
    }

    async fn execute_parallel(&self, group: &DeploymentGroup, layers: &[Vec<Uuid>]) -> Outcomes {
        let services: Vec<Uuid> = layers.iter().flatten().copied().collect();
        self.deploy_concurrently(group, &services, 0).await
    }

    /// One service at a time; a failure does not stop the rest
    async fn execute_sequential(&self, group: &DeploymentGroup, layers: &[Vec<Uuid>]) -> Outcomes {
        let mut deployments = Vec::new();
        let mut errors = Vec::new();
        for (order, service_id) in (0..).zip(layers.iter().flatten()) {
            match self.deploy_service(group, *service_id, order).await {
                Ok(deployment) => deployments.push(deployment),
                Err(err) => errors.push((*service_id, err)),
            }
        }
        (deployments, errors)
    }

    /// Layer by layer, stopping at the first layer with a failure
    async fn execute_dependency_ordered(
        &self,
        group: &DeploymentGroup,
        layers: &[Vec<Uuid>],
    ) -> Outcomes {
        let mut deployments = Vec::new();
        let mut errors = Vec::new();
        let mut next_order = 0;
        for (index, layer) in layers.iter().enumerate() {
            debug!(layer = index, services = layer.len(), "Deploying layer");
            let (deployed, failed) = self.deploy_concurrently(group, layer, next_order).await;
            next_order += layer.len() as i32;
            deployments.extend(deployed);
            let layer_failed = !failed.is_empty();
            errors.extend(failed);
            if layer_failed {
                warn!(
                    layer = index,
                    errors = errors.len(),
                    "Layer deployment failed, stopping group deployment"
                );
                break;
            }
        }
        (deployments, errors)
    }

    async fn deploy_concurrently(
        &self,
        group: &DeploymentGroup,
        services: &[Uuid],
        first_order: i32,
    ) -> Outcomes {
        let attempts = (first_order..)
            .zip(services)
            .map(|(order, service_id)| async move {
                (*service_id, self.deploy_service(group, *service_id, order).await)
            });

        let mut deployments = Vec::new();
        let mut errors = Vec::new();
        for (service_id, outcome) in join_all(attempts).await {
            match outcome {
                Ok(deployment) => deployments.push(deployment),
                Err(err) => errors.push((service_id, err)),
            }
        }
        (deployments, errors)
    }

    /// Creates a one-replica deployment of the service's newest ready release
    async fn deploy_service(
        &self,
        group: &DeploymentGroup,
        service_id: Uuid,
        deploy_order: i32,
    ) -> Result<Deployment> {
        let release = self
            .repo
            .list_releases_by_service(service_id)
            .await?
            .into_iter()
            .find(|r| r.status == ReleaseStatus::Ready)
            .ok_or(Error::NoReadyRelease(service_id))
            .inspect_err(|err| warn!(service_id = %service_id, error = %err, "Cannot deploy service"))?;

        let deployment = Deployment {
            group_id: Some(group.id),
            deploy_order,
            ..Deployment::pending(release.id, group.environment_id, 1)
        };
        self.repo.create_deployment(&deployment).await?;
        debug!(
            deployment_id = %deployment.id,
            service_id = %service_id,
            release_id = %release.id,
            deploy_order,
            "Created deployment for service in group"
        );
        self.schedule(&deployment);
        Ok(deployment)
    }

    fn schedule(&self, deployment: &Deployment) {
        let Some(controller) = &self.controller else {
            return;
        };
        let priority = i64::from(deployment.deploy_order);
        if let Err(err) = controller.schedule_reconciliation(deployment.id, priority) {
            debug!(deployment_id = %deployment.id, error = %err, "Reconciliation deferred to retry queue");
        }
    }

    /// Records that `service_id` depends on `depends_on`.
    ///
    /// Rejects self edges, unknown services, and edges that would close a cycle.
    pub async fn add_dependency(
        &self,
        service_id: Uuid,
        depends_on: Uuid,
        dependency_type: DependencyType,
    ) -> Result<ServiceDependency> {
        if service_id == depends_on {
            return Err(Error::SelfDependency(service_id));
        }
        self.repo.get_service(service_id).await?;
        if let Err(err) = self.repo.get_service(depends_on).await {
            return Err(if err.is_not_found() {
                Error::Validation("Dependency service not found".into())
            } else {
                err
            });
        }
        if self.repo.has_cycle(service_id, depends_on).await? {
            return Err(Error::CircularDependency {
                services: vec![service_id, depends_on],
            });
        }

        let dependency = ServiceDependency {
            id: Uuid::new_v4(),
            service_id,
            depends_on_service_id: depends_on,
            dependency_type,
        };
        self.repo.create_dependency(&dependency).await?;
        info!(
            service_id = %service_id,
            depends_on = %depends_on,
            dependency_type = ?dependency_type,
            "Added service dependency"
        );
        Ok(dependency)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controllers::ControllerConfig;
    use crate::fixtures::Fixture;
    use crate::notifications::LogNotifier;
    use crate::types::DeploymentStatus;

    fn request(fx: &Fixture, strategy: GroupStrategy) -> CreateGroupRequest {
        CreateGroupRequest {
            git_sha: Some("abc123".into()),
            triggered_by: Some("ci".into()),
            ..CreateGroupRequest::new(fx.project.id, fx.environment.id, strategy)
        }
    }

    #[tokio::test]
    async fn create_group_persists_pending_group_with_layers() {
        let fx = Fixture::new();
        let db = fx.service("db");
        let api = fx.service("api");
        fx.depends(&api, &db);

        let plan = GroupOrchestrator::new(fx.repo.clone())
            .create_group(request(&fx, GroupStrategy::DependencyOrdered))
            .await
            .unwrap();

        assert_eq!(plan.layers, vec![vec![db.id], vec![api.id]]);
        assert_eq!(plan.group.status, GroupStatus::Pending);
        assert!(plan.group.name.starts_with("deploy-shop-"));
        let stored = fx.repo.get_group(plan.group.id).await.unwrap();
        assert_eq!(stored, plan.group);
        assert_eq!(stored.git_sha.as_deref(), Some("abc123"));
    }

    #[tokio::test]
    async fn cyclic_services_abort_before_group_is_persisted() {
        let fx = Fixture::new();
        let a = fx.service("a");
        let b = fx.service("b");
        let c = fx.service("c");
        fx.depends(&a, &c);
        fx.depends(&b, &a);
        fx.depends(&c, &b);

        let err = GroupOrchestrator::new(fx.repo.clone())
            .create_group(request(&fx, GroupStrategy::Parallel))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::CircularDependency { .. }));
        assert!(fx.repo.groups().is_empty());
    }

    #[tokio::test]
    async fn project_without_services_is_rejected() {
        let fx = Fixture::new();
        let err = GroupOrchestrator::new(fx.repo.clone())
            .create_group(request(&fx, GroupStrategy::Parallel))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn dependency_ordered_stops_after_failed_layer() {
        let fx = Fixture::new();
        let db = fx.service("db");
        let cache = fx.service("cache");
        let api = fx.service("api");
        fx.depends(&api, &db);
        fx.depends(&api, &cache);
        // db has no ready release
        fx.release(&db, "v1", ReleaseStatus::Building, 5);
        fx.release(&cache, "v1", ReleaseStatus::Ready, 5);
        fx.release(&api, "v1", ReleaseStatus::Ready, 5);
        let orchestrator = GroupOrchestrator::new(fx.repo.clone());
        let plan = orchestrator
            .create_group(request(&fx, GroupStrategy::DependencyOrdered))
            .await
            .unwrap();

        let execution = orchestrator.execute_group(plan.group.id).await.unwrap();

        assert_eq!(execution.group.status, GroupStatus::Failed);
        assert_eq!(execution.group.error_message.as_deref(), Some("1 deployments failed"));
        assert!(execution.group.started_at.is_some());
        assert!(execution.group.completed_at.is_some());
        assert_eq!(execution.errors.len(), 1);
        assert_eq!(execution.errors[0].0, db.id);
        assert!(matches!(execution.errors[0].1, Error::NoReadyRelease(id) if id == db.id));

        // the cache sibling still deployed, api was never attempted
        let deployments = fx.repo.deployments();
        assert_eq!(deployments.len(), 1);
        let release = fx.repo.get_release(deployments[0].release_id).await.unwrap();
        assert_eq!(release.service_id, cache.id);
    }

    #[tokio::test]
    async fn sequential_continues_past_failures_with_increasing_order() {
        let fx = Fixture::new();
        let db = fx.service("db");
        let api = fx.service("api");
        let web = fx.service("web");
        fx.depends(&api, &db);
        fx.depends(&web, &api);
        fx.release(&db, "v1", ReleaseStatus::Ready, 5);
        fx.release(&web, "v1", ReleaseStatus::Ready, 5);
        let orchestrator = GroupOrchestrator::new(fx.repo.clone());
        let plan = orchestrator
            .create_group(request(&fx, GroupStrategy::Sequential))
            .await
            .unwrap();

        let execution = orchestrator.execute_group(plan.group.id).await.unwrap();

        assert_eq!(execution.group.status, GroupStatus::Failed);
        let orders: Vec<i32> = execution.deployments.iter().map(|d| d.deploy_order).collect();
        assert_eq!(orders, vec![0, 2]);
        assert_eq!(execution.errors.len(), 1);
        assert_eq!(execution.errors[0].0, api.id);
    }

    #[tokio::test]
    async fn parallel_deploys_every_service_and_schedules_it() {
        let fx = Fixture::new();
        let services = [fx.service("db"), fx.service("api"), fx.service("web")];
        fx.depends(&services[1], &services[0]);
        for svc in &services {
            fx.release(svc, "v1", ReleaseStatus::Ready, 10);
            fx.release(svc, "v2", ReleaseStatus::Ready, 1);
        }
        let controller = Arc::new(Controller::new(
            fx.repo.clone(),
            fx.orchestrator.clone(),
            Arc::new(LogNotifier),
            ControllerConfig::default(),
        ));
        let orchestrator =
            GroupOrchestrator::new(fx.repo.clone()).with_controller(controller.clone());
        let plan = orchestrator
            .create_group(request(&fx, GroupStrategy::Parallel))
            .await
            .unwrap();

        let execution = orchestrator.execute_group(plan.group.id).await.unwrap();

        assert_eq!(execution.group.status, GroupStatus::Succeeded);
        assert!(execution.group.error_message.is_none());
        assert_eq!(execution.deployments.len(), 3);
        for deployment in &execution.deployments {
            assert_eq!(deployment.group_id, Some(plan.group.id));
            assert_eq!(deployment.replicas, 1);
            assert_eq!(deployment.status, DeploymentStatus::Pending);
            let release = fx.repo.get_release(deployment.release_id).await.unwrap();
            assert_eq!(release.version, "v2");
        }
        let mut orders: Vec<i32> = execution.deployments.iter().map(|d| d.deploy_order).collect();
        orders.sort_unstable();
        assert_eq!(orders, vec![0, 1, 2]);
        assert_eq!(controller.get_status().work_queue, 3);
    }

    #[tokio::test]
    async fn only_pending_groups_execute() {
        let fx = Fixture::new();
        let api = fx.service("api");
        fx.release(&api, "v1", ReleaseStatus::Ready, 5);
        let orchestrator = GroupOrchestrator::new(fx.repo.clone());
        let plan = orchestrator
            .create_group(request(&fx, GroupStrategy::Parallel))
            .await
            .unwrap();
        orchestrator.execute_group(plan.group.id).await.unwrap();

        let err = orchestrator.execute_group(plan.group.id).await.unwrap_err();

        assert!(matches!(err, Error::GroupNotPending { status, .. } if status == "succeeded"));
    }

    #[tokio::test]
    async fn dependency_edges_are_validated() {
        let fx = Fixture::new();
        let db = fx.service("db");
        let api = fx.service("api");
        let orchestrator = GroupOrchestrator::new(fx.repo.clone());

        let self_edge = orchestrator
            .add_dependency(api.id, api.id, DependencyType::Runtime)
            .await
            .unwrap_err();
        assert!(matches!(self_edge, Error::SelfDependency(id) if id == api.id));

        let missing = orchestrator
            .add_dependency(api.id, Uuid::new_v4(), DependencyType::Runtime)
            .await
            .unwrap_err();
        assert!(matches!(missing, Error::Validation(_)));

        orchestrator
            .add_dependency(api.id, db.id, DependencyType::Data)
            .await
            .unwrap();
        let cycle = orchestrator
            .add_dependency(db.id, api.id, DependencyType::Runtime)
            .await
            .unwrap_err();
        assert!(matches!(cycle, Error::CircularDependency { .. }));
        assert_eq!(fx.repo.get_dependencies(api.id).await.unwrap().len(), 1);
    }
}
