//! Typed access to the platform's persisted state.
//!
//! The relational store lives outside this crate. Everything the reconcilers
//! need from it goes through [`Repository`], so the engine can run against
//! the production database or against [`memory::InMemoryRepository`].

pub mod memory;

use std::collections::{HashSet, VecDeque};

use async_trait::async_trait;
use uuid::Uuid;

use crate::types::{
    AddonBinding, AddonStatus, CustomDomain, DatabaseAddon, Deployment, DeploymentGroup,
    DeploymentStatus, Environment, EnvVar, Function, FunctionStatus, GroupStatus, HealthStatus,
    HttpRoute, Project, Release, Service, ServiceDependency,
};
use crate::Result;

/// Lookups that miss return [`crate::Error::NotFound`] unless the method
/// returns an `Option`.
#[async_trait]
pub trait Repository: Send + Sync {
    // --- Projects and services ---

    async fn get_project(&self, id: Uuid) -> Result<Project>;

    async fn get_service(&self, id: Uuid) -> Result<Service>;

    async fn get_service_by_name(&self, project_id: Uuid, name: &str) -> Result<Option<Service>>;

    async fn list_services_by_project(&self, project_id: Uuid) -> Result<Vec<Service>>;

    // --- Releases ---

    async fn get_release(&self, id: Uuid) -> Result<Release>;

    /// Newest first.
    async fn list_releases_by_service(&self, service_id: Uuid) -> Result<Vec<Release>>;

    async fn create_release(&self, release: &Release) -> Result<()>;

    // --- Deployments ---

    async fn get_deployment(&self, id: Uuid) -> Result<Deployment>;

    async fn create_deployment(&self, deployment: &Deployment) -> Result<()>;

    async fn list_deployments_by_status(&self, status: DeploymentStatus)
        -> Result<Vec<Deployment>>;

    /// The most recently created deployment of any release of the service
    /// into the environment.
    async fn get_latest_deployment_by_service(
        &self,
        service_id: Uuid,
        environment_id: Uuid,
    ) -> Result<Option<Deployment>>;

    /// Ordered by deploy order, then creation time.
    async fn list_deployments_by_group(&self, group_id: Uuid) -> Result<Vec<Deployment>>;

    async fn update_deployment_status(
        &self,
        id: Uuid,
        status: DeploymentStatus,
        health: HealthStatus,
        error_message: Option<String>,
    ) -> Result<()>;

    // --- Environments ---

    async fn get_environment(&self, id: Uuid) -> Result<Environment>;

    async fn list_environments(&self) -> Result<Vec<Environment>>;

    async fn get_environment_by_namespace(&self, namespace: &str) -> Result<Option<Environment>>;

    // --- Per-service configuration ---

    /// Decrypted values, secret flag preserved.
    async fn get_env_vars(&self, service_id: Uuid, environment_id: Uuid) -> Result<Vec<EnvVar>>;

    async fn list_custom_domains(
        &self,
        service_id: Uuid,
        environment_id: Uuid,
    ) -> Result<Vec<CustomDomain>>;

    async fn list_routes(&self, service_id: Uuid, environment_id: Uuid) -> Result<Vec<HttpRoute>>;

    // --- Deployment groups ---

    async fn create_group(&self, group: &DeploymentGroup) -> Result<()>;

    async fn get_group(&self, id: Uuid) -> Result<DeploymentGroup>;

    /// Moves the group to deploying and stamps `started_at`.
    async fn mark_group_started(&self, id: Uuid) -> Result<()>;

    /// Sets the final status and stamps `completed_at`.
    async fn complete_group(
        &self,
        id: Uuid,
        status: GroupStatus,
        error_message: Option<String>,
    ) -> Result<()>;

    async fn update_group_status(
        &self,
        id: Uuid,
        status: GroupStatus,
        error_message: Option<String>,
    ) -> Result<()>;

    // --- Service dependency graph ---

    /// Edges where `service_id` is the dependent.
    async fn get_dependencies(&self, service_id: Uuid) -> Result<Vec<ServiceDependency>>;

    /// Edges where `service_id` is depended upon.
    async fn get_dependents(&self, service_id: Uuid) -> Result<Vec<ServiceDependency>>;

    async fn create_dependency(&self, dependency: &ServiceDependency) -> Result<()>;

    /// Whether adding `service_id -> depends_on` would close a cycle.
    async fn has_cycle(&self, service_id: Uuid, depends_on: Uuid) -> Result<bool> {
        if service_id == depends_on {
            return Ok(true);
        }
        let mut seen = HashSet::new();
        let mut frontier = VecDeque::from([depends_on]);
        while let Some(current) = frontier.pop_front() {
            if !seen.insert(current) {
                continue;
            }
            for edge in self.get_dependencies(current).await? {
                if edge.depends_on_service_id == service_id {
                    return Ok(true);
                }
                frontier.push_back(edge.depends_on_service_id);
            }
        }
        Ok(false)
    }

    // --- Database addons ---

    async fn get_addon(&self, id: Uuid) -> Result<DatabaseAddon>;

    /// Addons in pending, provisioning or deleting.
    async fn list_pending_addons(&self) -> Result<Vec<DatabaseAddon>>;

    async fn update_addon(&self, addon: &DatabaseAddon) -> Result<()>;

    /// Marks the addon deleted without removing the row.
    async fn soft_delete_addon(&self, id: Uuid) -> Result<()>;

    async fn list_addon_bindings(&self, service_id: Uuid) -> Result<Vec<AddonBinding>>;

    // --- Functions ---

    async fn list_functions_by_status(&self, status: FunctionStatus) -> Result<Vec<Function>>;

    async fn update_function(&self, function: &Function) -> Result<()>;

    async fn update_function_status(
        &self,
        id: Uuid,
        status: FunctionStatus,
        message: &str,
    ) -> Result<()>;

    async fn update_function_replicas(&self, id: Uuid, replicas: i32) -> Result<()>;

    async fn delete_function(&self, id: Uuid) -> Result<()>;
}

/// Statuses the addon reconciler polls
pub const PENDING_ADDON_STATUSES: [AddonStatus; 3] = [
    AddonStatus::Pending,
    AddonStatus::Provisioning,
    AddonStatus::Deleting,
];
