//! In-memory [`Repository`] for tests and local runs.
//!
//! Not durable and not shared across processes.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::{Repository, PENDING_ADDON_STATUSES};
use crate::types::{
    AddonBinding, AddonStatus, CustomDomain, DatabaseAddon, Deployment, DeploymentGroup,
    DeploymentStatus, Environment, EnvVar, Function, FunctionStatus, GroupStatus, HealthStatus,
    HttpRoute, Project, Release, Service, ServiceDependency,
};
use crate::{Error, Result};

#[derive(Default)]
struct Tables {
    projects: HashMap<Uuid, Project>,
    services: HashMap<Uuid, Service>,
    releases: Vec<Release>,
    deployments: Vec<Deployment>,
    environments: HashMap<Uuid, Environment>,
    env_vars: HashMap<(Uuid, Uuid), Vec<EnvVar>>,
    domains: HashMap<(Uuid, Uuid), Vec<CustomDomain>>,
    routes: HashMap<(Uuid, Uuid), Vec<HttpRoute>>,
    groups: HashMap<Uuid, DeploymentGroup>,
    dependencies: Vec<ServiceDependency>,
    addons: HashMap<Uuid, DatabaseAddon>,
    bindings: Vec<AddonBinding>,
    functions: HashMap<Uuid, Function>,
}

#[derive(Default)]
pub struct InMemoryRepository {
    tables: RwLock<Tables>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert_project(&self, project: Project) {
        self.write().projects.insert(project.id, project);
    }

    pub fn insert_service(&self, service: Service) {
        self.write().services.insert(service.id, service);
    }

    pub fn insert_release(&self, release: Release) {
        self.write().releases.push(release);
    }

    pub fn insert_deployment(&self, deployment: Deployment) {
        self.write().deployments.push(deployment);
    }

    pub fn insert_environment(&self, environment: Environment) {
        self.write()
            .environments
            .insert(environment.id, environment);
    }

    pub fn set_env_vars(&self, service_id: Uuid, environment_id: Uuid, vars: Vec<EnvVar>) {
        self.write()
            .env_vars
            .insert((service_id, environment_id), vars);
    }

    pub fn set_custom_domains(
        &self,
        service_id: Uuid,
        environment_id: Uuid,
        domains: Vec<CustomDomain>,
    ) {
        self.write()
            .domains
            .insert((service_id, environment_id), domains);
    }

    pub fn set_routes(&self, service_id: Uuid, environment_id: Uuid, routes: Vec<HttpRoute>) {
        self.write()
            .routes
            .insert((service_id, environment_id), routes);
    }

    pub fn insert_dependency(&self, dependency: ServiceDependency) {
        self.write().dependencies.push(dependency);
    }

    pub fn insert_addon(&self, addon: DatabaseAddon) {
        self.write().addons.insert(addon.id, addon);
    }

    pub fn insert_binding(&self, binding: AddonBinding) {
        self.write().bindings.push(binding);
    }

    pub fn insert_function(&self, function: Function) {
        self.write().functions.insert(function.id, function);
    }

    pub fn deployments(&self) -> Vec<Deployment> {
        self.read().deployments.clone()
    }

    pub fn releases(&self) -> Vec<Release> {
        self.read().releases.clone()
    }

    pub fn function(&self, id: Uuid) -> Option<Function> {
        self.read().functions.get(&id).cloned()
    }

    pub fn groups(&self) -> Vec<DeploymentGroup> {
        self.read().groups.values().cloned().collect()
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn get_project(&self, id: Uuid) -> Result<Project> {
        self.read()
            .projects
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("project", id))
    }

    async fn get_service(&self, id: Uuid) -> Result<Service> {
        self.read()
            .services
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("service", id))
    }

    async fn get_service_by_name(&self, project_id: Uuid, name: &str) -> Result<Option<Service>> {
        Ok(self
            .read()
            .services
            .values()
            .find(|s| s.project_id == project_id && s.name == name)
            .cloned())
    }

    async fn list_services_by_project(&self, project_id: Uuid) -> Result<Vec<Service>> {
        let mut services: Vec<Service> = self
            .read()
            .services
            .values()
            .filter(|s| s.project_id == project_id)
            .cloned()
            .collect();
        services.sort_by_key(|s| s.created_at);
        Ok(services)
    }

    async fn get_release(&self, id: Uuid) -> Result<Release> {
        self.read()
            .releases
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or_else(|| Error::not_found("release", id))
    }

    async fn list_releases_by_service(&self, service_id: Uuid) -> Result<Vec<Release>> {
        let mut releases: Vec<Release> = self
            .read()
            .releases
            .iter()
            .filter(|r| r.service_id == service_id)
            .cloned()
            .collect();
        releases.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(releases)
    }

    async fn create_release(&self, release: &Release) -> Result<()> {
        self.write().releases.push(release.clone());
        Ok(())
    }

    async fn get_deployment(&self, id: Uuid) -> Result<Deployment> {
        self.read()
            .deployments
            .iter()
            .find(|d| d.id == id)
            .cloned()
            .ok_or_else(|| Error::not_found("deployment", id))
    }

    async fn create_deployment(&self, deployment: &Deployment) -> Result<()> {
        self.write().deployments.push(deployment.clone());
        Ok(())
    }

    async fn list_deployments_by_status(
        &self,
        status: DeploymentStatus,
    ) -> Result<Vec<Deployment>> {
        Ok(self
            .read()
            .deployments
            .iter()
            .filter(|d| d.status == status)
            .cloned()
            .collect())
    }

    async fn get_latest_deployment_by_service(
        &self,
        service_id: Uuid,
        environment_id: Uuid,
    ) -> Result<Option<Deployment>> {
        let tables = self.read();
        let latest = tables
            .deployments
            .iter()
            .filter(|d| d.environment_id == environment_id)
            .filter(|d| {
                tables
                    .releases
                    .iter()
                    .any(|r| r.id == d.release_id && r.service_id == service_id)
            })
            .max_by_key(|d| d.created_at)
            .cloned();
        Ok(latest)
    }

    async fn list_deployments_by_group(&self, group_id: Uuid) -> Result<Vec<Deployment>> {
        let mut deployments: Vec<Deployment> = self
            .read()
            .deployments
            .iter()
            .filter(|d| d.group_id == Some(group_id))
            .cloned()
            .collect();
        deployments.sort_by_key(|d| (d.deploy_order, d.created_at));
        Ok(deployments)
    }

    async fn update_deployment_status(
        &self,
        id: Uuid,
        status: DeploymentStatus,
        health: HealthStatus,
        error_message: Option<String>,
    ) -> Result<()> {
        let mut tables = self.write();
        let deployment = tables
            .deployments
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or_else(|| Error::not_found("deployment", id))?;
        deployment.status = status;
        deployment.health = health;
        deployment.error_message = error_message;
        deployment.updated_at = Utc::now();
        Ok(())
    }

    async fn get_environment(&self, id: Uuid) -> Result<Environment> {
        self.read()
            .environments
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("environment", id))
    }

    async fn list_environments(&self) -> Result<Vec<Environment>> {
        Ok(self.read().environments.values().cloned().collect())
    }

    async fn get_environment_by_namespace(&self, namespace: &str) -> Result<Option<Environment>> {
        Ok(self
            .read()
            .environments
            .values()
            .find(|e| e.kube_namespace == namespace)
            .cloned())
    }

    async fn get_env_vars(&self, service_id: Uuid, environment_id: Uuid) -> Result<Vec<EnvVar>> {
        Ok(self
            .read()
            .env_vars
            .get(&(service_id, environment_id))
            .cloned()
            .unwrap_or_default())
    }

    async fn list_custom_domains(
        &self,
        service_id: Uuid,
        environment_id: Uuid,
    ) -> Result<Vec<CustomDomain>> {
        Ok(self
            .read()
            .domains
            .get(&(service_id, environment_id))
            .cloned()
            .unwrap_or_default())
    }

    async fn list_routes(&self, service_id: Uuid, environment_id: Uuid) -> Result<Vec<HttpRoute>> {
        Ok(self
            .read()
            .routes
            .get(&(service_id, environment_id))
            .cloned()
            .unwrap_or_default())
    }

    async fn create_group(&self, group: &DeploymentGroup) -> Result<()> {
        self.write().groups.insert(group.id, group.clone());
        Ok(())
    }

    async fn get_group(&self, id: Uuid) -> Result<DeploymentGroup> {
        self.read()
            .groups
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("deployment group", id))
    }

    async fn mark_group_started(&self, id: Uuid) -> Result<()> {
        let mut tables = self.write();
        let group = tables
            .groups
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("deployment group", id))?;
        group.status = GroupStatus::Deploying;
        group.started_at = Some(Utc::now());
        Ok(())
    }

    async fn complete_group(
        &self,
        id: Uuid,
        status: GroupStatus,
        error_message: Option<String>,
    ) -> Result<()> {
        let mut tables = self.write();
        let group = tables
            .groups
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("deployment group", id))?;
        group.status = status;
        group.error_message = error_message;
        group.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn update_group_status(
        &self,
        id: Uuid,
        status: GroupStatus,
        error_message: Option<String>,
    ) -> Result<()> {
        let mut tables = self.write();
        let group = tables
            .groups
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("deployment group", id))?;
        group.status = status;
        group.error_message = error_message;
        Ok(())
    }

    async fn get_dependencies(&self, service_id: Uuid) -> Result<Vec<ServiceDependency>> {
        Ok(self
            .read()
            .dependencies
            .iter()
            .filter(|d| d.service_id == service_id)
            .cloned()
            .collect())
    }

    async fn get_dependents(&self, service_id: Uuid) -> Result<Vec<ServiceDependency>> {
        Ok(self
            .read()
            .dependencies
            .iter()
            .filter(|d| d.depends_on_service_id == service_id)
            .cloned()
            .collect())
    }

    async fn create_dependency(&self, dependency: &ServiceDependency) -> Result<()> {
        self.write().dependencies.push(dependency.clone());
        Ok(())
    }

    async fn get_addon(&self, id: Uuid) -> Result<DatabaseAddon> {
        self.read()
            .addons
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("database addon", id))
    }

    async fn list_pending_addons(&self) -> Result<Vec<DatabaseAddon>> {
        Ok(self
            .read()
            .addons
            .values()
            .filter(|a| PENDING_ADDON_STATUSES.contains(&a.status))
            .cloned()
            .collect())
    }

    async fn update_addon(&self, addon: &DatabaseAddon) -> Result<()> {
        let mut tables = self.write();
        match tables.addons.get_mut(&addon.id) {
            Some(existing) => {
                *existing = addon.clone();
                Ok(())
            }
            None => Err(Error::not_found("database addon", addon.id)),
        }
    }

    async fn soft_delete_addon(&self, id: Uuid) -> Result<()> {
        let mut tables = self.write();
        let addon = tables
            .addons
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("database addon", id))?;
        addon.status = AddonStatus::Deleted;
        addon.updated_at = Utc::now();
        Ok(())
    }

    async fn list_addon_bindings(&self, service_id: Uuid) -> Result<Vec<AddonBinding>> {
        Ok(self
            .read()
            .bindings
            .iter()
            .filter(|b| b.service_id == service_id)
            .cloned()
            .collect())
    }

    async fn list_functions_by_status(&self, status: FunctionStatus) -> Result<Vec<Function>> {
        Ok(self
            .read()
            .functions
            .values()
            .filter(|f| f.status == status)
            .cloned()
            .collect())
    }

    async fn update_function(&self, function: &Function) -> Result<()> {
        let mut tables = self.write();
        match tables.functions.get_mut(&function.id) {
            Some(existing) => {
                *existing = function.clone();
                Ok(())
            }
            None => Err(Error::not_found("function", function.id)),
        }
    }

    async fn update_function_status(
        &self,
        id: Uuid,
        status: FunctionStatus,
        message: &str,
    ) -> Result<()> {
        let mut tables = self.write();
        let function = tables
            .functions
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("function", id))?;
        function.status = status;
        function.status_message = message.to_string();
        function.updated_at = Utc::now();
        Ok(())
    }

    async fn update_function_replicas(&self, id: Uuid, replicas: i32) -> Result<()> {
        let mut tables = self.write();
        let function = tables
            .functions
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("function", id))?;
        function.available_replicas = replicas;
        Ok(())
    }

    async fn delete_function(&self, id: Uuid) -> Result<()> {
        self.write()
            .functions
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| Error::not_found("function", id))
    }
}
