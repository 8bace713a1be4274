//! Seeded platform state shared by unit tests.

use std::sync::Arc;

use chrono::{Duration, Utc};
use uuid::Uuid;

use crate::orchestrator::InMemoryOrchestrator;
use crate::repository::memory::InMemoryRepository;
use crate::types::{
    AutoDeployPolicy, DependencyType, Deployment, Environment, Project, Release, ReleaseStatus,
    Service, ServiceDependency,
};

pub struct Fixture {
    pub repo: Arc<InMemoryRepository>,
    pub orchestrator: Arc<InMemoryOrchestrator>,
    pub project: Project,
    pub environment: Environment,
}

impl Fixture {
    /// Project `shop` with a `production` environment in namespace `shop-prod`
    pub fn new() -> Self {
        let repo = Arc::new(InMemoryRepository::new());
        let project = Project {
            id: Uuid::new_v4(),
            name: "Shop".into(),
            slug: "shop".into(),
        };
        let environment = Environment {
            id: Uuid::new_v4(),
            project_id: project.id,
            name: "production".into(),
            kube_namespace: "shop-prod".into(),
        };
        repo.insert_project(project.clone());
        repo.insert_environment(environment.clone());
        Fixture {
            repo,
            orchestrator: Arc::new(InMemoryOrchestrator::new()),
            project,
            environment,
        }
    }

    pub fn service(&self, name: &str) -> Service {
        let service = Service {
            id: Uuid::new_v4(),
            project_id: self.project.id,
            name: name.into(),
            git_repo: Some(format!("https://github.com/shop/{name}")),
            app_path: None,
            volumes: vec![],
            resources: None,
            health_check: None,
            auto_deploy: AutoDeployPolicy::default(),
            created_at: Utc::now(),
        };
        self.repo.insert_service(service.clone());
        service
    }

    /// A release created `age_minutes` ago
    pub fn release(
        &self,
        service: &Service,
        version: &str,
        status: ReleaseStatus,
        age_minutes: i64,
    ) -> Release {
        let release = Release {
            id: Uuid::new_v4(),
            service_id: service.id,
            version: version.into(),
            image_uri: format!("ghcr.io/shop/{}:{version}", service.name),
            git_sha: format!("sha-{version}"),
            status,
            created_at: Utc::now() - Duration::minutes(age_minutes),
        };
        self.repo.insert_release(release.clone());
        release
    }

    pub fn deployment(&self, release: &Release) -> Deployment {
        let deployment = Deployment::pending(release.id, self.environment.id, 2);
        self.repo.insert_deployment(deployment.clone());
        deployment
    }

    /// `service` depends on `depends_on`
    pub fn depends(&self, service: &Service, depends_on: &Service) {
        self.repo.insert_dependency(ServiceDependency {
            id: Uuid::new_v4(),
            service_id: service.id,
            depends_on_service_id: depends_on.id,
            dependency_type: DependencyType::Runtime,
        });
    }
}
