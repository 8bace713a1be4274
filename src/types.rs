use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Implements `as_str` and `Display` for a closed string-backed enum
macro_rules! string_enum {
    ($name:ident { $($variant:ident => $value:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $value),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseStatus {
    Building,
    Ready,
    Failed,
}

string_enum!(ReleaseStatus {
    Building => "building",
    Ready => "ready",
    Failed => "failed",
});

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Running,
    Failed,
}

string_enum!(DeploymentStatus {
    Pending => "pending",
    Running => "running",
    Failed => "failed",
});

impl DeploymentStatus {
    /// Running and failed are the states that trigger notifications
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeploymentStatus::Running | DeploymentStatus::Failed)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Unhealthy,
}

string_enum!(HealthStatus {
    Unknown => "unknown",
    Healthy => "healthy",
    Unhealthy => "unhealthy",
});

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GroupStrategy {
    Parallel,
    Sequential,
    DependencyOrdered,
}

string_enum!(GroupStrategy {
    Parallel => "parallel",
    Sequential => "sequential",
    DependencyOrdered => "dependency_ordered",
});

impl std::str::FromStr for GroupStrategy {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "parallel" => Ok(GroupStrategy::Parallel),
            "sequential" => Ok(GroupStrategy::Sequential),
            "dependency_ordered" => Ok(GroupStrategy::DependencyOrdered),
            other => Err(crate::Error::Validation(format!(
                "invalid deployment group strategy '{other}'"
            ))),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    Pending,
    Deploying,
    Succeeded,
    Failed,
    RolledBack,
}

string_enum!(GroupStatus {
    Pending => "pending",
    Deploying => "deploying",
    Succeeded => "succeeded",
    Failed => "failed",
    RolledBack => "rolled_back",
});

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DependencyType {
    Runtime,
    Build,
    Data,
}

string_enum!(DependencyType {
    Runtime => "runtime",
    Build => "build",
    Data => "data",
});

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AddonType {
    Postgres,
    Redis,
    Mysql,
}

string_enum!(AddonType {
    Postgres => "postgres",
    Redis => "redis",
    Mysql => "mysql",
});

impl AddonType {
    /// Default port the addon listens on inside the cluster
    pub fn default_port(&self) -> i32 {
        match self {
            AddonType::Postgres => 5432,
            AddonType::Redis => 6379,
            AddonType::Mysql => 3306,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AddonStatus {
    Pending,
    Provisioning,
    Ready,
    Failed,
    Deleting,
    Deleted,
}

string_enum!(AddonStatus {
    Pending => "pending",
    Provisioning => "provisioning",
    Ready => "ready",
    Failed => "failed",
    Deleting => "deleting",
    Deleted => "deleted",
});

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FunctionStatus {
    Pending,
    Building,
    Deploying,
    Ready,
    Failed,
    Deleting,
}

string_enum!(FunctionStatus {
    Pending => "pending",
    Building => "building",
    Deploying => "deploying",
    Ready => "ready",
    Failed => "failed",
    Deleting => "deleting",
});

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FunctionRuntime {
    Go,
    Python,
    Node,
    Rust,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    pub slug: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ResourceConfig {
    pub cpu_request: Option<String>,
    pub cpu_limit: Option<String>,
    pub memory_request: Option<String>,
    pub memory_limit: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct HealthCheckConfig {
    pub disabled: bool,
    pub path: Option<String>,
    pub liveness_path: Option<String>,
    pub readiness_path: Option<String>,
    pub port: Option<i32>,
    pub initial_delay_seconds: Option<i32>,
    pub timeout_seconds: Option<i32>,
    pub period_seconds: Option<i32>,
    pub failure_threshold: Option<i32>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Volume {
    pub name: String,
    pub mount_path: String,
    pub size: String,
    pub storage_class_name: Option<String>,
    pub access_mode: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct AutoDeployPolicy {
    pub enabled: bool,
    pub branch: Option<String>,
    pub environment: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Service {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub git_repo: Option<String>,
    pub app_path: Option<String>,
    #[serde(default)]
    pub volumes: Vec<Volume>,
    pub resources: Option<ResourceConfig>,
    pub health_check: Option<HealthCheckConfig>,
    #[serde(default)]
    pub auto_deploy: AutoDeployPolicy,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Release {
    pub id: Uuid,
    pub service_id: Uuid,
    pub version: String,
    pub image_uri: String,
    pub git_sha: String,
    pub status: ReleaseStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Deployment {
    pub id: Uuid,
    pub release_id: Uuid,
    pub environment_id: Uuid,
    pub replicas: i32,
    pub status: DeploymentStatus,
    pub health: HealthStatus,
    pub group_id: Option<Uuid>,
    pub deploy_order: i32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Deployment {
    /// A fresh pending deployment of `release_id` into `environment_id`
    pub fn pending(release_id: Uuid, environment_id: Uuid, replicas: i32) -> Self {
        let now = Utc::now();
        Deployment {
            id: Uuid::new_v4(),
            release_id,
            environment_id,
            replicas,
            status: DeploymentStatus::Pending,
            health: HealthStatus::Unknown,
            group_id: None,
            deploy_order: 0,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Environment {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub kube_namespace: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DeploymentGroup {
    pub id: Uuid,
    pub project_id: Uuid,
    pub environment_id: Uuid,
    pub name: String,
    pub strategy: GroupStrategy,
    pub status: GroupStatus,
    pub triggered_by: Option<String>,
    pub git_sha: Option<String>,
    pub pr_url: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ServiceDependency {
    pub id: Uuid,
    pub service_id: Uuid,
    pub depends_on_service_id: Uuid,
    pub dependency_type: DependencyType,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DatabaseAddon {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub addon_type: AddonType,
    pub status: AddonStatus,
    pub status_message: String,
    pub k8s_namespace: String,
    pub k8s_resource_name: String,
    pub connection_secret: Option<String>,
    pub host: String,
    pub port: i32,
    pub database_name: String,
    pub username: String,
    pub provisioned_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Binds a ready addon to a service under an environment variable name
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AddonBinding {
    pub addon_id: Uuid,
    pub service_id: Uuid,
    pub env_var_name: String,
}

/// A bound addon as seen by the service reconciler
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedAddonBinding {
    pub env_var_name: String,
    pub addon_type: AddonType,
    pub k8s_namespace: String,
    pub k8s_resource_name: String,
    pub connection_secret: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FunctionEnvVar {
    pub name: String,
    pub value: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FunctionConfig {
    pub runtime: FunctionRuntime,
    pub handler: String,
    pub memory: Option<String>,
    pub cpu: Option<String>,
    pub timeout: i32,
    pub min_replicas: i32,
    pub max_replicas: i32,
    pub concurrency: i32,
    pub cooldown_period: i32,
    #[serde(default)]
    pub env: Vec<FunctionEnvVar>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Function {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub config: FunctionConfig,
    pub status: FunctionStatus,
    pub status_message: String,
    pub image_uri: Option<String>,
    pub endpoint: Option<String>,
    pub k8s_namespace: String,
    pub k8s_resource_name: String,
    pub available_replicas: i32,
    pub invocation_count: i64,
    pub deployed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// A decrypted environment variable for a service in an environment
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct EnvVar {
    pub key: String,
    pub value: String,
    pub is_secret: bool,
}

/// Flattens env vars into a key → value map
pub fn env_map(vars: &[EnvVar]) -> BTreeMap<String, String> {
    vars.iter()
        .map(|v| (v.key.clone(), v.value.clone()))
        .collect()
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CustomDomain {
    pub domain: String,
    pub tls_enabled: bool,
    pub tls_issuer: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PathType {
    #[default]
    Prefix,
    Exact,
    ImplementationSpecific,
}

string_enum!(PathType {
    Prefix => "Prefix",
    Exact => "Exact",
    ImplementationSpecific => "ImplementationSpecific",
});

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct HttpRoute {
    pub path: String,
    #[serde(default)]
    pub path_type: PathType,
    pub port: i32,
}
