//! Workload, cluster service and env secret generation for a service.

use std::collections::BTreeMap;

use chrono::Utc;
use k8s_openapi::api::apps::v1::{
    Deployment, DeploymentSpec, DeploymentStrategy, RollingUpdateDeployment,
};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, ContainerPort, EnvVar, EnvVarSource, HTTPGetAction,
    LocalObjectReference, PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec, Probe,
    ResourceRequirements, Secret, SecretKeySelector, Service, ServicePort, ServiceSpec, Volume,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use super::addon_env::addon_env_vars;
use super::quantity::parse_quantity;
use super::service::ReconcileRequest;
use super::{label_selector, object_meta, resource_labels, selector_labels, REGISTRY_SECRET};
use crate::types::{HealthCheckConfig, ResourceConfig};
use crate::Result;

/// Env var that, when set, mounts the platform kubeconfig into the container
pub const KUBECONFIG_VAR: &str = "ENCLII_KUBE_CONFIG";
const KUBECONFIG_VOLUME: &str = "kubeconfig-cm";
const KUBECONFIG_CONFIG_MAP: &str = "switchyard-kubeconfig";
const KUBECONFIG_MOUNT_PATH: &str = "/etc/kubeconfig";

pub fn secret_name(service_name: &str) -> String {
    format!("{service_name}-secrets")
}

/// PVC backing a declared volume
pub fn pvc_name(service_name: &str, volume_name: &str) -> String {
    format!("{service_name}-{volume_name}")
}

fn workload_labels(req: &ReconcileRequest) -> BTreeMap<String, String> {
    let mut labels = resource_labels(&req.service);
    labels.extend([
        ("version".to_string(), req.release.version.clone()),
        ("enclii.dev/release".to_string(), req.release.id.to_string()),
        (
            "enclii.dev/deployment".to_string(),
            req.deployment.id.to_string(),
        ),
    ]);
    labels
}

/// Opaque secret holding every secret-flagged variable, if there are any
pub fn env_secret(req: &ReconcileRequest, namespace: &str) -> Option<Secret> {
    let data: BTreeMap<String, String> = req
        .env_vars
        .iter()
        .filter(|var| var.is_secret)
        .map(|var| (var.key.clone(), var.value.clone()))
        .collect();
    if data.is_empty() {
        return None;
    }

    let mut metadata = object_meta(
        secret_name(&req.service.name),
        namespace,
        resource_labels(&req.service),
    );
    metadata.annotations = Some(BTreeMap::from([
        (
            "enclii.dev/deployment-id".to_string(),
            req.deployment.id.to_string(),
        ),
        ("enclii.dev/updated".to_string(), Utc::now().to_rfc3339()),
    ]));

    Some(Secret {
        metadata,
        type_: Some("Opaque".into()),
        string_data: Some(data),
        ..Default::default()
    })
}

fn container_env(req: &ReconcileRequest, port: i32) -> Vec<EnvVar> {
    let literal = |name: &str, value: String| EnvVar {
        name: name.into(),
        value: Some(value),
        value_from: None,
    };

    let mut env = vec![
        literal("ENCLII_SERVICE_NAME", req.service.name.clone()),
        literal("ENCLII_PROJECT_ID", req.service.project_id.to_string()),
        literal("ENCLII_RELEASE_VERSION", req.release.version.clone()),
        literal("ENCLII_DEPLOYMENT_ID", req.deployment.id.to_string()),
        literal("PORT", port.to_string()),
    ];

    let secret = secret_name(&req.service.name);
    env.extend(req.env_vars.iter().map(|var| {
        if var.is_secret {
            EnvVar {
                name: var.key.clone(),
                value: None,
                value_from: Some(EnvVarSource {
                    secret_key_ref: Some(SecretKeySelector {
                        name: secret.clone(),
                        key: var.key.clone(),
                        optional: None,
                    }),
                    ..Default::default()
                }),
            }
        } else {
            literal(&var.key, var.value.clone())
        }
    }));

    env.extend(addon_env_vars(&req.addon_bindings));
    env
}

/// Requests and limits, validated, with platform defaults for unset values
pub fn resource_requirements(cfg: Option<&ResourceConfig>) -> Result<ResourceRequirements> {
    let pick = |value: Option<&String>, default: &str| -> String {
        value
            .filter(|v| !v.is_empty())
            .cloned()
            .unwrap_or_else(|| default.to_string())
    };
    let cpu_request = pick(cfg.and_then(|c| c.cpu_request.as_ref()), "100m");
    let cpu_limit = pick(cfg.and_then(|c| c.cpu_limit.as_ref()), "500m");
    let memory_request = pick(cfg.and_then(|c| c.memory_request.as_ref()), "128Mi");
    let memory_limit = pick(cfg.and_then(|c| c.memory_limit.as_ref()), "512Mi");

    Ok(ResourceRequirements {
        requests: Some(BTreeMap::from([
            ("cpu".to_string(), parse_quantity("cpu request", &cpu_request)?),
            (
                "memory".to_string(),
                parse_quantity("memory request", &memory_request)?,
            ),
        ])),
        limits: Some(BTreeMap::from([
            ("cpu".to_string(), parse_quantity("cpu limit", &cpu_limit)?),
            (
                "memory".to_string(),
                parse_quantity("memory limit", &memory_limit)?,
            ),
        ])),
        ..Default::default()
    })
}

#[derive(Clone, Copy)]
enum ProbeKind {
    Liveness,
    Readiness,
}

fn http_probe(cfg: Option<&HealthCheckConfig>, container_port: i32, kind: ProbeKind) -> Option<Probe> {
    if cfg.is_some_and(|c| c.disabled) {
        return None;
    }

    // initial delay, timeout, period, failure threshold
    let (delay, timeout, period, failures) = match kind {
        ProbeKind::Liveness => (30, 5, 10, 3),
        ProbeKind::Readiness => (5, 3, 5, 2),
    };
    let positive = |v: Option<i32>, default: i32| v.filter(|v| *v > 0).unwrap_or(default);

    let non_empty = |p: &&String| !p.is_empty();
    let specific_path = cfg
        .and_then(|c| match kind {
            ProbeKind::Liveness => c.liveness_path.as_ref(),
            ProbeKind::Readiness => c.readiness_path.as_ref(),
        })
        .filter(non_empty);
    let path = specific_path
        .or(cfg.and_then(|c| c.path.as_ref()).filter(non_empty))
        .cloned()
        .unwrap_or_else(|| "/health".to_string());

    Some(Probe {
        http_get: Some(HTTPGetAction {
            path: Some(path),
            port: IntOrString::Int(positive(cfg.and_then(|c| c.port), container_port)),
            ..Default::default()
        }),
        initial_delay_seconds: Some(positive(cfg.and_then(|c| c.initial_delay_seconds), delay)),
        timeout_seconds: Some(positive(cfg.and_then(|c| c.timeout_seconds), timeout)),
        period_seconds: Some(positive(cfg.and_then(|c| c.period_seconds), period)),
        failure_threshold: Some(positive(cfg.and_then(|c| c.failure_threshold), failures)),
        ..Default::default()
    })
}

pub fn liveness_probe(cfg: Option<&HealthCheckConfig>, container_port: i32) -> Option<Probe> {
    http_probe(cfg, container_port, ProbeKind::Liveness)
}

pub fn readiness_probe(cfg: Option<&HealthCheckConfig>, container_port: i32) -> Option<Probe> {
    http_probe(cfg, container_port, ProbeKind::Readiness)
}

fn mounts_kubeconfig(req: &ReconcileRequest) -> bool {
    req.env_vars
        .iter()
        .any(|var| var.key == KUBECONFIG_VAR && !var.value.is_empty())
}

fn volume_mounts(req: &ReconcileRequest) -> Vec<VolumeMount> {
    let mut mounts: Vec<VolumeMount> = req
        .service
        .volumes
        .iter()
        .map(|vol| VolumeMount {
            name: vol.name.clone(),
            mount_path: vol.mount_path.clone(),
            ..Default::default()
        })
        .collect();
    if mounts_kubeconfig(req) {
        mounts.push(VolumeMount {
            name: KUBECONFIG_VOLUME.into(),
            mount_path: KUBECONFIG_MOUNT_PATH.into(),
            read_only: Some(true),
            ..Default::default()
        });
    }
    mounts
}

fn pod_volumes(req: &ReconcileRequest) -> Vec<Volume> {
    let mut volumes: Vec<Volume> = req
        .service
        .volumes
        .iter()
        .map(|vol| Volume {
            name: vol.name.clone(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: pvc_name(&req.service.name, &vol.name),
                read_only: None,
            }),
            ..Default::default()
        })
        .collect();
    if mounts_kubeconfig(req) {
        volumes.push(Volume {
            name: KUBECONFIG_VOLUME.into(),
            config_map: Some(ConfigMapVolumeSource {
                name: KUBECONFIG_CONFIG_MAP.into(),
                ..Default::default()
            }),
            ..Default::default()
        });
    }
    volumes
}

/// The service's workload in `namespace`, listening on `port`
pub fn build_deployment(req: &ReconcileRequest, namespace: &str, port: i32) -> Result<Deployment> {
    let name = req.service.name.clone();
    let labels = workload_labels(req);
    let replicas = if req.deployment.replicas > 0 {
        req.deployment.replicas
    } else {
        1
    };

    let mut metadata = object_meta(name.clone(), namespace, labels.clone());
    metadata.annotations = Some(BTreeMap::from([
        ("enclii.dev/git-sha".to_string(), req.release.git_sha.clone()),
        (
            "enclii.dev/deployment-time".to_string(),
            req.deployment.created_at.to_rfc3339(),
        ),
    ]));

    let health_check = req.service.health_check.as_ref();
    let container = Container {
        name: name.clone(),
        image: Some(req.release.image_uri.clone()),
        ports: Some(vec![ContainerPort {
            name: Some("http".into()),
            container_port: port,
            protocol: Some("TCP".into()),
            ..Default::default()
        }]),
        env: Some(container_env(req, port)),
        resources: Some(resource_requirements(req.service.resources.as_ref())?),
        liveness_probe: liveness_probe(health_check, port),
        readiness_probe: readiness_probe(health_check, port),
        volume_mounts: Some(volume_mounts(req)),
        ..Default::default()
    };

    Ok(Deployment {
        metadata,
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            selector: label_selector(&name),
            strategy: Some(DeploymentStrategy {
                type_: Some("RollingUpdate".into()),
                rolling_update: Some(RollingUpdateDeployment {
                    max_unavailable: Some(IntOrString::String("25%".into())),
                    max_surge: Some(IntOrString::String("25%".into())),
                }),
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    annotations: Some(BTreeMap::from([(
                        "enclii.dev/git-sha".to_string(),
                        req.release.git_sha.clone(),
                    )])),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    image_pull_secrets: Some(vec![LocalObjectReference {
                        name: REGISTRY_SECRET.into(),
                    }]),
                    volumes: Some(pod_volumes(req)),
                    restart_policy: Some("Always".into()),
                    termination_grace_period_seconds: Some(30),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Keeps the live workload's selector; it is immutable once created.
///
/// Pod template labels are extended with the selector so they keep matching.
pub fn preserve_selector(desired: &mut Deployment, existing: &Deployment) {
    let Some(existing_selector) = existing.spec.as_ref().map(|s| s.selector.clone()) else {
        return;
    };
    let Some(spec) = desired.spec.as_mut() else {
        return;
    };
    if let Some(match_labels) = &existing_selector.match_labels {
        let template_labels = spec
            .template
            .metadata
            .get_or_insert_with(Default::default)
            .labels
            .get_or_insert_with(Default::default);
        template_labels.extend(match_labels.clone());
    }
    spec.selector = existing_selector;
}

/// Cluster-local endpoint: port 80 to the container port
pub fn build_service(req: &ReconcileRequest, namespace: &str, port: i32) -> Service {
    Service {
        metadata: object_meta(
            req.service.name.clone(),
            namespace,
            workload_labels(req),
        ),
        spec: Some(ServiceSpec {
            selector: Some(selector_labels(&req.service.name)),
            ports: Some(vec![ServicePort {
                name: Some("http".into()),
                port: 80,
                target_port: Some(IntOrString::Int(port)),
                protocol: Some("TCP".into()),
                ..Default::default()
            }]),
            type_: Some("ClusterIP".into()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Keeps the live service's cluster IP and non-empty selector
pub fn preserve_service_fields(desired: &mut Service, existing: &Service) {
    let (Some(spec), Some(live)) = (desired.spec.as_mut(), existing.spec.as_ref()) else {
        return;
    };
    if live.cluster_ip.is_some() {
        spec.cluster_ip = live.cluster_ip.clone();
    }
    if live.selector.as_ref().is_some_and(|s| !s.is_empty()) {
        spec.selector = live.selector.clone();
    }
}

#[cfg(test)]
mod tests {
    use assert_json_diff::assert_json_include;
    use serde_json::json;

    use super::*;
    use crate::reconcilers::service::tests::request;
    use crate::types::{EnvVar as PlatformEnvVar, Volume as PlatformVolume};

    #[test]
    fn deployment_has_platform_defaults() {
        let req = request();
        let deployment = build_deployment(&req, "shop-prod", 4200).unwrap();

        assert_json_include!(
            actual: serde_json::to_value(&deployment).unwrap(),
            expected: json!({
                "metadata": {
                    "name": "api",
                    "namespace": "shop-prod",
                    "labels": {
                        "app": "api",
                        "enclii.dev/managed-by": "switchyard",
                        "version": "v1"
                    }
                },
                "spec": {
                    "replicas": 2,
                    "selector": {"matchLabels": {"app": "api", "enclii.dev/service": "api"}},
                    "strategy": {
                        "type": "RollingUpdate",
                        "rollingUpdate": {"maxSurge": "25%", "maxUnavailable": "25%"}
                    },
                    "template": {"spec": {
                        "imagePullSecrets": [{"name": "enclii-registry-credentials"}],
                        "terminationGracePeriodSeconds": 30,
                        "containers": [{
                            "name": "api",
                            "ports": [{"name": "http", "containerPort": 4200}],
                            "resources": {
                                "requests": {"cpu": "100m", "memory": "128Mi"},
                                "limits": {"cpu": "500m", "memory": "512Mi"}
                            },
                            "livenessProbe": {
                                "httpGet": {"path": "/health", "port": 4200},
                                "initialDelaySeconds": 30,
                                "timeoutSeconds": 5,
                                "periodSeconds": 10,
                                "failureThreshold": 3
                            },
                            "readinessProbe": {
                                "httpGet": {"path": "/health", "port": 4200},
                                "initialDelaySeconds": 5,
                                "timeoutSeconds": 3,
                                "periodSeconds": 5,
                                "failureThreshold": 2
                            }
                        }]
                    }}
                }
            })
        );
    }

    #[test]
    fn secrets_are_referenced_not_inlined() {
        let mut req = request();
        req.env_vars = vec![
            PlatformEnvVar {
                key: "LOG_LEVEL".into(),
                value: "debug".into(),
                is_secret: false,
            },
            PlatformEnvVar {
                key: "API_TOKEN".into(),
                value: "s3cr3t".into(),
                is_secret: true,
            },
        ];

        let deployment = build_deployment(&req, "shop-prod", 4200).unwrap();
        let env = serde_json::to_value(
            &deployment.spec.unwrap().template.spec.unwrap().containers[0].env,
        )
        .unwrap();
        assert!(!env.to_string().contains("s3cr3t"));
        assert_json_include!(
            actual: env,
            expected: json!([
                {"name": "ENCLII_SERVICE_NAME", "value": "api"},
                {}, {}, {},
                {"name": "PORT", "value": "4200"},
                {"name": "LOG_LEVEL", "value": "debug"},
                {"name": "API_TOKEN", "valueFrom": {"secretKeyRef": {"name": "api-secrets", "key": "API_TOKEN"}}}
            ])
        );

        let secret = env_secret(&req, "shop-prod").unwrap();
        assert_eq!(secret.metadata.name.as_deref(), Some("api-secrets"));
        assert_eq!(
            secret.string_data.unwrap(),
            BTreeMap::from([("API_TOKEN".to_string(), "s3cr3t".to_string())])
        );
    }

    #[test]
    fn no_secret_without_secret_vars() {
        assert!(env_secret(&request(), "shop-prod").is_none());
    }

    #[test]
    fn health_check_overrides_and_disable() {
        let cfg = HealthCheckConfig {
            path: Some("/ready".into()),
            liveness_path: Some("/live".into()),
            port: Some(9000),
            timeout_seconds: Some(7),
            ..Default::default()
        };
        let liveness = liveness_probe(Some(&cfg), 4200).unwrap();
        let readiness = readiness_probe(Some(&cfg), 4200).unwrap();
        let get = |p: &Probe| p.http_get.clone().unwrap();

        assert_eq!(get(&liveness).path.as_deref(), Some("/live"));
        assert_eq!(get(&readiness).path.as_deref(), Some("/ready"));
        assert_eq!(get(&readiness).port, IntOrString::Int(9000));
        assert_eq!(liveness.timeout_seconds, Some(7));
        assert_eq!(readiness.period_seconds, Some(5));

        let disabled = HealthCheckConfig {
            disabled: true,
            ..Default::default()
        };
        assert!(liveness_probe(Some(&disabled), 4200).is_none());
        assert!(readiness_probe(Some(&disabled), 4200).is_none());
    }

    #[test]
    fn invalid_resource_config_is_rejected() {
        let cfg = ResourceConfig {
            memory_limit: Some("lots".into()),
            ..Default::default()
        };
        assert!(resource_requirements(Some(&cfg)).is_err());
    }

    #[test]
    fn volumes_and_kubeconfig_are_mounted() {
        let mut req = request();
        req.service.volumes = vec![PlatformVolume {
            name: "data".into(),
            mount_path: "/var/lib/data".into(),
            size: "1Gi".into(),
            storage_class_name: None,
            access_mode: None,
        }];
        req.env_vars = vec![PlatformEnvVar {
            key: KUBECONFIG_VAR.into(),
            value: "/etc/kubeconfig/config".into(),
            is_secret: false,
        }];

        let pod = build_deployment(&req, "shop-prod", 4200)
            .unwrap()
            .spec
            .unwrap()
            .template
            .spec
            .unwrap();
        assert_json_include!(
            actual: serde_json::to_value(&pod).unwrap(),
            expected: json!({
                "volumes": [
                    {"name": "data", "persistentVolumeClaim": {"claimName": "api-data"}},
                    {"name": "kubeconfig-cm", "configMap": {"name": "switchyard-kubeconfig"}}
                ],
                "containers": [{"volumeMounts": [
                    {"name": "data", "mountPath": "/var/lib/data"},
                    {"name": "kubeconfig-cm", "mountPath": "/etc/kubeconfig", "readOnly": true}
                ]}]
            })
        );
    }

    #[test]
    fn live_selector_and_cluster_ip_are_kept() {
        let req = request();
        let mut live = build_deployment(&req, "shop-prod", 4200).unwrap();
        live.spec.as_mut().unwrap().selector.match_labels =
            Some(BTreeMap::from([("legacy".to_string(), "api".to_string())]));

        let mut desired = build_deployment(&req, "shop-prod", 4200).unwrap();
        preserve_selector(&mut desired, &live);
        let spec = desired.spec.unwrap();
        assert_eq!(spec.selector, live.spec.unwrap().selector);
        assert_eq!(
            spec.template.metadata.unwrap().labels.unwrap().get("legacy"),
            Some(&"api".to_string())
        );

        let mut live_svc = build_service(&req, "shop-prod", 4200);
        live_svc.spec.as_mut().unwrap().cluster_ip = Some("10.0.0.12".into());
        let mut desired_svc = build_service(&req, "shop-prod", 4200);
        preserve_service_fields(&mut desired_svc, &live_svc);
        assert_eq!(
            desired_svc.spec.unwrap().cluster_ip.as_deref(),
            Some("10.0.0.12")
        );
    }
}
