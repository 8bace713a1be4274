use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ContainerStatus, Pod};

/// Restarts after which a crash loop is considered permanent
const CRASH_LOOP_LIMIT: i32 = 5;

/// All desired replicas are updated and ready
pub fn deployment_ready(deployment: &Deployment) -> bool {
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.replicas)
        .unwrap_or(1);
    let Some(status) = deployment.status.as_ref() else {
        return false;
    };
    status.ready_replicas.unwrap_or(0) == desired && status.updated_replicas.unwrap_or(0) == desired
}

fn container_fatal_condition(status: &ContainerStatus) -> Option<String> {
    let waiting = status.state.as_ref()?.waiting.as_ref()?;
    let reason = waiting.reason.as_deref().unwrap_or_default();
    let message = waiting.message.as_deref().unwrap_or_default();

    match reason {
        "ImagePullBackOff" | "ErrImagePull" => {
            let lower = message.to_lowercase();
            if ["401", "unauthorized", "403", "forbidden"]
                .iter()
                .any(|needle| lower.contains(needle))
            {
                Some(format!(
                    "image pull failed due to missing registry credentials: {message} - ensure enclii-registry-credentials secret exists in namespace"
                ))
            } else if lower.contains("not found") || lower.contains("manifest unknown") {
                Some(format!(
                    "image not found: {message} - verify the image exists and tag is correct"
                ))
            } else if status.restart_count > 0 || reason.contains("BackOff") {
                Some(format!(
                    "image pull failed: {message} - check registry credentials and image availability"
                ))
            } else {
                None
            }
        }
        "InvalidImageName" => Some(format!("invalid image name: {message}")),
        "CreateContainerConfigError" if message.contains("secret") => Some(format!(
            "container config error - missing secret: {message}"
        )),
        "CreateContainerConfigError" => Some(format!("container config error: {message}")),
        "CrashLoopBackOff" if status.restart_count >= CRASH_LOOP_LIMIT => Some(format!(
            "container in CrashLoopBackOff after {} restarts - check application logs",
            status.restart_count
        )),
        _ => None,
    }
}

/// A container condition on `pod` that will not heal on its own
pub fn fatal_pod_condition(pod: &Pod) -> Option<String> {
    pod.status
        .as_ref()?
        .container_statuses
        .as_ref()?
        .iter()
        .find_map(container_fatal_condition)
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::apps::v1::{DeploymentSpec, DeploymentStatus};
    use k8s_openapi::api::core::v1::{ContainerState, ContainerStateWaiting, PodStatus};
    use rstest::rstest;

    use super::*;

    fn waiting_pod(reason: &str, message: &str, restarts: i32) -> Pod {
        Pod {
            status: Some(PodStatus {
                container_statuses: Some(vec![ContainerStatus {
                    name: "api".into(),
                    restart_count: restarts,
                    state: Some(ContainerState {
                        waiting: Some(ContainerStateWaiting {
                            reason: Some(reason.into()),
                            message: Some(message.into()),
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[rstest]
    #[case("ErrImagePull", "401 Unauthorized", 0, Some("missing registry credentials"))]
    #[case("ImagePullBackOff", "manifest unknown", 0, Some("image not found"))]
    #[case("ImagePullBackOff", "timeout", 0, Some("image pull failed"))]
    #[case("ErrImagePull", "timeout", 0, None)]
    #[case("ErrImagePull", "timeout", 2, Some("image pull failed"))]
    #[case("InvalidImageName", "bad ref", 0, Some("invalid image name"))]
    #[case("CreateContainerConfigError", "secret \"api-secrets\" not found", 0, Some("missing secret"))]
    #[case("CreateContainerConfigError", "configmap missing", 0, Some("container config error"))]
    #[case("CrashLoopBackOff", "", 4, None)]
    #[case("CrashLoopBackOff", "", 5, Some("CrashLoopBackOff after 5 restarts"))]
    #[case("ContainerCreating", "", 0, None)]
    fn classifies_pod_conditions(
        #[case] reason: &str,
        #[case] message: &str,
        #[case] restarts: i32,
        #[case] expected: Option<&str>,
    ) {
        let found = fatal_pod_condition(&waiting_pod(reason, message, restarts));
        match expected {
            Some(fragment) => assert!(
                found.as_deref().is_some_and(|f| f.contains(fragment)),
                "{found:?} should contain {fragment}"
            ),
            None => assert_eq!(found, None),
        }
    }

    #[test]
    fn pod_without_status_is_not_fatal() {
        assert_eq!(fatal_pod_condition(&Pod::default()), None);
    }

    fn deployment(desired: i32, ready: i32, updated: i32) -> Deployment {
        Deployment {
            spec: Some(DeploymentSpec {
                replicas: Some(desired),
                ..Default::default()
            }),
            status: Some(DeploymentStatus {
                ready_replicas: Some(ready),
                updated_replicas: Some(updated),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn readiness_needs_ready_and_updated() {
        assert!(deployment_ready(&deployment(2, 2, 2)));
        assert!(!deployment_ready(&deployment(2, 2, 1)));
        assert!(!deployment_ready(&deployment(2, 1, 2)));
        assert!(!deployment_ready(&Deployment::default()));
    }
}
