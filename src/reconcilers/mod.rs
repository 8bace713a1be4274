use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};

use crate::types::Service;

pub mod addon_env;
pub mod ingress;
pub mod network_policies;
pub mod port;
pub mod quantity;
pub mod readiness;
pub mod service;
pub mod storage;
pub mod workload;

pub use service::{ReconcileRequest, ReconcileResult, ServiceReconciler};

/// Ownership label every resource this engine writes carries
pub const MANAGED_BY_LABEL: &str = "enclii.dev/managed-by";
pub const MANAGED_BY: &str = "switchyard";

/// Opt-out annotation; reconciliation and drift sync leave the workload alone
pub const RECONCILE_ANNOTATION: &str = "enclii.dev/reconcile";
pub const RECONCILE_DISABLED: &str = "disabled";

/// Pull secret for the platform registry, copied into every service namespace
pub const REGISTRY_SECRET: &str = "enclii-registry-credentials";
/// Namespace holding the platform's own resources
pub const PLATFORM_NAMESPACE: &str = "enclii";

/// Labels shared by every resource generated for `service`
pub fn resource_labels(service: &Service) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".into(), service.name.clone()),
        ("enclii.dev/service".into(), service.name.clone()),
        ("enclii.dev/project".into(), service.project_id.to_string()),
        (MANAGED_BY_LABEL.into(), MANAGED_BY.into()),
    ])
}

pub fn selector_labels(service_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".into(), service_name.into()),
        ("enclii.dev/service".into(), service_name.into()),
    ])
}

pub fn label_selector(service_name: &str) -> LabelSelector {
    LabelSelector {
        match_labels: Some(selector_labels(service_name)),
        match_expressions: None,
    }
}

/// Selects a whole namespace by its immutable name label
pub fn namespace_selector(namespace: &str) -> LabelSelector {
    LabelSelector {
        match_labels: Some(BTreeMap::from([(
            "kubernetes.io/metadata.name".to_string(),
            namespace.to_string(),
        )])),
        match_expressions: None,
    }
}

pub fn object_meta(
    name: impl Into<String>,
    namespace: &str,
    labels: BTreeMap<String, String>,
) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.into()),
        namespace: Some(namespace.into()),
        labels: Some(labels),
        ..Default::default()
    }
}

/// Whether an orchestrator object was created by this engine
pub fn is_managed(meta: &ObjectMeta) -> bool {
    meta.labels
        .as_ref()
        .and_then(|labels| labels.get(MANAGED_BY_LABEL))
        .is_some_and(|value| value == MANAGED_BY)
}

/// Whether an operator opted the object out of reconciliation
pub fn reconcile_disabled(meta: &ObjectMeta) -> bool {
    meta.annotations
        .as_ref()
        .and_then(|annotations| annotations.get(RECONCILE_ANNOTATION))
        .is_some_and(|value| value == RECONCILE_DISABLED)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(labels: &[(&str, &str)], annotations: &[(&str, &str)]) -> ObjectMeta {
        let map = |pairs: &[(&str, &str)]| {
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>()
        };
        ObjectMeta {
            name: Some("api".into()),
            labels: Some(map(labels)),
            annotations: Some(map(annotations)),
            ..Default::default()
        }
    }

    #[test]
    fn ownership_requires_exact_label() {
        assert!(is_managed(&meta(&[(MANAGED_BY_LABEL, "switchyard")], &[])));
        assert!(!is_managed(&meta(&[(MANAGED_BY_LABEL, "helm")], &[])));
        assert!(!is_managed(&meta(&[("app", "api")], &[])));
        assert!(!is_managed(&ObjectMeta::default()));
    }

    #[test]
    fn opt_out_annotation() {
        assert!(reconcile_disabled(&meta(
            &[],
            &[(RECONCILE_ANNOTATION, "disabled")]
        )));
        assert!(!reconcile_disabled(&meta(
            &[],
            &[(RECONCILE_ANNOTATION, "enabled")]
        )));
        assert!(!reconcile_disabled(&ObjectMeta::default()));
    }
}
