use k8s_openapi::api::networking::v1::{
    IPBlock, NetworkPolicy, NetworkPolicyEgressRule, NetworkPolicyIngressRule, NetworkPolicyPeer,
    NetworkPolicyPort, NetworkPolicySpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use super::{label_selector, namespace_selector, object_meta, resource_labels};
use crate::types::{ResolvedAddonBinding, Service};

/// Namespaces that front public traffic into the cluster
const EDGE_NAMESPACES: [&str; 2] = ["ingress-nginx", "cloudflare-tunnel"];
/// Shared data tier with postgres and redis
const DATA_NAMESPACE: &str = "data";

pub fn ingress_policy_name(service_name: &str) -> String {
    format!("{service_name}-ingress")
}

pub fn egress_policy_name(service_name: &str) -> String {
    format!("{service_name}-egress")
}

fn tcp(port: i32) -> NetworkPolicyPort {
    NetworkPolicyPort {
        protocol: Some("TCP".into()),
        port: Some(IntOrString::Int(port)),
        end_port: None,
    }
}

fn namespace_peer(namespace: &str) -> NetworkPolicyPeer {
    NetworkPolicyPeer {
        namespace_selector: Some(namespace_selector(namespace)),
        ..Default::default()
    }
}

/// Accepts traffic on the container port from the edge and from the service's own namespace
pub fn ingress_policy(service: &Service, namespace: &str, container_port: i32) -> NetworkPolicy {
    let mut from: Vec<_> = EDGE_NAMESPACES.iter().map(|ns| namespace_peer(ns)).collect();
    from.push(namespace_peer(namespace));

    NetworkPolicy {
        metadata: object_meta(
            ingress_policy_name(&service.name),
            namespace,
            resource_labels(service),
        ),
        spec: Some(NetworkPolicySpec {
            pod_selector: label_selector(&service.name),
            policy_types: Some(vec!["Ingress".into()]),
            ingress: Some(vec![NetworkPolicyIngressRule {
                from: Some(from),
                ports: Some(vec![tcp(container_port)]),
            }]),
            ..Default::default()
        }),
    }
}

fn allow_dns() -> NetworkPolicyEgressRule {
    NetworkPolicyEgressRule {
        to: Some(vec![NetworkPolicyPeer {
            pod_selector: Some(LabelSelector {
                match_labels: Some([("k8s-app".to_string(), "kube-dns".to_string())].into()),
                ..Default::default()
            }),
            namespace_selector: Some(namespace_selector("kube-system")),
            ..Default::default()
        }]),
        ports: Some(vec![
            NetworkPolicyPort {
                protocol: Some("UDP".into()),
                port: Some(IntOrString::Int(53)),
                end_port: None,
            },
            tcp(53),
        ]),
    }
}

/// DNS, the API server, bound addons, the data tier and the own namespace
pub fn egress_policy(
    service: &Service,
    namespace: &str,
    bindings: &[ResolvedAddonBinding],
) -> NetworkPolicy {
    let mut egress = vec![
        allow_dns(),
        // in-cluster API server
        NetworkPolicyEgressRule {
            to: Some(vec![NetworkPolicyPeer {
                ip_block: Some(IPBlock {
                    cidr: "10.0.0.0/8".into(),
                    except: None,
                }),
                ..Default::default()
            }]),
            ports: Some(vec![tcp(443), tcp(6443)]),
        },
        // single-node clusters expose the API server on the node's external address
        NetworkPolicyEgressRule {
            to: None,
            ports: Some(vec![tcp(6443)]),
        },
    ];

    egress.extend(bindings.iter().map(|binding| NetworkPolicyEgressRule {
        to: Some(vec![namespace_peer(&binding.k8s_namespace)]),
        ports: Some(vec![tcp(binding.addon_type.default_port())]),
    }));

    egress.push(NetworkPolicyEgressRule {
        to: Some(vec![namespace_peer(DATA_NAMESPACE)]),
        ports: Some(vec![tcp(5432), tcp(6379)]),
    });
    egress.push(NetworkPolicyEgressRule {
        to: Some(vec![namespace_peer(namespace)]),
        ports: None,
    });

    NetworkPolicy {
        metadata: object_meta(
            egress_policy_name(&service.name),
            namespace,
            resource_labels(service),
        ),
        spec: Some(NetworkPolicySpec {
            pod_selector: label_selector(&service.name),
            policy_types: Some(vec!["Egress".into()]),
            egress: Some(egress),
            ..Default::default()
        }),
    }
}

/// First ingress port of a policy, if any
pub fn ingress_port(policy: &NetworkPolicy) -> Option<i32> {
    policy
        .spec
        .as_ref()?
        .ingress
        .as_ref()?
        .iter()
        .flat_map(|rule| rule.ports.iter().flatten())
        .find_map(|port| match port.port {
            Some(IntOrString::Int(p)) => Some(p),
            _ => None,
        })
}
