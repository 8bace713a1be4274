use std::collections::BTreeMap;

use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, IngressTLS, ServiceBackendPort,
};

use super::{object_meta, resource_labels};
use crate::types::{CustomDomain, HttpRoute, PathType, Service};

const INGRESS_CLASS: &str = "nginx";
const DEFAULT_ISSUER: &str = "letsencrypt-prod";

/// Secret-name-safe form of a domain
pub fn sanitize_domain(domain: &str) -> String {
    domain.replace('.', "-")
}

pub fn tls_secret_name(service_name: &str, domain: &str) -> String {
    format!("{service_name}-{}-tls", sanitize_domain(domain))
}

fn path(service_name: &str, path: &str, path_type: PathType, port: i32) -> HTTPIngressPath {
    HTTPIngressPath {
        path: Some(path.into()),
        path_type: path_type.as_str().into(),
        backend: IngressBackend {
            service: Some(IngressServiceBackend {
                name: service_name.into(),
                port: Some(ServiceBackendPort {
                    number: Some(port),
                    name: None,
                }),
            }),
            resource: None,
        },
    }
}

/// Routes every custom domain to the service, with TLS where enabled.
///
/// Returns `None` when the service has no custom domains.
pub fn build_ingress(
    service: &Service,
    namespace: &str,
    domains: &[CustomDomain],
    routes: &[HttpRoute],
) -> Option<Ingress> {
    let first = domains.first()?;

    let paths: Vec<HTTPIngressPath> = if routes.is_empty() {
        vec![path(&service.name, "/", PathType::Prefix, 80)]
    } else {
        routes
            .iter()
            .map(|route| path(&service.name, &route.path, route.path_type, route.port))
            .collect()
    };

    let rules = domains
        .iter()
        .map(|domain| IngressRule {
            host: Some(domain.domain.clone()),
            http: Some(HTTPIngressRuleValue {
                paths: paths.clone(),
            }),
        })
        .collect();

    let tls: Vec<IngressTLS> = domains
        .iter()
        .filter(|domain| domain.tls_enabled)
        .map(|domain| IngressTLS {
            hosts: Some(vec![domain.domain.clone()]),
            secret_name: Some(tls_secret_name(&service.name, &domain.domain)),
        })
        .collect();

    let issuer = first
        .tls_issuer
        .as_deref()
        .filter(|issuer| !issuer.is_empty())
        .unwrap_or(DEFAULT_ISSUER);

    let mut metadata = object_meta(service.name.clone(), namespace, resource_labels(service));
    metadata.annotations = Some(BTreeMap::from([
        ("kubernetes.io/ingress.class".to_string(), INGRESS_CLASS.to_string()),
        ("cert-manager.io/cluster-issuer".to_string(), issuer.to_string()),
        (
            "nginx.ingress.kubernetes.io/ssl-redirect".to_string(),
            "true".to_string(),
        ),
        (
            "nginx.ingress.kubernetes.io/force-ssl-redirect".to_string(),
            "true".to_string(),
        ),
    ]));

    Some(Ingress {
        metadata,
        spec: Some(IngressSpec {
            ingress_class_name: Some(INGRESS_CLASS.into()),
            rules: Some(rules),
            tls: (!tls.is_empty()).then_some(tls),
            ..Default::default()
        }),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use assert_json_diff::assert_json_include;
    use serde_json::json;

    use super::*;
    use crate::reconcilers::service::tests::request;

    fn domain(name: &str, tls: bool, issuer: Option<&str>) -> CustomDomain {
        CustomDomain {
            domain: name.into(),
            tls_enabled: tls,
            tls_issuer: issuer.map(str::to_string),
        }
    }

    #[test]
    fn no_domains_no_ingress() {
        assert!(build_ingress(&request().service, "shop-prod", &[], &[]).is_none());
    }

    #[test]
    fn default_route_and_tls() {
        let service = request().service;
        let ingress = build_ingress(
            &service,
            "shop-prod",
            &[
                domain("shop.example.com", true, Some("letsencrypt-staging")),
                domain("www.shop.example.com", false, None),
            ],
            &[],
        )
        .unwrap();

        assert_json_include!(
            actual: serde_json::to_value(&ingress).unwrap(),
            expected: json!({
                "metadata": {
                    "name": "api",
                    "annotations": {
                        "kubernetes.io/ingress.class": "nginx",
                        "cert-manager.io/cluster-issuer": "letsencrypt-staging",
                        "nginx.ingress.kubernetes.io/force-ssl-redirect": "true"
                    }
                },
                "spec": {
                    "ingressClassName": "nginx",
                    "rules": [
                        {"host": "shop.example.com", "http": {"paths": [{
                            "path": "/",
                            "pathType": "Prefix",
                            "backend": {"service": {"name": "api", "port": {"number": 80}}}
                        }]}},
                        {"host": "www.shop.example.com"}
                    ],
                    "tls": [{"hosts": ["shop.example.com"], "secretName": "api-shop-example-com-tls"}]
                }
            })
        );
        assert_eq!(ingress.spec.unwrap().tls.unwrap().len(), 1);
    }

    #[test]
    fn routes_replace_default_path() {
        let service = request().service;
        let routes = [
            HttpRoute {
                path: "/api".into(),
                path_type: PathType::Prefix,
                port: 80,
            },
            HttpRoute {
                path: "/healthz".into(),
                path_type: PathType::Exact,
                port: 8081,
            },
        ];
        let ingress = build_ingress(
            &service,
            "shop-prod",
            &[domain("shop.example.com", false, None)],
            &routes,
        )
        .unwrap();
        let spec = ingress.spec.unwrap();
        let rules = spec.rules.unwrap();
        let paths = &rules[0].http.as_ref().unwrap().paths;
        assert_eq!(paths.len(), 2);
        assert_eq!(paths[1].path_type, "Exact");
        assert!(spec.tls.is_none());
        assert_eq!(
            ingress.metadata.annotations.unwrap()["cert-manager.io/cluster-issuer"],
            "letsencrypt-prod"
        );
    }
}
