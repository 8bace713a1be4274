use k8s_openapi::api::core::v1::{EnvVar, EnvVarSource, SecretKeySelector};

use crate::types::{AddonType, ResolvedAddonBinding};

/// Secret key holding the connection URI in operator-managed secrets
const URI_KEY: &str = "uri";

fn secret_ref(name: String, env_var_name: &str) -> EnvVar {
    EnvVar {
        name: env_var_name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name,
                key: URI_KEY.into(),
                optional: None,
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Connection-string variables for every bound addon.
///
/// Postgres and MySQL read the URI from the operator's connection secret;
/// Redis has no credentials and gets a literal in-cluster URL.
pub fn addon_env_vars(bindings: &[ResolvedAddonBinding]) -> Vec<EnvVar> {
    bindings
        .iter()
        .map(|binding| match binding.addon_type {
            AddonType::Postgres => secret_ref(
                binding
                    .connection_secret
                    .clone()
                    .unwrap_or_else(|| format!("{}-app", binding.k8s_resource_name)),
                &binding.env_var_name,
            ),
            AddonType::Mysql => secret_ref(
                binding
                    .connection_secret
                    .clone()
                    .unwrap_or_else(|| format!("{}-credentials", binding.k8s_resource_name)),
                &binding.env_var_name,
            ),
            AddonType::Redis => EnvVar {
                name: binding.env_var_name.clone(),
                value: Some(format!(
                    "redis://{}.{}.svc.cluster.local:{}/0",
                    binding.k8s_resource_name,
                    binding.k8s_namespace,
                    AddonType::Redis.default_port()
                )),
                value_from: None,
            },
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(addon_type: AddonType, secret: Option<&str>) -> ResolvedAddonBinding {
        ResolvedAddonBinding {
            env_var_name: "DATABASE_URL".into(),
            addon_type,
            k8s_namespace: "addons".into(),
            k8s_resource_name: "shop-db".into(),
            connection_secret: secret.map(str::to_string),
        }
    }

    fn secret_name(var: &EnvVar) -> Option<&str> {
        var.value_from
            .as_ref()
            .and_then(|source| source.secret_key_ref.as_ref())
            .map(|selector| selector.name.as_str())
    }

    #[test]
    fn postgres_defaults_to_cnpg_app_secret() {
        let vars = addon_env_vars(&[
            binding(AddonType::Postgres, None),
            binding(AddonType::Postgres, Some("custom")),
        ]);
        assert_eq!(secret_name(&vars[0]), Some("shop-db-app"));
        assert_eq!(secret_name(&vars[1]), Some("custom"));
        assert_eq!(
            vars[0]
                .value_from
                .as_ref()
                .and_then(|s| s.secret_key_ref.as_ref())
                .map(|s| s.key.as_str()),
            Some("uri")
        );
    }

    #[test]
    fn mysql_defaults_to_credentials_secret() {
        let vars = addon_env_vars(&[binding(AddonType::Mysql, None)]);
        assert_eq!(secret_name(&vars[0]), Some("shop-db-credentials"));
    }

    #[test]
    fn redis_is_a_literal_url() {
        let vars = addon_env_vars(&[binding(AddonType::Redis, Some("ignored"))]);
        assert_eq!(
            vars[0].value.as_deref(),
            Some("redis://shop-db.addons.svc.cluster.local:6379/0")
        );
        assert!(vars[0].value_from.is_none());
    }
}
