//! Ingress inspection helpers
//!
//! Small pure functions over `networking.k8s.io/v1` Ingress objects: identity
//! keys, enablement checks, ACME challenge detection, TLS secret lookup, and
//! the change fingerprint the watch dispatcher uses to ignore no-op updates.

use std::collections::BTreeMap;

use k8s_openapi::api::networking::v1::Ingress;
use kube::ResourceExt;

use crate::{ACME_CHALLENGE_PATH, ENABLED_LABEL};

/// Canonical `namespace/name` identity for an ingress
///
/// This string keys the lock table and the dispatcher's fingerprint cache.
pub fn ingress_key(ingress: &Ingress) -> String {
    format!(
        "{}/{}",
        ingress.namespace().unwrap_or_default(),
        ingress.name_any()
    )
}

/// Whether the ingress opts in to certgate management
///
/// The enablement label must be present with a truthy value. Listing uses
/// a label-existence selector, so falsy values ("false", "no", "") are
/// filtered here.
pub fn is_enabled(ingress: &Ingress) -> bool {
    ingress
        .labels()
        .get(ENABLED_LABEL)
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
        .unwrap_or(false)
}

/// Whether any routing rule of the ingress serves an ACME HTTP-01 challenge
pub fn has_acme_challenge(ingress: &Ingress) -> bool {
    let Some(spec) = &ingress.spec else {
        return false;
    };
    spec.rules.iter().flatten().any(|rule| {
        rule.http.iter().any(|http| {
            http.paths
                .iter()
                .any(|p| p.path.as_deref().is_some_and(|path| path.contains(ACME_CHALLENGE_PATH)))
        })
    })
}

/// First TLS secret name referenced by the ingress, if any
pub fn first_tls_secret(ingress: &Ingress) -> Option<&str> {
    ingress
        .spec
        .as_ref()?
        .tls
        .iter()
        .flatten()
        .find_map(|tls| tls.secret_name.as_deref())
}

/// The parts of an ingress that matter for renewal decisions
///
/// Watch events fire for every write to an ingress, including status churn
/// from the ingress controller. The dispatcher compares fingerprints between
/// events and only reacts when one of these fields actually changed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IngressFingerprint {
    rule_paths: Vec<String>,
    tls_secrets: Vec<String>,
    enabled: Option<String>,
    annotations: BTreeMap<String, String>,
}

/// Compute the renewal-relevant fingerprint of an ingress
pub fn fingerprint(ingress: &Ingress) -> IngressFingerprint {
    let rule_paths = ingress
        .spec
        .iter()
        .flat_map(|spec| spec.rules.iter().flatten())
        .flat_map(|rule| rule.http.iter())
        .flat_map(|http| http.paths.iter())
        .filter_map(|p| p.path.clone())
        .collect();

    let tls_secrets = ingress
        .spec
        .iter()
        .flat_map(|spec| spec.tls.iter().flatten())
        .filter_map(|tls| tls.secret_name.clone())
        .collect();

    IngressFingerprint {
        rule_paths,
        tls_secrets,
        enabled: ingress.labels().get(ENABLED_LABEL).cloned(),
        annotations: ingress
            .annotations()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::BTreeMap;

    use k8s_openapi::api::networking::v1::{
        HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
        IngressServiceBackend, IngressSpec, IngressTLS, ServiceBackendPort,
    };
    use kube::api::ObjectMeta;

    use crate::{BACKEND_PROTOCOL_ANNOTATION, BACKEND_PROTOCOL_HTTPS, ENABLED_LABEL};

    /// Builder for test ingresses
    pub struct IngressBuilder {
        namespace: String,
        name: String,
        labels: BTreeMap<String, String>,
        annotations: BTreeMap<String, String>,
        paths: Vec<String>,
        tls_secrets: Vec<String>,
        resource_version: Option<String>,
    }

    impl IngressBuilder {
        pub fn new(namespace: &str, name: &str) -> Self {
            Self {
                namespace: namespace.to_string(),
                name: name.to_string(),
                labels: BTreeMap::new(),
                annotations: BTreeMap::new(),
                paths: Vec::new(),
                tls_secrets: Vec::new(),
                resource_version: None,
            }
        }

        pub fn enabled(mut self) -> Self {
            self.labels
                .insert(ENABLED_LABEL.to_string(), "true".to_string());
            self
        }

        pub fn label(mut self, key: &str, value: &str) -> Self {
            self.labels.insert(key.to_string(), value.to_string());
            self
        }

        pub fn https_annotation(mut self) -> Self {
            self.annotations.insert(
                BACKEND_PROTOCOL_ANNOTATION.to_string(),
                BACKEND_PROTOCOL_HTTPS.to_string(),
            );
            self
        }

        pub fn path(mut self, path: &str) -> Self {
            self.paths.push(path.to_string());
            self
        }

        pub fn tls_secret(mut self, name: &str) -> Self {
            self.tls_secrets.push(name.to_string());
            self
        }

        pub fn resource_version(mut self, rv: &str) -> Self {
            self.resource_version = Some(rv.to_string());
            self
        }

        pub fn build(self) -> Ingress {
            let paths = self
                .paths
                .iter()
                .map(|p| HTTPIngressPath {
                    path: Some(p.clone()),
                    path_type: "Prefix".to_string(),
                    backend: IngressBackend {
                        service: Some(IngressServiceBackend {
                            name: "backend".to_string(),
                            port: Some(ServiceBackendPort {
                                number: Some(8080),
                                ..Default::default()
                            }),
                        }),
                        ..Default::default()
                    },
                })
                .collect::<Vec<_>>();

            let rules = if paths.is_empty() {
                None
            } else {
                Some(vec![IngressRule {
                    host: Some("example.com".to_string()),
                    http: Some(HTTPIngressRuleValue { paths }),
                }])
            };

            let tls = if self.tls_secrets.is_empty() {
                None
            } else {
                Some(
                    self.tls_secrets
                        .iter()
                        .map(|s| IngressTLS {
                            hosts: Some(vec!["example.com".to_string()]),
                            secret_name: Some(s.clone()),
                        })
                        .collect(),
                )
            };

            Ingress {
                metadata: ObjectMeta {
                    namespace: Some(self.namespace),
                    name: Some(self.name),
                    labels: Some(self.labels),
                    annotations: Some(self.annotations),
                    resource_version: self.resource_version,
                    ..Default::default()
                },
                spec: Some(IngressSpec {
                    rules,
                    tls,
                    ..Default::default()
                }),
                status: None,
            }
        }
    }
}
