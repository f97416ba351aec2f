//! RenewalPolicy Custom Resource Definition
//!
//! A RenewalPolicy carries the per-namespace tunables for certificate
//! renewal: how close to expiry a certificate may get before renewal,
//! how long the force-HTTPS annotation stays removed, and how often the
//! namespace is audited. The audit loop lazily creates one record named
//! `default` per namespace the first time it touches an ingress there.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Specification for a RenewalPolicy
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "certgate.dev",
    version = "v1alpha1",
    kind = "RenewalPolicy",
    plural = "renewalpolicies",
    shortname = "rp",
    status = "RenewalPolicyStatus",
    namespaced,
    printcolumn = r#"{"name":"Threshold","type":"integer","jsonPath":".spec.certificateRenewalThreshold"}"#,
    printcolumn = r#"{"name":"LastAudit","type":"string","jsonPath":".status.lastAuditTime"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RenewalPolicySpec {
    /// Namespace whose ingresses this policy governs
    pub target_namespace: String,

    /// Renew when a certificate has this many days of validity left
    pub certificate_renewal_threshold: u32,

    /// Seconds the force-HTTPS annotation stays removed while waiting for
    /// an HTTP-01 challenge to complete
    pub annotation_removal_delay: u32,

    /// Minutes between audit passes over the namespace
    pub renewal_check_interval: u32,
}

impl RenewalPolicySpec {
    /// Build a policy spec from the process-level defaults
    pub fn with_defaults(namespace: &str, threshold: u32, delay: u32, interval: u32) -> Self {
        Self {
            target_namespace: namespace.to_string(),
            certificate_renewal_threshold: threshold,
            annotation_removal_delay: delay,
            renewal_check_interval: interval,
        }
    }

    /// Validate the policy specification
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.target_namespace.is_empty() {
            return Err(crate::Error::config("targetNamespace must not be empty"));
        }
        if self.certificate_renewal_threshold == 0 {
            return Err(crate::Error::config(
                "certificateRenewalThreshold must be at least 1 day",
            ));
        }
        if self.annotation_removal_delay == 0 {
            return Err(crate::Error::config(
                "annotationRemovalDelay must be at least 1 second",
            ));
        }
        if self.renewal_check_interval == 0 {
            return Err(crate::Error::config(
                "renewalCheckInterval must be at least 1 minute",
            ));
        }
        Ok(())
    }
}

/// Status for a RenewalPolicy
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RenewalPolicyStatus {
    /// RFC 3339 timestamp of the last completed audit pass
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_audit_time: Option<String>,

    /// Ingresses found needing renewal in the last pass
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingresses_needing_renewal: Option<u32>,

    /// Ingresses successfully renewed in the last pass
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingresses_renewed: Option<u32>,
}
