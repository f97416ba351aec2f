//! Periodic audit loop
//!
//! Every pass lists all managed ingresses and decides, per ingress, whether
//! a renewal cycle is needed: either an ACME challenge path is already
//! present (issuance is stuck mid-flight, likely from a crashed run), or the
//! TLS certificate is within the renewal threshold of expiry. One failing
//! ingress never aborts the rest of the pass.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::networking::v1::Ingress;
use kube::ResourceExt;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::crd::{RenewalPolicy, RenewalPolicySpec, RenewalPolicyStatus};
use crate::renewal::{RenewalOutcome, Renewer};
use crate::secrets::SecretRotator;
use crate::store::ObjectStore;
use crate::{cert, ingress, Error, Result, DEFAULT_POLICY_NAME};

/// Pause between deleting an expiring secret and starting the renewal, so
/// the issuer notices the deletion and opens a fresh order
pub const SECRET_DELETION_SETTLE: Duration = Duration::from_secs(5);

/// Counters from one audit pass
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AuditReport {
    /// Managed ingresses examined
    pub scanned: usize,
    /// Ingresses for which a renewal cycle was attempted
    pub needed_renewal: usize,
    /// Ingresses whose renewal completed
    pub renewed: usize,
}

/// What the audit decided for a single ingress
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuditAction {
    /// Nothing to do
    Healthy,
    /// A renewal cycle ran
    RenewalAttempted {
        /// Whether the cycle completed successfully
        renewed: bool,
    },
}

/// Scans managed ingresses and drives renewals
pub struct AuditScanner {
    store: Arc<dyn ObjectStore>,
    renewer: Renewer,
    rotator: SecretRotator,
    settings: Settings,
}

impl AuditScanner {
    /// Assemble a scanner from its shared parts
    pub fn new(
        store: Arc<dyn ObjectStore>,
        renewer: Renewer,
        rotator: SecretRotator,
        settings: Settings,
    ) -> Self {
        Self {
            store,
            renewer,
            rotator,
            settings,
        }
    }

    /// Run audit passes until shutdown
    ///
    /// The first pass runs immediately; later passes follow the configured
    /// interval. A failed pass is logged and retried at the next tick.
    pub async fn run(&self, shutdown: CancellationToken) {
        let period = Duration::from_secs(u64::from(self.settings.renewal_check_interval) * 60);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval_mins = self.settings.renewal_check_interval,
            "Audit loop started"
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Audit loop stopped");
                    return;
                }
                _ = ticker.tick() => {
                    match self.run_pass(&shutdown).await {
                        Ok(report) => info!(
                            scanned = report.scanned,
                            needed_renewal = report.needed_renewal,
                            renewed = report.renewed,
                            "Audit pass complete"
                        ),
                        Err(e) => warn!(error = %e, "Audit pass failed"),
                    }
                }
            }
        }
    }

    /// Audit every managed ingress once
    ///
    /// A failed list aborts the pass; a failed audit of one ingress is
    /// logged and the pass continues.
    pub async fn run_pass(&self, shutdown: &CancellationToken) -> Result<AuditReport> {
        let ingresses = self.store.list_enabled_ingresses().await?;

        let mut report = AuditReport::default();
        // Per-namespace (attempted, renewed), recorded in policy status
        let mut by_namespace: BTreeMap<String, (u32, u32)> = BTreeMap::new();

        for ing in &ingresses {
            if shutdown.is_cancelled() {
                break;
            }
            report.scanned += 1;
            let namespace = ing.namespace().unwrap_or_default();

            match self.audit_ingress(ing, shutdown).await {
                Ok(AuditAction::Healthy) => {
                    by_namespace.entry(namespace).or_default();
                }
                Ok(AuditAction::RenewalAttempted { renewed }) => {
                    report.needed_renewal += 1;
                    let counts = by_namespace.entry(namespace).or_default();
                    counts.0 += 1;
                    if renewed {
                        report.renewed += 1;
                        counts.1 += 1;
                    }
                }
                Err(e) => {
                    warn!(ingress = %ingress::ingress_key(ing), error = %e, "Audit of ingress failed");
                }
            }
        }

        // Status updates are best-effort bookkeeping
        let now = Utc::now().to_rfc3339();
        for (namespace, (attempted, renewed)) in &by_namespace {
            let status = RenewalPolicyStatus {
                last_audit_time: Some(now.clone()),
                ingresses_needing_renewal: Some(*attempted),
                ingresses_renewed: Some(*renewed),
            };
            if let Err(e) = self.store.update_policy_status(namespace, &status).await {
                warn!(namespace = %namespace, error = %e, "Failed to update policy status");
            }
        }

        Ok(report)
    }

    /// Decide and execute what one ingress needs
    ///
    /// Also the entry point for watch-driven audits of a single ingress.
    pub async fn audit_ingress(
        &self,
        ing: &Ingress,
        shutdown: &CancellationToken,
    ) -> Result<AuditAction> {
        let namespace = ing.namespace().unwrap_or_default();
        let key = ingress::ingress_key(ing);

        let policy = self.policy_for(&namespace).await?;
        let timeout = Duration::from_secs(u64::from(policy.spec.annotation_removal_delay));

        // A challenge path on a force-HTTPS ingress means issuance is stuck
        if ingress::has_acme_challenge(ing) {
            info!(ingress = %key, "Found in-flight ACME challenge, running renewal");
            let renewed = self.renew_with_rotation(ing, timeout, shutdown).await?;
            return Ok(AuditAction::RenewalAttempted { renewed });
        }

        // Deleting secrets to force reissuance requires explicit permission
        if !self.settings.admin_user_permission {
            return Ok(AuditAction::Healthy);
        }
        let Some(secret_name) = ingress::first_tls_secret(ing) else {
            return Ok(AuditAction::Healthy);
        };
        let secret = match self.store.get_secret(&namespace, secret_name).await {
            Ok(secret) => secret,
            Err(e) if e.is_not_found() => {
                // No certificate yet, nothing to expire
                debug!(ingress = %key, secret = %secret_name, "TLS secret absent, skipping");
                return Ok(AuditAction::Healthy);
            }
            Err(e) => return Err(e),
        };

        let remaining = cert::remaining_validity(&secret)?;
        let threshold =
            chrono::Duration::days(i64::from(policy.spec.certificate_renewal_threshold));
        if remaining > threshold {
            return Ok(AuditAction::Healthy);
        }

        info!(
            ingress = %key,
            secret = %secret_name,
            days_left = remaining.num_days(),
            "Certificate within renewal threshold, deleting secret to force reissuance"
        );
        self.store.delete_secret(&namespace, secret_name).await?;
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = tokio::time::sleep(SECRET_DELETION_SETTLE) => {}
        }

        let renewed = self.renew_with_rotation(ing, timeout, shutdown).await?;
        Ok(AuditAction::RenewalAttempted { renewed })
    }

    /// Fetch the namespace's policy, creating the default one on first touch
    ///
    /// A fetched policy that fails validation (users can edit the record) is
    /// rejected as a data error rather than driving renewals with a zero
    /// window.
    async fn policy_for(&self, namespace: &str) -> Result<RenewalPolicy> {
        if let Some(policy) = self.store.get_policy(namespace).await? {
            policy.spec.validate().map_err(|e| {
                Error::data(format!(
                    "renewal policy {}/{} is invalid: {}",
                    namespace, DEFAULT_POLICY_NAME, e
                ))
            })?;
            return Ok(policy);
        }

        let spec = RenewalPolicySpec::with_defaults(
            namespace,
            self.settings.certificate_renewal_threshold,
            self.settings.annotation_removal_delay,
            self.settings.renewal_check_interval,
        );
        let mut policy = RenewalPolicy::new(DEFAULT_POLICY_NAME, spec);
        policy.metadata.namespace = Some(namespace.to_string());

        info!(namespace = %namespace, "Creating default renewal policy");
        self.store.create_policy(&policy).await?;
        Ok(policy)
    }

    /// One renewal cycle, with a single rotate-and-retry on timeout
    ///
    /// A timed-out wait usually means the issuer is stuck on a cached order;
    /// rotating the TLS secret name forces a fresh one. Contention means
    /// another worker owns the ingress and this caller backs off.
    async fn renew_with_rotation(
        &self,
        ing: &Ingress,
        timeout: Duration,
        shutdown: &CancellationToken,
    ) -> Result<bool> {
        let namespace = ing.namespace().unwrap_or_default();
        let name = ing.name_any();
        let key = ingress::ingress_key(ing);

        match self.renewer.renew(&namespace, &name, timeout, shutdown).await? {
            RenewalOutcome::Renewed { .. } => return Ok(true),
            RenewalOutcome::Contended => return Ok(false),
            RenewalOutcome::TimedOut => {}
        }

        // The TLS block may have changed during the wait, refetch before
        // deciding what to rotate
        let current = self.store.get_ingress(&namespace, &name).await?;
        let Some(secret_name) = ingress::first_tls_secret(&current) else {
            warn!(ingress = %key, "Renewal timed out and the ingress has no TLS secret to rotate");
            return Ok(false);
        };
        let new_name = self.rotator.rotate(&namespace, &name, secret_name).await?;
        info!(ingress = %key, secret = %new_name, "Rotated secret after timed-out renewal, retrying once");

        match self.renewer.renew(&namespace, &name, timeout, shutdown).await? {
            RenewalOutcome::Renewed { .. } => Ok(true),
            RenewalOutcome::TimedOut | RenewalOutcome::Contended => {
                warn!(
                    ingress = %key,
                    "Renewal still failing after secret rotation, operator attention needed"
                );
                Ok(false)
            }
        }
    }
}
