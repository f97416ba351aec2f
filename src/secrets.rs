//! TLS secret-name versioning and rotation
//!
//! When a renewal attempt times out, the issuer may be stuck on a cached
//! order for the old secret. Rotating the secret name referenced by the
//! ingress TLS block (`cert` -> `cert-v1` -> `cert-v2` ...) forces a fresh
//! order, after which the renewal is retried once.

use std::sync::Arc;

use tracing::info;

use crate::lock::LockTable;
use crate::store::ObjectStore;
use crate::{Error, Result};

/// Compute the next versioned name for a TLS secret
///
/// A trailing `-v<digits>` suffix is incremented; any other name (including
/// a malformed suffix like `-vX` or an overflowing version) gets `-v1`
/// appended and is treated as unversioned.
pub fn next_secret_name(name: &str) -> String {
    if let Some((stem, suffix)) = name.rsplit_once("-v") {
        if !stem.is_empty() && !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(version) = suffix.parse::<u64>() {
                return format!("{}-v{}", stem, version + 1);
            }
        }
    }
    format!("{}-v1", name)
}

/// Rewrites ingress TLS blocks to point at freshly versioned secret names
pub struct SecretRotator {
    store: Arc<dyn ObjectStore>,
    locks: Arc<LockTable>,
}

impl SecretRotator {
    /// Create a rotator sharing the renewal lock table
    pub fn new(store: Arc<dyn ObjectStore>, locks: Arc<LockTable>) -> Self {
        Self { store, locks }
    }

    /// Point the ingress TLS entries at the next version of `current` and
    /// return the new secret name
    ///
    /// The rewrite happens under the ingress lock. Held lock means a renewal
    /// is mid-flight on this ingress, which is surfaced as contention rather
    /// than waited out.
    pub async fn rotate(&self, namespace: &str, name: &str, current: &str) -> Result<String> {
        let key = format!("{}/{}", namespace, name);
        let next = next_secret_name(current);

        if !self.locks.try_lock(&key) {
            return Err(Error::contention(format!(
                "ingress {} is locked, skipping secret rotation",
                key
            )));
        }

        let result = self.rotate_locked(namespace, name, current, &next).await;
        self.locks.unlock(&key);
        result?;

        info!(
            ingress = %key,
            old_secret = %current,
            new_secret = %next,
            "Rotated TLS secret name"
        );
        Ok(next)
    }

    async fn rotate_locked(
        &self,
        namespace: &str,
        name: &str,
        current: &str,
        next: &str,
    ) -> Result<()> {
        // Refetch under the lock so we rewrite the latest version
        let mut ing = self.store.get_ingress(namespace, name).await?;

        let mut rewritten = false;
        if let Some(spec) = ing.spec.as_mut() {
            for tls in spec.tls.iter_mut().flatten() {
                if tls.secret_name.as_deref() == Some(current) {
                    tls.secret_name = Some(next.to_string());
                    rewritten = true;
                }
            }
        }
        if !rewritten {
            return Err(Error::not_found(format!(
                "ingress {}/{} has no TLS entry named {}",
                namespace, name, current
            )));
        }

        self.store.update_ingress(&ing).await
    }
}
