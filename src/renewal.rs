//! The renewal state machine
//!
//! A renewal cycle is three steps on one ingress:
//!
//! 1. remove the force-HTTPS annotation so the issuer can serve HTTP-01
//!    challenge tokens in the clear,
//! 2. wait for the challenge path to vanish from the routing rules,
//! 3. restore the annotation.
//!
//! Steps 1 and 3 each run under the ingress lock but the lock is NOT held
//! across the wait, so the dispatcher and audit loop can observe the ingress
//! while issuance is in flight. Step 1 uses a non-blocking acquire (a held
//! lock means another renewal owns the ingress); step 3 uses a blocking
//! acquire because restoration may never be skipped - a timed-out or failed
//! wait still restores.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::challenge::{ChallengeObserver, WaitOutcome};
use crate::lock::LockTable;
use crate::metrics::Metrics;
use crate::store::ObjectStore;
use crate::{Result, BACKEND_PROTOCOL_ANNOTATION, BACKEND_PROTOCOL_HTTPS};

/// How a renewal attempt ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RenewalOutcome {
    /// The challenge cleared and the annotation was restored
    Renewed {
        /// Full cycle duration, removal through restoration
        elapsed: Duration,
    },
    /// The wait window elapsed; the annotation was restored anyway
    TimedOut,
    /// Another worker already holds this ingress, nothing was done
    Contended,
}

/// Drives renewal cycles on individual ingresses
pub struct Renewer {
    store: Arc<dyn ObjectStore>,
    locks: Arc<LockTable>,
    observer: ChallengeObserver,
    metrics: Metrics,
}

impl Renewer {
    /// Assemble a renewer from its shared parts
    pub fn new(
        store: Arc<dyn ObjectStore>,
        locks: Arc<LockTable>,
        observer: ChallengeObserver,
        metrics: Metrics,
    ) -> Self {
        Self {
            store,
            locks,
            observer,
            metrics,
        }
    }

    /// Run one renewal cycle on the ingress
    ///
    /// `timeout` bounds the challenge wait, not the whole cycle. Errors from
    /// the wait or the restore are propagated after restoration has been
    /// attempted.
    pub async fn renew(
        &self,
        namespace: &str,
        name: &str,
        timeout: Duration,
        shutdown: &CancellationToken,
    ) -> Result<RenewalOutcome> {
        let key = format!("{}/{}", namespace, name);
        let started = Instant::now();

        if !self.locks.try_lock(&key) {
            self.metrics.contention_skips_total.inc();
            debug!(ingress = %key, "Ingress locked by another renewal, skipping");
            return Ok(RenewalOutcome::Contended);
        }
        let removal = self.set_backend_protocol(namespace, name, None).await;
        self.locks.unlock(&key);
        removal?;

        info!(ingress = %key, "Removed force-HTTPS annotation, waiting for challenge to clear");
        let wait = self
            .observer
            .wait_for_absence(namespace, name, timeout, shutdown)
            .await;

        // Restoration is mandatory regardless of how the wait ended
        self.locks.lock(&key).await;
        let restore = self
            .set_backend_protocol(namespace, name, Some(BACKEND_PROTOCOL_HTTPS))
            .await;
        self.locks.unlock(&key);
        if let Err(e) = &restore {
            error!(ingress = %key, error = %e, "Failed to restore force-HTTPS annotation");
        }

        let outcome = wait?;
        restore?;

        match outcome {
            WaitOutcome::Cleared(_) => {
                let elapsed = started.elapsed();
                self.metrics.renewals_total.inc();
                self.metrics
                    .renewal_cycle_seconds
                    .observe(elapsed.as_secs_f64());
                info!(ingress = %key, elapsed_secs = elapsed.as_secs(), "Certificate renewed");
                Ok(RenewalOutcome::Renewed { elapsed })
            }
            WaitOutcome::TimedOut => {
                warn!(ingress = %key, "Challenge did not clear within the window");
                Ok(RenewalOutcome::TimedOut)
            }
        }
    }

    /// Set or remove the force-HTTPS annotation on the ingress
    async fn set_backend_protocol(
        &self,
        namespace: &str,
        name: &str,
        value: Option<&str>,
    ) -> Result<()> {
        let mut ing = self.store.get_ingress(namespace, name).await?;
        let annotations = ing.metadata.annotations.get_or_insert_with(Default::default);
        match value {
            Some(v) => {
                annotations.insert(BACKEND_PROTOCOL_ANNOTATION.to_string(), v.to_string());
            }
            None => {
                annotations.remove(BACKEND_PROTOCOL_ANNOTATION);
            }
        }
        self.store.update_ingress(&ing).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;
    use crate::challenge::ObserveStrategy;
    use crate::ingress::test_support::IngressBuilder;
    use crate::store::MockObjectStore;
    use crate::Error;

    fn with_challenge() -> k8s_openapi::api::networking::v1::Ingress {
        IngressBuilder::new("shop", "web")
            .enabled()
            .https_annotation()
            .path("/")
            .path("/.well-known/acme-challenge/token")
            .build()
    }

    fn without_challenge() -> k8s_openapi::api::networking::v1::Ingress {
        IngressBuilder::new("shop", "web")
            .enabled()
            .https_annotation()
            .path("/")
            .build()
    }

    fn annotation_of(ing: &k8s_openapi::api::networking::v1::Ingress) -> Option<String> {
        ing.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(BACKEND_PROTOCOL_ANNOTATION))
            .cloned()
    }

    fn renewer(store: MockObjectStore, metrics: Metrics) -> (Renewer, Arc<LockTable>) {
        let store: Arc<dyn ObjectStore> = Arc::new(store);
        let locks = Arc::new(LockTable::new());
        let observer = ChallengeObserver::new(Arc::clone(&store), ObserveStrategy::Poll);
        (
            Renewer::new(store, Arc::clone(&locks), observer, metrics),
            locks,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn successful_cycle_removes_waits_and_restores() {
        let mut store = MockObjectStore::new();

        // Calls: removal fetch, one observer poll (challenge gone), restore fetch
        let gets = AtomicUsize::new(0);
        store.expect_get_ingress().returning(move |_, _| {
            Ok(match gets.fetch_add(1, Ordering::SeqCst) {
                0 => with_challenge(),
                _ => without_challenge(),
            })
        });

        let updates: Arc<Mutex<Vec<Option<String>>>> = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&updates);
        store.expect_update_ingress().returning(move |ing| {
            captured.lock().unwrap().push(annotation_of(ing));
            Ok(())
        });

        let metrics = Metrics::for_tests();
        let (renewer, locks) = renewer(store, metrics.clone());
        let shutdown = CancellationToken::new();

        let outcome = renewer
            .renew("shop", "web", Duration::from_secs(10), &shutdown)
            .await
            .unwrap();
        assert!(matches!(outcome, RenewalOutcome::Renewed { .. }));

        // Annotation removed, then restored to HTTPS
        let log = updates.lock().unwrap().clone();
        assert_eq!(
            log,
            vec![None, Some(BACKEND_PROTOCOL_HTTPS.to_string())]
        );

        assert_eq!(metrics.renewals_total.get(), 1);
        assert!(!locks.is_locked("shop/web"));
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_cycle_still_restores_the_annotation() {
        let mut store = MockObjectStore::new();
        // Challenge never clears
        store
            .expect_get_ingress()
            .returning(|_, _| Ok(with_challenge()));

        let updates: Arc<Mutex<Vec<Option<String>>>> = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&updates);
        store.expect_update_ingress().returning(move |ing| {
            captured.lock().unwrap().push(annotation_of(ing));
            Ok(())
        });

        let metrics = Metrics::for_tests();
        let (renewer, locks) = renewer(store, metrics.clone());
        let shutdown = CancellationToken::new();

        let outcome = renewer
            .renew("shop", "web", Duration::from_secs(3), &shutdown)
            .await
            .unwrap();
        assert_eq!(outcome, RenewalOutcome::TimedOut);

        let log = updates.lock().unwrap().clone();
        assert_eq!(
            log,
            vec![None, Some(BACKEND_PROTOCOL_HTTPS.to_string())]
        );

        // A timed-out cycle is not a renewal
        assert_eq!(metrics.renewals_total.get(), 0);
        assert!(!locks.is_locked("shop/web"));
    }

    #[tokio::test(start_paused = true)]
    async fn contended_ingress_is_left_untouched() {
        let mut store = MockObjectStore::new();
        store.expect_get_ingress().never();
        store.expect_update_ingress().never();

        let metrics = Metrics::for_tests();
        let (renewer, locks) = renewer(store, metrics.clone());
        assert!(locks.try_lock("shop/web"));

        let shutdown = CancellationToken::new();
        let outcome = renewer
            .renew("shop", "web", Duration::from_secs(3), &shutdown)
            .await
            .unwrap();
        assert_eq!(outcome, RenewalOutcome::Contended);
        assert_eq!(metrics.contention_skips_total.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_restore_is_surfaced_after_being_attempted() {
        let mut store = MockObjectStore::new();
        let gets = AtomicUsize::new(0);
        store.expect_get_ingress().returning(move |_, _| {
            Ok(match gets.fetch_add(1, Ordering::SeqCst) {
                0 => with_challenge(),
                _ => without_challenge(),
            })
        });

        let updates = AtomicUsize::new(0);
        store.expect_update_ingress().returning(move |_| {
            if updates.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(()) // removal succeeds
            } else {
                Err(Error::not_found("ingress shop/web")) // restore fails
            }
        });

        let (renewer, locks) = renewer(store, Metrics::for_tests());
        let shutdown = CancellationToken::new();

        let err = renewer
            .renew("shop", "web", Duration::from_secs(10), &shutdown)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(!locks.is_locked("shop/web"));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_mid_wait_restores_before_returning() {
        let mut store = MockObjectStore::new();
        store
            .expect_get_ingress()
            .returning(|_, _| Ok(with_challenge()));

        let updates: Arc<Mutex<Vec<Option<String>>>> = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&updates);
        store.expect_update_ingress().returning(move |ing| {
            captured.lock().unwrap().push(annotation_of(ing));
            Ok(())
        });

        let (renewer, _) = renewer(store, Metrics::for_tests());
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let outcome = renewer
            .renew("shop", "web", Duration::from_secs(600), &shutdown)
            .await
            .unwrap();
        assert_eq!(outcome, RenewalOutcome::TimedOut);

        let log = updates.lock().unwrap().clone();
        assert_eq!(
            log,
            vec![None, Some(BACKEND_PROTOCOL_HTTPS.to_string())]
        );
    }
}
