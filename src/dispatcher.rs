//! Watch-driven acceleration of the audit loop
//!
//! The periodic audit catches everything eventually, but a challenge that
//! appears right after a pass would otherwise sit stuck until the next one.
//! The dispatcher follows a watch stream over managed ingresses and audits
//! an ingress immediately when a renewal-relevant field changes and a
//! challenge path is present.
//!
//! Kubernetes watch streams fire on every write, including status churn, so
//! events are deduplicated against a fingerprint of the fields that matter.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::StreamExt;
use k8s_openapi::api::networking::v1::Ingress;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ingress::{self, IngressFingerprint};
use crate::scanner::AuditScanner;
use crate::store::{IngressEvent, ObjectStore};

/// Pause before reopening a watch stream that ended or failed
pub const WATCH_REOPEN_BACKOFF: Duration = Duration::from_secs(5);

/// Follows ingress changes and triggers targeted audits
pub struct EventDispatcher {
    store: Arc<dyn ObjectStore>,
    scanner: Arc<AuditScanner>,
    seen: DashMap<String, IngressFingerprint>,
}

impl EventDispatcher {
    /// Create a dispatcher feeding the given scanner
    pub fn new(store: Arc<dyn ObjectStore>, scanner: Arc<AuditScanner>) -> Self {
        Self {
            store,
            scanner,
            seen: DashMap::new(),
        }
    }

    /// Follow the ingress watch until shutdown, reopening the stream when it
    /// ends
    pub async fn run(&self, shutdown: CancellationToken) {
        loop {
            let mut stream = self.store.watch_enabled_ingresses();
            info!("Ingress watch opened");

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("Ingress watch stopped");
                        return;
                    }
                    event = stream.next() => match event {
                        Some(Ok(IngressEvent::Modified(ing))) => {
                            self.handle_update(&ing, &shutdown).await;
                        }
                        Some(Ok(IngressEvent::Deleted(ing))) => self.forget(&ing),
                        Some(Err(e)) => warn!(error = %e, "Ingress watch error"),
                        None => {
                            warn!("Ingress watch stream ended, reopening");
                            break;
                        }
                    }
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(WATCH_REOPEN_BACKOFF) => {}
            }
        }
    }

    /// React to a created or updated ingress
    pub async fn handle_update(&self, ing: &Ingress, shutdown: &CancellationToken) {
        let key = ingress::ingress_key(ing);

        // The label may have been flipped off since the watch was opened
        if !ingress::is_enabled(ing) {
            self.seen.remove(&key);
            return;
        }

        let fp = ingress::fingerprint(ing);
        let changed = match self.seen.insert(key.clone(), fp.clone()) {
            None => true,
            Some(previous) => previous != fp,
        };
        if !changed {
            return;
        }
        if !ingress::has_acme_challenge(ing) {
            debug!(ingress = %key, "Ingress changed without a challenge, leaving it to the audit loop");
            return;
        }

        info!(ingress = %key, "Challenge appeared on watched ingress, auditing now");
        if let Err(e) = self.scanner.audit_ingress(ing, shutdown).await {
            warn!(ingress = %key, error = %e, "Watch-triggered audit failed");
        }
    }

    /// Drop dedup state for a deleted ingress
    fn forget(&self, ing: &Ingress) {
        self.seen.remove(&ingress::ingress_key(ing));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::stream;

    use super::*;
    use crate::challenge::{ChallengeObserver, ObserveStrategy};
    use crate::config::Settings;
    use crate::crd::{RenewalPolicy, RenewalPolicySpec};
    use crate::ingress::test_support::IngressBuilder;
    use crate::lock::LockTable;
    use crate::metrics::Metrics;
    use crate::renewal::Renewer;
    use crate::secrets::SecretRotator;
    use crate::store::MockObjectStore;
    use crate::DEFAULT_POLICY_NAME;

    fn policy(namespace: &str) -> RenewalPolicy {
        let mut policy = RenewalPolicy::new(
            DEFAULT_POLICY_NAME,
            RenewalPolicySpec::with_defaults(namespace, 30, 2, 60),
        );
        policy.metadata.namespace = Some(namespace.to_string());
        policy
    }

    fn dispatcher(store: MockObjectStore) -> EventDispatcher {
        let store: Arc<dyn ObjectStore> = Arc::new(store);
        let locks = Arc::new(LockTable::new());
        let observer = ChallengeObserver::new(Arc::clone(&store), ObserveStrategy::Poll);
        let renewer = Renewer::new(
            Arc::clone(&store),
            Arc::clone(&locks),
            observer,
            Metrics::for_tests(),
        );
        let rotator = SecretRotator::new(Arc::clone(&store), locks);
        let scanner = Arc::new(AuditScanner::new(
            Arc::clone(&store),
            renewer,
            rotator,
            Settings::default(),
        ));
        EventDispatcher::new(store, scanner)
    }

    fn challenged_ingress() -> Ingress {
        IngressBuilder::new("shop", "web")
            .enabled()
            .https_annotation()
            .path("/")
            .path("/.well-known/acme-challenge/token")
            .tls_secret("tls-cert")
            .build()
    }

    fn healthy_ingress() -> Ingress {
        IngressBuilder::new("shop", "web")
            .enabled()
            .https_annotation()
            .path("/")
            .tls_secret("tls-cert")
            .build()
    }

    /// Shared expectation: one renewal cycle that clears on the first poll
    fn expect_one_renewal(store: &mut MockObjectStore) -> Arc<AtomicUsize> {
        store.expect_get_policy().returning(|ns| Ok(Some(policy(ns))));
        let gets = AtomicUsize::new(0);
        store.expect_get_ingress().returning(move |_, _| {
            Ok(match gets.fetch_add(1, Ordering::SeqCst) {
                0 => challenged_ingress(),
                _ => healthy_ingress(),
            })
        });
        let updates = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&updates);
        store.expect_update_ingress().returning(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        updates
    }

    #[tokio::test(start_paused = true)]
    async fn a_new_challenge_triggers_an_immediate_audit() {
        let mut store = MockObjectStore::new();
        let updates = expect_one_renewal(&mut store);

        let dispatcher = dispatcher(store);
        let shutdown = CancellationToken::new();
        dispatcher
            .handle_update(&challenged_ingress(), &shutdown)
            .await;

        // One remove and one restore of the annotation
        assert_eq!(updates.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn an_unchanged_ingress_is_audited_only_once() {
        let mut store = MockObjectStore::new();
        let updates = expect_one_renewal(&mut store);

        let dispatcher = dispatcher(store);
        let shutdown = CancellationToken::new();
        dispatcher
            .handle_update(&challenged_ingress(), &shutdown)
            .await;
        dispatcher
            .handle_update(&challenged_ingress(), &shutdown)
            .await;

        assert_eq!(updates.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn a_change_without_a_challenge_is_ignored() {
        let mut store = MockObjectStore::new();
        store.expect_get_policy().never();
        store.expect_get_ingress().never();
        store.expect_update_ingress().never();

        let dispatcher = dispatcher(store);
        let shutdown = CancellationToken::new();
        dispatcher.handle_update(&healthy_ingress(), &shutdown).await;
    }

    #[tokio::test(start_paused = true)]
    async fn a_disabled_ingress_is_dropped_from_dedup_state() {
        let mut store = MockObjectStore::new();
        store.expect_get_policy().never();

        let dispatcher = dispatcher(store);
        let shutdown = CancellationToken::new();

        let disabled = IngressBuilder::new("shop", "web")
            .label(crate::ENABLED_LABEL, "false")
            .path("/.well-known/acme-challenge/token")
            .build();
        dispatcher.handle_update(&disabled, &shutdown).await;
        assert!(dispatcher.seen.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn deletion_clears_dedup_state_so_a_recreation_is_audited() {
        let mut store = MockObjectStore::new();
        let updates = expect_one_renewal(&mut store);

        let dispatcher = dispatcher(store);
        let shutdown = CancellationToken::new();
        dispatcher
            .handle_update(&challenged_ingress(), &shutdown)
            .await;
        assert_eq!(updates.load(Ordering::SeqCst), 2);

        dispatcher.forget(&challenged_ingress());
        assert!(dispatcher.seen.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn run_consumes_the_watch_until_shutdown() {
        let mut store = MockObjectStore::new();
        store.expect_watch_enabled_ingresses().returning(|| {
            stream::iter(vec![Ok(IngressEvent::Modified(healthy_ingress()))])
                .chain(stream::pending())
                .boxed()
        });
        // The healthy update is fingerprinted but not audited
        store.expect_get_policy().never();

        let dispatcher = Arc::new(dispatcher(store));
        let shutdown = CancellationToken::new();

        let handle = {
            let dispatcher = Arc::clone(&dispatcher);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { dispatcher.run(shutdown).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
        handle.await.unwrap();

        assert_eq!(dispatcher.seen.len(), 1);
    }
}
