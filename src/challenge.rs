//! Challenge-path observation
//!
//! While the force-HTTPS annotation is removed, the certificate issuer adds
//! an `/.well-known/acme-challenge/...` routing rule to the ingress, serves
//! the token, and removes the rule once the order completes. The observer
//! answers a single question: did the challenge path disappear within the
//! allotted window?
//!
//! Timing out is a normal outcome here, not an error. The caller decides
//! what to do with a stuck challenge (typically rotate the secret name and
//! retry).

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::store::{IngressEvent, ObjectStore};
use crate::{ingress, Error, Result};

/// How often the polling strategy refetches the ingress
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Result of waiting for a challenge path to clear
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The challenge path disappeared after this long
    Cleared(Duration),
    /// The window (or the process lifetime) ended with the path still present
    TimedOut,
}

/// How the observer learns about ingress changes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObserveStrategy {
    /// Refetch the ingress on a fixed interval
    Poll,
    /// Follow a watch stream of ingress updates
    Watch,
}

/// Waits for ACME challenge paths to vanish from an ingress
pub struct ChallengeObserver {
    store: Arc<dyn ObjectStore>,
    strategy: ObserveStrategy,
    poll_interval: Duration,
}

impl ChallengeObserver {
    /// Create an observer with the default poll interval
    pub fn new(store: Arc<dyn ObjectStore>, strategy: ObserveStrategy) -> Self {
        Self {
            store,
            strategy,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Wait until the ingress has no challenge path, the window elapses, or
    /// shutdown is requested
    ///
    /// Shutdown is reported as [`WaitOutcome::TimedOut`] so the caller's
    /// restoration logic runs the same way it would for a stuck challenge.
    pub async fn wait_for_absence(
        &self,
        namespace: &str,
        name: &str,
        timeout: Duration,
        shutdown: &CancellationToken,
    ) -> Result<WaitOutcome> {
        match self.strategy {
            ObserveStrategy::Poll => self.poll(namespace, name, timeout, shutdown).await,
            ObserveStrategy::Watch => self.watch(namespace, name, timeout, shutdown).await,
        }
    }

    async fn poll(
        &self,
        namespace: &str,
        name: &str,
        timeout: Duration,
        shutdown: &CancellationToken,
    ) -> Result<WaitOutcome> {
        let started = Instant::now();
        let deadline = started + timeout;

        loop {
            let ing = self.store.get_ingress(namespace, name).await?;
            if !ingress::has_acme_challenge(&ing) {
                return Ok(WaitOutcome::Cleared(started.elapsed()));
            }

            let next = Instant::now() + self.poll_interval;
            if next >= deadline {
                debug!(ingress = %format!("{}/{}", namespace, name), "Challenge wait window elapsed");
                return Ok(WaitOutcome::TimedOut);
            }
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(WaitOutcome::TimedOut),
                _ = tokio::time::sleep_until(next) => {}
            }
        }
    }

    async fn watch(
        &self,
        namespace: &str,
        name: &str,
        timeout: Duration,
        shutdown: &CancellationToken,
    ) -> Result<WaitOutcome> {
        let started = Instant::now();
        let mut stream = self.store.watch_ingress(namespace, name);
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(WaitOutcome::TimedOut),
                _ = &mut deadline => return Ok(WaitOutcome::TimedOut),
                event = stream.next() => match event {
                    Some(Ok(IngressEvent::Modified(ing))) => {
                        if !ingress::has_acme_challenge(&ing) {
                            return Ok(WaitOutcome::Cleared(started.elapsed()));
                        }
                    }
                    Some(Ok(IngressEvent::Deleted(_))) => {
                        return Err(Error::not_found(format!(
                            "ingress {}/{} deleted while waiting for challenge",
                            namespace, name
                        )));
                    }
                    Some(Err(e)) => return Err(e),
                    None => {
                        return Err(Error::watch(format!(
                            "watch stream for ingress {}/{} ended",
                            namespace, name
                        )));
                    }
                },
            }
        }
    }
}
