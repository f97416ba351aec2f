//! Certgate - Kubernetes operator for ACME HTTP-01 certificate renewal
//!
//! An ACME HTTP-01 challenge needs a temporarily-unencrypted backend so the
//! issuer can serve challenge tokens in the clear. Certgate orchestrates that
//! window: it removes the force-HTTPS annotation from a managed ingress, waits
//! for the challenge path to vanish from the ingress routing rules (the signal
//! that issuance finished), and restores the annotation - while guaranteeing
//! that concurrent attempts never race on the same ingress and that a stuck
//! issuance never leaves the resource permanently unprotected.
//!
//! # Modules
//!
//! - [`crd`] - RenewalPolicy custom resource (per-namespace thresholds/delays)
//! - [`store`] - Object-store trait over the Kubernetes API
//! - [`lock`] - Named per-ingress locking
//! - [`challenge`] - Challenge-path observation (polling and watch strategies)
//! - [`renewal`] - The remove/wait/restore renewal state machine
//! - [`secrets`] - TLS secret-name versioning and rotation
//! - [`scanner`] - Periodic audit loop that drives renewals
//! - [`dispatcher`] - Watch-driven acceleration of the audit loop
//! - [`cert`] - Certificate expiry parsing from secret data
//! - [`config`] - Process-level settings
//! - [`metrics`] - Prometheus counters and histograms
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod cert;
pub mod challenge;
pub mod config;
pub mod crd;
pub mod dispatcher;
pub mod error;
pub mod ingress;
pub mod lock;
pub mod metrics;
pub mod renewal;
pub mod scanner;
pub mod secrets;
pub mod store;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Interoperability Constants
// =============================================================================
// These strings are shared with the ingress controller and the external
// certificate issuer. They must stay byte-for-byte exact and are defined only
// here, never inline at call sites.

/// Label that marks an ingress as managed by certgate
pub const ENABLED_LABEL: &str = "certgate.dev/enabled";

/// Annotation the ingress controller reads to force HTTPS to the backend
///
/// Removed for the duration of an HTTP-01 challenge, restored afterwards.
pub const BACKEND_PROTOCOL_ANNOTATION: &str = "nginx.ingress.kubernetes.io/backend-protocol";

/// Value of the force-HTTPS annotation
pub const BACKEND_PROTOCOL_HTTPS: &str = "HTTPS";

/// Path substring that identifies an in-flight ACME HTTP-01 exchange
pub const ACME_CHALLENGE_PATH: &str = ".well-known/acme-challenge";

/// Name of the lazily-created per-namespace RenewalPolicy record
pub const DEFAULT_POLICY_NAME: &str = "default";

/// Field manager name for server-side apply and status patches
pub const FIELD_MANAGER: &str = "certgate-controller";
