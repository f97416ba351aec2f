//! Process-level settings
//!
//! Settings arrive through CLI flags or environment variables and become the
//! defaults baked into lazily-created RenewalPolicy records. Invalid values
//! fail process startup instead of being silently clamped.

use std::fmt;
use std::str::FromStr;

use crate::Error;

/// Renew when a certificate has fewer than this many days left
pub const DEFAULT_RENEWAL_THRESHOLD_DAYS: u32 = 30;

/// Seconds the force-HTTPS annotation stays removed during a challenge
pub const DEFAULT_ANNOTATION_REMOVAL_DELAY_SECS: u32 = 10;

/// Minutes between audit passes (one day)
pub const DEFAULT_RENEWAL_CHECK_INTERVAL_MINS: u32 = 1440;

/// Deployment mode, controls log verbosity defaults
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunMode {
    /// Local development
    Dev,
    /// Production deployment
    Prod,
}

impl FromStr for RunMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dev" | "development" => Ok(Self::Dev),
            "prod" | "production" => Ok(Self::Prod),
            other => Err(Error::config(format!(
                "unknown run mode '{}', expected dev or prod",
                other
            ))),
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dev => write!(f, "dev"),
            Self::Prod => write!(f, "prod"),
        }
    }
}

/// Validated operator settings
#[derive(Clone, Debug)]
pub struct Settings {
    /// Deployment mode
    pub run_mode: RunMode,
    /// Days-left threshold below which certificates are renewed
    pub certificate_renewal_threshold: u32,
    /// Seconds to wait for a challenge to clear before giving up
    pub annotation_removal_delay: u32,
    /// Whether the operator may delete expiring TLS secrets to force
    /// reissuance
    pub admin_user_permission: bool,
    /// Minutes between audit passes
    pub renewal_check_interval: u32,
    /// Observe challenges via a watch stream instead of polling
    pub challenge_watch: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            run_mode: RunMode::Prod,
            certificate_renewal_threshold: DEFAULT_RENEWAL_THRESHOLD_DAYS,
            annotation_removal_delay: DEFAULT_ANNOTATION_REMOVAL_DELAY_SECS,
            admin_user_permission: false,
            renewal_check_interval: DEFAULT_RENEWAL_CHECK_INTERVAL_MINS,
            challenge_watch: false,
        }
    }
}

impl Settings {
    /// Validate the settings, failing fast on nonsensical values
    pub fn validate(&self) -> Result<(), Error> {
        if self.certificate_renewal_threshold == 0 {
            return Err(Error::config(
                "certificate renewal threshold must be at least 1 day",
            ));
        }
        if self.annotation_removal_delay == 0 {
            return Err(Error::config(
                "annotation removal delay must be at least 1 second",
            ));
        }
        if self.renewal_check_interval == 0 {
            return Err(Error::config(
                "renewal check interval must be at least 1 minute",
            ));
        }
        Ok(())
    }
}
