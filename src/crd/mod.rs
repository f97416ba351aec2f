//! Custom Resource Definitions for certgate
//!
//! This module contains all CRD definitions used by the certgate operator.

mod policy;

pub use policy::{RenewalPolicy, RenewalPolicySpec, RenewalPolicyStatus};
