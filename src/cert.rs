//! Certificate expiry parsing from TLS secret data
//!
//! The audit loop decides whether a certificate is close enough to expiry to
//! renew by reading the leaf certificate out of the ingress TLS secret.
//! Secrets written by issuers carry PEM in `tls.crt`; raw DER is accepted
//! too since nothing in the Secret API enforces an encoding.

use chrono::Utc;
use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

use crate::{Error, Result};

/// Key under which a TLS secret stores its certificate chain
pub const TLS_CERT_KEY: &str = "tls.crt";

/// Remaining validity of the certificate stored in `secret`
///
/// Negative durations mean the certificate is already expired. Errors are
/// [`Error::Data`]: missing `tls.crt`, undecodable PEM, or malformed DER.
pub fn remaining_validity(secret: &Secret) -> Result<chrono::Duration> {
    let id = format!(
        "{}/{}",
        secret.namespace().unwrap_or_default(),
        secret.name_any()
    );

    let bytes = secret
        .data
        .as_ref()
        .and_then(|data| data.get(TLS_CERT_KEY))
        .map(|b| b.0.as_slice())
        .ok_or_else(|| Error::data(format!("secret {} has no {} entry", id, TLS_CERT_KEY)))?;

    let der = decode_certificate(bytes, &id)?;
    let (_, cert) = X509Certificate::from_der(&der)
        .map_err(|e| Error::data(format!("secret {}: malformed certificate: {}", id, e)))?;

    let not_after = cert.validity().not_after.timestamp();
    Ok(chrono::Duration::seconds(not_after - Utc::now().timestamp()))
}

/// Extract DER bytes from PEM-or-DER certificate data
fn decode_certificate(bytes: &[u8], id: &str) -> Result<Vec<u8>> {
    // PEM banner anywhere in the data (issuers sometimes prepend comments)
    let looks_pem = bytes
        .windows(b"-----BEGIN".len())
        .any(|w| w == b"-----BEGIN");
    if !looks_pem {
        return Ok(bytes.to_vec());
    }

    let block = pem::parse(bytes)
        .map_err(|e| Error::data(format!("secret {}: invalid PEM: {}", id, e)))?;
    if block.tag() != "CERTIFICATE" {
        return Err(Error::data(format!(
            "secret {}: expected CERTIFICATE PEM block, found {}",
            id,
            block.tag()
        )));
    }
    Ok(block.contents().to_vec())
}
