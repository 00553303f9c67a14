//! PEM parsing and certificate inspection.
//!
//! All trust material is PEM. Parsing goes through `rustls-pki-types`'
//! [`PemObject`] so the same DER types flow straight into rustls configs.

use chrono::{DateTime, Utc};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, CertificateRevocationListDer, PrivateKeyDer};
use sha2::{Digest, Sha256};
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;
use x509_parser::x509::AttributeTypeAndValue;

use crate::{Error, Result};

/// Parse every `CERTIFICATE` block.
///
/// # Errors
///
/// Returns `Error::Store` if a block is malformed or none are present.
pub fn parse_certificates(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let certs = CertificateDer::pem_slice_iter(pem)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Store(format!("malformed certificate PEM: {e}")))?;
    if certs.is_empty() {
        return Err(Error::Store("no certificate found in PEM".into()));
    }
    Ok(certs)
}

/// Parse the first private key block (PKCS#8, SEC1 or PKCS#1).
///
/// # Errors
///
/// Returns `Error::Store` if no key is present.
pub fn parse_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    PrivateKeyDer::from_pem_slice(pem)
        .map_err(|e| Error::Store(format!("no usable private key in PEM: {e}")))
}

/// Parse every `X509 CRL` block; an empty input yields no CRLs.
///
/// # Errors
///
/// Returns `Error::Store` if a block is malformed.
pub fn parse_crls(pem: &[u8]) -> Result<Vec<CertificateRevocationListDer<'static>>> {
    CertificateRevocationListDer::pem_slice_iter(pem)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Store(format!("malformed CRL PEM: {e}")))
}

/// Split PEM text into `(label, block)` pairs. Each block keeps its
/// BEGIN/END lines and ends with a newline; text outside blocks is dropped.
#[must_use]
pub fn blocks(text: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let mut current: Option<(String, String)> = None;
    for line in text.lines() {
        let line = line.trim_end();
        if let Some(label) = line
            .strip_prefix("-----BEGIN ")
            .and_then(|l| l.strip_suffix("-----"))
        {
            current = Some((label.to_string(), format!("{line}\n")));
        } else if let Some((label, mut block)) = current.take() {
            block.push_str(line);
            block.push('\n');
            if line == format!("-----END {label}-----") {
                out.push((label, block));
            } else {
                current = Some((label, block));
            }
        }
    }
    out
}

/// SHA-256 over the DER bytes, lowercase hex
#[must_use]
pub fn fingerprint(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}

/// Metadata read back from a certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertInfo {
    /// Serial number
    pub serial: u64,
    /// Subject common name
    pub common_name: Option<String>,
    /// Start of validity
    pub not_before: DateTime<Utc>,
    /// End of validity
    pub not_after: DateTime<Utc>,
    /// SHA-256 fingerprint
    pub fingerprint: String,
    /// Basic constraints `CA:TRUE`
    pub is_ca: bool,
    /// Raw SubjectPublicKeyInfo key bits
    pub public_key: Vec<u8>,
}

impl CertInfo {
    /// Parse a DER certificate
    ///
    /// # Errors
    ///
    /// Returns `Error::Store` if the certificate cannot be parsed or its
    /// serial does not fit in 64 bits.
    pub fn inspect(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| Error::Store(format!("failed to parse certificate: {e}")))?;

        let serial = serial_to_u64(cert.raw_serial())?;
        let validity = cert.validity();
        let not_before = timestamp(validity.not_before.timestamp())?;
        let not_after = timestamp(validity.not_after.timestamp())?;
        let common_name = first_attribute(cert.subject().iter_common_name());

        Ok(Self {
            serial,
            common_name,
            not_before,
            not_after,
            fingerprint: fingerprint(der),
            is_ca: cert.is_ca(),
            public_key: cert.public_key().subject_public_key.data.to_vec(),
        })
    }

    /// Whether `now` is inside the validity window
    #[must_use]
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.not_before <= now && now < self.not_after
    }

    /// Time left before expiry, zero once expired
    #[must_use]
    pub fn remaining(&self, now: DateTime<Utc>) -> std::time::Duration {
        (self.not_after - now).to_std().unwrap_or_default()
    }
}

/// First string value among subject attributes of one type
pub(crate) fn first_attribute<'a, 'b: 'a>(
    mut values: impl Iterator<Item = &'a AttributeTypeAndValue<'b>>,
) -> Option<String> {
    values
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_owned)
}

fn serial_to_u64(raw: &[u8]) -> Result<u64> {
    let trimmed: Vec<u8> = raw.iter().copied().skip_while(|b| *b == 0).collect();
    if trimmed.len() > 8 {
        return Err(Error::Store(format!(
            "certificate serial is {} bytes, expected at most 8",
            trimmed.len()
        )));
    }
    Ok(trimmed.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| Error::Store(format!("certificate time {secs} out of range")))
}
