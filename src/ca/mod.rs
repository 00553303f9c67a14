//! Certificate authority.
//!
//! Owns the root key pair and issues leaf certificates for mesh subjects.
//!
//! CA directory layout:
//!
//! ```text
//! ca.crt        root certificate
//! ca.key        root private key (0600)
//! serial        last serial handed out
//! revoked.json  revoked serials
//! ca.crl        CRL signed by the root
//! ```
//!
//! Issuance is idempotent per subject: while a published certificate from
//! this root has more than `renew_before` left, [`CertificateAuthority::issue`]
//! returns it unchanged.

pub mod params;
pub mod revocation;
pub mod serial;

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use rcgen::{Issuer, KeyPair};
use tracing::{debug, info, warn};

pub use params::KeyAlgorithm;
pub use revocation::{RevocationList, RevokedEntry};
pub use serial::SerialCounter;

use crate::config::CaConfig;
use crate::trust::pem::{self, CertInfo};
use crate::trust::store::write_atomic;
use crate::trust::{CertSubject, IssuedCertificate, TrustStore};
use crate::{Error, Result};

const CERT_FILE: &str = "ca.crt";
const KEY_FILE: &str = "ca.key";
const SERIAL_FILE: &str = "serial";
const REVOKED_FILE: &str = "revoked.json";
const CRL_FILE: &str = "ca.crl";

/// Root key pair, serial counter and revocation list
pub struct CertificateAuthority {
    config: CaConfig,
    issuer: Issuer<'static, KeyPair>,
    ca_pem: String,
    ca_info: CertInfo,
    serials: SerialCounter,
    revocations: Mutex<RevocationList>,
    store: TrustStore,
    subject_locks: DashMap<CertSubject, Arc<Mutex<()>>>,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("dir", &self.config.dir)
            .field("fingerprint", &self.ca_info.fingerprint)
            .field("serial", &self.serials.current())
            .finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    /// Create the root if the CA directory is empty, otherwise load and
    /// validate it. The root is published to the trust store either way.
    ///
    /// # Errors
    ///
    /// Returns `Error::CaInit` if only one of key/certificate exists, either
    /// is corrupt, the key does not match the certificate, the certificate
    /// is not a CA or has expired, or the serial/revocation files are corrupt.
    pub fn initialize(config: &CaConfig, store: TrustStore) -> Result<Self> {
        let dir = config.dir.as_path();
        fs::create_dir_all(dir).map_err(|e| {
            Error::CaInit(format!("cannot create CA dir '{}': {e}", dir.display()))
        })?;

        let cert_path = dir.join(CERT_FILE);
        let key_path = dir.join(KEY_FILE);
        let (ca_pem, key) = match (cert_path.exists(), key_path.exists()) {
            (false, false) => create_root(config, &cert_path, &key_path)?,
            (true, true) => load_root(&cert_path, &key_path)?,
            (cert, _) => {
                let missing = if cert { &key_path } else { &cert_path };
                return Err(Error::CaInit(format!(
                    "incomplete CA material: '{}' is missing",
                    missing.display()
                )));
            }
        };

        let ca_der = pem::parse_certificates(ca_pem.as_bytes())
            .map_err(|e| Error::CaInit(e.to_string()))?
            .remove(0);
        let ca_info = CertInfo::inspect(&ca_der).map_err(|e| Error::CaInit(e.to_string()))?;
        if !ca_info.is_ca {
            return Err(Error::CaInit("root certificate is not a CA".into()));
        }
        if !ca_info.is_valid_at(Utc::now()) {
            return Err(Error::CaInit(format!(
                "root certificate is outside its validity window (not_after {})",
                ca_info.not_after
            )));
        }
        if ca_info.public_key != key.public_key_raw() {
            return Err(Error::CaInit(
                "CA private key does not match the root certificate".into(),
            ));
        }

        let issuer = Issuer::from_ca_cert_pem(&ca_pem, key)
            .map_err(|e| Error::CaInit(format!("cannot build issuer from root: {e}")))?;
        let serials = SerialCounter::open(&dir.join(SERIAL_FILE))?;
        let revocations = RevocationList::load(&dir.join(REVOKED_FILE))?;

        let ca = Self {
            config: config.clone(),
            issuer,
            ca_pem,
            ca_info,
            serials,
            revocations: Mutex::new(revocations),
            store,
            subject_locks: DashMap::new(),
        };

        ca.store
            .publish_ca(&ca.ca_pem)
            .map_err(|e| Error::CaInit(format!("cannot publish CA root: {e}")))?;
        if !ca.revocations.lock().is_empty() {
            ca.refresh_crl()?;
        }

        info!(
            dir = %dir.display(),
            fingerprint = %ca.ca_info.fingerprint,
            not_after = %ca.ca_info.not_after,
            "Certificate authority ready"
        );
        Ok(ca)
    }

    /// PEM of the root certificate
    #[must_use]
    pub fn ca_pem(&self) -> &str {
        &self.ca_pem
    }

    /// Root certificate metadata
    #[must_use]
    pub fn ca_info(&self) -> &CertInfo {
        &self.ca_info
    }

    /// Trust store the CA publishes into
    #[must_use]
    pub fn store(&self) -> &TrustStore {
        &self.store
    }

    /// Issue (or reuse) a certificate with the configured leaf validity
    ///
    /// # Errors
    ///
    /// See [`CertificateAuthority::issue_with_validity`].
    pub fn issue(&self, subject: &CertSubject) -> Result<IssuedCertificate> {
        self.issue_with_validity(subject, self.config.leaf_validity)
    }

    /// Issue a certificate for `subject`, or return the published one if it
    /// was signed by this root and stays valid past the renewal window.
    ///
    /// Calls for the same subject are serialized; distinct subjects run in
    /// parallel and only contend on serial allocation.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for an invalid subject, `Error::Issuance` if
    /// key generation or signing fails, or a store error if publishing fails.
    pub fn issue_with_validity(
        &self,
        subject: &CertSubject,
        validity: Duration,
    ) -> Result<IssuedCertificate> {
        subject.validate()?;
        let lock = self
            .subject_locks
            .entry(subject.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock();

        if let Some(existing) = self.reusable(subject) {
            debug!(subject = %subject, serial = existing.serial, "Reusing issued certificate");
            return Ok(existing);
        }

        let serial = self.serials.next()?;
        let key = self.config.key_algorithm.generate()?;
        let leaf = params::leaf_params(&params::LeafSpec {
            subject,
            serial,
            validity,
            trust_domain: &self.config.trust_domain,
            extra_sans: &self.config.extra_sans,
        })?
        .signed_by(&key, &self.issuer)
        .map_err(|e| Error::Issuance(format!("signing {subject} failed: {e}")))?;

        let info = CertInfo::inspect(leaf.der())?;
        let issued = IssuedCertificate {
            subject: subject.clone(),
            cert_pem: leaf.pem(),
            key_pem: key.serialize_pem(),
            ca_pem: self.ca_pem.clone(),
            serial,
            not_before: info.not_before,
            not_after: info.not_after,
            fingerprint: info.fingerprint,
        };
        self.store.publish(&issued)?;

        info!(
            subject = %subject,
            serial,
            not_after = %issued.not_after,
            "Issued certificate"
        );
        Ok(issued)
    }

    /// Issue every subject listed in `ca.identities`
    ///
    /// # Errors
    ///
    /// Stops at the first subject that fails.
    pub fn bootstrap(&self) -> Result<Vec<IssuedCertificate>> {
        if self.config.identities.is_empty() {
            warn!("No identities configured for bootstrap");
        }
        self.config
            .identities
            .iter()
            .map(|subject| self.issue(subject))
            .collect()
    }

    /// Revoke the subject's published certificate, republish the CRL and
    /// remove the bundle from the trust store.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if nothing is published for the subject.
    pub fn revoke(&self, subject: &CertSubject) -> Result<RevokedEntry> {
        let lock = self
            .subject_locks
            .entry(subject.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock();

        let bundle = self
            .store
            .load(subject)
            .map_err(|_| Error::NotFound(format!("no published certificate for {subject}")))?;
        let entry = RevokedEntry {
            serial: bundle.info.serial,
            subject: subject.clone(),
            revoked_at: Utc::now(),
        };
        self.revocations.lock().add(entry.clone())?;
        self.refresh_crl()?;
        self.store.remove(subject)?;

        warn!(subject = %subject, serial = entry.serial, "Revoked certificate");
        Ok(entry)
    }

    /// Revoked entries, oldest first
    #[must_use]
    pub fn revoked(&self) -> Vec<RevokedEntry> {
        self.revocations.lock().entries().to_vec()
    }

    /// Re-sign the CRL and publish it to the CA dir and the trust store
    ///
    /// # Errors
    ///
    /// Returns an error if signing or writing fails.
    pub fn refresh_crl(&self) -> Result<()> {
        let crl = self
            .revocations
            .lock()
            .sign_crl(&self.issuer, self.config.crl_validity)?;
        write_atomic(&self.config.dir.join(CRL_FILE), crl.as_bytes(), Some(0o644))?;
        self.store.publish_crl(&crl)
    }

    fn reusable(&self, subject: &CertSubject) -> Option<IssuedCertificate> {
        let existing = self.store.load_issued(subject).ok()?;
        let ca_der = pem::parse_certificates(existing.ca_pem.as_bytes()).ok()?;
        let same_root = ca_der
            .first()
            .is_some_and(|der| pem::fingerprint(der) == self.ca_info.fingerprint);
        if !same_root || self.revocations.lock().contains(existing.serial) {
            return None;
        }
        let remaining = (existing.not_after - Utc::now()).to_std().unwrap_or_default();
        (remaining > self.config.renew_before).then_some(existing)
    }
}

fn create_root(config: &CaConfig, cert_path: &Path, key_path: &Path) -> Result<(String, KeyPair)> {
    let key = config
        .key_algorithm
        .generate()
        .map_err(|e| Error::CaInit(e.to_string()))?;
    let cert = params::root_params(&config.common_name, config.root_validity_days)?
        .self_signed(&key)
        .map_err(|e| Error::CaInit(format!("root self-signing failed: {e}")))?;
    let ca_pem = cert.pem();

    // Key first: a crash in between leaves an incomplete CA that fails loudly.
    write_atomic(key_path, key.serialize_pem().as_bytes(), Some(0o600))?;
    write_atomic(cert_path, ca_pem.as_bytes(), Some(0o644))?;
    info!(
        common_name = %config.common_name,
        algorithm = ?config.key_algorithm,
        "Generated new root certificate"
    );
    Ok((ca_pem, key))
}

fn load_root(cert_path: &Path, key_path: &Path) -> Result<(String, KeyPair)> {
    let ca_pem = read_text(cert_path)?;
    let key_pem = read_text(key_path)?;
    let key = KeyPair::from_pem(&key_pem)
        .map_err(|e| Error::CaInit(format!("corrupt CA key '{}': {e}", key_path.display())))?;
    Ok((ca_pem, key))
}

fn read_text(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .map_err(|e| Error::CaInit(format!("cannot read '{}': {e}", path.display())))
}
