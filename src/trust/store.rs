//! Filesystem trust store.
//!
//! Layout under the store root:
//!
//! ```text
//! ca.crt                       CA root, public
//! ca.crl                       CRL, only once something was revoked
//! {identity}/{role}.pem        leaf certificate + CA root + private key
//! ```
//!
//! Every file is replaced with write-temp, `sync_all`, rename, so a reader
//! sees either the previous bundle or the new one, never a mix.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use rustls::pki_types::{CertificateDer, CertificateRevocationListDer, PrivateKeyDer};
use tracing::{debug, info};

use crate::tls;
use crate::trust::pem::{self, CertInfo};
use crate::trust::{CertSubject, IssuedCertificate};
use crate::{Error, Result};

const CA_FILE: &str = "ca.crt";
const CRL_FILE: &str = "ca.crl";

/// Non-blocking check that a subject's trust material is usable.
///
/// The startup gate polls any implementation of this trait.
pub trait Readiness: Send + Sync {
    /// True iff the subject's certificate, key and CA are present and the
    /// certificate is currently valid.
    fn is_ready(&self, subject: &CertSubject) -> bool;
}

/// Trust material read back from the store
pub struct PublishedBundle {
    /// Subject the bundle belongs to
    pub subject: CertSubject,
    /// Leaf certificate chain (leaf first)
    pub chain: Vec<CertificateDer<'static>>,
    /// Private key matching the leaf
    pub key: PrivateKeyDer<'static>,
    /// Trusted CA roots
    pub ca: Vec<CertificateDer<'static>>,
    /// Leaf metadata
    pub info: CertInfo,
}

impl Clone for PublishedBundle {
    fn clone(&self) -> Self {
        Self {
            subject: self.subject.clone(),
            chain: self.chain.clone(),
            key: self.key.clone_key(),
            ca: self.ca.clone(),
            info: self.info.clone(),
        }
    }
}

impl fmt::Debug for PublishedBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublishedBundle")
            .field("subject", &self.subject)
            .field("serial", &self.info.serial)
            .field("not_after", &self.info.not_after)
            .field("fingerprint", &self.info.fingerprint)
            .finish_non_exhaustive()
    }
}

/// Identity-addressed store of published bundles
#[derive(Debug, Clone)]
pub struct TrustStore {
    root: PathBuf,
}

impl TrustStore {
    /// Store rooted at `root`; nothing is touched until the first publish
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Store root directory
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of a subject's bundle file
    #[must_use]
    pub fn bundle_path(&self, subject: &CertSubject) -> PathBuf {
        self.root
            .join(&subject.identity)
            .join(format!("{}.pem", subject.role))
    }

    /// Path of the published CA root
    #[must_use]
    pub fn ca_path(&self) -> PathBuf {
        self.root.join(CA_FILE)
    }

    /// Path of the published CRL
    #[must_use]
    pub fn crl_path(&self) -> PathBuf {
        self.root.join(CRL_FILE)
    }

    /// Atomically publish a subject's bundle and the CA root.
    ///
    /// # Errors
    ///
    /// Returns an error if the subject is invalid or a file cannot be written.
    pub fn publish(&self, issued: &IssuedCertificate) -> Result<PathBuf> {
        issued.subject.validate()?;
        let path = self.bundle_path(&issued.subject);
        let bundle = format!(
            "{}{}{}",
            ensure_newline(&issued.cert_pem),
            ensure_newline(&issued.ca_pem),
            ensure_newline(&issued.key_pem)
        );
        write_atomic(&path, bundle.as_bytes(), Some(0o600))?;
        self.publish_ca(&issued.ca_pem)?;

        info!(
            subject = %issued.subject,
            serial = issued.serial,
            path = %path.display(),
            "Published trust bundle"
        );
        Ok(path)
    }

    /// Atomically publish the CA root alone
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn publish_ca(&self, ca_pem: &str) -> Result<()> {
        write_atomic(&self.ca_path(), ca_pem.as_bytes(), Some(0o644))
    }

    /// Atomically publish a CRL
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn publish_crl(&self, crl_pem: &str) -> Result<()> {
        write_atomic(&self.crl_path(), crl_pem.as_bytes(), Some(0o644))?;
        debug!(path = %self.crl_path().display(), "Published CRL");
        Ok(())
    }

    /// Load and validate a subject's bundle.
    ///
    /// # Errors
    ///
    /// Returns `Error::Store` if the bundle is missing, malformed, lacks a
    /// CA or key, or the key does not match the certificate.
    pub fn load(&self, subject: &CertSubject) -> Result<PublishedBundle> {
        let path = self.bundle_path(subject);
        let data = fs::read(&path)
            .map_err(|e| Error::Store(format!("cannot read '{}': {e}", path.display())))?;
        parse_bundle(subject, &path, &data)
    }

    /// Load a subject's bundle back into its PEM parts.
    ///
    /// # Errors
    ///
    /// Same as [`TrustStore::load`].
    pub fn load_issued(&self, subject: &CertSubject) -> Result<IssuedCertificate> {
        let path = self.bundle_path(subject);
        let text = fs::read_to_string(&path)
            .map_err(|e| Error::Store(format!("cannot read '{}': {e}", path.display())))?;
        let bundle = parse_bundle(subject, &path, text.as_bytes())?;

        let mut certs = Vec::new();
        let mut key_pem = None;
        for (label, block) in pem::blocks(&text) {
            if label == "CERTIFICATE" {
                certs.push(block);
            } else if label.ends_with("PRIVATE KEY") && key_pem.is_none() {
                key_pem = Some(block);
            }
        }
        let (Some(cert_pem), Some(ca_pem), Some(key_pem)) =
            (certs.first(), certs.last(), key_pem)
        else {
            return Err(Error::Store(format!(
                "bundle '{}' is incomplete",
                path.display()
            )));
        };

        Ok(IssuedCertificate {
            subject: subject.clone(),
            cert_pem: cert_pem.clone(),
            key_pem,
            ca_pem: ca_pem.clone(),
            serial: bundle.info.serial,
            not_before: bundle.info.not_before,
            not_after: bundle.info.not_after,
            fingerprint: bundle.info.fingerprint,
        })
    }

    /// Published CA roots
    ///
    /// # Errors
    ///
    /// Returns `Error::Store` if `ca.crt` is missing or malformed.
    pub fn ca_certificates(&self) -> Result<Vec<CertificateDer<'static>>> {
        let path = self.ca_path();
        let data = fs::read(&path)
            .map_err(|e| Error::Store(format!("cannot read '{}': {e}", path.display())))?;
        pem::parse_certificates(&data)
    }

    /// Published CRLs; none when nothing has been revoked
    ///
    /// # Errors
    ///
    /// Returns `Error::Store` if `ca.crl` exists but cannot be parsed.
    pub fn crls(&self) -> Result<Vec<CertificateRevocationListDer<'static>>> {
        match fs::read(self.crl_path()) {
            Ok(data) => pem::parse_crls(&data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(Error::Store(format!("cannot read CRL: {e}"))),
        }
    }

    /// Remove a subject's bundle. Returns `false` if nothing was published.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be removed.
    pub fn remove(&self, subject: &CertSubject) -> Result<bool> {
        let path = self.bundle_path(subject);
        let graveyard = sibling(&path, "removed");
        match fs::rename(&path, &graveyard) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        }
        fs::remove_file(&graveyard)?;
        sync_parent(&path)?;
        info!(subject = %subject, "Removed trust bundle");
        Ok(true)
    }
}

impl Readiness for TrustStore {
    fn is_ready(&self, subject: &CertSubject) -> bool {
        match self.load(subject) {
            Ok(bundle) => bundle.info.is_valid_at(Utc::now()),
            Err(e) => {
                debug!(subject = %subject, error = %e, "Trust bundle not ready");
                false
            }
        }
    }
}

fn parse_bundle(subject: &CertSubject, path: &Path, data: &[u8]) -> Result<PublishedBundle> {
    let mut certs = pem::parse_certificates(data)?;
    if certs.len() < 2 {
        return Err(Error::Store(format!(
            "bundle '{}' has no CA certificate",
            path.display()
        )));
    }
    let ca = certs.split_off(1);
    let key = pem::parse_private_key(data)?;
    if !tls::keys_match(&certs[0], &key) {
        return Err(Error::Store(format!(
            "bundle '{}' key does not match its certificate",
            path.display()
        )));
    }
    let info = CertInfo::inspect(&certs[0])?;

    Ok(PublishedBundle {
        subject: subject.clone(),
        chain: certs,
        key,
        ca,
        info,
    })
}

fn ensure_newline(pem: &str) -> String {
    if pem.ends_with('\n') {
        pem.to_string()
    } else {
        format!("{pem}\n")
    }
}

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

fn sibling(path: &Path, tag: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    path.with_file_name(format!(".{name}.{tag}.{}.{n}", std::process::id()))
}

/// Replace `path` atomically: write a temp file in the same directory,
/// fsync it, rename it over `path`, then fsync the directory.
///
/// # Errors
///
/// Returns an IO error if any step fails; the temp file is cleaned up.
pub(crate) fn write_atomic(path: &Path, contents: &[u8], mode: Option<u32>) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let tmp = sibling(path, "tmp");

    let result = (|| -> std::io::Result<()> {
        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(mode.unwrap_or(0o644));
        }
        #[cfg(not(unix))]
        let _ = mode;
        let mut file = options.open(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();

    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    sync_parent(path)
}

fn sync_parent(path: &Path) -> Result<()> {
    #[cfg(unix)]
    if let Some(dir) = path.parent() {
        fs::File::open(dir)?.sync_all()?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}
