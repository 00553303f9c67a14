//! Revoked serials and CRL generation.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rcgen::{
    CertificateRevocationListParams, Issuer, KeyIdMethod, KeyPair, RevocationReason,
    RevokedCertParams, SerialNumber,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::trust::CertSubject;
use crate::trust::store::write_atomic;
use crate::{Error, Result};

/// One revoked certificate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevokedEntry {
    /// Serial of the revoked certificate
    pub serial: u64,
    /// Subject it was issued to
    pub subject: CertSubject,
    /// When it was revoked
    pub revoked_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RevocationFile {
    crl_number: u64,
    entries: Vec<RevokedEntry>,
}

/// Persisted revocation list (`revoked.json`)
#[derive(Debug)]
pub struct RevocationList {
    path: PathBuf,
    state: RevocationFile,
}

impl RevocationList {
    /// Load the list, starting empty if the file is absent
    ///
    /// # Errors
    ///
    /// Returns `Error::CaInit` if the file exists but cannot be parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let state = match fs::read(path) {
            Ok(data) => serde_json::from_slice(&data).map_err(|e| {
                Error::CaInit(format!("corrupt revocation list '{}': {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => RevocationFile::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path: path.to_path_buf(),
            state,
        })
    }

    /// Revoked entries, oldest first
    #[must_use]
    pub fn entries(&self) -> &[RevokedEntry] {
        &self.state.entries
    }

    /// Whether any certificate has been revoked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.entries.is_empty()
    }

    /// Whether `serial` is revoked
    #[must_use]
    pub fn contains(&self, serial: u64) -> bool {
        self.state.entries.iter().any(|e| e.serial == serial)
    }

    /// Record a revocation and persist the list. Returns `false` if the
    /// serial was already revoked.
    ///
    /// # Errors
    ///
    /// Returns an error if the list cannot be written.
    pub fn add(&mut self, entry: RevokedEntry) -> Result<bool> {
        if self.contains(entry.serial) {
            return Ok(false);
        }
        self.state.entries.push(entry);
        self.persist()?;
        Ok(true)
    }

    /// Sign a fresh CRL covering every entry, bumping the CRL number.
    ///
    /// # Errors
    ///
    /// Returns `Error::Issuance` if signing fails or the list cannot be
    /// persisted.
    pub fn sign_crl(&mut self, issuer: &Issuer<'_, KeyPair>, validity: Duration) -> Result<String> {
        self.state.crl_number += 1;
        self.persist()?;

        let now = OffsetDateTime::now_utc();
        let next_update = time::Duration::try_from(validity)
            .ok()
            .and_then(|v| now.checked_add(v))
            .ok_or_else(|| Error::Issuance("CRL validity out of range".into()))?;

        let revoked_certs = self
            .state
            .entries
            .iter()
            .map(|e| {
                Ok(RevokedCertParams {
                    serial_number: SerialNumber::from(e.serial),
                    revocation_time: OffsetDateTime::from_unix_timestamp(e.revoked_at.timestamp())
                        .map_err(|err| Error::Issuance(format!("revocation time: {err}")))?,
                    reason_code: Some(RevocationReason::CessationOfOperation),
                    invalidity_date: None,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let params = CertificateRevocationListParams {
            this_update: now,
            next_update,
            crl_number: SerialNumber::from(self.state.crl_number),
            issuing_distribution_point: None,
            revoked_certs,
            key_identifier_method: KeyIdMethod::Sha256,
        };
        let crl = params
            .signed_by(issuer)
            .map_err(|e| Error::Issuance(format!("CRL signing failed: {e}")))?;
        crl.pem()
            .map_err(|e| Error::Issuance(format!("CRL encoding failed: {e}")))
    }

    fn persist(&self) -> Result<()> {
        let json = serde_json::to_vec_pretty(&self.state)?;
        write_atomic(&self.path, &json, Some(0o600))
    }
}
