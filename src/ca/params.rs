//! Certificate parameter builders for the root and leaf certificates.

use std::net::IpAddr;
use std::time::Duration;

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, KeyPair, KeyUsagePurpose, SanType, SerialNumber, SignatureAlgorithm, string::Ia5String,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::trust::{CertSubject, Role};
use crate::{Error, Result};

/// Certificates are backdated by this much to absorb clock skew between
/// the CA host and verifiers.
const BACKDATE: Duration = Duration::from_secs(60);

/// Key algorithm used for the root and every leaf
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyAlgorithm {
    /// ECDSA over P-256 with SHA-256
    #[default]
    EcdsaP256,
    /// ECDSA over P-384 with SHA-384
    EcdsaP384,
    /// Ed25519
    Ed25519,
}

impl KeyAlgorithm {
    fn signature_algorithm(self) -> &'static SignatureAlgorithm {
        match self {
            Self::EcdsaP256 => &rcgen::PKCS_ECDSA_P256_SHA256,
            Self::EcdsaP384 => &rcgen::PKCS_ECDSA_P384_SHA384,
            Self::Ed25519 => &rcgen::PKCS_ED25519,
        }
    }

    /// Generate a fresh key pair
    ///
    /// # Errors
    ///
    /// Returns `Error::Issuance` if the crypto backend fails.
    pub fn generate(self) -> Result<KeyPair> {
        KeyPair::generate_for(self.signature_algorithm())
            .map_err(|e| Error::Issuance(format!("key generation ({self:?}) failed: {e}")))
    }
}

/// Parameters of the self-signed root
///
/// # Errors
///
/// Returns `Error::CaInit` if the validity window overflows.
pub fn root_params(common_name: &str, validity_days: u32) -> Result<CertificateParams> {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.serial_number = Some(SerialNumber::from(1u64));

    let validity = Duration::from_secs(u64::from(validity_days) * 86_400);
    let (not_before, not_after) = validity_window(validity).map_err(Error::CaInit)?;
    params.not_before = not_before;
    params.not_after = not_after;
    Ok(params)
}

/// Everything a leaf certificate carries besides its key
#[derive(Debug)]
pub struct LeafSpec<'a> {
    /// Subject the leaf is issued to
    pub subject: &'a CertSubject,
    /// Serial allocated for this leaf
    pub serial: u64,
    /// Lifetime from now
    pub validity: Duration,
    /// SPIFFE trust domain
    pub trust_domain: &'a str,
    /// Extra DNS names or IPs
    pub extra_sans: &'a [String],
}

/// Parameters of a leaf: CN = identity, OU = role, DNS SAN = identity plus
/// extras, SPIFFE URI SAN and a role-specific EKU.
///
/// # Errors
///
/// Returns `Error::Issuance` if a SAN is not a valid IA5 string or the
/// validity window overflows.
pub fn leaf_params(spec: &LeafSpec<'_>) -> Result<CertificateParams> {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, spec.subject.identity.as_str());
    dn.push(DnType::OrganizationalUnitName, spec.subject.role.as_str());
    params.distinguished_name = dn;
    params.is_ca = IsCa::ExplicitNoCa;
    params.serial_number = Some(SerialNumber::from(spec.serial));
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![match spec.subject.role {
        Role::Server => ExtendedKeyUsagePurpose::ServerAuth,
        Role::Client => ExtendedKeyUsagePurpose::ClientAuth,
    }];
    params.use_authority_key_identifier_extension = true;

    let mut sans = vec![dns_san(&spec.subject.identity)?];
    for extra in spec.extra_sans {
        if extra == &spec.subject.identity {
            continue;
        }
        match extra.parse::<IpAddr>() {
            Ok(ip) => sans.push(SanType::IpAddress(ip)),
            Err(_) => sans.push(dns_san(extra)?),
        }
    }
    let spiffe = spec.subject.spiffe_id(spec.trust_domain);
    sans.push(SanType::URI(Ia5String::try_from(spiffe.as_str()).map_err(
        |e| Error::Issuance(format!("invalid URI SAN '{spiffe}': {e}")),
    )?));
    params.subject_alt_names = sans;

    let (not_before, not_after) = validity_window(spec.validity).map_err(Error::Issuance)?;
    params.not_before = not_before;
    params.not_after = not_after;
    Ok(params)
}

fn dns_san(name: &str) -> Result<SanType> {
    Ia5String::try_from(name)
        .map(SanType::DnsName)
        .map_err(|e| Error::Issuance(format!("invalid DNS SAN '{name}': {e}")))
}

fn validity_window(
    validity: Duration,
) -> std::result::Result<(OffsetDateTime, OffsetDateTime), String> {
    let now = OffsetDateTime::now_utc();
    let not_before = now
        .checked_sub(time::Duration::try_from(BACKDATE).map_err(|e| e.to_string())?)
        .ok_or("validity start out of range")?;
    let not_after = now
        .checked_add(time::Duration::try_from(validity).map_err(|e| e.to_string())?)
        .ok_or("validity end out of range")?;
    Ok((not_before, not_after))
}
