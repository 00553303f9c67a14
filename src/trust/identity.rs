//! Peer identity extraction.
//!
//! Parses the verified peer certificate of an mTLS connection and extracts
//! the fields the router authenticates and authorizes with: Common Name,
//! Organisational Unit (the certificate role), SAN URIs and SAN DNS names.

use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::FromDer;

use crate::trust::Role;
use crate::trust::pem::first_attribute;
use crate::{Error, Result};

/// Identity fields of a verified peer certificate.
///
/// Attached to every authenticated request as an extension. The
/// `display_name` is computed once for logs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerIdentity {
    /// Certificate Common Name (CN), the mesh identity.
    pub common_name: Option<String>,

    /// First Organisational Unit (OU), the certificate role.
    pub organizational_unit: Option<String>,

    /// SAN URI entries (SPIFFE IDs).
    pub san_uris: Vec<String>,

    /// SAN DNS entries.
    pub san_dns_names: Vec<String>,

    /// Human-readable label for logs.
    pub display_name: String,
}

impl PeerIdentity {
    /// Parse a DER-encoded certificate and extract its identity fields.
    ///
    /// # Errors
    ///
    /// Returns `Error::Unauthorized` if the certificate cannot be parsed.
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| Error::Unauthorized(format!("unparseable peer certificate: {e}")))?;

        let common_name = first_attribute(cert.subject().iter_common_name());
        let organizational_unit = first_attribute(cert.subject().iter_organizational_unit());
        let (san_uris, san_dns_names) = extract_sans(&cert);
        let display_name = build_display_name(common_name.as_ref(), &san_uris);

        Ok(Self {
            common_name,
            organizational_unit,
            san_uris,
            san_dns_names,
            display_name,
        })
    }

    /// Mesh identity (the CN), or `<unknown>`
    #[must_use]
    pub fn identity(&self) -> &str {
        self.common_name.as_deref().unwrap_or("<unknown>")
    }

    /// Role carried in the OU, if it names one
    #[must_use]
    pub fn role(&self) -> Option<Role> {
        self.organizational_unit.as_deref()?.parse().ok()
    }

    /// Whether the certificate names `identity` in its CN or DNS SANs
    #[must_use]
    pub fn matches(&self, identity: &str) -> bool {
        self.common_name.as_deref() == Some(identity)
            || self.san_dns_names.iter().any(|d| d == identity)
    }
}

fn extract_sans(cert: &X509Certificate<'_>) -> (Vec<String>, Vec<String>) {
    let mut uris = Vec::new();
    let mut dns_names = Vec::new();

    if let Ok(Some(san_ext)) = cert.subject_alternative_name() {
        for name in &san_ext.value.general_names {
            match name {
                GeneralName::URI(uri) => uris.push((*uri).to_owned()),
                GeneralName::DNSName(dns) => dns_names.push((*dns).to_owned()),
                _ => {}
            }
        }
    }

    (uris, dns_names)
}

/// Prefers the SPIFFE URI, then CN, then `"<unknown>"`.
fn build_display_name(cn: Option<&String>, san_uris: &[String]) -> String {
    san_uris
        .iter()
        .find(|u| u.starts_with("spiffe://"))
        .map(String::as_str)
        .or_else(|| cn.map(String::as_str))
        .unwrap_or("<unknown>")
        .to_owned()
}
