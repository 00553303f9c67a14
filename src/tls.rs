//! rustls configuration for both sides of mesh connections.
//!
//! - [`server_config`]: the router's listener, verifying client certificates
//!   against the CA root and optional CRL
//! - [`client_config`]: upstream connections, presenting the router's client
//!   certificate and pinning the backend's expected identity
//!
//! Only TLS 1.3 is offered and aws-lc-rs is the only provider wired in.

use std::sync::Arc;

use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{
    CertificateDer, CertificateRevocationListDer, PrivateKeyDer, ServerName, UnixTime,
};
use rustls::server::WebPkiClientVerifier;
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use tracing::debug;

use crate::trust::PublishedBundle;
use crate::{Error, Result};

/// The crypto provider every config is built with
#[must_use]
pub fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

/// Whether `key` is the private half of `cert`'s public key
#[must_use]
pub fn keys_match(cert: &CertificateDer<'_>, key: &PrivateKeyDer<'_>) -> bool {
    let Ok(signing_key) = provider().key_provider.load_private_key(key.clone_key()) else {
        return false;
    };
    CertifiedKey::new(vec![cert.clone().into_owned()], signing_key)
        .keys_match()
        .is_ok()
}

/// Root store holding the mesh CA
///
/// # Errors
///
/// Returns `Error::Config` if a certificate is not a usable trust anchor.
pub fn root_store(cas: &[CertificateDer<'static>]) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for ca in cas {
        roots
            .add(ca.clone())
            .map_err(|e| Error::Config(format!("Failed to add CA cert to trust store: {e}")))?;
    }
    Ok(roots)
}

/// Listener config for the router.
///
/// With `require_client_cert` the handshake itself fails for callers
/// without a valid certificate; otherwise anonymous handshakes succeed and
/// authentication is left to the HTTP layer.
///
/// # Errors
///
/// Returns an error if the CA, CRL or certificate/key pair is unusable.
pub fn server_config(
    bundle: &PublishedBundle,
    crls: Vec<CertificateRevocationListDer<'static>>,
    require_client_cert: bool,
) -> Result<ServerConfig> {
    let provider = provider();
    let roots = Arc::new(root_store(&bundle.ca)?);
    let has_crls = !crls.is_empty();

    let mut builder = WebPkiClientVerifier::builder_with_provider(roots, provider.clone());
    if has_crls {
        builder = builder
            .with_crls(crls)
            .only_check_end_entity_revocation()
            .allow_unknown_revocation_status();
    }
    if !require_client_cert {
        builder = builder.allow_unauthenticated();
    }
    let verifier = builder
        .build()
        .map_err(|e| Error::Config(format!("Failed to build client verifier: {e}")))?;

    let mut config = ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| Error::Config(format!("TLS protocol setup failed: {e}")))?
        .with_client_cert_verifier(verifier)
        .with_single_cert(bundle.chain.clone(), bundle.key.clone_key())
        .map_err(|e| Error::Config(format!("TLS config error (cert/key mismatch?): {e}")))?;

    // Prefer HTTP/2, fall back to HTTP/1.1
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    debug!(
        subject = %bundle.subject,
        serial = bundle.info.serial,
        require_client_cert,
        crl = has_crls,
        "Server TLS config built"
    );
    Ok(config)
}

/// Client config presenting `bundle` and accepting only a server
/// certificate that chains to the CA and names `expected_identity`.
///
/// # Errors
///
/// Returns an error if the identity is not a valid server name or the
/// certificate/key pair is unusable.
pub fn client_config(bundle: &PublishedBundle, expected_identity: &str) -> Result<ClientConfig> {
    let provider = provider();
    let verifier = IdentityVerifier::new(&bundle.ca, expected_identity, provider.clone())?;

    let mut config = ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| Error::Config(format!("TLS protocol setup failed: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_client_auth_cert(bundle.chain.clone(), bundle.key.clone_key())
        .map_err(|e| Error::Config(format!("TLS client cert error: {e}")))?;

    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

/// Verifies the server chain with webpki but checks the certificate against
/// a pinned mesh identity instead of the host the client dialed.
#[derive(Debug)]
pub struct IdentityVerifier {
    inner: Arc<WebPkiServerVerifier>,
    expected: ServerName<'static>,
}

impl IdentityVerifier {
    /// Verifier trusting `cas` and expecting `identity`
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the identity is not a valid DNS name or
    /// the CA cannot be used as a trust anchor.
    pub fn new(
        cas: &[CertificateDer<'static>],
        identity: &str,
        provider: Arc<CryptoProvider>,
    ) -> Result<Self> {
        let expected = ServerName::try_from(identity.to_string())
            .map_err(|e| Error::Config(format!("invalid certificate identity '{identity}': {e}")))?;
        let inner = WebPkiServerVerifier::builder_with_provider(Arc::new(root_store(cas)?), provider)
            .build()
            .map_err(|e| Error::Config(format!("Failed to build server verifier: {e}")))?;
        Ok(Self { inner, expected })
    }
}

impl ServerCertVerifier for IdentityVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        self.inner
            .verify_server_cert(end_entity, intermediates, &self.expected, ocsp_response, now)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}
