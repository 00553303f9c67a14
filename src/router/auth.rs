//! Caller authentication.
//!
//! The TLS layer has already verified any client certificate against the
//! mesh CA; this middleware turns the verified certificate into a
//! [`PeerIdentity`] request extension and refuses anonymous callers on every
//! path that is not public.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, FromRequestParts, State},
    http::{Request, request::Parts},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{debug, warn};

use super::listener::ClientConnection;
use crate::Error;
use crate::registry::prefix;
use crate::trust::PeerIdentity;

/// Which paths skip client authentication
#[derive(Debug, Clone, Default)]
pub struct AuthPolicy {
    /// Paths reachable without a certificate, matched on whole segments
    pub public_paths: Vec<String>,
}

impl AuthPolicy {
    /// Policy from the configured public paths
    #[must_use]
    pub fn new(public_paths: &[String]) -> Self {
        Self {
            public_paths: public_paths.to_vec(),
        }
    }

    /// Check if a path is public (bypasses auth)
    #[must_use]
    pub fn is_public_path(&self, path: &str) -> bool {
        self.public_paths
            .iter()
            .any(|p| prefix::is_segment_prefix(p, path))
    }
}

/// Authentication middleware
pub async fn authenticate(
    State(policy): State<Arc<AuthPolicy>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<ClientConnection>>()
        .and_then(|ConnectInfo(conn)| conn.peer.clone());

    if let Some(peer) = peer {
        debug!(client = %peer.display_name, path = %request.uri().path(), "Authenticated request");
        request.extensions_mut().insert(peer);
        return next.run(request).await;
    }

    let path = request.uri().path();
    if policy.is_public_path(path) {
        debug!(path = %path, "Public path, skipping auth");
        return next.run(request).await;
    }

    warn!(path = %path, "Request without client certificate");
    Error::Unauthorized("a client certificate is required".into()).into_response()
}

/// Authenticated caller, `None` on public paths reached anonymously
#[derive(Debug, Clone)]
pub struct Caller(pub Option<Arc<PeerIdentity>>);

impl Caller {
    /// The caller's identity or `Unauthorized`
    ///
    /// # Errors
    ///
    /// Returns `Error::Unauthorized` for anonymous callers.
    pub fn require(&self) -> crate::Result<&PeerIdentity> {
        self.0
            .as_deref()
            .ok_or_else(|| Error::Unauthorized("a client certificate is required".into()))
    }
}

impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(parts.extensions.get::<Arc<PeerIdentity>>().cloned()))
    }
}
