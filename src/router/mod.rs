//! Dynamic mTLS router.
//!
//! ```text
//! TCP accept
//!   → TLS handshake   (client cert verified against the mesh CA + CRL)
//!   → authenticate    (PeerIdentity from the verified certificate)
//!   → resolve route   (longest segment prefix in the module registry)
//!   → forward         (per-module mTLS pool, identity pinned)
//!   → relay response  (streamed)
//! ```
//!
//! The same listener serves `/health` and the registration API under
//! `/admin/v1/registry/modules`.

pub mod api;
pub mod auth;
pub mod forward;
pub mod listener;
pub mod probe;
pub mod server;
pub mod upstream;

use std::sync::Arc;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    http::HeaderName,
    middleware,
    routing::{delete, get},
};
use tower_http::{
    catch_panic::CatchPanicLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

pub use auth::{AuthPolicy, Caller};
pub use listener::{ClientConnection, MtlsListener, ReloadableAcceptor};
pub use server::MeshRouter;
pub use upstream::UpstreamPools;

use crate::config::HealthCheckConfig;
use crate::registry::ModuleRegistry;

/// Shared application state
#[derive(Debug)]
pub struct AppState {
    /// Module registry
    pub registry: Arc<ModuleRegistry>,
    /// Per-module upstream pools
    pub upstreams: Arc<UpstreamPools>,
    /// Header carrying the caller identity to modules
    pub identity_header: HeaderName,
    /// Identities allowed to manage any module
    pub admin_identities: Vec<String>,
    /// Probe settings
    pub health_check: HealthCheckConfig,
    /// Consecutive failures on every instance before eviction (0 = never)
    pub evict_after: u32,
}

/// Create the router
pub fn create_router(state: Arc<AppState>, auth: Arc<AuthPolicy>, max_body_size: usize) -> Router {
    Router::new()
        .route("/health", get(api::health))
        .route(
            "/admin/v1/registry/modules",
            get(api::list_modules).post(api::register_module),
        )
        .route(
            "/admin/v1/registry/modules/{id}",
            delete(api::deregister_module),
        )
        .fallback(forward::forward)
        // Innermost: runs after request ids and tracing are set up
        .layer(middleware::from_fn_with_state(auth, auth::authenticate))
        .layer(DefaultBodyLimit::max(max_body_size))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(CatchPanicLayer::new())
        .with_state(state)
}
