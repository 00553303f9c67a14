//! Mesh Gateway Library
//!
//! Certificate bootstrap and dynamic mTLS routing for a multi-service admin
//! plane.
//!
//! # Components
//!
//! - **Certificate authority** ([`ca`]): root key pair, leaf issuance with
//!   per-subject idempotence, revocation and CRL publishing
//! - **Trust store** ([`trust`]): identity-addressed PEM bundles published
//!   with write-temp-then-rename
//! - **Startup gate** ([`gate`]): blocks a service until its certificates
//!   are published and valid
//! - **Module registry** ([`registry`]): prefix routing table with health
//!   tracking and lock-free reads
//! - **Router** ([`router`]): mTLS reverse proxy forwarding to modules with
//!   the router's client certificate
//! - **Registration client** ([`client`]): how modules announce themselves

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod ca;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod gate;
pub mod registry;
pub mod router;
pub mod tls;
pub mod trust;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// `RUST_LOG` takes precedence over `level`.
///
/// # Errors
///
/// Returns `Error::Config` if a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json().with_current_span(false))
            .try_init(),
        _ => subscriber.with(fmt::layer().with_target(false)).try_init(),
    }
    .map_err(|e| Error::Config(format!("failed to install tracing subscriber: {e}")))
}
