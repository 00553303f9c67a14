//! Router server: startup gate, listener, background tasks, shutdown.

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::auth::AuthPolicy;
use super::listener::{ClientConnection, MtlsListener, ReloadableAcceptor};
use super::probe::spawn_health_probes;
use super::upstream::{self, UpstreamPools};
use super::{AppState, create_router};
use crate::config::Config;
use crate::gate::wait_for_certificates;
use crate::registry::ModuleRegistry;
use crate::tls;
use crate::trust::{PublishedBundle, TrustStore, pem};
use crate::{Error, Result};

/// Fingerprints of the material the listener currently uses
#[derive(Debug, Clone, PartialEq, Eq)]
struct ListenerMaterial {
    server: String,
    crl: String,
}

impl ListenerMaterial {
    fn of(bundle: &PublishedBundle, crls: &[rustls::pki_types::CertificateRevocationListDer<'_>]) -> Self {
        let crl = crls
            .iter()
            .map(|c| pem::fingerprint(c))
            .collect::<Vec<_>>()
            .join(",");
        Self {
            server: bundle.info.fingerprint.clone(),
            crl,
        }
    }
}

/// The admin-plane router
pub struct MeshRouter {
    config: Config,
    store: TrustStore,
    state: Arc<AppState>,
    auth: Arc<AuthPolicy>,
    acceptor: ReloadableAcceptor,
    material: Arc<Mutex<ListenerMaterial>>,
    listener: Option<MtlsListener>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for MeshRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshRouter")
            .field("identity", &self.config.tls.identity)
            .field("modules", &self.state.registry.len())
            .field("listening", &self.local_addr())
            .finish_non_exhaustive()
    }
}

impl MeshRouter {
    /// Wait for the router's own certificates, then build TLS configs, the
    /// registry (with statically configured modules) and upstream pools.
    ///
    /// # Errors
    ///
    /// - `Error::CertificateTimeout` if the bundles do not appear in time
    /// - `Error::Shutdown` if `cancel` fires while waiting
    /// - configuration or TLS errors for unusable material
    pub async fn bootstrap(config: Config, cancel: CancellationToken) -> Result<Self> {
        let store = TrustStore::new(&config.tls.store_dir);
        let server_subject = config.server_subject();
        let client_subject = config.client_subject();

        wait_for_certificates(
            &store,
            &[server_subject.clone(), client_subject.clone()],
            config.gate.timeout,
            config.gate.poll_interval,
            &cancel,
        )
        .await?;

        let server_bundle = store.load(&server_subject)?;
        let client_bundle = store.load(&client_subject)?;
        let crls = store.crls()?;
        let material = ListenerMaterial::of(&server_bundle, &crls);
        let require_client_cert = config.server.public_paths.is_empty();
        let acceptor = ReloadableAcceptor::new(tls::server_config(
            &server_bundle,
            crls,
            require_client_cert,
        )?);

        let registry = Arc::new(ModuleRegistry::new(
            &config.registry,
            config.health_check.unhealthy_threshold,
        ));
        for descriptor in &config.modules {
            registry.register(descriptor).map_err(|e| {
                Error::Config(format!("static module '{}': {e}", descriptor.id))
            })?;
        }

        let state = Arc::new(AppState {
            registry,
            upstreams: Arc::new(UpstreamPools::new(config.upstream.clone(), client_bundle)),
            identity_header: upstream::identity_header(&config.server.identity_header)?,
            admin_identities: config.registry.admin_identities.clone(),
            health_check: config.health_check.clone(),
            evict_after: config.registry.evict_after,
        });

        Ok(Self {
            auth: Arc::new(AuthPolicy::new(&config.server.public_paths)),
            config,
            store,
            state,
            acceptor,
            material: Arc::new(Mutex::new(material)),
            listener: None,
            cancel,
        })
    }

    /// Bind the configured host and port; port 0 picks a free one
    ///
    /// # Errors
    ///
    /// Returns an error if the host is invalid or the port cannot be bound.
    pub async fn listen(&mut self) -> Result<SocketAddr> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );
        let listener = MtlsListener::bind(
            addr,
            self.acceptor.clone(),
            self.config.server.handshake_timeout,
        )
        .await?;
        let local = listener.local_addr;
        self.listener = Some(listener);
        Ok(local)
    }

    /// Bound address, once [`MeshRouter::listen`] succeeded
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().map(|l| l.local_addr)
    }

    /// Shared state (registry and pools)
    #[must_use]
    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.state)
    }

    /// Token that stops the router when cancelled
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Serve until the cancellation token fires, then drain connections for
    /// at most `server.shutdown_timeout`.
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails or the server stops abnormally.
    pub async fn serve(mut self) -> Result<()> {
        if self.listener.is_none() {
            self.listen().await?;
        }
        let Some(listener) = self.listener.take() else {
            return Err(Error::Internal("listener missing after bind".into()));
        };
        let local = listener.local_addr;

        info!("============================================================");
        info!("MESH GATEWAY v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(addr = %local, identity = %self.config.tls.identity, "Listening (mTLS)");
        info!(modules = self.state.registry.len(), root = %self.state.registry.module_root(), "Module registry ready");
        if self.auth.public_paths.is_empty() {
            info!("Client certificates required at the handshake");
        } else {
            warn!(paths = ?self.auth.public_paths, "Public paths reachable without a client certificate");
        }
        info!("============================================================");

        let tasks = vec![
            spawn_health_probes(Arc::clone(&self.state), self.cancel.clone()),
            self.spawn_refresh(),
        ];

        let app = create_router(
            Arc::clone(&self.state),
            Arc::clone(&self.auth),
            self.config.server.max_body_size,
        );
        let serve = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<ClientConnection>(),
        )
        .with_graceful_shutdown(self.cancel.clone().cancelled_owned())
        .into_future();

        let drain_limit = self.config.server.shutdown_timeout;
        let cancel = self.cancel.clone();
        let result = tokio::select! {
            r = serve => r.map_err(|e| Error::Internal(e.to_string())),
            () = async {
                cancel.cancelled().await;
                tokio::time::sleep(drain_limit).await;
            } => {
                warn!(timeout_ms = u64::try_from(drain_limit.as_millis()).unwrap_or(u64::MAX), "Drain timeout elapsed, closing remaining connections");
                Ok(())
            }
        };

        self.cancel.cancel();
        for task in tasks {
            let _ = task.await;
        }
        info!("Router stopped");
        result
    }

    /// Bootstrap, bind and serve until SIGINT/SIGTERM
    ///
    /// # Errors
    ///
    /// Propagates bootstrap and serve errors.
    pub async fn run(config: Config) -> Result<()> {
        let cancel = CancellationToken::new();
        tokio::spawn(shutdown_signal(cancel.clone()));
        let mut router = Self::bootstrap(config, cancel).await?;
        router.listen().await?;
        router.serve().await
    }

    /// Periodically reload the router's bundles and the CRL
    fn spawn_refresh(&self) -> JoinHandle<()> {
        let store = self.store.clone();
        let state = Arc::clone(&self.state);
        let acceptor = self.acceptor.clone();
        let material = Arc::clone(&self.material);
        let cancel = self.cancel.clone();
        let server_subject = self.config.server_subject();
        let client_subject = self.config.client_subject();
        let require_client_cert = self.auth.public_paths.is_empty();
        let period = self.config.tls.refresh_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }

                match store.load(&client_subject) {
                    Ok(bundle) => {
                        state.upstreams.rotate_client(bundle);
                    }
                    Err(e) => warn!(subject = %client_subject, error = %e, "Keeping previous client certificate"),
                }

                let reloaded = store
                    .load(&server_subject)
                    .and_then(|bundle| Ok((store.crls()?, bundle)))
                    .and_then(|(crls, bundle)| {
                        let next = ListenerMaterial::of(&bundle, &crls);
                        if *material.lock() == next {
                            return Ok(None);
                        }
                        let config = tls::server_config(&bundle, crls, require_client_cert)?;
                        Ok(Some((config, next, bundle.info.serial)))
                    });
                match reloaded {
                    Ok(Some((config, next, serial))) => {
                        acceptor.replace(config);
                        *material.lock() = next;
                        info!(subject = %server_subject, serial, "Listener TLS material reloaded");
                    }
                    Ok(None) => debug!("Listener TLS material unchanged"),
                    Err(e) => error!(subject = %server_subject, error = %e, "Keeping previous listener TLS config"),
                }
            }
        })
    }
}

/// Cancel `token` on Ctrl+C or SIGTERM
pub async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
        () = token.cancelled() => return,
    }

    info!("Shutdown signal received");
    token.cancel();
}
