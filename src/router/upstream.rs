//! Upstream connection pools.
//!
//! One pool per module: a reqwest client that presents the router's client
//! certificate and pins the module's expected server identity, plus a
//! semaphore bounding in-flight requests. Rotating the client certificate
//! drops every pool; requests already holding a pool finish on it while new
//! requests handshake with the new material.

use std::sync::Arc;

use arc_swap::ArcSwap;
use axum::http::{HeaderMap, HeaderName, HeaderValue, header};
use dashmap::DashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

use crate::config::UpstreamConfig;
use crate::registry::{ModuleEntry, ModuleRegistry};
use crate::tls;
use crate::trust::{PeerIdentity, PublishedBundle};
use crate::{Error, Result};

/// Headers that describe one hop and never cross the router
static HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Pooled client for one module
#[derive(Debug)]
pub struct ModulePool {
    /// HTTP client pinned to the module identity
    pub client: reqwest::Client,
    /// Identity the pool was built for
    pub cert_identity: String,
    permits: Arc<Semaphore>,
}

impl ModulePool {
    /// Wait for an in-flight slot; `None` once `timeout` passes
    pub async fn acquire(&self, timeout: std::time::Duration) -> Option<OwnedSemaphorePermit> {
        tokio::time::timeout(timeout, self.permits.clone().acquire_owned())
            .await
            .ok()?
            .ok()
    }

    /// Free in-flight slots
    #[must_use]
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

/// Per-module pools sharing the router's client certificate
#[derive(Debug)]
pub struct UpstreamPools {
    config: UpstreamConfig,
    client_bundle: ArcSwap<PublishedBundle>,
    pools: DashMap<String, Arc<ModulePool>>,
}

impl UpstreamPools {
    /// Pools presenting `client_bundle`
    #[must_use]
    pub fn new(config: UpstreamConfig, client_bundle: PublishedBundle) -> Self {
        Self {
            config,
            client_bundle: ArcSwap::from_pointee(client_bundle),
            pools: DashMap::new(),
        }
    }

    /// Upstream settings
    #[must_use]
    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    /// Fingerprint of the client certificate currently presented
    #[must_use]
    pub fn client_fingerprint(&self) -> String {
        self.client_bundle.load().info.fingerprint.clone()
    }

    /// Pool for `entry`, built on first use
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS config or HTTP client cannot be built.
    pub fn pool(&self, entry: &ModuleEntry) -> Result<Arc<ModulePool>> {
        if let Some(pool) = self
            .pools
            .get(&entry.id)
            .filter(|p| p.cert_identity == entry.cert_identity)
        {
            return Ok(Arc::clone(&pool));
        }

        let bundle = self.client_bundle.load();
        let tls = tls::client_config(&bundle, &entry.cert_identity)?;
        let client = reqwest::Client::builder()
            .use_preconfigured_tls(tls)
            .connect_timeout(self.config.connect_timeout)
            .pool_idle_timeout(self.config.idle_timeout)
            .pool_max_idle_per_host(self.config.max_connections_per_module)
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .http1_only()
            .build()?;
        let pool = Arc::new(ModulePool {
            client,
            cert_identity: entry.cert_identity.clone(),
            permits: Arc::new(Semaphore::new(self.config.max_connections_per_module)),
        });
        self.pools.insert(entry.id.clone(), Arc::clone(&pool));
        debug!(module = %entry.id, identity = %entry.cert_identity, "Upstream pool created");
        Ok(pool)
    }

    /// Present a new client certificate. Returns `true` and drops every
    /// pool if the fingerprint changed.
    pub fn rotate_client(&self, bundle: PublishedBundle) -> bool {
        if bundle.info.fingerprint == self.client_bundle.load().info.fingerprint {
            return false;
        }
        info!(
            serial = bundle.info.serial,
            fingerprint = %bundle.info.fingerprint,
            pools = self.pools.len(),
            "Client certificate rotated, dropping upstream pools"
        );
        self.client_bundle.store(Arc::new(bundle));
        self.pools.clear();
        true
    }

    /// Drop the pool of one module
    pub fn invalidate(&self, module_id: &str) {
        self.pools.remove(module_id);
    }

    /// Drop pools of modules no longer registered
    pub fn prune(&self, registry: &ModuleRegistry) {
        self.pools.retain(|id, _| registry.get(id).is_some());
    }

    /// Number of live pools
    #[must_use]
    pub fn len(&self) -> usize {
        self.pools.len()
    }

    /// Whether no pool exists
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }
}

/// Names listed in `Connection` plus the fixed hop-by-hop set
fn hop_by_hop(headers: &HeaderMap) -> Vec<HeaderName> {
    let mut names = HOP_BY_HOP.to_vec();
    for value in headers.get_all(header::CONNECTION) {
        if let Ok(list) = value.to_str() {
            names.extend(
                list.split(',')
                    .filter_map(|n| HeaderName::from_bytes(n.trim().as_bytes()).ok()),
            );
        }
    }
    names
}

/// Headers sent to a module: hop-by-hop, `host` and `content-length`
/// dropped, any inbound identity header replaced by the caller's identity.
#[must_use]
pub fn request_headers(
    inbound: &HeaderMap,
    identity_header: &HeaderName,
    caller: Option<&PeerIdentity>,
) -> HeaderMap {
    let mut headers = inbound.clone();
    for name in hop_by_hop(inbound) {
        headers.remove(name);
    }
    headers.remove(header::HOST);
    headers.remove(header::CONTENT_LENGTH);
    headers.remove(identity_header);
    if let Some(value) = caller.and_then(|c| HeaderValue::from_str(c.identity()).ok()) {
        headers.insert(identity_header.clone(), value);
    }
    headers
}

/// Headers relayed back to the caller
#[must_use]
pub fn response_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = upstream.clone();
    for name in hop_by_hop(upstream) {
        headers.remove(name);
    }
    headers
}

/// Parse the configured identity header name
///
/// # Errors
///
/// Returns `Error::Config` if the name is not a valid header name.
pub fn identity_header(name: &str) -> Result<HeaderName> {
    HeaderName::from_bytes(name.to_ascii_lowercase().as_bytes())
        .map_err(|e| Error::Config(format!("invalid identity header '{name}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::CertificateAuthority;
    use crate::config::{CaConfig, RegistryConfig};
    use crate::registry::ModuleDescriptor;
    use crate::trust::{CertSubject, Role, TrustStore};
    use std::time::Duration;

    struct Fixture {
        _tmp: tempfile::TempDir,
        ca: CertificateAuthority,
        store: TrustStore,
        subject: CertSubject,
        entry: Arc<ModuleEntry>,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let store = TrustStore::new(tmp.path().join("trust"));
        let ca_config = CaConfig {
            dir: tmp.path().join("ca"),
            ..CaConfig::default()
        };
        let ca = CertificateAuthority::initialize(&ca_config, store.clone()).unwrap();
        let subject = CertSubject::new("admin-router", Role::Client);
        ca.issue(&subject).unwrap();

        let registry = ModuleRegistry::new(&RegistryConfig::default(), 3);
        registry
            .register(&ModuleDescriptor {
                id: "lcm".into(),
                prefix: "/admin/v1/modules/lcm".into(),
                address: "lcm:8443".into(),
                cert_identity: "lcm-service".into(),
            })
            .unwrap();
        let entry = registry.get("lcm").unwrap();
        Fixture {
            _tmp: tmp,
            ca,
            store,
            subject,
            entry,
        }
    }

    #[tokio::test]
    async fn rotation_drops_pools_only_for_new_material() {
        // GIVEN: a pool built with the first client certificate
        let f = fixture();
        let pools = UpstreamPools::new(UpstreamConfig::default(), f.store.load(&f.subject).unwrap());
        let first = pools.pool(&f.entry).unwrap();
        assert!(Arc::ptr_eq(&first, &pools.pool(&f.entry).unwrap()));

        // WHEN: the same bundle is offered again
        // THEN: nothing changes
        assert!(!pools.rotate_client(f.store.load(&f.subject).unwrap()));
        assert_eq!(pools.len(), 1);

        // WHEN: the certificate is replaced
        let before = pools.client_fingerprint();
        f.ca.revoke(&f.subject).unwrap();
        f.ca.issue(&f.subject).unwrap();
        assert!(pools.rotate_client(f.store.load(&f.subject).unwrap()));

        // THEN: pools are rebuilt with the new material
        assert!(pools.is_empty());
        assert_ne!(pools.client_fingerprint(), before);
        assert!(!Arc::ptr_eq(&first, &pools.pool(&f.entry).unwrap()));
    }

    #[tokio::test]
    async fn exhausted_pool_times_out_until_a_slot_frees() {
        let f = fixture();
        let config = UpstreamConfig {
            max_connections_per_module: 1,
            ..UpstreamConfig::default()
        };
        let pools = UpstreamPools::new(config, f.store.load(&f.subject).unwrap());
        let pool = pools.pool(&f.entry).unwrap();

        let held = pool.acquire(Duration::from_millis(50)).await.unwrap();
        assert_eq!(pool.available(), 0);
        assert!(pool.acquire(Duration::from_millis(50)).await.is_none());

        drop(held);
        assert!(pool.acquire(Duration::from_millis(50)).await.is_some());
    }

    fn caller(cn: &str) -> PeerIdentity {
        PeerIdentity {
            common_name: Some(cn.into()),
            display_name: cn.into(),
            ..PeerIdentity::default()
        }
    }

    #[test]
    fn spoofed_identity_header_is_replaced() {
        // GIVEN: an inbound request claiming to be the LCM
        let name = identity_header("X-Mesh-Client-Identity").unwrap();
        let mut inbound = HeaderMap::new();
        inbound.insert(name.clone(), HeaderValue::from_static("lcm-service"));
        inbound.insert(header::ACCEPT, HeaderValue::from_static("application/json"));

        // WHEN: forwarding for the real caller
        let out = request_headers(&inbound, &name, Some(&caller("operator")));

        // THEN: only the authenticated identity reaches the module
        let values: Vec<_> = out.get_all(&name).iter().collect();
        assert_eq!(values, vec![HeaderValue::from_static("operator")]);
        assert_eq!(out[header::ACCEPT], "application/json");
    }

    #[test]
    fn anonymous_caller_gets_no_identity_header() {
        let name = identity_header("x-mesh-client-identity").unwrap();
        let mut inbound = HeaderMap::new();
        inbound.insert(name.clone(), HeaderValue::from_static("lcm-service"));
        let out = request_headers(&inbound, &name, None);
        assert!(out.get(&name).is_none());
    }

    #[test]
    fn hop_by_hop_and_connection_listed_headers_are_dropped() {
        let mut inbound = HeaderMap::new();
        inbound.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, x-trace-hop"));
        inbound.insert("x-trace-hop", HeaderValue::from_static("1"));
        inbound.insert(header::HOST, HeaderValue::from_static("router:8443"));
        inbound.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        inbound.insert("x-request-id", HeaderValue::from_static("abc"));

        let name = identity_header("x-mesh-client-identity").unwrap();
        let out = request_headers(&inbound, &name, None);

        assert!(out.get(header::CONNECTION).is_none());
        assert!(out.get("x-trace-hop").is_none());
        assert!(out.get(header::HOST).is_none());
        assert!(out.get(header::TRANSFER_ENCODING).is_none());
        assert_eq!(out["x-request-id"], "abc");
    }

    #[test]
    fn response_keeps_content_headers() {
        let mut upstream = HeaderMap::new();
        upstream.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        upstream.insert(header::CONTENT_LENGTH, HeaderValue::from_static("2"));
        upstream.insert(header::CONNECTION, HeaderValue::from_static("close"));
        let out = response_headers(&upstream);
        assert_eq!(out[header::CONTENT_LENGTH], "2");
        assert!(out.get(header::CONNECTION).is_none());
    }

    #[test]
    fn invalid_identity_header_name_is_config_error() {
        assert!(matches!(identity_header("bad header"), Err(Error::Config(_))));
    }
}
