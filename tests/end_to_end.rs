//! End-to-end router tests
//!
//! Runs a real mesh on loopback: a CA, an mTLS module backend and the
//! router in front of it. Tests:
//! - Forwarding with prefix stripping and caller identity injection
//! - Rejection of callers without a client certificate
//! - Dynamic registration through the registration client
//! - Health-driven refusal and recovery
//! - Retry on a second instance, 502 without one
//! - Streamed downloads and uploads outliving the response deadline
//! - Client certificate rotation reaching the upstream pools

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::routing::{get, post};
use axum::serve::Listener;
use axum::{
    Json, Router,
    http::{HeaderMap, StatusCode, Uri},
};
use bytes::Bytes;
use futures::StreamExt;
use mesh_gateway::Error;
use mesh_gateway::ca::CertificateAuthority;
use mesh_gateway::client::RegistrationClient;
use mesh_gateway::config::{
    CaConfig, Config, GateConfig, HealthCheckConfig, ServerConfig, TlsConfig, UpstreamConfig,
};
use mesh_gateway::registry::{ModuleDescriptor, RegistrationOutcome};
use mesh_gateway::router::probe::probe_once;
use mesh_gateway::router::{AppState, ClientConnection, MeshRouter, MtlsListener, ReloadableAcceptor};
use mesh_gateway::tls::{self, IdentityVerifier};
use mesh_gateway::trust::{CertSubject, TrustStore};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const IDENTITY_HEADER: &str = "x-mesh-client-identity";
const ROUTER_IDENTITY: &str = "admin-router";

/// A running CA + backend + router
struct Mesh {
    _tmp: TempDir,
    ca: CertificateAuthority,
    store: TrustStore,
    url: String,
    state: Arc<AppState>,
    cancel: CancellationToken,
    serving: JoinHandle<mesh_gateway::Result<()>>,
}

fn default_upstream() -> UpstreamConfig {
    UpstreamConfig {
        connect_timeout: Duration::from_secs(2),
        retry_backoff: Duration::from_millis(10),
        ..UpstreamConfig::default()
    }
}

impl Mesh {
    async fn start() -> Self {
        Self::start_with(default_upstream()).await
    }

    async fn start_with(upstream: UpstreamConfig) -> Self {
        let tmp = TempDir::new().unwrap();
        let store = TrustStore::new(tmp.path().join("trust"));
        let ca_config = CaConfig {
            dir: tmp.path().join("ca"),
            ..CaConfig::default()
        };
        let ca = CertificateAuthority::initialize(&ca_config, store.clone()).unwrap();
        for subject in [
            "lcm-service",
            "lcm-service:client",
            "admin-router",
            "admin-router:client",
            "operator:client",
        ] {
            ca.issue(&subject.parse().unwrap()).unwrap();
        }

        let cancel = CancellationToken::new();
        let backend = start_backend(&store, "127.0.0.1:0".parse().unwrap(), cancel.clone()).await;

        let config = Config {
            server: ServerConfig {
                host: "127.0.0.1".into(),
                port: 0,
                shutdown_timeout: Duration::from_secs(1),
                ..ServerConfig::default()
            },
            tls: TlsConfig {
                store_dir: store.root().to_path_buf(),
                refresh_interval: Duration::from_millis(100),
                ..TlsConfig::default()
            },
            ca: ca_config,
            gate: GateConfig {
                timeout: Duration::from_secs(5),
                poll_interval: Duration::from_millis(20),
            },
            health_check: HealthCheckConfig {
                enabled: false,
                timeout: Duration::from_secs(2),
                ..HealthCheckConfig::default()
            },
            upstream,
            modules: vec![ModuleDescriptor {
                id: "lcm".into(),
                prefix: "/admin/v1/modules/lcm".into(),
                address: backend.to_string(),
                cert_identity: "lcm-service".into(),
            }],
            ..Config::default()
        };

        let mut router = MeshRouter::bootstrap(config, cancel.clone()).await.unwrap();
        let addr = router.listen().await.unwrap();
        let state = router.state();
        let serving = tokio::spawn(router.serve());

        Self {
            _tmp: tmp,
            ca,
            store,
            url: format!("https://{addr}"),
            state,
            cancel,
            serving,
        }
    }

    /// HTTP client presenting `subject`'s certificate
    fn client_as(&self, subject: &str) -> reqwest::Client {
        let bundle = self.store.load(&subject.parse().unwrap()).unwrap();
        reqwest::Client::builder()
            .use_preconfigured_tls(tls::client_config(&bundle, ROUTER_IDENTITY).unwrap())
            .no_proxy()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap()
    }

    /// HTTP client that trusts the router but presents no certificate
    fn anonymous_client(&self) -> reqwest::Client {
        let cas = self.store.ca_certificates().unwrap();
        let verifier = IdentityVerifier::new(&cas, ROUTER_IDENTITY, tls::provider()).unwrap();
        let config = rustls::ClientConfig::builder_with_provider(tls::provider())
            .with_protocol_versions(&[&rustls::version::TLS13])
            .unwrap()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_no_client_auth();
        reqwest::Client::builder()
            .use_preconfigured_tls(config)
            .no_proxy()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap()
    }

    fn registration_client(&self, subject: &str) -> RegistrationClient {
        RegistrationClient::from_store(
            &self.store,
            &subject.parse::<CertSubject>().unwrap(),
            &self.url,
            ROUTER_IDENTITY,
            Duration::from_secs(10),
        )
        .unwrap()
    }

    /// Register `id` at `/admin/v1/modules/{id}` straight into the registry
    fn add_instance(&self, id: &str, address: SocketAddr) {
        self.state
            .registry
            .register(&ModuleDescriptor {
                id: id.into(),
                prefix: format!("/admin/v1/modules/{id}"),
                address: address.to_string(),
                cert_identity: "lcm-service".into(),
            })
            .unwrap();
    }

    async fn get(&self, client: &reqwest::Client, path: &str) -> (StatusCode, Value) {
        let response = client.get(format!("{}{path}", self.url)).send().await.unwrap();
        let status = response.status();
        let body = response.json().await.unwrap_or(Value::Null);
        (status, body)
    }
}

impl Drop for Mesh {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Module stand-in: echoes what it received
async fn echo(uri: Uri, headers: HeaderMap) -> Json<Value> {
    Json(json!({
        "path": uri.path(),
        "query": uri.query(),
        "identity": headers.get(IDENTITY_HEADER).and_then(|v| v.to_str().ok()),
    }))
}

/// `chunks` chunks of 1 KiB, `gap` apart
fn slow_chunks(
    chunks: usize,
    gap: Duration,
) -> impl futures::Stream<Item = std::io::Result<Bytes>> + Send + 'static {
    futures::stream::iter(0..chunks).then(move |i| async move {
        if i > 0 {
            tokio::time::sleep(gap).await;
        }
        Ok(Bytes::from(vec![b'x'; 1024]))
    })
}

/// 6 KiB trickled out over 1.5s
async fn download() -> Body {
    Body::from_stream(slow_chunks(6, Duration::from_millis(300)))
}

/// One chunk, then silence for 3s
async fn stall() -> Body {
    Body::from_stream(slow_chunks(2, Duration::from_secs(3)))
}

/// Answers only after 2s
async fn slow() -> Json<Value> {
    tokio::time::sleep(Duration::from_secs(2)).await;
    Json(json!({ "slow": true }))
}

/// Counts the uploaded bytes
async fn upload(body: Body) -> Json<Value> {
    let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
    Json(json!({ "bytes": bytes.len() }))
}

/// Dead address: bound once, then released
fn dead_address() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

/// Serve the echo module over mTLS as `lcm-service` on `addr`
async fn start_backend(store: &TrustStore, addr: SocketAddr, cancel: CancellationToken) -> SocketAddr {
    let bundle = store.load(&"lcm-service".parse().unwrap()).unwrap();
    let acceptor = ReloadableAcceptor::new(tls::server_config(&bundle, Vec::new(), true).unwrap());
    let listener = MtlsListener::bind(addr, acceptor, Duration::from_secs(5))
        .await
        .unwrap();
    let local = listener.local_addr().unwrap();
    let app = Router::new()
        .route("/v1/download", get(download))
        .route("/v1/stall", get(stall))
        .route("/v1/slow", get(slow))
        .route("/v1/upload", post(upload))
        .fallback(echo);
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<ClientConnection>(),
        )
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .unwrap();
    });
    local
}

/// Requests are forwarded with the prefix stripped and the caller named
#[tokio::test]
async fn test_operator_request_reaches_module() {
    let mesh = Mesh::start().await;
    let operator = mesh.client_as("operator:client");

    let (status, body) = mesh
        .get(&operator, "/admin/v1/modules/lcm/v1/certificates?limit=5")
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["path"], "/v1/certificates");
    assert_eq!(body["query"], "limit=5");
    assert_eq!(body["identity"], "operator");
}

/// A caller cannot impersonate another identity through the header
#[tokio::test]
async fn test_spoofed_identity_header_is_replaced() {
    let mesh = Mesh::start().await;
    let operator = mesh.client_as("operator:client");

    let body: Value = operator
        .get(format!("{}/admin/v1/modules/lcm/v1/status", mesh.url))
        .header(IDENTITY_HEADER, "lcm-service")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["identity"], "operator");
}

/// Without a client certificate nothing gets through
#[tokio::test]
async fn test_client_without_certificate_is_refused() {
    let mesh = Mesh::start().await;

    let result = mesh
        .anonymous_client()
        .get(format!("{}/admin/v1/modules/lcm/v1/status", mesh.url))
        .send()
        .await;

    assert!(result.is_err(), "anonymous request succeeded: {result:?}");
}

/// Paths no module claims are 404
#[tokio::test]
async fn test_unknown_module_is_not_found() {
    let mesh = Mesh::start().await;
    let operator = mesh.client_as("operator:client");

    let (status, body) = mesh.get(&operator, "/admin/v1/modules/nope/v1/x").await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"]["message"].is_string());
}

/// The router health endpoint counts registered modules
#[tokio::test]
async fn test_health_reports_modules() {
    let mesh = Mesh::start().await;
    let operator = mesh.client_as("operator:client");

    let (status, body) = mesh.get(&operator, "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["modules"], 1);
}

/// A module registered at runtime is routable and can leave again
#[tokio::test]
async fn test_dynamic_registration_round_trip() {
    let mesh = Mesh::start().await;
    let operator = mesh.client_as("operator:client");
    let lcm = mesh.registration_client("lcm-service:client");
    let backend = mesh.state.registry.get("lcm").unwrap().instances[0].address.clone();
    let ipam = ModuleDescriptor {
        id: "ipam".into(),
        prefix: "/admin/v1/modules/ipam".into(),
        address: backend,
        cert_identity: "lcm-service".into(),
    };

    assert_eq!(lcm.register(&ipam).await.unwrap(), RegistrationOutcome::Created);
    assert_eq!(lcm.register(&ipam).await.unwrap(), RegistrationOutcome::Unchanged);

    let (status, body) = mesh.get(&operator, "/admin/v1/modules/ipam/v1/pools").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["path"], "/v1/pools");

    let listing = lcm.modules().await.unwrap();
    let ids: Vec<&str> = listing["modules"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|m| m["id"].as_str())
        .collect();
    assert_eq!(ids, vec!["ipam", "lcm"]);

    assert!(lcm.deregister("ipam", None).await.unwrap());
    let (status, _) = mesh.get(&operator, "/admin/v1/modules/ipam/v1/pools").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

/// Only the module's own identity or an admin may register it
#[tokio::test]
async fn test_registration_by_stranger_is_forbidden() {
    let mesh = Mesh::start().await;
    let operator = mesh.registration_client("operator:client");

    let err = operator
        .register(&ModuleDescriptor {
            id: "ipam".into(),
            prefix: "/admin/v1/modules/ipam".into(),
            address: "ipam:8443".into(),
            cert_identity: "ipam-service".into(),
        })
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Rejected { status: 403, .. }), "unexpected error: {err}");
    assert!(mesh.state.registry.get("ipam").is_none());
}

/// Three failed probes take a module out of rotation; one success brings it back
#[tokio::test]
async fn test_unhealthy_module_is_refused_until_recovery() {
    let mesh = Mesh::start().await;
    let operator = mesh.client_as("operator:client");
    let dead = dead_address();
    mesh.add_instance("flaky", dead);
    let entry = mesh.state.registry.get("flaky").unwrap();
    let instance = &entry.instances[0];

    for _ in 0..3 {
        assert!(!probe_once(&mesh.state, &entry, instance, &mesh.state.health_check).await);
    }
    let (status, _) = mesh.get(&operator, "/admin/v1/modules/flaky/v1/status").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    start_backend(&mesh.store, dead, mesh.cancel.clone()).await;
    assert!(probe_once(&mesh.state, &entry, instance, &mesh.state.health_check).await);

    let (status, body) = mesh.get(&operator, "/admin/v1/modules/flaky/v1/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["path"], "/v1/status");
}

/// A refused connection is retried on the module's other instance
#[tokio::test]
async fn test_connect_failure_retries_other_instance() {
    let mesh = Mesh::start().await;
    let operator = mesh.client_as("operator:client");
    mesh.add_instance("lcm", dead_address());
    assert_eq!(mesh.state.registry.get("lcm").unwrap().instances.len(), 2);

    // Round robin puts the dead instance first for some of these.
    for _ in 0..4 {
        let (status, body) = mesh.get(&operator, "/admin/v1/modules/lcm/v1/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["path"], "/v1/status");
    }
}

/// With no instance left to try the caller gets 502
#[tokio::test]
async fn test_single_dead_instance_is_bad_gateway() {
    let mesh = Mesh::start().await;
    let operator = mesh.client_as("operator:client");
    mesh.add_instance("gone", dead_address());

    let (status, body) = mesh.get(&operator, "/admin/v1/modules/gone/v1/status").await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"]["code"], "upstream_unavailable");
}

fn tight_deadlines() -> UpstreamConfig {
    UpstreamConfig {
        response_timeout: Duration::from_secs(1),
        body_idle_timeout: Duration::from_secs(1),
        ..default_upstream()
    }
}

/// A download that trickles in for longer than the deadline arrives whole
#[tokio::test]
async fn test_slow_download_is_relayed_completely() {
    let mesh = Mesh::start_with(tight_deadlines()).await;
    let operator = mesh.client_as("operator:client");

    let response = operator
        .get(format!("{}/admin/v1/modules/lcm/v1/download", mesh.url))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.bytes().await.unwrap().len(), 6 * 1024);
}

/// A streamed upload may take longer than the response deadline
#[tokio::test]
async fn test_slow_upload_is_streamed_through() {
    let mesh = Mesh::start_with(tight_deadlines()).await;
    let operator = mesh.client_as("operator:client");

    let response = operator
        .post(format!("{}/admin/v1/modules/lcm/v1/upload", mesh.url))
        .body(reqwest::Body::wrap_stream(slow_chunks(6, Duration::from_millis(300))))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["bytes"], 6 * 1024);
}

/// A module that goes quiet mid-body has its response cut off
#[tokio::test]
async fn test_stalled_download_is_cut_off() {
    let mesh = Mesh::start_with(tight_deadlines()).await;
    let operator = mesh.client_as("operator:client");

    let response = operator
        .get(format!("{}/admin/v1/modules/lcm/v1/stall", mesh.url))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.bytes().await.is_err());
}

/// A module that never answers a buffered request yields 502
#[tokio::test]
async fn test_missing_response_headers_time_out() {
    let mesh = Mesh::start_with(tight_deadlines()).await;
    let operator = mesh.client_as("operator:client");

    let (status, body) = mesh.get(&operator, "/admin/v1/modules/lcm/v1/slow").await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"]["code"], "upstream_unavailable");
}

/// A reissued router client certificate is picked up by the refresh task
#[tokio::test]
async fn test_client_certificate_rotation_reaches_pools() {
    let mesh = Mesh::start().await;
    let operator = mesh.client_as("operator:client");
    let (status, _) = mesh.get(&operator, "/admin/v1/modules/lcm/v1/status").await;
    assert_eq!(status, StatusCode::OK);
    let before = mesh.state.upstreams.client_fingerprint();

    let subject: CertSubject = "admin-router:client".parse().unwrap();
    mesh.ca.revoke(&subject).unwrap();
    let renewed = mesh.ca.issue(&subject).unwrap();
    assert_ne!(renewed.fingerprint, before);

    tokio::time::timeout(Duration::from_secs(5), async {
        while mesh.state.upstreams.client_fingerprint() != renewed.fingerprint {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("refresh task did not rotate the client certificate");

    let (status, body) = mesh.get(&operator, "/admin/v1/modules/lcm/v1/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["identity"], "operator");
}

/// Cancelling the token stops the router within the drain timeout
#[tokio::test]
async fn test_router_stops_on_cancel() {
    let mut mesh = Mesh::start().await;
    let operator = mesh.client_as("operator:client");
    let (status, _) = mesh.get(&operator, "/health").await;
    assert_eq!(status, StatusCode::OK);

    mesh.cancel.cancel();
    let stopped = tokio::time::timeout(Duration::from_secs(5), &mut mesh.serving)
        .await
        .expect("router did not stop");

    assert!(stopped.unwrap().is_ok());
}
