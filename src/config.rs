//! Configuration management

use std::{path::Path, path::PathBuf, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::ca::KeyAlgorithm;
use crate::registry::{ModuleDescriptor, prefix};
use crate::trust::{CertSubject, Role};
use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Router listener configuration
    pub server: ServerConfig,
    /// Trust store and the router's own identity
    pub tls: TlsConfig,
    /// Certificate authority configuration
    pub ca: CaConfig,
    /// Startup gate configuration
    pub gate: GateConfig,
    /// Module registry configuration
    pub registry: RegistryConfig,
    /// Module health probing
    pub health_check: HealthCheckConfig,
    /// Upstream connection pooling
    pub upstream: UpstreamConfig,
    /// Statically registered modules
    pub modules: Vec<ModuleDescriptor>,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // MESH_GATEWAY_SERVER__PORT=9443 -> server.port
        figment = figment.merge(Env::prefixed("MESH_GATEWAY_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints serde cannot express
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.ca.leaf_validity <= self.ca.renew_before {
            return Err(Error::Config(
                "ca.leaf_validity must be longer than ca.renew_before".into(),
            ));
        }
        if self.ca.root_validity_days == 0 {
            return Err(Error::Config("ca.root_validity_days must be > 0".into()));
        }
        if self.ca.trust_domain.is_empty() {
            return Err(Error::Config("ca.trust_domain must not be empty".into()));
        }
        if self.gate.poll_interval.is_zero() {
            return Err(Error::Config("gate.poll_interval must be > 0".into()));
        }
        if self.health_check.unhealthy_threshold == 0 {
            return Err(Error::Config(
                "health_check.unhealthy_threshold must be >= 1".into(),
            ));
        }
        if self.upstream.response_timeout.is_zero() || self.upstream.body_idle_timeout.is_zero() {
            return Err(Error::Config(
                "upstream.response_timeout and upstream.body_idle_timeout must be > 0".into(),
            ));
        }
        if self.upstream.max_connections_per_module == 0 {
            return Err(Error::Config(
                "upstream.max_connections_per_module must be >= 1".into(),
            ));
        }
        prefix::validate_root(&self.registry.module_root)?;
        for subject in &self.ca.identities {
            subject.validate()?;
        }
        Ok(())
    }

    /// Subject whose bundle the router terminates TLS with
    #[must_use]
    pub fn server_subject(&self) -> CertSubject {
        CertSubject::new(&self.tls.identity, Role::Server)
    }

    /// Subject whose bundle the router presents to modules
    #[must_use]
    pub fn client_subject(&self) -> CertSubject {
        CertSubject::new(&self.tls.identity, Role::Client)
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Graceful shutdown timeout
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Maximum TLS handshake duration before the connection is dropped
    #[serde(with = "humantime_serde")]
    pub handshake_timeout: Duration,
    /// Maximum request body size for registry endpoints (bytes)
    pub max_body_size: usize,
    /// Paths reachable without a client certificate.
    ///
    /// Empty (the default) makes the TLS handshake itself require a client
    /// certificate.
    pub public_paths: Vec<String>,
    /// Header carrying the authenticated caller to modules
    pub identity_header: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8443,
            shutdown_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            max_body_size: 1024 * 1024,
            public_paths: Vec::new(),
            identity_header: "x-mesh-client-identity".to_string(),
        }
    }
}

/// Trust store location and the router's own identity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Shared trust store root
    pub store_dir: PathBuf,
    /// Certificate identity of this router
    pub identity: String,
    /// How often the router reloads its own bundles
    #[serde(with = "humantime_serde")]
    pub refresh_interval: Duration,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            store_dir: PathBuf::from("/var/lib/mesh/trust"),
            identity: "admin-router".to_string(),
            refresh_interval: Duration::from_secs(60),
        }
    }
}

/// Certificate authority configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaConfig {
    /// Directory holding the root key, certificate, serial and CRL
    pub dir: PathBuf,
    /// Common name of the root certificate
    pub common_name: String,
    /// SPIFFE trust domain for leaf URI SANs
    pub trust_domain: String,
    /// Key algorithm for the root and every leaf
    pub key_algorithm: KeyAlgorithm,
    /// Root certificate validity in days
    pub root_validity_days: u32,
    /// Leaf certificate validity
    #[serde(with = "humantime_serde")]
    pub leaf_validity: Duration,
    /// Re-issue a leaf once its remaining validity drops below this
    #[serde(with = "humantime_serde")]
    pub renew_before: Duration,
    /// Lifetime of a generated CRL
    #[serde(with = "humantime_serde")]
    pub crl_validity: Duration,
    /// Extra DNS names or IP addresses added to every leaf
    pub extra_sans: Vec<String>,
    /// Subjects issued by `ca bootstrap`
    pub identities: Vec<CertSubject>,
}

impl Default for CaConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/var/lib/mesh/ca"),
            common_name: "Mesh Root CA".to_string(),
            trust_domain: "mesh.local".to_string(),
            key_algorithm: KeyAlgorithm::default(),
            root_validity_days: 3650,
            leaf_validity: Duration::from_secs(90 * 86_400),
            renew_before: Duration::from_secs(30 * 86_400),
            crl_validity: Duration::from_secs(7 * 86_400),
            extra_sans: Vec::new(),
            identities: Vec::new(),
        }
    }
}

/// Startup gate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Give up after this long
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Delay between readiness checks
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Module registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Every module prefix must live strictly under this path
    pub module_root: String,
    /// Identities allowed to register or remove any module
    pub admin_identities: Vec<String>,
    /// Number of prefix conflicts kept for inspection
    pub conflict_history: usize,
    /// Remove an entry after this many consecutive failures on every
    /// instance (0 disables eviction)
    pub evict_after: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            module_root: "/admin/v1/modules".to_string(),
            admin_identities: vec!["lcm-service".to_string()],
            conflict_history: 64,
            evict_after: 0,
        }
    }
}

/// Module health probing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Enable the background probe loop
    pub enabled: bool,
    /// Probe interval
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Per-probe timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Path probed on each instance
    pub path: String,
    /// Consecutive failures before an instance is unhealthy
    pub unhealthy_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(5),
            path: "/health".to_string(),
            unhealthy_threshold: 3,
        }
    }
}

/// Upstream connection pooling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// In-flight requests allowed per module
    pub max_connections_per_module: usize,
    /// How long a request waits for a pool slot
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Duration,
    /// TCP + TLS connect timeout
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Idle pooled connections are closed after this long
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    /// How long a module may take to send response headers. Requests with a
    /// streamed body are exempt, their upload time is unbounded.
    #[serde(with = "humantime_serde")]
    pub response_timeout: Duration,
    /// Longest pause between two chunks of a relayed response body
    #[serde(with = "humantime_serde")]
    pub body_idle_timeout: Duration,
    /// Delay before retrying on another instance
    #[serde(with = "humantime_serde")]
    pub retry_backoff: Duration,
    /// Request bodies up to this size are buffered so they can be replayed
    pub replay_buffer_limit: usize,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            max_connections_per_module: 64,
            acquire_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(90),
            response_timeout: Duration::from_secs(60),
            body_idle_timeout: Duration::from_secs(60),
            retry_backoff: Duration::from_millis(100),
            replay_buffer_limit: 64 * 1024,
        }
    }
}

/// Human-readable duration serialization
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to the largest exact unit (e.g., "30s", "5m", "90d")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format(*duration))
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "100ms", "2h", "90d")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    /// Parse a duration string; a bare number is seconds
    ///
    /// # Errors
    ///
    /// Returns a message describing the malformed input.
    pub fn parse(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        // "ms" must be checked before "m" and "s".
        let (digits, unit_ms) = if let Some(v) = s.strip_suffix("ms") {
            (v, 1)
        } else if let Some(v) = s.strip_suffix('s') {
            (v, 1_000)
        } else if let Some(v) = s.strip_suffix('m') {
            (v, 60_000)
        } else if let Some(v) = s.strip_suffix('h') {
            (v, 3_600_000)
        } else if let Some(v) = s.strip_suffix('d') {
            (v, 86_400_000)
        } else {
            (s, 1_000)
        };
        let n = digits
            .trim()
            .parse::<u64>()
            .map_err(|e| format!("invalid duration '{s}': {e}"))?;
        n.checked_mul(unit_ms)
            .map(Duration::from_millis)
            .ok_or_else(|| format!("duration '{s}' overflows"))
    }

    fn format(d: Duration) -> String {
        let ms = d.as_millis();
        for (unit, size) in [("d", 86_400_000), ("h", 3_600_000), ("m", 60_000), ("s", 1_000)] {
            if ms >= size && ms % size == 0 {
                return format!("{}{unit}", ms / size);
            }
        }
        format!("{ms}ms")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn durations_accept_every_unit() {
        assert_eq!(humantime_serde::parse("100ms"), Ok(Duration::from_millis(100)));
        assert_eq!(humantime_serde::parse("30s"), Ok(Duration::from_secs(30)));
        assert_eq!(humantime_serde::parse("5m"), Ok(Duration::from_secs(300)));
        assert_eq!(humantime_serde::parse("2h"), Ok(Duration::from_secs(7200)));
        assert_eq!(
            humantime_serde::parse("90d"),
            Ok(Duration::from_secs(90 * 86_400))
        );
        assert_eq!(humantime_serde::parse("15"), Ok(Duration::from_secs(15)));
        assert!(humantime_serde::parse("soon").is_err());
    }

    #[test]
    fn defaults_validate() {
        // GIVEN: a default-constructed config
        let config = Config::default();
        // WHEN/THEN: it passes validation with a strict handshake
        config.validate().unwrap();
        assert!(config.server.public_paths.is_empty());
        assert_eq!(config.health_check.unhealthy_threshold, 3);
    }

    #[test]
    fn renewal_window_must_be_shorter_than_validity() {
        let mut config = Config::default();
        config.ca.renew_before = config.ca.leaf_validity;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("renew_before"));
    }

    #[test]
    fn upstream_deadlines_must_be_positive() {
        let mut config = Config::default();
        config.upstream.body_idle_timeout = Duration::ZERO;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("body_idle_timeout"));
    }

    #[test]
    fn yaml_file_is_loaded_with_modules_and_identities() {
        // GIVEN: a config file with custom values
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mesh.yaml");
        let mut f = std::fs::File::create(&path).unwrap();
        write!(
            f,
            r#"
server:
  port: 9443
  public_paths: ["/health"]
ca:
  leaf_validity: 30d
  renew_before: 7d
  key_algorithm: ed25519
  identities: ["lcm-service", "admin-router:client"]
gate:
  poll_interval: 250ms
modules:
  - id: ipam
    prefix: /admin/v1/modules/ipam
    address: 10.0.0.5:8443
    cert_identity: ipam-service
"#
        )
        .unwrap();
        drop(f);

        // WHEN: loading it
        let config = Config::load(Some(&path)).unwrap();

        // THEN: values are parsed, defaults fill the rest
        assert_eq!(config.server.port, 9443);
        assert_eq!(config.server.public_paths, vec!["/health".to_string()]);
        assert_eq!(config.ca.key_algorithm, KeyAlgorithm::Ed25519);
        assert_eq!(config.ca.leaf_validity, Duration::from_secs(30 * 86_400));
        assert_eq!(config.gate.poll_interval, Duration::from_millis(250));
        assert_eq!(config.gate.timeout, Duration::from_secs(120));
        assert_eq!(
            config.ca.identities,
            vec![
                CertSubject::new("lcm-service", Role::Server),
                CertSubject::new("admin-router", Role::Client),
            ]
        );
        assert_eq!(config.modules.len(), 1);
        assert_eq!(config.modules[0].cert_identity, "ipam-service");
    }

    #[test]
    fn health_check_section_parses_durations() {
        let yaml = r#"
enabled: false
interval: 2s
path: /ready
"#;
        let hc: HealthCheckConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(!hc.enabled);
        assert_eq!(hc.interval, Duration::from_secs(2));
        assert_eq!(hc.timeout, Duration::from_secs(5));
        assert_eq!(hc.path, "/ready");
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let err = Config::load(Some(Path::new("/nonexistent/mesh.yaml"))).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn router_subjects_follow_tls_identity() {
        let config = Config::default();
        assert_eq!(config.server_subject().to_string(), "admin-router:server");
        assert_eq!(config.client_subject().to_string(), "admin-router:client");
    }
}
