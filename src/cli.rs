//! Command-line interface

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::config::humantime_serde;
use crate::trust::CertSubject;

/// Mesh gateway: certificate authority, startup gate and dynamic mTLS router
#[derive(Parser, Debug)]
#[command(name = "mesh-gateway")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "MESH_GATEWAY_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "MESH_GATEWAY_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "MESH_GATEWAY_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (defaults to `serve`)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the router (default)
    Serve(ServeArgs),

    /// Certificate authority commands
    #[command(subcommand)]
    Ca(CaCommand),

    /// Block until certificates are published; exits non-zero on timeout
    Wait(WaitArgs),

    /// Register a module instance with a running router
    Register(RegisterArgs),

    /// Remove a module (or one instance) from a running router
    Deregister(DeregisterArgs),
}

/// `serve` options
#[derive(Args, Debug, Default)]
pub struct ServeArgs {
    /// Port to listen on
    #[arg(short, long, env = "MESH_GATEWAY_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "MESH_GATEWAY_HOST")]
    pub host: Option<String>,
}

/// CA subcommands
#[derive(Subcommand, Debug)]
pub enum CaCommand {
    /// Create the root (or validate an existing one) and publish it
    Init,

    /// Issue (or reuse) a leaf certificate
    Issue {
        /// Subject as `identity` or `identity:role`
        #[arg(required = true)]
        subject: CertSubject,

        /// Leaf validity (e.g. "30d"); defaults to `ca.leaf_validity`
        #[arg(long, value_parser = parse_duration)]
        validity: Option<Duration>,
    },

    /// Issue every subject listed in `ca.identities`
    Bootstrap,

    /// Revoke a subject's certificate and republish the CRL
    Revoke {
        /// Subject as `identity` or `identity:role`
        #[arg(required = true)]
        subject: CertSubject,
    },

    /// Show the root certificate and revoked serials
    Status {
        /// Output format (text, json, yaml)
        #[arg(short, long, default_value = "text", value_parser = ["text", "json", "yaml"])]
        format: String,
    },
}

/// `wait` options
#[derive(Args, Debug)]
pub struct WaitArgs {
    /// Subjects to wait for; defaults to the router's own server and client
    #[arg(short, long = "subject")]
    pub subjects: Vec<CertSubject>,

    /// Give up after this long; defaults to `gate.timeout`
    #[arg(long, value_parser = parse_duration)]
    pub timeout: Option<Duration>,

    /// Delay between checks; defaults to `gate.poll_interval`
    #[arg(long, value_parser = parse_duration)]
    pub poll_interval: Option<Duration>,
}

/// Router connection shared by `register` and `deregister`
#[derive(Args, Debug)]
pub struct RouterArgs {
    /// Router base URL
    #[arg(long, env = "MESH_GATEWAY_ROUTER_URL", default_value = "https://admin-router:8443")]
    pub router_url: String,

    /// Identity the router's server certificate must carry
    #[arg(long, default_value = "admin-router")]
    pub router_identity: String,

    /// Client subject whose published bundle authenticates this call
    #[arg(long = "as", value_name = "SUBJECT")]
    pub caller: CertSubject,

    /// Per-request timeout
    #[arg(long, default_value = "10s", value_parser = parse_duration)]
    pub timeout: Duration,
}

/// `register` options
#[derive(Args, Debug)]
pub struct RegisterArgs {
    /// Module id
    #[arg(long)]
    pub id: String,

    /// Routing prefix, e.g. `/admin/v1/modules/ipam`
    #[arg(long)]
    pub prefix: String,

    /// Backend `host:port`
    #[arg(long)]
    pub address: String,

    /// Identity of the backend's server certificate
    #[arg(long)]
    pub cert_identity: String,

    /// Retry transient failures this many times
    #[arg(long, default_value_t = 10)]
    pub retries: usize,

    #[command(flatten)]
    pub router: RouterArgs,
}

/// `deregister` options
#[derive(Args, Debug)]
pub struct DeregisterArgs {
    /// Module id
    #[arg(long)]
    pub id: String,

    /// Remove only this instance
    #[arg(long)]
    pub address: Option<String>,

    #[command(flatten)]
    pub router: RouterArgs,
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    humantime_serde::parse(s)
}
