//! Mesh Gateway - CA-backed mTLS bootstrap and dynamic module router

use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use mesh_gateway::{
    ca::CertificateAuthority,
    cli::{CaCommand, Cli, Command, DeregisterArgs, RegisterArgs, RouterArgs, ServeArgs, WaitArgs},
    client::{RegistrationClient, RetryPolicy},
    config::Config,
    gate::wait_for_certificates,
    registry::ModuleDescriptor,
    router::{MeshRouter, server::shutdown_signal},
    setup_tracing,
    trust::TrustStore,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Some(Command::Ca(cmd)) => run_ca_command(&config, cmd),
        Some(Command::Wait(args)) => run_wait(&config, args).await,
        Some(Command::Register(args)) => run_register(&config, args).await,
        Some(Command::Deregister(args)) => run_deregister(&config, args).await,
        Some(Command::Serve(args)) => run_server(config, args).await,
        None => run_server(config, ServeArgs::default()).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Run the router
async fn run_server(mut config: Config, args: ServeArgs) -> anyhow::Result<()> {
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(host) = args.host {
        config.server.host = host;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        identity = %config.tls.identity,
        static_modules = config.modules.len(),
        "Starting mesh gateway"
    );

    MeshRouter::run(config).await.context("router failed")?;
    info!("Router shutdown complete");
    Ok(())
}

/// Run certificate authority commands
fn run_ca_command(config: &Config, cmd: CaCommand) -> anyhow::Result<()> {
    let store = TrustStore::new(&config.tls.store_dir);
    let ca = CertificateAuthority::initialize(&config.ca, store)
        .context("failed to initialize certificate authority")?;

    match cmd {
        CaCommand::Init => {
            let info = ca.ca_info();
            println!("CA ready: {}", config.ca.dir.display());
            println!("  subject:     {}", info.common_name.as_deref().unwrap_or("-"));
            println!("  fingerprint: {}", info.fingerprint);
            println!("  not after:   {}", info.not_after);
        }
        CaCommand::Issue { subject, validity } => {
            let issued = match validity {
                Some(v) => ca.issue_with_validity(&subject, v),
                None => ca.issue(&subject),
            }
            .with_context(|| format!("failed to issue {subject}"))?;
            println!(
                "{} serial={} not_after={} fingerprint={}",
                issued.subject, issued.serial, issued.not_after, issued.fingerprint
            );
        }
        CaCommand::Bootstrap => {
            let issued = ca.bootstrap().context("bootstrap failed")?;
            for cert in &issued {
                println!("{} serial={} not_after={}", cert.subject, cert.serial, cert.not_after);
            }
            println!("{} certificate(s) published", issued.len());
        }
        CaCommand::Revoke { subject } => {
            let entry = ca
                .revoke(&subject)
                .with_context(|| format!("failed to revoke {subject}"))?;
            println!("revoked {} serial={}", entry.subject, entry.serial);
        }
        CaCommand::Status { format } => {
            let revoked = ca.revoked();
            let status = serde_json::json!({
                "fingerprint": ca.ca_info().fingerprint,
                "not_after": ca.ca_info().not_after,
                "revoked": revoked,
            });
            match format.as_str() {
                "json" => println!("{}", serde_json::to_string_pretty(&status)?),
                "yaml" => print!("{}", serde_yaml::to_string(&status)?),
                _ => {
                    println!("fingerprint: {}", ca.ca_info().fingerprint);
                    println!("not after:   {}", ca.ca_info().not_after);
                    println!("revoked:     {}", revoked.len());
                    for entry in revoked {
                        println!("  {} serial={} at={}", entry.subject, entry.serial, entry.revoked_at);
                    }
                }
            }
        }
    }
    Ok(())
}

/// Block until the requested subjects are published
async fn run_wait(config: &Config, args: WaitArgs) -> anyhow::Result<()> {
    let store = TrustStore::new(&config.tls.store_dir);
    let subjects = if args.subjects.is_empty() {
        vec![config.server_subject(), config.client_subject()]
    } else {
        args.subjects
    };
    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    wait_for_certificates(
        &store,
        &subjects,
        args.timeout.unwrap_or(config.gate.timeout),
        args.poll_interval.unwrap_or(config.gate.poll_interval),
        &cancel,
    )
    .await?;
    Ok(())
}

fn registration_client(config: &Config, router: &RouterArgs) -> anyhow::Result<RegistrationClient> {
    let store = TrustStore::new(&config.tls.store_dir);
    RegistrationClient::from_store(
        &store,
        &router.caller,
        &router.router_url,
        &router.router_identity,
        router.timeout,
    )
    .with_context(|| format!("cannot build client for {}", router.caller))
}

/// Register a module instance
async fn run_register(config: &Config, args: RegisterArgs) -> anyhow::Result<()> {
    let client = registration_client(config, &args.router)?;
    let descriptor = ModuleDescriptor {
        id: args.id,
        prefix: args.prefix,
        address: args.address,
        cert_identity: args.cert_identity,
    };
    let outcome = client
        .register_with_retry(
            &descriptor,
            RetryPolicy {
                max_retries: args.retries,
                ..RetryPolicy::default()
            },
        )
        .await
        .with_context(|| format!("registration of '{}' failed", descriptor.id))?;
    println!("{}: {outcome:?}", descriptor.id);
    Ok(())
}

/// Remove a module or one instance
async fn run_deregister(config: &Config, args: DeregisterArgs) -> anyhow::Result<()> {
    let client = registration_client(config, &args.router)?;
    let removed = client
        .deregister(&args.id, args.address.as_deref())
        .await
        .with_context(|| format!("deregistration of '{}' failed", args.id))?;
    println!("{}: module_removed={removed}", args.id);
    Ok(())
}
