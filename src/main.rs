//! Reputation gate CLI.

use anyhow::Result;
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use zentinel_reputation_gate::{server, Config, Decision, RequestGuard};

#[derive(Parser, Debug)]
#[command(name = "zentinel-reputation-gate")]
#[command(about = "Reputation gate for Zentinel - reject requests from IPs AbuseIPDB rates as abusive")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "reputation-gate.yaml")]
    config: PathBuf,

    /// HTTP listen address
    #[arg(short, long, default_value = "127.0.0.1:8088")]
    listen: SocketAddr,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: String,

    /// Print example configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,

    /// Evaluate these addresses, print the decisions and exit
    #[arg(long, value_name = "ADDR")]
    check: Vec<IpAddr>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle --print-config
    if args.print_config {
        println!("{}", Config::example());
        return Ok(());
    }

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    // Load configuration
    info!(config = %args.config.display(), "Loading configuration");
    let config = Config::load(&args.config)?;

    // Handle --validate
    if args.validate {
        info!("Configuration is valid");
        return Ok(());
    }

    let guard = Arc::new(RequestGuard::new(config)?);

    // Handle --check
    if !args.check.is_empty() {
        for ip in args.check {
            let decision = guard.check_ip(ip).await;
            let label = match decision {
                Decision::Allow => "allow",
                Decision::Reject => "deny",
            };
            println!("{ip}\t{label}");
        }
        return Ok(());
    }

    let listener = tokio::net::TcpListener::bind(args.listen).await?;
    info!(listen = %args.listen, "Starting reputation gate");

    axum::serve(
        listener,
        server::router(guard).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutting down");
}
