//! Nexus gateway entry point.
//!
//! This module contains the main entry point for the Nexus edge gateway.
//! It handles command-line argument parsing, configuration loading, service
//! registry bootstrap, and server startup.
//!
//! # Responsibilities
//!
//! - Parse CLI arguments and environment variables (via Clap)
//! - Initialize logging and load the service registry
//! - Install the TLS crypto provider
//! - Start the HTTPS listener
//!
//! # Exit codes
//!
//! - 0: clean shutdown
//! - 2: bad configuration (missing/invalid environment values, bad registry)
//! - 3: cannot bind the listen address
//! - 4: cannot load or parse TLS materials

use clap::Parser;
use nexus::{
    config::{Args, GatewayConfig},
    errors::StartupError,
    server::service::start,
    state::GatewayState,
};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let fmt_layer = fmt::layer().with_target(false).compact();
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(EnvFilter::new(env_filter))
        .init();

    if let Err(e) = run(args).await {
        tracing::error!("{}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(args: Args) -> Result<(), StartupError> {
    let config = GatewayConfig::from_args(args)?;

    // Initialize metrics collection if enabled
    nexus::metrics::init();

    // Install AWS-LC cryptographic provider for TLS
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("Failed to install AWS-LC provider");

    let state = GatewayState::new(config).await?;

    start(state).await?;
    tracing::debug!("Server has exited");
    Ok(())
}
