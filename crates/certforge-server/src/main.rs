#![doc = include_str!("../README.md")]

mod server;

use anyhow::Context;
use clap::Parser;
use server::{
    Server,
    config::{CliArgs, ServerConfig},
    issuer::RsaIssuer,
    telemetry::init_telemetry,
};
use std::sync::Arc;
use tokio::signal;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ServerConfig::try_from(args)?;

    let providers = init_telemetry()?;

    let server = start(&config).inspect_err(|e| tracing::error!("Startup failed: {e:#}"))?;
    log_startup_info(&server, &config);

    let reactor_failed = tokio::select! {
        () = shutdown_signal() => false,
        () = server.reactor_stopped() => {
            tracing::error!("Reactor stopped unexpectedly, no longer serving; shutting down");
            true
        }
    };

    server.shutdown().await;
    let stats = server.stats();
    tracing::info!(
        "Service shut down ({} jobs completed, {} failed, {} names cached)",
        stats.completed,
        stats.failed,
        server.cached_names()
    );

    providers.shutdown();
    if reactor_failed {
        anyhow::bail!("reactor stopped unexpectedly");
    }
    Ok(())
}

/// Loads the issuer once and starts the server with it.
fn start(config: &ServerConfig) -> anyhow::Result<Server> {
    let authority = RsaIssuer::from_pem_file(
        &config.issuer_key,
        &config.issuer_dn,
        config.key_bits,
        config.cert_validity_days,
    )
    .with_context(|| format!("failed to load issuer from {}", config.issuer_key.display()))?;
    tracing::debug!("Issuer loaded, issuing {}-bit keys", authority.key_bits());

    Server::start(config, Arc::new(authority))
}

fn log_startup_info(server: &Server, config: &ServerConfig) {
    if cfg!(debug_assertions) {
        tracing::info!(
            "Starting issuance service on {} with full config: {:#?}",
            server.local_addr(),
            config
        );
    } else {
        tracing::info!(
            "Starting issuance service on {} with {} workers",
            server.local_addr(),
            config.num_workers
        );
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
    }

    tracing::info!("Shutdown signal received, terminating gracefully...");
}
