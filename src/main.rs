//! vapd - main entry point.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use vapd::config::Config;
use vapd::dispatcher::Dispatcher;
use vapd::proxy::{self, ProxyState, TokenRegistry};

#[derive(Parser, Debug)]
#[command(name = "vapd")]
#[command(about = "Marketplace dispatcher for sandboxed agent jobs")]
#[command(version)]
struct Args {
    /// Explicit .env file to load before reading configuration
    #[arg(long)]
    env_file: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if let Some(ref path) = args.env_file {
        dotenvy::from_path(path)?;
    }

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vapd=info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::info!("Starting dispatcher...");

    // Fatal startup failures (missing keys, empty identity pool) exit 1.
    let config = Config::from_env()?;

    let registry = TokenRegistry::new();
    let proxy_state = ProxyState::new(registry.clone(), config.proxy.clone());
    let proxy_port = config.proxy.port;
    let proxy_task = tokio::spawn(async move {
        if let Err(e) = proxy::start(proxy_state, proxy_port).await {
            tracing::error!(error = %e, "Credential proxy stopped");
        }
    });

    let dispatcher = Dispatcher::new(config, registry)?;

    tracing::info!("Dispatcher initialized, entering main loop");
    dispatcher.run(shutdown_signal()).await?;

    proxy_task.abort();
    tracing::info!("Dispatcher shutdown complete");
    Ok(())
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
