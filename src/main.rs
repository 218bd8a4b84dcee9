//! boombox - SSH gateway to per-user development pods on Kubernetes.

use std::sync::Arc;

use boombox::cluster::KubeCluster;
use boombox::config::{Args, Config, ConfigError};
use boombox::registry::SessionRegistry;
use boombox::shutdown::{ShutdownCoordinator, ShutdownError};
use boombox::ssh::{self, Gateway, ServeError};
use clap::Parser as ClapParser;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// boombox - SSH into your own development pod
///
/// Every SSH login gets a persistent home volume and a pod on Kubernetes,
/// created on first use and removed when the last terminal disconnects.
#[derive(ClapParser, Debug)]
#[command(name = "boombox", version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    args: Args,
}

#[derive(Error, Debug)]
pub enum BoomboxError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("kubernetes client error: {0}")]
    Kube(#[from] kube::Error),

    #[error("server error: {0}")]
    Serve(#[from] ServeError),

    #[error("shutdown failed: {0}")]
    Shutdown(#[from] ShutdownError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> Result<(), BoomboxError> {
    let cli = Cli::parse();
    let config_path = cli.args.config.clone();
    let config = Config::load(cli.args)?;
    init_tracing(&config.log_level);
    if let Some(path) = config_path.filter(|p| !p.exists()) {
        tracing::warn!(path = %path.display(), "config file not found, using defaults");
    }

    tracing::info!(
        listen = %config.listen,
        namespace = %config.namespace,
        image = %config.container_image,
        "boombox starting"
    );

    let client = kube::Client::try_default().await?;
    let cluster = KubeCluster::new(client, config.pod_template());
    let ssh_config = ssh::server_config(&config.host_key_path)?;
    let listener = tokio::net::TcpListener::bind(config.listen).await?;

    let registry = SessionRegistry::new();
    let coordinator = ShutdownCoordinator::new(registry.clone());
    let settings = Arc::new(config.session_settings());
    let gateway = Gateway {
        cluster: Arc::new(cluster),
        settings: Arc::clone(&settings),
        shutdown: coordinator.signal(),
        registry,
        tasks: coordinator.tracker(),
    };

    let server = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { ssh::serve(listener, ssh_config, gateway, &coordinator).await })
    };

    wait_for_signal().await;
    tracing::info!(sessions = coordinator.registry().len(), "received shutdown signal");

    let result = coordinator
        .stop(config.shutdown_timeout, settings.teardown_timeout)
        .await;
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "ssh server failed"),
        Err(e) => tracing::error!(error = %e, "ssh server task panicked"),
    }
    if let Err(e) = &result {
        tracing::error!(error = %e, "could not shut down gracefully");
    }
    result?;
    tracing::info!("boombox stopped");
    Ok(())
}

fn init_tracing(level: &str) {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| format!("boombox={level}")),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
                return;
            }
            Err(e) => tracing::warn!(error = %e, "cannot listen for SIGTERM"),
        }
    }
    let _ = tokio::signal::ctrl_c().await;
}
