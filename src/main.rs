use clap::Parser;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

use retun_client::config::{ClientConfig, ConfigFile};
use retun_client::{inspector, Client};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls CryptoProvider"))?;

    // Load config file as env-var defaults, then parse the CLI on top of
    // it: CLI > env > file, mirroring ConfigFile::inject_env
    // followed by Config::parse.
    if let Ok(path) = std::env::var("RETUN_CONFIG_FILE") {
        let path = std::path::Path::new(&path);
        if path.exists() {
            match ConfigFile::load(path) {
                Ok(file_cfg) => file_cfg.inject_env(),
                Err(error) => eprintln!("warning: failed to load config file {path:?}: {error}"),
            }
        }
    }

    let config = ClientConfig::parse();
    config
        .validate()
        .map_err(|error| anyhow::anyhow!("invalid configuration: {error}"))?;

    init_tracing(&config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        server_url = %config.server_url,
        tunnels = config.tunnels.len(),
        "retun-client starting"
    );

    let client = Client::new(config.clone(), None);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let inspector_handle = if config.inspector_disabled {
        None
    } else {
        match inspector::spawn(
            &config,
            client.tunnels(),
            client.capture(),
            client.events(),
            client.dialer_cache(),
            client.client_id().to_string(),
        )
        .await
        {
            Ok((addr, handle)) => {
                info!(%addr, "inspector listening");
                Some(handle)
            }
            Err(error) => {
                error!(%error, "failed to start inspector, continuing without it");
                None
            }
        }
    };

    let run_handle = tokio::spawn(client.run(shutdown_rx));

    wait_for_shutdown().await;
    info!("shutdown signal received, disconnecting...");
    let _ = shutdown_tx.send(true);

    if let Some(handle) = inspector_handle {
        handle.abort();
    }

    match run_handle.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(error)) => Err(anyhow::anyhow!(error)),
        Err(join_error) => Err(anyhow::anyhow!(join_error)),
    }
}

fn init_tracing(config: &ClientConfig) {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{reload, EnvFilter};

    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter_layer, _reload_handle) = reload::Layer::new(filter);

    if config.log_json {
        tracing_subscriber::registry()
            .with(filter_layer)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter_layer)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
