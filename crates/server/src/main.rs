use std::time::Duration;

use anyhow::Context;
use syncroom_server::{
    app::{build_router, install_metrics, RoomServices},
    config::{LogFormat, ServerConfig},
};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env();
    init_tracing(&config);

    if config.is_dev_jwt_secret() {
        warn!("SYNCROOM_JWT_SECRET is not set; using the development secret");
    }

    install_metrics();
    let services = RoomServices::from_config(&config).await?;
    match services.purge_own_presence().await {
        Ok(rooms) if !rooms.is_empty() => {
            info!(rooms = rooms.len(), "purged stale presence left by a previous run")
        }
        Ok(_) => {}
        Err(error) => warn!(error = ?error, "failed to purge instance presence at startup"),
    }

    let relay_listener = services.relay_listener(config.relay_retry_delay).spawn();
    let app = build_router(services.clone(), &config.cors_origins);

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind syncroom listener on {}", config.listen_addr))?;

    info!(
        listen_addr = %config.listen_addr,
        instance_id = %config.instance_id,
        "starting syncroom server"
    );

    let registry = services.registry.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            registry.begin_shutdown();
        })
        .await
        .context("syncroom server exited unexpectedly");

    match services.shutdown(SHUTDOWN_GRACE).await {
        Ok(rooms) => info!(rooms = rooms.len(), "presence released"),
        Err(error) => warn!(error = ?error, "failed to purge instance presence at shutdown"),
    }
    relay_listener.abort();

    served
}

fn init_tracing(config: &ServerConfig) {
    let filter = EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info"));
    match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}
