use std::sync::Arc;

use roomchat::{
    app,
    auth::Keys,
    config::{Config, FabricBackend, LogFormat},
    db,
    fabric::{BroadcastFabric, InProcessFabric, RedisFabric},
    AppState, GatewaySettings,
};
use tokio::{signal, sync::watch};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    init_tracing(config.log_format);

    let db_pool = db::connect(&config.database_url, config.database_max_connections).await?;
    db::migrate(&db_pool).await?;
    info!(database_url = %config.database_url, "database ready");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut listener_handle = None;
    let fabric: Arc<dyn BroadcastFabric> = match &config.fabric {
        FabricBackend::Memory => Arc::new(InProcessFabric::new()),
        FabricBackend::Redis { url } => {
            let fabric = RedisFabric::connect(url, config.fabric_channel_prefix.clone()).await?;
            listener_handle = Some(fabric.spawn_listener(shutdown_rx));
            info!(prefix = %config.fabric_channel_prefix, "redis fabric connected");
            Arc::new(fabric)
        }
    };

    let state = AppState {
        db_pool,
        keys: Keys::new(config.jwt_secret.as_bytes()),
        fabric,
        gateway: GatewaySettings { handshake_timeout: config.handshake_timeout },
    };

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!(addr = %config.bind_addr, "listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    if let Some(handle) = listener_handle {
        let _ = handle.await;
    }
    info!("stopped");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
