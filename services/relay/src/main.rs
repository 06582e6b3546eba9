use relay::config::{DirectoryMode, RelayConfig};
use relay::directory::{Directory, MemoryDirectory, RedisDirectory};
use relay::{liveness, AppState};
use std::env;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let config = RelayConfig::from_env();

    // The directory comes up before everything else and outlives the rest.
    let directory: Arc<dyn Directory> = match config.directory_mode {
        DirectoryMode::Shared => {
            let url = config
                .directory_url
                .clone()
                .expect("DIRECTORY_URL must be set when DIRECTORY_MODE=shared");
            info!("connecting to directory...");
            Arc::new(
                RedisDirectory::connect(&url)
                    .await
                    .expect("failed to connect to directory"),
            )
        }
        DirectoryMode::Disabled => Arc::new(MemoryDirectory::new()),
    };

    let state = AppState::new(config, directory);

    // Untokened dice-roll notifications are the one event stream the relay
    // itself consumes; everything else is up to embedders.
    state
        .registry
        .subscribe("roll-event", |client_id, envelope| {
            let total = envelope
                .payload
                .get("total")
                .map(ToString::to_string)
                .unwrap_or_default();
            info!(client_id = %client_id, total = %total, "roll event");
        })
        .await;

    let bind_addr = format!("0.0.0.0:{}", state.config.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("failed to bind");
    state.publish_replica_addr().await;
    let liveness_task = liveness::spawn(state.clone());
    info!(
        addr = %bind_addr,
        replica_id = %state.config.replica_id,
        directory_mode = state.config.directory_mode.as_str(),
        "relay listening"
    );

    axum::serve(listener, relay::build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");
    liveness_task.abort();
    info!("relay shut down gracefully");
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

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
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
