//! Process entrypoint. Loads configuration, connects to the external room store, and runs the
//! Rocket HTTP surface, the raw WebSocket listener, and the background sweep tasks on one
//! shared `tokio` runtime (`spec.md` §5: "exactly one process ... driven by the same executor").

use std::sync::Arc;
use std::time::Duration;

use ghostline_relay::config::Config;
use ghostline_relay::error::CloseCode;
use ghostline_relay::store::{RedisRoomStore, RoomStore};
use ghostline_relay::{build_rocket, sweep, ws, RelayState};
use tokio::sync::watch;
use tracing::{error, info, warn};

#[rocket::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = match Config::load() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    let store: Arc<dyn RoomStore> = match RedisRoomStore::connect(&config.kv_url).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(error = %e, "failed to connect to the external room store at startup");
            std::process::exit(1);
        }
    };

    let state = RelayState::new(store, config.clone());
    let http_state = state.clone();
    let state = Arc::new(state);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let ws_listener = tokio::spawn(ws::run(state.clone(), shutdown_rx));
    let keepalive_sweep = tokio::spawn(sweep::run_keepalive_sweep(state.clone()));
    let qr_sweep = tokio::spawn(sweep::run_qr_rotation_sweep(state.clone()));

    let rocket = build_rocket(http_state);
    let ignited = match rocket.ignite().await {
        Ok(r) => r,
        Err(e) => {
            error!(error = %e, "rocket failed to ignite");
            std::process::exit(1);
        }
    };
    let rocket_shutdown = ignited.shutdown();

    tokio::select! {
        result = ignited.launch() => {
            if let Err(e) = result {
                error!(error = %e, "rocket exited with an error");
            }
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received, entering graceful shutdown");
            rocket_shutdown.notify();
        }
    }

    // `spec.md` §4.9 / §6.11: stop accepting new sockets, send close to all, await in-flight
    // cleanup until a bounded timeout, then force exit.
    let _ = shutdown_tx.send(true);
    state.registry.close_all(CloseCode::GoingAway, "server shutting down").await;

    let deadline = config.graceful_shutdown_deadline();
    let drained = tokio::time::timeout(deadline, wait_for_drain(&state)).await;
    if drained.is_err() {
        warn!(deadline_ms = config.graceful_shutdown_deadline_ms, "graceful shutdown deadline elapsed with connections still open");
    }

    ws_listener.abort();
    keepalive_sweep.abort();
    qr_sweep.abort();
}

/// Polls the connection count down to zero so `main` doesn't force-exit while peers are still
/// draining their close frames; bounded by the caller's `timeout`.
async fn wait_for_drain(state: &RelayState) {
    while state.registry.len().await > 0 {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
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
}
