// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tunneld Contributors

// Tunneld - Daemon
// Long-lived service managing SSH tunnels: sessions, forwarders, manager,
// persistence, and the HTTP control surface

mod api;
mod auth;
mod config;
mod known_hosts;
mod storage;
mod tunnel;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use api::{create_router, AppState};
use auth::AuthState;
use config::DaemonConfig;
use storage::SqliteStore;
use tunnel::Manager;

#[tokio::main]
async fn main() -> Result<()> {
    // Peek at the config before logging is up so the debug flag can widen
    // the default filter
    let daemon_config = DaemonConfig::load()?;

    let default_filter = if daemon_config.debug {
        "tunneld=debug,tunneld_daemon=debug"
    } else {
        "tunneld=info,tunneld_daemon=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("tunneld starting, version {}", env!("CARGO_PKG_VERSION"));
    info!("control API: {}", daemon_config.listen_address);

    // Open the tunnel store and boot the manager from it
    let store = Arc::new(
        SqliteStore::open(&daemon_config.storage_path)
            .map_err(|e| anyhow::anyhow!("failed to open tunnel store: {}", e))?,
    );
    let manager = Manager::new(Some(store), daemon_config.known_hosts_path.clone());
    let loaded = manager
        .load_from_storage()
        .await
        .map_err(|e| anyhow::anyhow!("failed to load tunnels: {}", e))?;
    info!("restored {} tunnels in stopped state", loaded);

    // Log status changes as they happen
    let mut event_rx = manager.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv().await {
            if let tunneld_common::TunnelEvent::TunnelUpdate { tunnel_id, status } = event {
                info!(
                    "tunnel {} -> {}{}",
                    tunnel_id,
                    status.state,
                    if status.last_error.is_empty() {
                        String::new()
                    } else {
                        format!(" ({})", status.last_error)
                    }
                );
            }
        }
    });

    let auth_state = match &daemon_config.auth {
        Some(auth_config) => {
            info!("control API requires signed tokens");
            Some(AuthState::new(auth_config))
        }
        None => {
            info!("authentication disabled; control API is open");
            None
        }
    };

    // Shutdown broadcast lets SSE streams end before the listener closes
    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

    let state = Arc::new(AppState {
        manager: manager.clone(),
        auth: auth_state,
        shutdown_tx: shutdown_tx.clone(),
    });
    let app = create_router(state);

    match &daemon_config.tls {
        Some(tls) => {
            let rustls_config = RustlsConfig::from_pem_file(&tls.cert_path, &tls.key_path)
                .await
                .context("failed to load TLS certificate or key")?;

            info!("serving HTTPS on {}", daemon_config.listen_address);
            let addr: std::net::SocketAddr = daemon_config
                .listen_address
                .parse()
                .context("listen_address must be an ip:port for TLS mode")?;

            let handle = Handle::new();
            let shutdown_handle = handle.clone();
            let shutdown_manager = manager.clone();
            tokio::spawn(async move {
                wait_for_shutdown(shutdown_manager, shutdown_tx).await;
                shutdown_handle.graceful_shutdown(None);
            });

            axum_server::bind_rustls(addr, rustls_config)
                .handle(handle)
                .serve(app.into_make_service())
                .await
                .context("HTTPS server error")?;
        }
        None => {
            info!("serving HTTP on {}", daemon_config.listen_address);
            let listener = tokio::net::TcpListener::bind(&daemon_config.listen_address)
                .await
                .with_context(|| format!("failed to bind {}", daemon_config.listen_address))?;

            axum::serve(listener, app)
                .with_graceful_shutdown(wait_for_shutdown(manager.clone(), shutdown_tx))
                .await
                .context("HTTP server error")?;
        }
    }

    info!("daemon shut down");
    Ok(())
}

/// Wait for ctrl-c or SIGTERM, then stop every tunnel and release the
/// SSE streams
async fn wait_for_shutdown(
    manager: Manager,
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
) {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received ctrl-c, shutting down"),
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received ctrl-c, shutting down");
    }

    let _ = shutdown_tx.send(());
    if let Err(e) = manager.shutdown().await {
        error!("shutdown finished with errors: {}", e);
    } else {
        info!("all tunnels stopped");
    }
}
