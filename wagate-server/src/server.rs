use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use wagate_core::{ConnectionClient, TenantStore, WagateConfig};

use crate::http::{self, HttpState};
use crate::subsystems::cache::TenantCache;
use crate::subsystems::directory::TenantDirectory;
use crate::subsystems::registry::SessionRegistry;
use crate::subsystems::supervisor::{Supervisor, SupervisorSettings};

/// Wire registry, cache, and directory around a store and a connection client.
pub fn build_supervisor(
    store: Arc<dyn TenantStore>,
    client: Arc<dyn ConnectionClient>,
    config: &WagateConfig,
) -> Arc<Supervisor> {
    let cache = Arc::new(TenantCache::from_config(&config.cache));
    Arc::new(Supervisor::new(
        Arc::new(SessionRegistry::new()),
        TenantDirectory::new(store, cache),
        client,
        SupervisorSettings::from(&config.supervisor),
    ))
}

fn socket_addr(address: &str, port: u16) -> anyhow::Result<SocketAddr> {
    let ip: IpAddr = address
        .parse()
        .with_context(|| format!("Invalid bind address {:?}", address))?;
    Ok(SocketAddr::new(ip, port))
}

/// Serve plain HTTP and, when `tls` is set, HTTPS on the TLS port. Returns once
/// shutdown is broadcast and the listeners have drained or the grace expired.
pub async fn run_http_servers(
    supervisor: Arc<Supervisor>,
    config: &WagateConfig,
    tls: Option<RustlsConfig>,
    shutdown: broadcast::Sender<()>,
) -> anyhow::Result<()> {
    let state = Arc::new(HttpState {
        supervisor,
        admin_token: config.server.admin_token.clone(),
    });
    let app = http::build_router(state, config.server.request_timeout());
    let grace = config.server.shutdown_grace();

    let https = match tls {
        Some(rustls) => {
            let addr = socket_addr(&config.server.address, config.tls.port)?;
            Some(spawn_https(app.clone(), addr, rustls, shutdown.subscribe(), grace))
        }
        None => None,
    };

    let addr = socket_addr(&config.server.address, config.server.port)?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!("Wagate HTTP API listening on http://{}", addr);

    let result = serve_plain(listener, app, shutdown.subscribe(), grace).await;

    if let Some(handle) = https {
        if let Err(e) = handle.await {
            tracing::error!("HTTPS server task failed: {}", e);
        }
    }
    result
}

/// Run `app` on `listener` until shutdown, then give in-flight requests at
/// most `grace` to finish before abandoning them.
pub async fn serve_plain(
    listener: TcpListener,
    app: Router,
    shutdown: broadcast::Receiver<()>,
    grace: Duration,
) -> anyhow::Result<()> {
    let mut drain_signal = shutdown.resubscribe();
    let mut shutdown = shutdown;

    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = drain_signal.recv().await;
                tracing::info!("HTTP server shutting down...");
            })
            .await
    });

    tokio::select! {
        joined = &mut server => {
            joined.context("HTTP server task panicked")??;
            return Ok(());
        }
        _ = shutdown.recv() => {}
    }

    match tokio::time::timeout(grace, &mut server).await {
        Ok(joined) => joined.context("HTTP server task panicked")??,
        Err(_) => {
            tracing::warn!(
                grace_secs = grace.as_secs_f64(),
                "HTTP drain grace expired, dropping open connections"
            );
            server.abort();
        }
    }
    Ok(())
}

fn spawn_https(
    app: Router,
    addr: SocketAddr,
    rustls: RustlsConfig,
    mut shutdown: broadcast::Receiver<()>,
    grace: Duration,
) -> tokio::task::JoinHandle<()> {
    let handle = axum_server::Handle::new();

    let drain = handle.clone();
    tokio::spawn(async move {
        let _ = shutdown.recv().await;
        tracing::info!("HTTPS server shutting down...");
        drain.graceful_shutdown(Some(grace));
    });

    tokio::spawn(async move {
        tracing::info!("Wagate HTTPS API listening on https://{}", addr);
        if let Err(e) = axum_server::bind_rustls(addr, rustls)
            .handle(handle)
            .serve(app.into_make_service())
            .await
        {
            tracing::error!("HTTPS server error: {}", e);
        }
    })
}

/// Resolve on ctrl-c or, on unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
