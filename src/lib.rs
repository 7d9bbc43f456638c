//! Connection-multiplexing core for a SolarmanV5 TCP proxy.
//!
//! Four concurrent activities, wired together in [`run`]: the loggers
//! listener, the clients listener, the registry/dispatcher event loop, and
//! (optionally) the UDP discovery responder.

pub mod codec;
pub mod discovery;
pub mod registry;
pub mod session;

use anyhow::{Context, Result};
use tokio::net::TcpListener;

use registry::Registry;
use session::{ClientSession, LoggerSession};

/// Fixed port for the clients listener.
pub const CLIENTS_PORT: u16 = 8899;
/// Fixed port for the UDP discovery responder.
pub const DISCOVERY_PORT: u16 = 48899;

/// Operator-supplied configuration for a single proxy run.
pub struct ProxyConfig {
    /// Bind host shared by the loggers listener and discovery replies.
    pub host: String,
    /// TCP port the loggers listener binds to.
    pub loggers_port: u16,
    /// Enable the per-logger write FIFO (`buffered`).
    pub buffered: bool,
    /// Enable the UDP discovery responder (`bcast`).
    pub bcast: bool,
}

/// Bind the three listeners, spawn the registry and (if enabled) the
/// discovery responder, and run the two accept loops until a socket errors
/// out or the process is asked to shut down.
///
/// All three sockets are bound up front, before anything is spawned, so a
/// bind failure on any of them (including the UDP discovery socket when
/// `bcast` is set) is fatal and returned to the caller rather than being
/// swallowed inside a background task. Once bound, per-connection errors
/// are contained to their own session.
pub async fn run(config: ProxyConfig) -> Result<()> {
    let ProxyConfig {
        host,
        loggers_port,
        buffered,
        bcast,
    } = config;

    let loggers_listener = TcpListener::bind((host.as_str(), loggers_port))
        .await
        .with_context(|| format!("cannot bind loggers listener on {host}:{loggers_port}"))?;
    log::info!("[loggers] listening on {}", loggers_listener.local_addr()?);

    let clients_listener = TcpListener::bind(("0.0.0.0", CLIENTS_PORT))
        .await
        .with_context(|| format!("cannot bind clients listener on 0.0.0.0:{CLIENTS_PORT}"))?;
    log::info!("[clients] listening on {}", clients_listener.local_addr()?);

    let discovery_socket = if bcast {
        Some(discovery::bind().await?)
    } else {
        None
    };

    let (registry, handle) = Registry::new();
    tokio::spawn(registry.run());

    if let Some(socket) = discovery_socket {
        let discovery_handle = handle.clone();
        let discovery_host = host.clone();
        tokio::spawn(async move {
            if let Err(e) = discovery::run(socket, discovery_host, discovery_handle).await {
                log::error!("[discovery] responder exited: {e}");
            }
        });
    }

    let loggers_handle = handle.clone();
    let loggers_task = tokio::spawn(async move {
        loop {
            match loggers_listener.accept().await {
                Ok((stream, peer)) => {
                    log::info!("[loggers] accepted {peer}");
                    LoggerSession::spawn(stream, loggers_handle.clone(), buffered).await;
                }
                Err(e) => {
                    log::error!("[loggers] accept error: {e}");
                }
            }
        }
    });

    let clients_task = tokio::spawn(async move {
        loop {
            match clients_listener.accept().await {
                Ok((stream, peer)) => {
                    log::info!("[clients] accepted {peer}");
                    ClientSession::spawn(stream, handle.clone()).await;
                }
                Err(e) => {
                    log::error!("[clients] accept error: {e}");
                }
            }
        }
    });

    tokio::select! {
        res = loggers_task => { res.context("loggers accept loop panicked")?; }
        res = clients_task => { res.context("clients accept loop panicked")?; }
        _ = shutdown_signal() => {
            log::info!("shutdown signal received, exiting");
        }
    }

    Ok(())
}

/// Resolves once Ctrl-C or SIGTERM is received, whichever comes first, so
/// the caller can log an orderly shutdown line before exiting.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                log::warn!("cannot install SIGTERM handler: {e}");
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
