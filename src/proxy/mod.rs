use std::{sync::Arc, time::Duration};

use anyhow::Context;
use thiserror::Error;
use tokio::{net::TcpListener, sync::Semaphore};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn, Instrument, Level};

use crate::{
    relay::RelayError,
    state::{ConnectionGuard, State},
    systemd,
    tunnel::TunnelError,
};

mod context;
mod http_connect;
mod request;

use context::RequestContext;
use http_connect::serve_http_connect;
use request::RequestError;

/// Pause after a failed `accept` so that resource exhaustion (e.g. EMFILE)
/// does not turn the accept loop into a busy loop.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error("Unsupported {method} request for `{target}`: only CONNECT tunnels are implemented")]
    Unsupported { method: http::Method, target: String },
    #[error("Failed to create tunnel to {destination}: {source}")]
    Tunnel {
        destination: String,
        source: TunnelError,
    },
    #[error("Tunnel to {destination} ended with an error: {source}")]
    Relay {
        destination: String,
        source: RelayError,
    },
    #[error("Failed to write to the client: {0}")]
    ClientIo(std::io::Error),
}

impl ProxyError {
    fn log_level(&self) -> Level {
        match self {
            ProxyError::Unsupported { .. } => Level::ERROR,
            ProxyError::Request(RequestError::Closed) => Level::DEBUG,
            ProxyError::Tunnel { .. }
            | ProxyError::Relay { .. }
            | ProxyError::Request(_)
            | ProxyError::ClientIo(_) => Level::WARN,
        }
    }
}

/// Logs the outcome of one connection. Every per-connection failure ends up
/// here instead of propagating to the accept loop.
fn log_connection_error(err: &ProxyError) {
    let level = err.log_level();
    if level == Level::ERROR {
        error!("{err}");
    } else if level == Level::WARN {
        warn!("{err}");
    } else {
        debug!("{err}");
    }
}

/// Binds the configured listen address and serves on it until `shutdown`
/// fires. Failing to bind is the only startup error.
pub async fn run(state: Arc<State>, shutdown: CancellationToken) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&state.settings.listen)
        .await
        .with_context(|| format!("Failed to listen on {}", state.settings.listen))?;
    start(state, listener, shutdown).await
}

/// Accepts connections on `listener` until `shutdown` fires, serving each one
/// on its own task.
///
/// On shutdown the listener is closed first, so new connection attempts are
/// refused, then in-flight tunnels (which observe the same token) get
/// `shutdown-grace` to wind down.
pub async fn start(
    state: Arc<State>,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let limiter = state
        .settings
        .max_connections
        .map(|max| Arc::new(Semaphore::new(max)));
    let tracker = TaskTracker::new();

    info!("Proxy running at {}", listener.local_addr()?);
    if let Err(e) = systemd::sd_notify_ready() {
        warn!("Failed to notify readiness: {e}");
    }

    loop {
        let permit = match limiter {
            Some(ref limiter) => tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = limiter.clone().acquire_owned() => {
                    Some(permit.context("connection limiter closed")?)
                }
            },
            None => None,
        };

        let (socket, addr) = tokio::select! {
            _ = shutdown.cancelled() => break,
            res = listener.accept() => match res {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept connection: {e}");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    continue;
                }
            },
        };

        let ctx = RequestContext::new(addr);
        let span = ctx.span();
        let state = state.clone();
        let shutdown = shutdown.clone();

        tracker.spawn(
            async move {
                let _permit = permit;
                let _guard = ConnectionGuard::new(&state.statistics);
                if let Err(e) = socket.set_nodelay(state.settings.tcp_nodelay) {
                    debug!("Failed to set TCP_NODELAY: {e}");
                }
                debug!("Accepted connection");

                match serve_http_connect(&state, socket, &shutdown).await {
                    Ok(()) => debug!("Connection closed"),
                    Err(e) => log_connection_error(&e),
                }
            }
            .instrument(span),
        );
    }

    drop(listener);
    info!("Stopped accepting connections");

    tracker.close();
    let grace = state.settings.shutdown_grace;
    if tokio::time::timeout(grace, tracker.wait()).await.is_err() {
        warn!(
            remaining = tracker.len(),
            "Connections still open after {grace:?}, abandoning them"
        );
    }

    state.statistics.log_summary();
    info!("Proxy stopped");
    Ok(())
}
