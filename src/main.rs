use std::os::fd::FromRawFd;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod proxy;
mod relay;
mod state;
mod systemd;
mod tunnel;

/// Name of the socket-activated listener, as set by `FileDescriptorName=`.
const PROXY_FD_NAME: &str = "proxy";

/// Local CONNECT proxy tunneling through an optional access gateway.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on, overrides `listen`.
    #[arg(short, long)]
    listen: Option<String>,

    /// Gateway URL, overrides `gateway-url`. An empty value tunnels directly.
    #[arg(long)]
    gateway_url: Option<String>,

    /// Bearer token presented to the gateway.
    #[arg(long)]
    gateway_token: Option<String>,

    /// Accept any certificate from the gateway.
    #[arg(long)]
    disable_tls_verification: bool,

    /// PEM bundle used instead of the built-in trust anchors.
    #[arg(long)]
    alternate_ca_path: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn apply(self, settings: &mut config::Settings) {
        if let Some(listen) = self.listen {
            settings.listen = listen;
        }
        if let Some(url) = self.gateway_url {
            settings.gateway_url = Some(url);
        }
        if let Some(token) = self.gateway_token {
            settings.gateway_token = Some(token);
        }
        if self.disable_tls_verification {
            settings.tls.disable_verification = true;
        }
        if let Some(path) = self.alternate_ca_path {
            settings.tls.alternate_ca_path = Some(path);
        }
    }
}

/// Takes over the listening socket passed by systemd, if any.
fn activated_listener() -> Result<Option<TcpListener>> {
    let fds_named = systemd::listen_fds_named();
    let Some(&fd) = fds_named.get(PROXY_FD_NAME) else {
        return Ok(None);
    };

    // SAFETY: systemd hands this fd over to us and nothing else owns it.
    let std = unsafe { std::net::TcpListener::from_raw_fd(fd) };
    std.set_nonblocking(true)?;
    Ok(Some(TcpListener::from_std(std)?))
}

async fn shutdown_signal() -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("failed to listen for SIGINT")?;
            info!("Received SIGINT");
        }
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sighup.recv() => info!("Received SIGHUP"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .context("invalid log level")?;
    tracing_subscriber::fmt::fmt().with_env_filter(filter).init();

    let mut settings = config::load(cli.config.as_deref())?;
    cli.apply(&mut settings);
    let state = Arc::new(state::init(settings)?);

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            warn!("{e:#}, shutting down");
        }
        if let Err(e) = systemd::sd_notify_stopping() {
            warn!("Failed to notify shutdown: {e}");
        }
        signal_token.cancel();
    });

    match activated_listener()? {
        Some(listener) => proxy::start(state, listener, shutdown).await?,
        None => proxy::run(state, shutdown).await?,
    }

    info!("exiting");
    Ok(())
}
