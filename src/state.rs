use std::{
    io::BufReader,
    path::Path,
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
};

use thiserror::Error;
use tokio_rustls::rustls::{pki_types::CertificateDer, RootCertStore};
use tracing::info;

use crate::{
    config::{ConfigError, Settings},
    tunnel::{client_tls, TunnelClient},
};

/// Immutable process-wide state shared by every connection task.
///
/// Nothing in here is behind a lock: settings and the tunnel client never
/// change after startup, and the statistics are plain atomics.
pub struct State {
    pub settings: Settings,
    pub client: TunnelClient,
    pub statistics: Statistics,
}

#[derive(Debug, Error)]
pub enum MaterialError {
    #[error("Failed to parse PEM section")]
    SectionParsingError,
    #[error("Expected a certificate")]
    ExpectedCertificate,
}

#[derive(Debug, Error)]
pub enum LoadTrustAnchorError {
    #[error("Unexpected material nature: {0}")]
    UnexpectedMaterialNature(#[from] MaterialError),
    #[error("Failed during I/O: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Adding a certificate to the root store failed: {0}")]
    RootStorePopulationError(#[from] tokio_rustls::rustls::Error),
    #[error("No certificate found in the CA bundle")]
    NoCertificates,
}

#[derive(Debug, Error)]
pub enum InitError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Failed to load trust anchors: {0}")]
    LoadTrustAnchorError(#[from] LoadTrustAnchorError),
}

fn expect_certificate(item: rustls_pemfile::Item) -> Result<CertificateDer<'static>, MaterialError> {
    match item {
        rustls_pemfile::Item::X509Certificate(cert) => Ok(cert),
        _ => Err(MaterialError::ExpectedCertificate),
    }
}

/// Loads every certificate of a PEM bundle into a fresh root store.
pub fn load_trust_anchors(ca_file: &Path) -> Result<RootCertStore, LoadTrustAnchorError> {
    let mut ca_file = BufReader::new(std::fs::File::open(ca_file)?);
    let certs: Vec<_> = rustls_pemfile::read_all(&mut ca_file)
        .map(|item| {
            item.map_err(|_| MaterialError::SectionParsingError)
                .and_then(expect_certificate)
        })
        .collect::<Result<Vec<_>, _>>()?;

    if certs.is_empty() {
        return Err(LoadTrustAnchorError::NoCertificates);
    }

    let mut roots = RootCertStore::empty();
    for cert in certs {
        roots.add(cert)?;
    }
    Ok(roots)
}

fn default_trust_anchors() -> RootCertStore {
    RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned())
}

/// Connection accounting, logged when the proxy stops.
#[derive(Debug, Default)]
pub struct Statistics {
    pub nr_ongoing_client_connections: AtomicUsize,
    pub nr_tunnels_established: AtomicU64,
    pub nr_tunnels_failed: AtomicU64,
    pub nr_requests_rejected: AtomicU64,
    pub bytes_client_to_upstream: AtomicU64,
    pub bytes_upstream_to_client: AtomicU64,
}

impl Statistics {
    pub fn log_summary(&self) {
        info!(
            ongoing = self.nr_ongoing_client_connections.load(Ordering::Relaxed),
            established = self.nr_tunnels_established.load(Ordering::Relaxed),
            failed = self.nr_tunnels_failed.load(Ordering::Relaxed),
            rejected = self.nr_requests_rejected.load(Ordering::Relaxed),
            bytes_up = self.bytes_client_to_upstream.load(Ordering::Relaxed),
            bytes_down = self.bytes_upstream_to_client.load(Ordering::Relaxed),
            "connection statistics"
        );
    }
}

/// Decrements the ongoing connection counter when dropped.
pub struct ConnectionGuard<'a>(&'a Statistics);

impl<'a> ConnectionGuard<'a> {
    pub fn new(statistics: &'a Statistics) -> Self {
        statistics
            .nr_ongoing_client_connections
            .fetch_add(1, Ordering::Relaxed);
        Self(statistics)
    }
}

impl Drop for ConnectionGuard<'_> {
    fn drop(&mut self) {
        self.0
            .nr_ongoing_client_connections
            .fetch_sub(1, Ordering::Relaxed);
    }
}

pub fn init(settings: Settings) -> Result<State, InitError> {
    settings.validate()?;
    let gateway = settings.gateway()?;

    let roots = match settings.tls.alternate_ca_path {
        Some(ref ca_path) => load_trust_anchors(ca_path)?,
        None => default_trust_anchors(),
    };
    let tls = client_tls::build_connector(roots, settings.tls.disable_verification);

    let client = TunnelClient::new(gateway, tls)
        .with_token(settings.gateway_token.clone())
        .with_connect_timeout(settings.connect_timeout)
        .with_tcp_nodelay(settings.tcp_nodelay);
    match client.gateway() {
        Some(gateway) => info!("Tunneling through gateway {gateway}"),
        None => info!("No gateway configured, tunneling directly"),
    }

    Ok(State {
        settings,
        client,
        statistics: Statistics::default(),
    })
}
