//! Upstream tunnel client: turns a `host:port` destination into a duplex
//! byte stream, either directly or through the configured access gateway.

use std::{
    fmt, io,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub mod client_tls;
mod gateway;
mod handshake;

pub use gateway::{Gateway, GatewayUrlError};

/// This is a workaround for the restriction `only auto traits can be used as additional traits in a trait object`
pub trait TunnelIo: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> TunnelIo for T {}

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Malformed destination `{destination}`: {reason}")]
    MalformedDestination {
        destination: String,
        reason: &'static str,
    },
    #[error("Destination {destination} is unreachable: {source}")]
    DestinationUnreachable {
        destination: String,
        source: io::Error,
    },
    #[error("Gateway {gateway} is unreachable: {source}")]
    GatewayUnreachable { gateway: String, source: io::Error },
    #[error("TLS handshake with gateway {gateway} failed: {source}")]
    GatewayTls { gateway: String, source: io::Error },
    #[error("CONNECT exchange with gateway {gateway} failed: {source}")]
    GatewayHandshake { gateway: String, source: io::Error },
    #[error("Gateway denied access to {destination}")]
    AccessDenied { destination: String },
    #[error("Gateway requires authentication to reach {destination}{}", login_hint(.location))]
    AuthenticationRequired {
        destination: String,
        location: Option<String>,
    },
    #[error("Gateway refused tunnel to {destination}: {status} {reason}")]
    GatewayRejected {
        destination: String,
        status: u16,
        reason: String,
    },
    #[error("Timed out after {timeout:?} establishing tunnel to {destination}")]
    Timeout {
        destination: String,
        timeout: Duration,
    },
    #[error("Tunnel establishment to {destination} was cancelled")]
    Cancelled { destination: String },
}

fn login_hint(location: &Option<String>) -> String {
    location
        .as_deref()
        .map(|location| format!(", log in at {location}"))
        .unwrap_or_default()
}

impl TunnelError {
    /// HTTP status reported to the proxy client for this failure.
    pub fn status_code(&self) -> http::StatusCode {
        use http::StatusCode;
        match self {
            Self::MalformedDestination { .. } => StatusCode::BAD_REQUEST,
            Self::AccessDenied { .. } => StatusCode::FORBIDDEN,
            Self::AuthenticationRequired { .. } => StatusCode::PROXY_AUTHENTICATION_REQUIRED,
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::Cancelled { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::DestinationUnreachable { .. }
            | Self::GatewayUnreachable { .. }
            | Self::GatewayTls { .. }
            | Self::GatewayHandshake { .. }
            | Self::GatewayRejected { .. } => StatusCode::BAD_GATEWAY,
        }
    }
}

/// A validated `host:port` tunnel target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    host: String,
    port: u16,
}

impl Destination {
    pub fn parse(raw: &str) -> Result<Self, TunnelError> {
        let malformed = |reason| TunnelError::MalformedDestination {
            destination: raw.to_owned(),
            reason,
        };

        if raw.is_empty() {
            return Err(malformed("empty destination"));
        }
        let authority: http::uri::Authority =
            raw.parse().map_err(|_| malformed("expected host:port"))?;
        if authority.as_str().contains('@') {
            return Err(malformed("user information is not allowed"));
        }
        let port = authority.port_u16().ok_or_else(|| malformed("missing port"))?;
        if port == 0 {
            return Err(malformed("port 0 is not a valid destination"));
        }
        let host = authority.host();
        if host.is_empty() {
            return Err(malformed("missing host"));
        }

        Ok(Self {
            host: host.to_owned(),
            port,
        })
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // IPv6 hosts keep their brackets from the authority form.
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// How a tunnel reaches its destination.
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    Direct,
    Gateway(String),
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Route::Direct => f.write_str("direct"),
            Route::Gateway(gateway) => write!(f, "via {gateway}"),
        }
    }
}

/// An established tunnel, usable as a plain duplex byte stream.
pub struct Tunnel {
    stream: Box<dyn TunnelIo>,
    destination: Destination,
    route: Route,
}

impl Tunnel {
    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn route(&self) -> &Route {
        &self.route
    }
}

impl fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tunnel")
            .field("destination", &self.destination)
            .field("route", &self.route)
            .finish_non_exhaustive()
    }
}

impl AsyncRead for Tunnel {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for Tunnel {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

/// Opens tunnels for the whole process. Cheap to clone; holds only the
/// immutable gateway reference and connection options.
#[derive(Clone)]
pub struct TunnelClient {
    gateway: Option<Gateway>,
    tls: TlsConnector,
    token: Option<String>,
    connect_timeout: Duration,
    tcp_nodelay: bool,
}

impl TunnelClient {
    /// `gateway == None` selects direct mode.
    pub fn new(gateway: Option<Gateway>, tls: TlsConnector) -> Self {
        Self {
            gateway,
            tls,
            token: None,
            connect_timeout: Duration::from_secs(10),
            tcp_nodelay: true,
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token.filter(|t| !t.is_empty());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_tcp_nodelay(mut self, nodelay: bool) -> Self {
        self.tcp_nodelay = nodelay;
        self
    }

    pub fn gateway(&self) -> Option<&Gateway> {
        self.gateway.as_ref()
    }

    pub fn route(&self) -> Route {
        match &self.gateway {
            Some(gateway) => Route::Gateway(gateway.to_string()),
            None => Route::Direct,
        }
    }

    /// Makes a single attempt at opening a tunnel to `destination`.
    ///
    /// Fails early if `cancel` fires or the connect timeout elapses before
    /// the tunnel is ready.
    pub async fn open(
        &self,
        destination: &str,
        cancel: &CancellationToken,
    ) -> Result<Tunnel, TunnelError> {
        let destination = Destination::parse(destination)?;

        tokio::select! {
            biased;

            _ = cancel.cancelled() => Err(TunnelError::Cancelled {
                destination: destination.to_string(),
            }),

            res = tokio::time::timeout(self.connect_timeout, self.establish(&destination)) => {
                res.unwrap_or_else(|_| Err(TunnelError::Timeout {
                    destination: destination.to_string(),
                    timeout: self.connect_timeout,
                }))
            }
        }
    }

    async fn establish(&self, destination: &Destination) -> Result<Tunnel, TunnelError> {
        let stream: Box<dyn TunnelIo> = match &self.gateway {
            Some(gateway) => {
                handshake::connect_through_gateway(
                    gateway,
                    &self.tls,
                    self.token.as_deref(),
                    destination,
                    self.tcp_nodelay,
                )
                .await?
            }
            None => {
                debug!("No gateway, establishing a direct connection to `{destination}`");
                let socket = TcpStream::connect(destination.to_string())
                    .await
                    .map_err(|source| TunnelError::DestinationUnreachable {
                        destination: destination.to_string(),
                        source,
                    })?;
                if let Err(e) = socket.set_nodelay(self.tcp_nodelay) {
                    debug!("Failed to set TCP_NODELAY towards {destination}: {e}");
                }
                Box::new(socket)
            }
        };

        Ok(Tunnel {
            stream,
            destination: destination.clone(),
            route: self.route(),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };
    use tokio_rustls::rustls::RootCertStore;

    pub(crate) fn direct_client() -> TunnelClient {
        TunnelClient::new(None, client_tls::build_connector(RootCertStore::empty(), false))
    }

    pub(crate) fn gateway_client(gateway: &str) -> TunnelClient {
        TunnelClient::new(
            Gateway::parse(gateway).unwrap(),
            client_tls::build_connector(RootCertStore::empty(), false),
        )
    }

    /// TCP server echoing every connection back to itself.
    pub(crate) async fn spawn_echo_server() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut read, mut write) = stream.split();
                    let _ = tokio::io::copy(&mut read, &mut write).await;
                });
            }
        });
        addr
    }

    /// Address nothing is listening on.
    pub(crate) async fn closed_port() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    /// Fake gateway: answers every CONNECT with `response`, then echoes.
    /// The request heads it receives are sent on the returned channel.
    async fn spawn_gateway(
        response: &'static str,
    ) -> (std::net::SocketAddr, tokio::sync::mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    let head = handshake::read_response_head(&mut stream).await.unwrap();
                    tx.send(String::from_utf8(head).unwrap()).unwrap();
                    stream.write_all(response.as_bytes()).await.unwrap();
                    let (mut read, mut write) = stream.split();
                    let _ = tokio::io::copy(&mut read, &mut write).await;
                });
            }
        });
        (addr, rx)
    }

    #[test]
    fn parses_destinations() {
        let destination = Destination::parse("example.org:443").unwrap();
        assert_eq!(destination.host, "example.org");
        assert_eq!(destination.port, 443);
        assert_eq!(destination.to_string(), "example.org:443");

        let destination = Destination::parse("[::1]:8443").unwrap();
        assert_eq!(destination.to_string(), "[::1]:8443");
    }

    #[test]
    fn rejects_malformed_destinations() {
        for raw in ["", "example.org", "example.org:0", "user@example.org:443", "example.org:443/x", ":443"] {
            assert!(
                matches!(
                    Destination::parse(raw),
                    Err(TunnelError::MalformedDestination { .. })
                ),
                "{raw:?} should be rejected"
            );
        }
    }

    #[test]
    fn failure_kinds_map_to_distinct_statuses() {
        let unreachable = TunnelError::DestinationUnreachable {
            destination: "a:1".into(),
            source: io::ErrorKind::ConnectionRefused.into(),
        };
        assert_eq!(unreachable.status_code(), http::StatusCode::BAD_GATEWAY);
        let denied = TunnelError::AccessDenied { destination: "a:1".into() };
        assert_eq!(denied.status_code(), http::StatusCode::FORBIDDEN);

        let auth = TunnelError::AuthenticationRequired {
            destination: "a:1".into(),
            location: Some("https://login".into()),
        };
        assert_eq!(
            auth.to_string(),
            "Gateway requires authentication to reach a:1, log in at https://login"
        );
    }

    #[tokio::test]
    async fn direct_tunnel_relays_bytes_in_order() {
        let echo = spawn_echo_server().await;
        let client = direct_client();

        let mut tunnel = client
            .open(&echo.to_string(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(tunnel.route(), &Route::Direct);

        let payload: Vec<u8> = (0..=255u8).cycle().take(64 * 1024).collect();
        let (mut read, mut write) = tokio::io::split(&mut tunnel);
        let writer = async {
            write.write_all(&payload).await.unwrap();
        };
        let reader = async {
            let mut received = vec![0u8; payload.len()];
            read.read_exact(&mut received).await.unwrap();
            received
        };
        let ((), received) = tokio::join!(writer, reader);
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn unreachable_destination_fails() {
        let addr = closed_port().await;
        let err = direct_client()
            .open(&addr.to_string(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::DestinationUnreachable { .. }), "{err}");
    }

    #[tokio::test]
    async fn malformed_destination_fails_without_io() {
        let err = direct_client()
            .open("no-port", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::MalformedDestination { .. }));
    }

    #[tokio::test]
    async fn cancelled_context_aborts_establishment() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let echo = spawn_echo_server().await;
        let err = direct_client()
            .open(&echo.to_string(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn stalled_gateway_times_out() {
        // Accepts the connection but never answers the CONNECT.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _accepting = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let client = gateway_client(&format!("http://{addr}"))
            .with_connect_timeout(Duration::from_millis(200));
        let err = client
            .open("internal.example.com:22", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::Timeout { .. }), "{err}");
    }

    #[tokio::test]
    async fn gateway_tunnel_sends_connect_and_relays() {
        let (addr, mut requests) = spawn_gateway("HTTP/1.1 200 Connection established\r\n\r\n").await;
        let client = gateway_client(&format!("http://{addr}"))
            .with_token(Some("s3cret".into()));

        let mut tunnel = client
            .open("internal.example.com:22", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(tunnel.route(), &Route::Gateway(format!("http://{addr}/")));

        let request = requests.recv().await.unwrap();
        assert!(request.starts_with("CONNECT internal.example.com:22 HTTP/1.1\r\n"));
        assert!(request.contains("Proxy-Authorization: Bearer s3cret\r\n"));

        tunnel.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        tunnel.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn gateway_answering_with_bare_line_feeds() {
        // Another instance of this proxy acting as the gateway.
        let (addr, _requests) = spawn_gateway("HTTP/1.1 200 Connection established\n\n").await;
        let client = gateway_client(&format!("http://{addr}"))
            .with_connect_timeout(Duration::from_secs(2));

        let mut tunnel = client
            .open("internal.example.com:22", &CancellationToken::new())
            .await
            .unwrap();
        tunnel.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        tunnel.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn gateway_denial_is_access_denied() {
        let (addr, _requests) = spawn_gateway("HTTP/1.1 403 Forbidden\r\n\r\n").await;
        let err = gateway_client(&format!("http://{addr}"))
            .open("internal.example.com:22", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::AccessDenied { .. }), "{err}");
    }

    #[tokio::test]
    async fn gateway_login_redirect_requires_authentication() {
        let (addr, _requests) = spawn_gateway(
            "HTTP/1.1 302 Found\r\nLocation: https://auth.example.com/login\r\n\r\n",
        )
        .await;
        let err = gateway_client(&format!("http://{addr}"))
            .open("internal.example.com:22", &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            TunnelError::AuthenticationRequired { location, .. } => {
                assert_eq!(location.as_deref(), Some("https://auth.example.com/login"))
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn unreachable_gateway_fails() {
        let addr = closed_port().await;
        let err = gateway_client(&format!("http://{addr}"))
            .open("internal.example.com:22", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::GatewayUnreachable { .. }), "{err}");
    }
}
