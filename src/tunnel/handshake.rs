use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use super::{client_tls, Destination, Gateway, TunnelError, TunnelIo};

const CONNECT_HEADERS_MAX_SIZE: usize = 8192;
const CONNECT_HEADERS_MAX_COUNT: usize = 32;

/// Status line and the headers we care about from the gateway's answer to
/// our CONNECT.
#[derive(Debug, PartialEq)]
pub(super) struct GatewayResponse {
    pub status: u16,
    pub reason: String,
    pub location: Option<String>,
}

/// Opens a tunnel to `destination` through `gateway`: TCP, TLS when the
/// gateway URL is `https`, then one CONNECT exchange. The returned stream is
/// positioned right after the gateway's response head.
pub(super) async fn connect_through_gateway(
    gateway: &Gateway,
    tls: &TlsConnector,
    token: Option<&str>,
    destination: &Destination,
    tcp_nodelay: bool,
) -> Result<Box<dyn TunnelIo>, TunnelError> {
    debug!(
        tls = gateway.uses_tls(),
        "Connecting to gateway {}:{}",
        gateway.host(),
        gateway.port()
    );
    let socket = TcpStream::connect(gateway.connect_addr())
        .await
        .map_err(|source| TunnelError::GatewayUnreachable {
            gateway: gateway.to_string(),
            source,
        })?;
    if let Err(e) = socket.set_nodelay(tcp_nodelay) {
        debug!("Failed to set TCP_NODELAY on gateway socket: {e}");
    }

    let mut stream: Box<dyn TunnelIo> = if gateway.uses_tls() {
        let tls_stream = client_tls::connect_using_tls(tls, gateway.host(), socket)
            .await
            .map_err(|source| TunnelError::GatewayTls {
                gateway: gateway.to_string(),
                source,
            })?;
        Box::new(tls_stream)
    } else {
        Box::new(socket)
    };

    let handshake_failed = |source| TunnelError::GatewayHandshake {
        gateway: gateway.to_string(),
        source,
    };

    stream
        .write_all(connect_request(destination, token).as_bytes())
        .await
        .map_err(handshake_failed)?;
    stream.flush().await.map_err(handshake_failed)?;

    let head = read_response_head(&mut stream)
        .await
        .map_err(handshake_failed)?;
    let response = parse_response(&head).map_err(handshake_failed)?;
    debug!(
        "Gateway {} answered CONNECT {} with {} {}",
        gateway, destination, response.status, response.reason
    );
    check_response(response, destination)?;

    Ok(stream)
}

pub(super) fn connect_request(destination: &Destination, token: Option<&str>) -> String {
    let mut request = format!("CONNECT {destination} HTTP/1.1\r\nHost: {destination}\r\n");
    if let Some(token) = token {
        request.push_str(&format!("Proxy-Authorization: Bearer {token}\r\n"));
    }
    request.push_str("\r\n");
    request
}

/// Reads up to and including the blank line ending the response head. Bare
/// `\n` line endings are accepted as well as `\r\n`.
///
/// Reads one byte at a time so that nothing past the head, which already
/// belongs to the tunnel, is consumed.
pub(super) async fn read_response_head<S: AsyncRead + Unpin>(stream: &mut S) -> io::Result<Vec<u8>> {
    // Most HTTP CONNECT responses should be under 512 bytes
    let mut buf = Vec::with_capacity(512);
    let mut one = [0u8; 1];
    loop {
        let n = stream.read(&mut one).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "gateway closed connection before response",
            ));
        }
        buf.push(one[0]);
        if buf.ends_with(b"\r\n\r\n") || buf.ends_with(b"\n\n") {
            return Ok(buf);
        }
        if buf.len() > CONNECT_HEADERS_MAX_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "gateway response headers too large",
            ));
        }
    }
}

pub(super) fn parse_response(head: &[u8]) -> io::Result<GatewayResponse> {
    let mut headers = [httparse::EMPTY_HEADER; CONNECT_HEADERS_MAX_COUNT];
    let mut response = httparse::Response::new(&mut headers);
    let status = response
        .parse(head)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if status.is_partial() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "incomplete gateway response head",
        ));
    }

    let status = response
        .code
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "empty gateway response"))?;
    let location = response
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("location"))
        .map(|h| String::from_utf8_lossy(h.value).into_owned());

    Ok(GatewayResponse {
        status,
        reason: response.reason.unwrap_or("").to_owned(),
        location,
    })
}

/// Maps the gateway status to a ready tunnel or the matching failure.
pub(super) fn check_response(
    response: GatewayResponse,
    destination: &Destination,
) -> Result<(), TunnelError> {
    let destination = destination.to_string();
    match response.status {
        200..=299 => Ok(()),
        300..=399 | 401 | 407 => Err(TunnelError::AuthenticationRequired {
            destination,
            location: response.location,
        }),
        403 => Err(TunnelError::AccessDenied { destination }),
        status => Err(TunnelError::GatewayRejected {
            destination,
            status,
            reason: response.reason,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn destination() -> Destination {
        Destination::parse("internal.example.com:22").unwrap()
    }

    #[test]
    fn connect_request_without_token() {
        assert_eq!(
            connect_request(&destination(), None),
            "CONNECT internal.example.com:22 HTTP/1.1\r\nHost: internal.example.com:22\r\n\r\n"
        );
    }

    #[test]
    fn connect_request_with_token() {
        let request = connect_request(&destination(), Some("s3cret"));
        assert!(request.contains("\r\nProxy-Authorization: Bearer s3cret\r\n"));
        assert!(request.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn reads_exactly_the_response_head() {
        let mut input: &[u8] = b"HTTP/1.1 200 OK\r\nX-Test: 1\r\n\r\nSSH-2.0-server\r\n";
        let head = read_response_head(&mut input).await.unwrap();
        assert_eq!(head, b"HTTP/1.1 200 OK\r\nX-Test: 1\r\n\r\n");
        assert_eq!(input, b"SSH-2.0-server\r\n");
    }

    #[tokio::test]
    async fn reads_head_with_bare_line_feeds() {
        let mut input: &[u8] = b"HTTP/1.1 200 Connection established\n\nSSH-2.0-server\r\n";
        let head = read_response_head(&mut input).await.unwrap();
        assert_eq!(head, b"HTTP/1.1 200 Connection established\n\n");
        assert_eq!(input, b"SSH-2.0-server\r\n");

        let response = parse_response(&head).unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.reason, "Connection established");
    }

    #[tokio::test]
    async fn truncated_response_is_an_error() {
        let mut input: &[u8] = b"HTTP/1.1 200 OK\r\n";
        let err = read_response_head(&mut input).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn oversized_response_is_an_error() {
        let mut head = b"HTTP/1.1 200 OK\r\n".to_vec();
        head.extend(std::iter::repeat(b'a').take(CONNECT_HEADERS_MAX_SIZE + 1));
        let mut input: &[u8] = &head;
        let err = read_response_head(&mut input).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn parses_redirect_location() {
        let response = parse_response(
            b"HTTP/1.1 302 Found\r\nLocation: https://auth.example.com/login\r\n\r\n",
        )
        .unwrap();
        assert_eq!(
            response,
            GatewayResponse {
                status: 302,
                reason: "Found".into(),
                location: Some("https://auth.example.com/login".into()),
            }
        );
    }

    #[test]
    fn garbage_response_is_invalid_data() {
        let err = parse_response(b"SSH-2.0-OpenSSH\r\n\r\n").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn status_mapping() {
        let response = |status, location: Option<&str>| GatewayResponse {
            status,
            reason: "x".into(),
            location: location.map(str::to_owned),
        };

        assert!(check_response(response(200, None), &destination()).is_ok());
        assert!(matches!(
            check_response(response(403, None), &destination()),
            Err(TunnelError::AccessDenied { .. })
        ));
        assert!(matches!(
            check_response(response(407, None), &destination()),
            Err(TunnelError::AuthenticationRequired { location: None, .. })
        ));
        assert!(matches!(
            check_response(response(302, Some("https://login")), &destination()),
            Err(TunnelError::AuthenticationRequired { location: Some(_), .. })
        ));
        assert!(matches!(
            check_response(response(502, None), &destination()),
            Err(TunnelError::GatewayRejected { status: 502, .. })
        ));
    }
}
