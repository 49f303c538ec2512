use std::sync::atomic::Ordering;

use bytes::Bytes;
use http::StatusCode;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    proxy::{
        request::{read_request, RequestError, RequestMethod},
        ProxyError,
    },
    relay::{relay, Direction, RelayError, RelayStats},
    state::State,
};

/// Written to the client once the tunnel is ready; raw relaying starts right
/// after it.
pub const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\n\n";

/// Serves one client connection: reads the request head and either runs a
/// CONNECT tunnel or rejects the request.
///
/// The stream is consumed; it is closed on every path by the time this
/// returns.
pub async fn serve_http_connect<S>(
    state: &State,
    mut stream: S,
    shutdown: &CancellationToken,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let head = match read_request(&mut stream, state.settings.request_timeout).await {
        Ok(head) => head,
        Err(err) => {
            let status = match err {
                RequestError::Malformed(_) => Some(StatusCode::BAD_REQUEST),
                RequestError::TooLarge => Some(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE),
                RequestError::Timeout(_) => Some(StatusCode::REQUEST_TIMEOUT),
                RequestError::Closed | RequestError::Io(_) => None,
            };
            if let Some(status) = status {
                reject(&mut stream, status).await;
            }
            return Err(err.into());
        }
    };

    match head.request.method {
        RequestMethod::Connect => {
            handle_connect(state, stream, &head.request.target, head.leftover, shutdown).await
        }
        RequestMethod::Other(method) => {
            state
                .statistics
                .nr_requests_rejected
                .fetch_add(1, Ordering::Relaxed);
            reject(&mut stream, StatusCode::NOT_IMPLEMENTED).await;
            Err(ProxyError::Unsupported {
                method,
                target: head.request.target,
            })
        }
    }
}

/// Opens a tunnel to `destination`, acknowledges the client and relays until
/// either side is done.
///
/// `leftover` holds bytes the client sent right after its request head;
/// they are forwarded before anything else.
pub async fn handle_connect<S>(
    state: &State,
    mut client: S,
    destination: &str,
    leftover: Bytes,
    shutdown: &CancellationToken,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    info!(%destination, route = %state.client.route(), "Creating new tunnel");

    let mut tunnel = match state.client.open(destination, shutdown).await {
        Ok(tunnel) => tunnel,
        Err(source) => {
            state
                .statistics
                .nr_tunnels_failed
                .fetch_add(1, Ordering::Relaxed);
            reject(&mut client, source.status_code()).await;
            return Err(ProxyError::Tunnel {
                destination: destination.to_owned(),
                source,
            });
        }
    };
    state
        .statistics
        .nr_tunnels_established
        .fetch_add(1, Ordering::Relaxed);
    debug!("Tunnel to {} ready ({})", tunnel.destination(), tunnel.route());

    client
        .write_all(CONNECTION_ESTABLISHED)
        .await
        .map_err(ProxyError::ClientIo)?;

    if !leftover.is_empty() {
        tunnel
            .write_all(&leftover)
            .await
            .map_err(|source| ProxyError::Relay {
                destination: destination.to_owned(),
                source: RelayError {
                    direction: Direction::ClientToUpstream,
                    stats: RelayStats::default(),
                    source,
                },
            })?;
    }

    let buffer_size = state.settings.relay_buffer_size;
    match relay(client, tunnel, shutdown, buffer_size).await {
        Ok((termination, stats)) => {
            record(state, &stats);
            debug!(
                %destination,
                ?termination,
                bytes_up = stats.client_to_upstream,
                bytes_down = stats.upstream_to_client,
                "Tunnel closed"
            );
            Ok(())
        }
        Err(source) => {
            record(state, &source.stats);
            Err(ProxyError::Relay {
                destination: destination.to_owned(),
                source,
            })
        }
    }
}

fn record(state: &State, stats: &RelayStats) {
    state
        .statistics
        .bytes_client_to_upstream
        .fetch_add(stats.client_to_upstream, Ordering::Relaxed);
    state
        .statistics
        .bytes_upstream_to_client
        .fetch_add(stats.upstream_to_client, Ordering::Relaxed);
}

/// Writes a bodiless error response and closes the write side. Failures are
/// ignored: the client may already be gone.
async fn reject<S: AsyncWrite + Unpin>(stream: &mut S, status: StatusCode) {
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    );
    if let Err(e) = stream.write_all(response.as_bytes()).await {
        debug!("Failed to send {status} to client: {e}");
        return;
    }
    let _ = stream.shutdown().await;
}
