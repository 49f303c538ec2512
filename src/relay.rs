//! Bidirectional byte relay between a client connection and a tunnel.
//!
//! Unlike [`tokio::io::copy_bidirectional`], the relay ends as soon as
//! either direction finishes: a half-closed tunnel is torn down instead of
//! lingering until the other peer notices.

use std::{fmt, io, time::Duration};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Upper bound on the time spent politely shutting down each stream.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToUpstream,
    UpstreamToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToUpstream => f.write_str("client to upstream"),
            Direction::UpstreamToClient => f.write_str("upstream to client"),
        }
    }
}

/// Why a relay stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// End of stream reached on the given direction's source.
    Closed(Direction),
    /// The cancellation token fired.
    Cancelled,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
}

#[derive(Debug, Error)]
#[error("Relay {direction} failed after {} bytes up, {} bytes down: {source}", stats.client_to_upstream, stats.upstream_to_client)]
pub struct RelayError {
    pub direction: Direction,
    pub stats: RelayStats,
    pub source: io::Error,
}

/// Copies bytes between `client` and `upstream` until one direction reaches
/// end of stream, fails, or `cancel` fires. Both streams are shut down and
/// dropped before returning.
///
/// Each direction uses its own buffer of `buffer_size` bytes.
pub async fn relay<C, U>(
    client: C,
    upstream: U,
    cancel: &CancellationToken,
    buffer_size: usize,
) -> Result<(Termination, RelayStats), RelayError>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);
    let mut stats = RelayStats::default();

    let outcome = {
        let up = copy_one_way(
            &mut client_read,
            &mut upstream_write,
            buffer_size,
            &mut stats.client_to_upstream,
        );
        let down = copy_one_way(
            &mut upstream_read,
            &mut client_write,
            buffer_size,
            &mut stats.upstream_to_client,
        );

        tokio::select! {
            res = up => res
                .map(|()| Termination::Closed(Direction::ClientToUpstream))
                .map_err(|e| (Direction::ClientToUpstream, e)),
            res = down => res
                .map(|()| Termination::Closed(Direction::UpstreamToClient))
                .map_err(|e| (Direction::UpstreamToClient, e)),
            _ = cancel.cancelled() => Ok(Termination::Cancelled),
        }
    };
    trace!(?outcome, ?stats, "relay direction finished, closing both sides");

    let mut client = client_read.unsplit(client_write);
    let mut upstream = upstream_read.unsplit(upstream_write);
    // Closing both sides unblocks whichever peer is still waiting on us.
    let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, client.shutdown()).await;
    let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, upstream.shutdown()).await;

    match outcome {
        Ok(termination) => Ok((termination, stats)),
        Err((direction, source)) => Err(RelayError {
            direction,
            stats,
            source,
        }),
    }
}

async fn copy_one_way<R, W>(
    reader: &mut R,
    writer: &mut W,
    buffer_size: usize,
    copied: &mut u64,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size.max(1)];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        *copied += n as u64;
    }
}
