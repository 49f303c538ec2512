use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Per-connection bookkeeping, mostly for log attribution.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub id: u64,
    pub client_address: SocketAddr,
}

impl RequestContext {
    pub fn new(client_address: SocketAddr) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            client_address,
        }
    }

    pub fn span(&self) -> tracing::Span {
        tracing::info_span!("conn", id = self.id, client = %self.client_address)
    }
}
