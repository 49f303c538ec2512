use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http::Method;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

const REQUEST_HEADERS_MAX_SIZE: usize = 8192;
const REQUEST_HEADERS_MAX_COUNT: usize = 64;

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("Client closed the connection before sending a request")]
    Closed,
    #[error("Client did not send a complete request within {0:?}")]
    Timeout(Duration),
    #[error("Request header section exceeds {REQUEST_HEADERS_MAX_SIZE} bytes")]
    TooLarge,
    #[error("Malformed request: {0}")]
    Malformed(String),
    #[error("Failed to read request: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestMethod {
    Connect,
    Other(Method),
}

/// One parsed proxy request head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRequest {
    pub method: RequestMethod,
    /// The request target: `host:port` for CONNECT, whatever the client sent
    /// otherwise.
    pub target: String,
}

impl ProxyRequest {
    /// Parses a request head from `buf`, returning `None` while it is
    /// incomplete. On success also returns the length of the head.
    pub fn parse(buf: &[u8]) -> Result<Option<(usize, Self)>, RequestError> {
        let mut headers = [httparse::EMPTY_HEADER; REQUEST_HEADERS_MAX_COUNT];
        let mut req = httparse::Request::new(&mut headers);
        let len = match req
            .parse(buf)
            .map_err(|e| RequestError::Malformed(e.to_string()))?
        {
            httparse::Status::Partial => return Ok(None),
            httparse::Status::Complete(len) => len,
        };

        let method = req
            .method
            .ok_or_else(|| RequestError::Malformed("missing method".into()))?;
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|e| RequestError::Malformed(e.to_string()))?;
        let target = req
            .path
            .ok_or_else(|| RequestError::Malformed("missing request target".into()))?
            .to_owned();

        let method = if method == Method::CONNECT {
            RequestMethod::Connect
        } else {
            RequestMethod::Other(method)
        };

        Ok(Some((len, Self { method, target })))
    }
}

/// A request head together with whatever the client sent after it.
#[derive(Debug)]
pub struct RequestHead {
    pub request: ProxyRequest,
    /// Bytes read past the end of the head; they belong to the tunnel.
    pub leftover: Bytes,
}

/// Reads from `stream` until a complete request head has arrived.
pub async fn read_request<S: AsyncRead + Unpin>(
    stream: &mut S,
    timeout: Duration,
) -> Result<RequestHead, RequestError> {
    tokio::time::timeout(timeout, read_request_inner(stream))
        .await
        .map_err(|_| RequestError::Timeout(timeout))?
}

async fn read_request_inner<S: AsyncRead + Unpin>(stream: &mut S) -> Result<RequestHead, RequestError> {
    let mut buf = BytesMut::with_capacity(1024);
    loop {
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(RequestError::Closed);
        }
        if let Some((len, request)) = ProxyRequest::parse(&buf)? {
            let leftover = buf.split_off(len).freeze();
            return Ok(RequestHead { request, leftover });
        }
        if buf.len() >= REQUEST_HEADERS_MAX_SIZE {
            return Err(RequestError::TooLarge);
        }
    }
}
