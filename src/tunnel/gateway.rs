use std::fmt;

use thiserror::Error;
use url::Url;

#[derive(Debug, Error, PartialEq)]
pub enum GatewayUrlError {
    #[error("Invalid gateway URL `{url}`: {source}")]
    Parse {
        url: String,
        source: url::ParseError,
    },
    #[error("Unsupported gateway URL scheme `{0}`, expected `http` or `https`")]
    UnsupportedScheme(String),
    #[error("Gateway URL `{0}` has no host")]
    MissingHost(String),
}

/// The upstream access gateway every tunnel is routed through.
///
/// Built once from configuration and shared read-only by all connections.
#[derive(Debug, Clone, PartialEq)]
pub struct Gateway {
    url: Url,
    host: String,
    port: u16,
    tls: bool,
}

impl Gateway {
    /// Parses a gateway URL. An empty (or whitespace only) string means that
    /// no gateway is configured and tunnels go directly to their destination.
    pub fn parse(raw: &str) -> Result<Option<Self>, GatewayUrlError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(None);
        }

        let url = Url::parse(raw).map_err(|source| GatewayUrlError::Parse {
            url: raw.to_owned(),
            source,
        })?;

        let tls = match url.scheme() {
            "https" => true,
            "http" => false,
            other => return Err(GatewayUrlError::UnsupportedScheme(other.to_owned())),
        };

        let host = match url.host() {
            Some(url::Host::Domain(domain)) => domain.to_owned(),
            Some(url::Host::Ipv4(ip)) => ip.to_string(),
            Some(url::Host::Ipv6(ip)) => ip.to_string(),
            None => return Err(GatewayUrlError::MissingHost(raw.to_owned())),
        };

        // `port_or_known_default` covers 80/443 for http(s).
        let port = url
            .port_or_known_default()
            .ok_or_else(|| GatewayUrlError::MissingHost(raw.to_owned()))?;

        Ok(Some(Self {
            url,
            host,
            port,
            tls,
        }))
    }

    /// Host name used for TLS server name verification.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn uses_tls(&self) -> bool {
        self.tls
    }

    /// Socket address string suitable for `TcpStream::connect`.
    pub fn connect_addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Gateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_url_means_direct_mode() {
        assert_eq!(Gateway::parse(""), Ok(None));
        assert_eq!(Gateway::parse("   "), Ok(None));
    }

    #[test]
    fn https_gateway_defaults_to_443() {
        let gateway = Gateway::parse("https://gateway.example.com")
            .unwrap()
            .unwrap();
        assert_eq!(gateway.host(), "gateway.example.com");
        assert_eq!(gateway.port(), 443);
        assert!(gateway.uses_tls());
        assert_eq!(gateway.connect_addr(), "gateway.example.com:443");
    }

    #[test]
    fn http_gateway_with_explicit_port() {
        let gateway = Gateway::parse("http://127.0.0.1:8080/").unwrap().unwrap();
        assert_eq!(gateway.host(), "127.0.0.1");
        assert_eq!(gateway.port(), 8080);
        assert!(!gateway.uses_tls());
    }

    #[test]
    fn ipv6_gateway_is_bracketed_for_connect() {
        let gateway = Gateway::parse("http://[::1]:8080").unwrap().unwrap();
        assert_eq!(gateway.host(), "::1");
        assert_eq!(gateway.connect_addr(), "[::1]:8080");
    }

    #[test]
    fn rejects_other_schemes() {
        assert_eq!(
            Gateway::parse("socks5://gateway:1080"),
            Err(GatewayUrlError::UnsupportedScheme("socks5".into()))
        );
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            Gateway::parse("not a url"),
            Err(GatewayUrlError::Parse { .. })
        ));
    }
}
