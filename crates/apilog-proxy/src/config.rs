//! Proxy configuration

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use url::{Host, Url};

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_TARGET_API_URL: &str = "https://api.anthropic.com";
pub const DEFAULT_DB_PATH: &str = "/data/requests.db";
pub const DEFAULT_MAX_REQUEST_BODY_BYTES: usize = 32 * 1024 * 1024;
pub const DEFAULT_MAX_CAPTURE_BYTES: usize = 10 * 1024 * 1024;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid upstream URL '{url}': {reason}")]
    InvalidTargetUrl { url: String, reason: String },

    #[error("TLS setup failed: {0}")]
    Tls(String),
}

/// URL scheme of the upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

/// The single upstream every request is forwarded to.
///
/// Parsed once at startup; a malformed URL never reaches request handling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
    /// Base URL without a trailing slash, e.g. `https://api.anthropic.com`
    base_url: String,
    /// Path prefix of the base URL without a trailing slash (often empty)
    base_path: String,
    scheme: Scheme,
    /// Host for DNS / TCP / TLS SNI (IPv6 literals without brackets)
    host: String,
    port: u16,
    /// Value for the forwarded `Host` header
    authority: String,
}

impl UpstreamTarget {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidTargetUrl {
            url: raw.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(invalid("URL is empty"));
        }

        let url = Url::parse(trimmed).map_err(|e| invalid(&e.to_string()))?;

        let scheme = match url.scheme() {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            other => return Err(invalid(&format!("unsupported scheme '{}'", other))),
        };

        if url.query().is_some() || url.fragment().is_some() {
            return Err(invalid("base URL must not carry a query or fragment"));
        }
        if !url.username().is_empty() || url.password().is_some() {
            return Err(invalid("credentials in the base URL are not supported"));
        }

        let host = match url.host() {
            Some(Host::Domain(domain)) => domain.to_string(),
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Ipv6(addr)) => addr.to_string(),
            None => return Err(invalid("URL has no host")),
        };
        let port = url
            .port_or_known_default()
            .ok_or_else(|| invalid("URL has no port"))?;

        // host_str keeps IPv6 brackets, which is what the Host header needs
        let host_header = url.host_str().unwrap_or(&host).to_string();
        let authority = match url.port() {
            Some(explicit) => format!("{}:{}", host_header, explicit),
            None => host_header,
        };

        let base_path = url.path().trim_end_matches('/').to_string();
        let base_url = format!(
            "{}://{}{}",
            url.scheme(),
            authority,
            base_path
        );

        Ok(Self {
            base_url,
            base_path,
            scheme,
            host,
            port,
            authority,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Fully resolved URL for an inbound path-and-query
    pub fn url_for(&self, path_and_query: &str) -> String {
        format!("{}{}", self.base_url, Self::normalize(path_and_query))
    }

    /// Origin-form request target sent on the upstream connection
    pub fn request_target(&self, path_and_query: &str) -> String {
        format!("{}{}", self.base_path, Self::normalize(path_and_query))
    }

    fn normalize(path_and_query: &str) -> String {
        if path_and_query.starts_with('/') {
            path_and_query.to_string()
        } else {
            format!("/{}", path_and_query)
        }
    }
}

/// Runtime configuration for the proxy server and forwarding engine
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    pub target: UpstreamTarget,
    /// Requests with larger bodies are rejected with 413
    pub max_request_body_bytes: usize,
    /// Response bytes kept for the log; the live stream is never cut
    pub max_capture_bytes: usize,
    /// Bound on DNS + TCP + TLS handshake
    pub connect_timeout: Duration,
    /// Bound on waiting for response headers and between body chunks
    pub upstream_timeout: Duration,
}

impl ProxyConfig {
    pub fn new(listen_addr: SocketAddr, target: UpstreamTarget) -> Self {
        Self {
            listen_addr,
            target,
            max_request_body_bytes: DEFAULT_MAX_REQUEST_BODY_BYTES,
            max_capture_bytes: DEFAULT_MAX_CAPTURE_BYTES,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            upstream_timeout: DEFAULT_UPSTREAM_TIMEOUT,
        }
    }
}
