//! Pooled HTTP/1.1 client for the single upstream target
//!
//! Connections are plain TCP or rustls over TCP depending on the target
//! scheme. A connection goes back to the pool only after the response body
//! it carried was read to the end; only the connection is reused, never
//! headers or cookies.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::config::{ConfigError, ProxyConfig, Scheme, UpstreamTarget};
use crate::error::ProxyError;

/// Maximum number of idle pooled connections
const MAX_POOL_SIZE: usize = 32;

pub type UpstreamSender = http1::SendRequest<Full<Bytes>>;

pub struct UpstreamClient {
    target: UpstreamTarget,
    tls: Option<(TlsConnector, ServerName<'static>)>,
    pool: Arc<Mutex<Vec<UpstreamSender>>>,
    connect_timeout: Duration,
    response_timeout: Duration,
}

impl UpstreamClient {
    pub fn new(config: &ProxyConfig) -> Result<Self, ConfigError> {
        let target = config.target.clone();

        let tls = match target.scheme() {
            Scheme::Http => None,
            Scheme::Https => {
                let server_name = ServerName::try_from(target.host().to_string())
                    .map_err(|e| ConfigError::Tls(format!("Invalid server name: {}", e)))?;
                Some((build_tls_connector()?, server_name))
            }
        };

        Ok(Self {
            target,
            tls,
            pool: Arc::new(Mutex::new(Vec::with_capacity(MAX_POOL_SIZE))),
            connect_timeout: config.connect_timeout,
            response_timeout: config.upstream_timeout,
        })
    }

    pub fn target(&self) -> &UpstreamTarget {
        &self.target
    }

    /// Send a request and wait (bounded) for the response head.
    ///
    /// The sender comes back with the response so the caller can
    /// [`release`](Self::release) it once the body is fully consumed.
    pub async fn send(
        &self,
        request: Request<Full<Bytes>>,
    ) -> Result<(Response<Incoming>, UpstreamSender), ProxyError> {
        let mut sender = self.checkout().await?;

        let response = tokio::time::timeout(self.response_timeout, sender.send_request(request))
            .await
            .map_err(|_| ProxyError::ResponseTimeout {
                secs: self.response_timeout.as_secs(),
            })?
            .map_err(|e| ProxyError::RequestFailed(e.to_string()))?;

        Ok((response, sender))
    }

    /// Return a connection whose last response was fully read
    pub async fn release(&self, sender: UpstreamSender) {
        if sender.is_closed() {
            debug!("Not returning closed connection to pool");
            return;
        }

        let mut pool = self.pool.lock().await;
        if pool.len() < MAX_POOL_SIZE {
            pool.push(sender);
            debug!("Returned connection to pool (size: {})", pool.len());
        }
    }

    /// Reuse an idle pooled connection or open a new one
    async fn checkout(&self) -> Result<UpstreamSender, ProxyError> {
        loop {
            let pooled = self.pool.lock().await.pop();
            let Some(mut sender) = pooled else {
                break;
            };
            if sender.is_closed() {
                debug!("Discarding closed connection from pool");
                continue;
            }
            match tokio::time::timeout(Duration::from_millis(100), sender.ready()).await {
                Ok(Ok(())) => {
                    debug!("Reusing pooled connection to {}", self.target.authority());
                    return Ok(sender);
                }
                _ => debug!("Discarding stale connection from pool"),
            }
        }

        tokio::time::timeout(self.connect_timeout, self.connect())
            .await
            .map_err(|_| ProxyError::ConnectTimeout {
                target: self.target.authority().to_string(),
                secs: self.connect_timeout.as_secs(),
            })?
    }

    async fn connect(&self) -> Result<UpstreamSender, ProxyError> {
        let connection_failed = |reason: String| ProxyError::ConnectionFailed {
            target: self.target.authority().to_string(),
            reason,
        };

        debug!("Creating new connection to {}", self.target.authority());
        let stream = TcpStream::connect((self.target.host(), self.target.port()))
            .await
            .map_err(|e| connection_failed(e.to_string()))?;
        let _ = stream.set_nodelay(true);

        match &self.tls {
            None => handshake(stream).await.map_err(connection_failed),
            Some((connector, server_name)) => {
                let tls_stream = connector
                    .connect(server_name.clone(), stream)
                    .await
                    .map_err(|e| connection_failed(format!("TLS handshake failed: {}", e)))?;
                handshake(tls_stream).await.map_err(connection_failed)
            }
        }
    }
}

async fn handshake<I>(io: I) -> Result<UpstreamSender, String>
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sender, conn) = http1::Builder::new()
        .preserve_header_case(true)
        .handshake(TokioIo::new(io))
        .await
        .map_err(|e| format!("HTTP handshake failed: {}", e))?;

    // Spawn connection driver
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Upstream connection closed: {}", e);
        }
    });

    Ok(sender)
}

fn build_tls_connector() -> Result<TlsConnector, ConfigError> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| ConfigError::Tls(e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();

    // Connections speak HTTP/1.1 only
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(TlsConnector::from(Arc::new(config)))
}
