//! Proxy server: the listener in front of the forwarding engine

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::server::graceful::GracefulShutdown;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::engine::ForwardingEngine;

/// How long open connections get to finish after shutdown starts
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try a different port with --port or PROXY_PORT")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },
}

pub struct ProxyServer {
    listener: TcpListener,
    engine: Arc<ForwardingEngine>,
}

impl ProxyServer {
    pub async fn bind(addr: SocketAddr, engine: Arc<ForwardingEngine>) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::BindError {
                address: addr.ip().to_string(),
                port: addr.port(),
                reason: e.to_string(),
            })?;

        Ok(Self { listener, engine })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until `shutdown` resolves, then wait (bounded) for open
    /// connections to finish their in-flight responses
    pub async fn run<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let bound_addr = self.listener.local_addr()?;
        info!("Proxy listening on {}", bound_addr);

        let mut builder = http1::Builder::new();
        builder
            .preserve_header_case(true)
            .keep_alive(true)
            .timer(TokioTimer::new());

        let graceful = GracefulShutdown::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        let _ = stream.set_nodelay(true);
                        debug!("Accepted connection from {}", peer_addr);

                        let engine = self.engine.clone();
                        let service = service_fn(move |req: Request<Incoming>| {
                            let engine = engine.clone();
                            async move { Ok::<_, Infallible>(engine.handle(req).await) }
                        });

                        let connection = graceful.watch(
                            builder.serve_connection(TokioIo::new(stream), service),
                        );

                        tokio::spawn(async move {
                            if let Err(e) = connection.await {
                                debug!("Connection error from {}: {}", peer_addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                },
                _ = &mut shutdown => {
                    info!("Shutdown requested, no longer accepting connections");
                    break;
                }
            }
        }

        drop(self.listener);

        match tokio::time::timeout(DRAIN_TIMEOUT, graceful.shutdown()).await {
            Ok(()) => info!("All connections closed"),
            Err(_) => warn!(
                "Connections still open after {:?}, shutting down anyway",
                DRAIN_TIMEOUT
            ),
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProxyConfig, UpstreamTarget};
    use crate::upstream::UpstreamClient;
    use crate::writer::{LogWriter, WriterOptions};

    async fn engine() -> (tempfile::TempDir, Arc<ForwardingEngine>) {
        let dir = tempfile::tempdir().unwrap();
        let db = apilog_db::open(&dir.path().join("requests.db"), &Default::default())
            .await
            .unwrap();
        apilog_db::migrate(&db).await.unwrap();

        let config = ProxyConfig::new(
            "127.0.0.1:0".parse().unwrap(),
            UpstreamTarget::parse("http://127.0.0.1:9").unwrap(),
        );
        let (writer, _task) = LogWriter::spawn(db, WriterOptions::default());
        let upstream = UpstreamClient::new(&config).unwrap();
        let engine = ForwardingEngine::new(&config, upstream, writer).unwrap();
        (dir, Arc::new(engine))
    }

    #[tokio::test]
    async fn test_bind_conflict_is_bind_error() {
        let (_dir, engine) = engine().await;
        let first = ProxyServer::bind("127.0.0.1:0".parse().unwrap(), engine.clone())
            .await
            .unwrap();
        let addr = first.local_addr().unwrap();

        match ProxyServer::bind(addr, engine).await {
            Err(ServerError::BindError { port, .. }) => assert_eq!(port, addr.port()),
            Err(other) => panic!("expected BindError, got {}", other),
            Ok(_) => panic!("second bind on {} succeeded", addr),
        }
    }

    #[tokio::test]
    async fn test_run_returns_after_shutdown() {
        let (_dir, engine) = engine().await;
        let server = ProxyServer::bind("127.0.0.1:0".parse().unwrap(), engine)
            .await
            .unwrap();

        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(server.run(async {
            let _ = stopped.await;
        }));

        stop.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
