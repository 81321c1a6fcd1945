//! Forwarding engine: the per-request state machine
//!
//! ```text
//! Received ──► Forwarding ──► Completed ──► Logged
//!     │             │                         ▲
//!     └─────────────┴──────► Failed ──────────┘
//! ```
//!
//! Each exchange runs on its own task, detached from the connection that
//! delivered it. If the caller goes away the task still reaches `Logged`:
//! before the upstream answers the exchange fails, after that the rest of
//! the upstream body is drained into the capture.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{SecondsFormat, Utc};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Body;
use hyper::header::{HeaderValue, CONTENT_TYPE, HOST};
use hyper::{Method, Request, Response, StatusCode, Uri, Version};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::body::{self, ProxyBody};
use crate::capture::BodyCapture;
use crate::config::{ConfigError, ProxyConfig};
use crate::error::ProxyError;
use crate::headers::{content_encoding, headers_to_json, is_json_content_type, strip_hop_by_hop};
use crate::upstream::UpstreamClient;
use crate::writer::{ExchangeRecord, LogWriter};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    Received,
    Forwarding,
    Completed,
    Failed,
    Logged,
}

impl ExchangeState {
    pub fn can_advance_to(self, next: ExchangeState) -> bool {
        use ExchangeState::*;
        matches!(
            (self, next),
            (Received, Forwarding)
                | (Received, Failed)
                | (Forwarding, Completed)
                | (Forwarding, Failed)
                | (Completed, Logged)
                | (Failed, Logged)
        )
    }
}

/// One exchange in flight and the record it accumulates
struct Exchange {
    state: ExchangeState,
    received: Instant,
    record: ExchangeRecord,
}

impl Exchange {
    fn advance(&mut self, next: ExchangeState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "invalid transition {:?} -> {:?}",
            self.state,
            next
        );
        debug!(
            "{} {}: {:?} -> {:?}",
            self.record.method, self.record.path, self.state, next
        );
        self.state = next;
    }
}

pub struct ForwardingEngine {
    upstream: UpstreamClient,
    writer: LogWriter,
    host: HeaderValue,
    max_request_body_bytes: usize,
    max_capture_bytes: usize,
    upstream_timeout: Duration,
}

impl ForwardingEngine {
    pub fn new(
        config: &ProxyConfig,
        upstream: UpstreamClient,
        writer: LogWriter,
    ) -> Result<Self, ConfigError> {
        let authority = upstream.target().authority();
        let host = HeaderValue::from_str(authority).map_err(|e| ConfigError::InvalidTargetUrl {
            url: upstream.target().base_url().to_string(),
            reason: format!("authority is not a valid Host header: {}", e),
        })?;

        Ok(Self {
            upstream,
            writer,
            host,
            max_request_body_bytes: config.max_request_body_bytes,
            max_capture_bytes: config.max_capture_bytes,
            upstream_timeout: config.upstream_timeout,
        })
    }

    /// Handle one inbound request.
    ///
    /// Always yields a response: the upstream's, or a synthesized error.
    pub async fn handle<B>(self: Arc<Self>, req: Request<B>) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let (respond, response) = oneshot::channel();
        tokio::spawn(self.run_exchange(req, respond));

        match response.await {
            Ok(response) => response,
            Err(_) => error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "exchange ended without a response",
            ),
        }
    }

    async fn run_exchange<B>(
        self: Arc<Self>,
        req: Request<B>,
        mut respond: oneshot::Sender<Response<ProxyBody>>,
    ) where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let received = Instant::now();
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);

        let (parts, body) = req.into_parts();
        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        let mut exchange = Exchange {
            state: ExchangeState::Received,
            received,
            record: ExchangeRecord {
                timestamp,
                method: parts.method.as_str().to_ascii_uppercase(),
                target_url: self.upstream.target().url_for(&path),
                path: path.clone(),
                request_headers: headers_to_json(&parts.headers),
                request_body: None,
                response_status: None,
                response_headers: None,
                response_body: None,
                duration_ms: None,
            },
        };

        if parts.method == Method::CONNECT {
            let error = ProxyError::InvalidRequest("CONNECT is not supported".to_string());
            return self.reject(exchange, respond, error).await;
        }

        let bytes = match Limited::new(body, self.max_request_body_bytes).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                let error = if e.downcast_ref::<LengthLimitError>().is_some() {
                    ProxyError::RequestTooLarge {
                        limit: self.max_request_body_bytes,
                    }
                } else {
                    ProxyError::RequestBody(e.to_string())
                };
                return self.reject(exchange, respond, error).await;
            }
        };

        // Non-JSON or unparseable bodies are logged as null
        if is_json_content_type(&parts.headers) && !bytes.is_empty() {
            exchange.record.request_body = serde_json::from_slice(&bytes).ok();
        }

        let uri = match self.upstream.target().request_target(&path).parse::<Uri>() {
            Ok(uri) => uri,
            Err(e) => {
                let error = ProxyError::InvalidRequest(format!("Invalid request target: {}", e));
                return self.reject(exchange, respond, error).await;
            }
        };

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        headers.insert(HOST, self.host.clone());

        let mut upstream_req = Request::new(Full::new(bytes));
        *upstream_req.method_mut() = parts.method;
        *upstream_req.uri_mut() = uri;
        *upstream_req.version_mut() = Version::HTTP_11;
        *upstream_req.headers_mut() = headers;
        // Carries the inbound header case map to the upstream connection
        *upstream_req.extensions_mut() = parts.extensions;

        exchange.advance(ExchangeState::Forwarding);

        let sent = tokio::select! {
            result = self.upstream.send(upstream_req) => result,
            _ = respond.closed() => Err(ProxyError::ClientDisconnected),
        };

        let (response, sender) = match sent {
            Ok(sent) => sent,
            Err(error) => return self.reject(exchange, respond, error).await,
        };

        let (head, mut upstream_body) = response.into_parts();
        exchange.record.response_status = Some(head.status.as_u16());
        exchange.record.response_headers = Some(headers_to_json(&head.headers));
        let encoding = content_encoding(&head.headers);

        let mut client_headers = head.headers;
        strip_hop_by_hop(&mut client_headers);

        let (tx, client_body) = body::channel();
        let mut client_response = Response::new(client_body);
        *client_response.status_mut() = head.status;
        *client_response.headers_mut() = client_headers;
        // Reason phrase and header case of the upstream response
        *client_response.extensions_mut() = head.extensions;

        let mut client = match respond.send(client_response) {
            Ok(()) => Some(tx),
            Err(_) => {
                debug!(
                    "Client left before the response head, draining {}",
                    exchange.record.path
                );
                None
            }
        };

        let mut capture = BodyCapture::new(self.max_capture_bytes);
        let outcome = loop {
            let frame = match tokio::time::timeout(self.upstream_timeout, upstream_body.frame()).await
            {
                Err(_) => {
                    break Err(ProxyError::ResponseTimeout {
                        secs: self.upstream_timeout.as_secs(),
                    })
                }
                Ok(None) => break Ok(()),
                Ok(Some(Err(e))) => break Err(ProxyError::ResponseBody(e.to_string())),
                Ok(Some(Ok(frame))) => frame,
            };

            if let Some(data) = frame.data_ref() {
                capture.push(data);
            }
            if let Some(tx) = &client {
                if tx.send(Ok(frame)).await.is_err() {
                    debug!(
                        "Client disconnected mid-stream, draining {}",
                        exchange.record.path
                    );
                    client = None;
                }
            }
        };

        let mut rendered = capture.render(encoding.as_deref());
        match outcome {
            Ok(()) => {
                drop(client);
                self.upstream.release(sender).await;
                exchange.advance(ExchangeState::Completed);
            }
            Err(error) => {
                warn!(
                    "{} {} upstream body failed: {}",
                    exchange.record.method, exchange.record.path, error
                );
                if let Some(tx) = client.take() {
                    let _ = tx.send(Err(error.clone())).await;
                }
                rendered.push_str(&format!("\n[upstream body error: {}]", error));
                exchange.advance(ExchangeState::Failed);
            }
        }
        exchange.record.response_body = Some(rendered);

        self.finish(exchange).await
    }

    /// Answer with a synthesized error before any upstream response.
    ///
    /// Client errors are logged with the status the caller saw; upstream
    /// failures are logged without a status.
    async fn reject(
        &self,
        mut exchange: Exchange,
        respond: oneshot::Sender<Response<ProxyBody>>,
        error: ProxyError,
    ) {
        warn!(
            "{} {} failed: {}",
            exchange.record.method, exchange.record.path, error
        );
        let status = error.status();
        if error.is_client_error() {
            exchange.record.response_status = Some(status.as_u16());
        }
        exchange.record.response_body = Some(error.to_string());
        let _ = respond.send(error_response(status, &error.to_string()));
        exchange.advance(ExchangeState::Failed);
        self.finish(exchange).await
    }

    /// Stamp the duration and hand the record to the log writer
    async fn finish(&self, mut exchange: Exchange) {
        let elapsed = exchange.received.elapsed().as_millis();
        let duration_ms = u64::try_from(elapsed).unwrap_or(u64::MAX);
        exchange.record.duration_ms = Some(duration_ms);

        match exchange.record.response_status {
            Some(status) => info!(
                "{} {} -> {} ({}ms)",
                exchange.record.method, exchange.record.path, status, duration_ms
            ),
            None => info!(
                "{} {} -> error ({}ms)",
                exchange.record.method, exchange.record.path, duration_ms
            ),
        }

        let record = exchange.record.clone();
        if let Err(e) = self.writer.write(record).await {
            warn!(
                "Failed to log {} {}: {}",
                exchange.record.method, exchange.record.path, e
            );
        }
        exchange.advance(ExchangeState::Logged);
    }
}

fn error_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let mut response = Response::new(body::full(format!("Proxy error: {}", message)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        use ExchangeState::*;

        assert!(Received.can_advance_to(Forwarding));
        assert!(Received.can_advance_to(Failed));
        assert!(Forwarding.can_advance_to(Completed));
        assert!(Forwarding.can_advance_to(Failed));
        assert!(Completed.can_advance_to(Logged));
        assert!(Failed.can_advance_to(Logged));

        assert!(!Received.can_advance_to(Logged));
        assert!(!Received.can_advance_to(Completed));
        assert!(!Completed.can_advance_to(Failed));
        assert!(!Logged.can_advance_to(Received));
    }

    #[tokio::test]
    async fn test_error_response_shape() {
        let response = error_response(StatusCode::BAD_GATEWAY, "connection refused");
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "text/plain; charset=utf-8"
        );

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"Proxy error: connection refused");
    }
}
