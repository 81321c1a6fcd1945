//! Log writer: the single write path into `request_logs`
//!
//! Records are queued to one task that owns the database handle and inserts
//! them one at a time, so `id` order is write order. Callers get the outcome
//! of their own insert back, but a failed insert is only ever reported on
//! the operational log; it never changes the HTTP response.

use std::time::Duration;

use apilog_db::entities::{request_log, RequestLog};
use sea_orm::{DatabaseConnection, DbErr, EntityTrait, Set};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::compact::compact_streaming_response;

/// Records waiting for the writer before `write` starts to wait
const QUEUE_CAPACITY: usize = 1024;

/// One finished exchange, ready to persist
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeRecord {
    pub timestamp: String,
    pub method: String,
    pub path: String,
    pub target_url: String,
    pub request_headers: Value,
    pub request_body: Option<Value>,
    pub response_status: Option<u16>,
    pub response_headers: Option<Value>,
    pub response_body: Option<String>,
    pub duration_ms: Option<u64>,
}

impl ExchangeRecord {
    /// Whether the upstream answered with `Content-Type: text/event-stream`
    fn is_event_stream(&self) -> bool {
        let content_type = self
            .response_headers
            .as_ref()
            .and_then(|headers| headers.get("content-type"));

        let is_sse = |value: &Value| {
            value
                .as_str()
                .map(|ct| ct.to_ascii_lowercase().starts_with("text/event-stream"))
                .unwrap_or(false)
        };

        match content_type {
            Some(Value::Array(values)) => values.iter().any(is_sse),
            Some(value) => is_sse(value),
            None => false,
        }
    }

    fn into_active_model(self, options: &WriterOptions) -> request_log::ActiveModel {
        let compact = options.compact_streaming_responses && self.is_event_stream();
        let response_body = match self.response_body {
            Some(body) if compact => {
                Some(compact_streaming_response(&body).unwrap_or(body))
            }
            other => other,
        };

        request_log::ActiveModel {
            timestamp: Set(self.timestamp),
            method: Set(self.method),
            path: Set(self.path),
            target_url: Set(self.target_url),
            request_headers: Set(self.request_headers),
            request_body: Set(self.request_body),
            response_status: Set(self.response_status.map(i32::from)),
            response_headers: Set(self.response_headers),
            response_body: Set(response_body),
            duration_ms: Set(self
                .duration_ms
                .map(|d| i64::try_from(d).unwrap_or(i64::MAX))),
            ..Default::default()
        }
    }
}

#[derive(Debug, Error)]
pub enum LogWriteError {
    #[error("Log writer is shut down")]
    Closed,

    #[error("Database error: {0}")]
    Database(#[from] DbErr),
}

#[derive(Debug, Clone, Default)]
pub struct WriterOptions {
    /// Store SSE message streams as one compacted JSON document
    pub compact_streaming_responses: bool,
}

struct WriteJob {
    record: ExchangeRecord,
    ack: oneshot::Sender<Result<i64, LogWriteError>>,
}

/// Cloneable handle used by exchanges to submit records
#[derive(Clone)]
pub struct LogWriter {
    tx: mpsc::Sender<WriteJob>,
}

/// The writer task. Finishes once every [`LogWriter`] handle is dropped and
/// the queue is drained.
pub struct LogWriterTask {
    handle: JoinHandle<()>,
}

impl LogWriter {
    pub fn spawn(db: DatabaseConnection, options: WriterOptions) -> (LogWriter, LogWriterTask) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let handle = tokio::spawn(run_writer(db, options, rx));
        (LogWriter { tx }, LogWriterTask { handle })
    }

    /// Persist one record and return its assigned id
    pub async fn write(&self, record: ExchangeRecord) -> Result<i64, LogWriteError> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(WriteJob { record, ack })
            .await
            .map_err(|_| LogWriteError::Closed)?;
        done.await.map_err(|_| LogWriteError::Closed)?
    }
}

impl LogWriterTask {
    /// Wait (bounded) for queued records to be written
    pub async fn shutdown(self, timeout: Duration) {
        match tokio::time::timeout(timeout, self.handle).await {
            Ok(Ok(())) => info!("Log writer drained"),
            Ok(Err(e)) => error!("Log writer task failed: {}", e),
            Err(_) => warn!("Log writer did not drain within {:?}", timeout),
        }
    }
}

async fn run_writer(
    db: DatabaseConnection,
    options: WriterOptions,
    mut rx: mpsc::Receiver<WriteJob>,
) {
    debug!("Log writer started");

    while let Some(WriteJob { record, ack }) = rx.recv().await {
        let method = record.method.clone();
        let path = record.path.clone();
        let model = record.into_active_model(&options);

        let result = RequestLog::insert(model)
            .exec(&db)
            .await
            .map(|res| res.last_insert_id)
            .map_err(LogWriteError::from);

        match &result {
            Ok(id) => debug!("Logged exchange {} {} as #{}", method, path, id),
            Err(e) => error!("Failed to log exchange {} {}: {}", method, path, e),
        }

        // The submitter may have gone away; the row is written either way
        let _ = ack.send(result);
    }

    debug!("Log writer stopped");
}
