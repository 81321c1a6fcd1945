//! Transparent logging reverse proxy
//!
//! Every inbound request is forwarded to a single upstream base URL and the
//! upstream response is streamed back unchanged. Once the exchange reaches a
//! terminal state, exactly one [`ExchangeRecord`] is handed to the
//! [`LogWriter`], which persists it through `apilog-db`.
//!
//! ```text
//! client ──► ProxyServer ──► ForwardingEngine ──► UpstreamClient ──► upstream
//!                                   │
//!                                   └──► LogWriter ──► request_logs (SQLite)
//! ```

pub mod body;
pub mod capture;
pub mod compact;
pub mod config;
pub mod engine;
pub mod error;
pub mod headers;
pub mod server;
pub mod upstream;
pub mod writer;

pub use config::{ConfigError, ProxyConfig, UpstreamTarget};
pub use engine::{ExchangeState, ForwardingEngine};
pub use error::ProxyError;
pub use server::{ProxyServer, ServerError};
pub use upstream::UpstreamClient;
pub use writer::{ExchangeRecord, LogWriteError, LogWriter, LogWriterTask, WriterOptions};
