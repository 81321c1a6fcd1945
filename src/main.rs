//! apilog - transparent logging reverse proxy
//!
//! Forwards every request to one upstream API and records each exchange in a
//! SQLite database that analytics tooling can query directly.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use apilog_db::{Durability, StoreOptions};
use apilog_proxy::config::{
    DEFAULT_DB_PATH, DEFAULT_MAX_CAPTURE_BYTES, DEFAULT_MAX_REQUEST_BODY_BYTES, DEFAULT_PORT,
    DEFAULT_TARGET_API_URL,
};
use apilog_proxy::{
    ForwardingEngine, LogWriter, ProxyConfig, ProxyServer, UpstreamClient, UpstreamTarget,
    WriterOptions,
};

/// How long queued log records get to reach the database on shutdown
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Logging reverse proxy for HTTP APIs
#[derive(Parser, Debug)]
#[command(name = "apilog")]
#[command(about = "Forward HTTP traffic to an upstream API and log every exchange to SQLite", long_about = None)]
#[command(version)]
struct Cli {
    /// Port to listen on
    #[arg(long, env = "PROXY_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Interface to listen on
    #[arg(long, env = "PROXY_BIND_HOST", default_value = "0.0.0.0")]
    bind_host: IpAddr,

    /// Upstream base URL all requests are forwarded to
    #[arg(long, env = "TARGET_API_URL", default_value = DEFAULT_TARGET_API_URL)]
    target_api_url: String,

    /// SQLite database file (parent directories are created)
    #[arg(long, env = "DB_PATH", default_value = DEFAULT_DB_PATH)]
    db_path: PathBuf,

    /// Reject request bodies larger than this with 413
    #[arg(long, env = "MAX_REQUEST_BODY_BYTES", default_value_t = DEFAULT_MAX_REQUEST_BODY_BYTES)]
    max_request_body_bytes: usize,

    /// Response bytes kept for the log (the client always gets the full body)
    #[arg(long, env = "MAX_CAPTURE_BYTES", default_value_t = DEFAULT_MAX_CAPTURE_BYTES)]
    max_capture_bytes: usize,

    /// Timeout for connecting to the upstream, including TLS
    #[arg(long, env = "UPSTREAM_CONNECT_TIMEOUT_SECS", default_value_t = 10)]
    connect_timeout_secs: u64,

    /// Timeout for upstream response headers and for each gap in the body
    #[arg(long, env = "UPSTREAM_TIMEOUT_SECS", default_value_t = 600)]
    upstream_timeout_secs: u64,

    /// SQLite synchronous level: off, normal, full or extra
    #[arg(long, env = "DB_SYNCHRONOUS", default_value = "normal")]
    db_synchronous: Durability,

    /// Store streamed (SSE) responses as one compacted JSON document
    #[arg(long, env = "COMPACT_STREAMING_RESPONSES")]
    compact_streaming_responses: bool,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level)?;

    info!("Starting apilog proxy");

    let target = UpstreamTarget::parse(&cli.target_api_url)
        .context("TARGET_API_URL must be an absolute http(s) URL")?;
    info!("Upstream: {}", target.base_url());

    let listen_addr = SocketAddr::new(cli.bind_host, cli.port);
    let mut config = ProxyConfig::new(listen_addr, target);
    config.max_request_body_bytes = cli.max_request_body_bytes;
    config.max_capture_bytes = cli.max_capture_bytes;
    config.connect_timeout = Duration::from_secs(cli.connect_timeout_secs);
    config.upstream_timeout = Duration::from_secs(cli.upstream_timeout_secs);

    // Schema must be in place before the listener binds
    let store_options = StoreOptions {
        durability: cli.db_synchronous,
        ..StoreOptions::default()
    };
    let db = apilog_db::open(&cli.db_path, &store_options)
        .await
        .with_context(|| format!("Failed to open database {}", cli.db_path.display()))?;

    apilog_db::migrate(&db)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to run database migrations: {}", e))?;

    let (writer, writer_task) = LogWriter::spawn(
        db,
        WriterOptions {
            compact_streaming_responses: cli.compact_streaming_responses,
        },
    );

    let upstream = UpstreamClient::new(&config).context("Failed to set up upstream client")?;
    let engine = Arc::new(
        ForwardingEngine::new(&config, upstream, writer).context("Invalid upstream target")?,
    );

    let server = ProxyServer::bind(config.listen_addr, engine.clone()).await?;
    info!("Logging exchanges to {}", cli.db_path.display());

    server.run(shutdown_signal()).await?;

    // Exchanges still in flight hold their own engine handle; the writer
    // finishes once the last of them has logged
    drop(engine);
    writer_task.shutdown(WRITER_DRAIN_TIMEOUT).await;

    info!("Proxy stopped");
    Ok(())
}

async fn shutdown_signal() {
    match signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received, stopping proxy..."),
        Err(e) => {
            error!("Unable to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await
        }
    }
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
