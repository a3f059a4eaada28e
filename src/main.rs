//! camo - HMAC-signed HTTPS asset proxy.
//!
//! Initializes the runtime, loads configuration, sets up logging, and
//! launches the proxy service and the loopback metrics listener.

use camo::{CamoProxy, Metrics, run_gauge_ticker, run_metrics_listener};
use camo::config::{Config, HMAC_ENV_KEY};
use clap::Parser;
use pingora::proxy::http_proxy_service;
use pingora::server::Server;
use pingora::server::configuration::ServerConf;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

/// Seconds in-flight requests get to drain on shutdown.
const GRACE_PERIOD_SECS: u64 = 10;

#[derive(Parser, Debug)]
#[command(name = "camo", version, about = "HMAC-signed asset proxy")]
struct Cli {
    /// Address to listen on; overrides CAMO_LISTEN_ADDR.
    #[arg(long)]
    addr: Option<SocketAddr>,

    /// Maximum proxied body size in MB; overrides CAMO_MAX_SIZE_MB.
    #[arg(long)]
    maxsize: Option<u64>,

    /// Shared HMAC secret; overrides CAMO_HMAC_SECRET.
    #[arg(long)]
    secret: Option<String>,

    /// TLS certificate path; overrides CAMO_TLS_CERT.
    #[arg(long)]
    cert: Option<String>,

    /// TLS key path; overrides CAMO_TLS_KEY.
    #[arg(long)]
    key: Option<String>,

    /// Debug-level logging.
    #[arg(long, short = 'v')]
    verbose: bool,
}

fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let (non_blocking, _guard) = tracing_appender::non_blocking(std::io::stdout());
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking);

    let mut config = (*Config::from_env()).clone();
    if let Some(addr) = cli.addr {
        config.listen_addr = addr;
    }
    if let Some(maxsize) = cli.maxsize {
        config.max_size = maxsize * 1024 * 1024;
    }
    if let Some(secret) = cli.secret {
        config.hmac_secret = Zeroizing::new(secret);
    }
    if let Some(cert) = cli.cert {
        config.tls_cert = Some(cert);
    }
    if let Some(key) = cli.key {
        config.tls_key = Some(key);
    }

    if config.log_format.eq_ignore_ascii_case("pretty") {
        subscriber.init();
    } else {
        subscriber.json().init();
    }

    if config.hmac_secret.is_empty() {
        panic!("FATAL: {HMAC_ENV_KEY} must be set (or pass --secret)");
    }

    let config = Arc::new(config);
    info!(
        listen_addr = %config.listen_addr,
        metrics_addr = %config.metrics_addr,
        server_name = %config.server_name,
        max_size = config.max_size,
        max_redirects = config.max_redirects,
        tls = config.tls_enabled(),
        log_format = %config.log_format,
        "Server initialized"
    );

    let metrics = Metrics::new();
    let proxy = CamoProxy::new(config.clone(), metrics.clone())
        .unwrap_or_else(|e| panic!("FATAL: {e}"));

    let mut server_conf = ServerConf::default();
    server_conf.grace_period_seconds = Some(GRACE_PERIOD_SECS);
    let mut server = Server::new_with_opt_and_conf(None, server_conf);
    server.bootstrap();

    let mut proxy_service = http_proxy_service(&server.configuration, proxy);
    match (&config.tls_cert, &config.tls_key) {
        (Some(cert), Some(key)) => {
            proxy_service
                .add_tls(&config.listen_addr.to_string(), cert, key)
                .expect("Failed to configure TLS listener");
        }
        _ => proxy_service.add_tcp(&config.listen_addr.to_string()),
    }
    server.add_service(proxy_service);

    let metrics_addr = config.metrics_addr;
    let metrics_for_thread = metrics.clone();
    std::thread::spawn(move || {
        let rt = tokio::runtime::Runtime::new().expect("Failed to create tokio runtime");
        rt.block_on(async move {
            tokio::spawn(run_gauge_ticker(metrics_for_thread.clone()));
            run_metrics_listener(metrics_addr, metrics_for_thread).await;
        });
    });

    server.run_forever();
}
