use std::process;

use clap::Parser;
use durable_stream::{proxy::ProxyConfig, server, types::ServerOptions};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(name = "streamd", version, about = "Durable streams server", long_about = None)]
struct Opts {
    /// Host to bind to
    #[arg(long, env = "STREAMD_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on (0 for auto-assign)
    #[arg(long, short = 'p', env = "STREAMD_PORT", default_value_t = 4437)]
    port: u16,

    /// Long-poll timeout in milliseconds
    #[arg(long, env = "STREAMD_LONG_POLL_TIMEOUT_MS", default_value_t = 20_000)]
    long_poll_timeout_ms: u64,

    /// Data directory for file-backed persistence (in-memory if unset)
    #[arg(long, short = 'd', env = "STREAMD_DATA_DIR")]
    data_dir: Option<String>,

    /// Disable response compression
    #[arg(long, default_value_t = false)]
    no_compression: bool,

    /// Cursor interval in seconds
    #[arg(long, env = "STREAMD_CURSOR_INTERVAL", default_value_t = 20)]
    cursor_interval_seconds: u64,

    /// TTL sweep interval in milliseconds
    #[arg(long, default_value_t = 1_000)]
    sweep_interval_ms: u64,

    /// Largest accepted append body, in bytes
    #[arg(long, default_value_t = 16 * 1024 * 1024)]
    max_append_bytes: usize,

    /// Service secret enabling the proxy profile
    #[arg(long, env = "STREAMD_PROXY_SECRET")]
    proxy_secret: Option<String>,

    /// Allowlisted upstream host (repeatable)
    #[arg(long = "proxy-allow", env = "STREAMD_PROXY_ALLOW", value_delimiter = ',')]
    proxy_allow: Vec<String>,

    /// Mount point of the proxy endpoints
    #[arg(long, default_value = "/proxy")]
    proxy_base_path: String,

    /// Signed proxy URL lifetime in seconds
    #[arg(long, default_value_t = 3600)]
    proxy_url_ttl_seconds: u64,
}

impl Opts {
    fn server_options(&self) -> ServerOptions {
        ServerOptions {
            host: self.host.clone(),
            port: self.port,
            long_poll_timeout_ms: self.long_poll_timeout_ms,
            data_dir: self.data_dir.clone(),
            compression: !self.no_compression,
            cursor_interval_seconds: self.cursor_interval_seconds,
            sweep_interval_ms: self.sweep_interval_ms,
            max_append_bytes: self.max_append_bytes,
            ..Default::default()
        }
    }

    fn proxy_config(&self) -> Option<ProxyConfig> {
        let secret = self.proxy_secret.clone()?;
        if self.proxy_allow.is_empty() {
            error!("--proxy-secret set but no --proxy-allow hosts; proxy profile disabled");
            return None;
        }
        Some(ProxyConfig {
            secret,
            allowed_hosts: self.proxy_allow.clone(),
            base_path: self.proxy_base_path.clone(),
            default_url_ttl_seconds: self.proxy_url_ttl_seconds,
        })
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let opts = Opts::parse();
    let (router, addr) = match server::prepare(opts.server_options(), opts.proxy_config()) {
        Ok(prepared) => prepared,
        Err(err) => {
            error!(error = %err, "failed to initialize server");
            process::exit(1);
        }
    };

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(addr = %addr, error = %err, "failed to bind");
            process::exit(1);
        }
    };
    info!(addr = %addr, "durable streams server listening");

    if let Err(err) = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(error = %err, "server error");
        process::exit(1);
    }
    info!("server shut down gracefully");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
