//! RProxy - Main entry point
//!
//! Virtual-host reverse proxy with SNI-based TLS termination

use anyhow::{Context, Result};
use clap::Parser;
use rproxy::{load_rules, FallbackPolicy, ForwardOptions, ProxyConfig, ProxyServer};
use std::fs::OpenOptions;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// RProxy - a virtual-host reverse proxy
#[derive(Parser, Debug)]
#[command(name = "rproxy")]
#[command(author = "RProxy Contributors")]
#[command(version = "1.0.0")]
#[command(about = "Virtual-host reverse proxy with SNI-based TLS termination")]
struct Args {
    /// Rule file (JSON or YAML)
    #[arg(short = 'c', long, env = "PROXY_CONFIG", default_value = "config.yaml")]
    config: PathBuf,

    /// Plaintext HTTP port
    #[arg(short = 'p', long, env = "PORT", default_value = "80")]
    port: u16,

    /// HTTPS port, only bound when a rule enables TLS
    #[arg(long, env = "TLS_PORT", default_value = "443")]
    tls_port: u16,

    /// Address both listeners bind to
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Certificate for unknown SNI names: first, none, or a server name
    #[arg(long, env = "DEFAULT_CERT", default_value = "first")]
    default_cert: FallbackPolicy,

    /// Send the backend's host:port as Host instead of the client's Host header
    #[arg(long)]
    rewrite_host: bool,

    /// Add X-Forwarded-For and X-Forwarded-Proto
    #[arg(long)]
    forwarded_for: bool,

    /// Keep serving plaintext when certificates fail to load
    #[arg(long)]
    isolate_tls_failure: bool,

    /// Seconds allowed for reading request headers (and the TLS handshake)
    #[arg(long, default_value = "5")]
    header_timeout: u64,

    /// Seconds allowed for connecting to a backend
    #[arg(long, default_value = "10")]
    connect_timeout: u64,

    /// Seconds to wait for backend response headers
    #[arg(long, default_value = "30")]
    upstream_timeout: u64,

    /// Seconds a request or response body may stall
    #[arg(long, default_value = "60")]
    body_idle_timeout: u64,

    /// Append logs to this file instead of stdout
    #[arg(long)]
    logfile: Option<PathBuf>,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

fn init_logging(args: &Args) -> Result<()> {
    let debug_mode = std::env::var("REVERSEPROXY_DEBUG").map(|v| v == "true").unwrap_or(false);
    let level = if debug_mode { "debug" } else { args.log_level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .compact();

    match &args.logfile {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("cannot open logfile {}", path.display()))?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).init();
        }
        None => builder.init(),
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    info!("Starting RProxy v1.0.0");

    let rules = load_rules(&args.config)
        .with_context(|| format!("failed to load rules from {}", args.config.display()))?;
    info!("Loaded {} rule(s) from {}", rules.len(), args.config.display());

    let config = ProxyConfig {
        bind_addr: args.bind,
        http_port: args.port,
        https_port: args.tls_port,
        fallback: args.default_cert,
        isolate_tls_failure: args.isolate_tls_failure,
        forward: ForwardOptions {
            rewrite_host: args.rewrite_host,
            forwarded_for: args.forwarded_for,
        },
        header_read_timeout: Duration::from_secs(args.header_timeout),
        connect_timeout: Duration::from_secs(args.connect_timeout),
        upstream_timeout: Duration::from_secs(args.upstream_timeout),
        body_idle_timeout: Duration::from_secs(args.body_idle_timeout),
    };

    let server = Arc::new(ProxyServer::new(config, &rules)?);
    info!("TLS: {:?}", server.tls_status());

    server.run().await?;

    Ok(())
}
