//! TierCache - Multi-Tier Cache Daemon
//!
//! Runs a cache instance with its maintenance scheduler and exposes health
//! and Prometheus endpoints. Also offers offline tools for a durable tier
//! directory.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use clap::{Parser, Subcommand};
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tiercache::cache::{
    read_record_headers, DurableConfig, DurableTier, SchedulerState, Tier,
};
use tiercache::config::{format_duration, parse_duration};
use tiercache::{CacheCoordinator, CacheExporter, MaintenanceScheduler, TierCacheConfig};

/// TierCache - multi-tier cache daemon and tools
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, global = true, env = "TIERCACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Enable JSON logging
    #[arg(long, global = true, env = "LOG_JSON", default_value = "false")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the cache with its scheduler, health and metrics endpoints
    Serve {
        /// Metrics server address
        #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
        metrics_addr: String,

        /// Health probe server address
        #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
        health_addr: String,

        /// Durable tier directory (overrides the config file)
        #[arg(long, env = "TIERCACHE_DURABLE_DIR")]
        durable_dir: Option<PathBuf>,

        /// Leave the edge tier out of the chain
        #[arg(long, env = "TIERCACHE_NO_EDGE", default_value = "false")]
        no_edge: bool,

        /// Expiration sweep interval (e.g. "30s", "5m")
        #[arg(long, env = "TIERCACHE_SWEEP_INTERVAL", value_parser = parse_interval)]
        sweep_interval: Option<Duration>,
    },

    /// Print the record headers found in a durable tier directory
    Inspect {
        /// Durable tier directory
        #[arg(long)]
        dir: PathBuf,

        /// Print JSON instead of a table
        #[arg(long, default_value = "false")]
        json: bool,
    },

    /// Delete expired, corrupt and leftover records from a durable tier directory
    Sweep {
        /// Durable tier directory
        #[arg(long)]
        dir: PathBuf,
    },
}

fn parse_interval(raw: &str) -> Result<Duration, String> {
    parse_duration(raw).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let config = match &args.config {
        Some(path) => TierCacheConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => TierCacheConfig::default(),
    };

    match args.command {
        Command::Serve {
            metrics_addr,
            health_addr,
            durable_dir,
            no_edge,
            sweep_interval,
        } => {
            let mut config = config;
            if let Some(dir) = durable_dir {
                config.durable.enabled = true;
                config.durable.dir = dir;
            }
            if no_edge {
                config.edge.enabled = false;
            }
            if let Some(interval) = sweep_interval {
                config.scheduler.sweep_interval = interval;
            }
            serve(config, &metrics_addr, &health_addr).await
        }
        Command::Inspect { dir, json } => inspect(dir, json).await,
        Command::Sweep { dir } => sweep(dir, &config).await,
    }
}

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    if let Ok(directive) = "hyper=warn".parse() {
        filter = filter.add_directive(directive);
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

async fn serve(config: TierCacheConfig, metrics_addr: &str, health_addr: &str) -> anyhow::Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        default_ttl = %format_duration(config.default_ttl),
        durable = config.durable.enabled,
        edge = config.edge.enabled,
        "Starting TierCache"
    );

    let cache = CacheCoordinator::open(&config)
        .await
        .context("opening cache")?;
    let scheduler = MaintenanceScheduler::new(Arc::clone(&cache), config.scheduler.clone());
    let scheduler_handle = scheduler.spawn();
    let exporter = Arc::new(CacheExporter::new()?);

    let health_addr = health_addr.to_string();
    let health_scheduler = Arc::clone(&scheduler);
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_scheduler).await {
            error!("Health server error: {}", e);
        }
    });

    let metrics_addr = metrics_addr.to_string();
    let metrics_cache = Arc::clone(&cache);
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, metrics_cache, exporter).await {
            error!("Metrics server error: {}", e);
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown signal received");

    scheduler.shutdown();
    if let Err(e) = scheduler_handle.await {
        warn!("Scheduler task ended abnormally: {}", e);
    }

    let stats = cache.get_stats();
    info!(
        hit_rate = stats.hit_rate,
        entries = stats.total_entries,
        "TierCache stopped"
    );
    Ok(())
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
}

/// Run health check server
async fn run_health_server(
    addr: &str,
    scheduler: Arc<MaintenanceScheduler>,
) -> anyhow::Result<()> {
    let addr: SocketAddr = addr.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("Health server listening on {}", addr);

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let scheduler = Arc::clone(&scheduler);

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let scheduler = Arc::clone(&scheduler);
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => text_response(StatusCode::OK, "OK"),
                        "/readyz" if scheduler.state() != SchedulerState::Stopped => {
                            text_response(StatusCode::OK, "OK")
                        }
                        "/readyz" => {
                            text_response(StatusCode::SERVICE_UNAVAILABLE, "Scheduler stopped")
                        }
                        _ => text_response(StatusCode::NOT_FOUND, "Not Found"),
                    };
                    Ok::<_, Infallible>(response)
                }
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("Health server connection error: {}", e);
            }
        });
    }
}

/// Run Prometheus metrics server
async fn run_metrics_server(
    addr: &str,
    cache: Arc<CacheCoordinator>,
    exporter: Arc<CacheExporter>,
) -> anyhow::Result<()> {
    let addr: SocketAddr = addr.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("Metrics server listening on {}", addr);

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let cache = Arc::clone(&cache);
        let exporter = Arc::clone(&exporter);

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let cache = Arc::clone(&cache);
                let exporter = Arc::clone(&exporter);
                async move {
                    if req.uri().path() != "/metrics" {
                        return Ok::<_, Infallible>(text_response(
                            StatusCode::NOT_FOUND,
                            "Not Found",
                        ));
                    }

                    exporter.refresh(&cache.get_stats());
                    let response = match exporter.render() {
                        Ok(buffer) => {
                            let mut response = Response::new(Full::new(Bytes::from(buffer)));
                            response.headers_mut().insert(
                                CONTENT_TYPE,
                                HeaderValue::from_static(prometheus::TEXT_FORMAT),
                            );
                            response
                        }
                        Err(e) => {
                            error!("Failed to encode metrics: {}", e);
                            text_response(StatusCode::INTERNAL_SERVER_ERROR, "Encoding failed")
                        }
                    };
                    Ok(response)
                }
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("Metrics server connection error: {}", e);
            }
        });
    }
}

/// Print record headers without modifying the directory
async fn inspect(dir: PathBuf, json: bool) -> anyhow::Result<()> {
    let headers = read_record_headers(&dir)
        .await
        .with_context(|| format!("reading {}", dir.display()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&headers)?);
        return Ok(());
    }

    println!(
        "{:<40} {:>8} {:>10} {:>10} {:>8} {:<6}",
        "KEY", "VERSION", "SIZE", "TTL LEFT", "STATE", "ALGO"
    );
    for header in &headers {
        match &header.meta {
            Some(meta) => {
                let state = if meta.is_expired() { "expired" } else { "live" };
                println!(
                    "{:<40} {:>8} {:>10} {:>10} {:>8} {:<6}",
                    meta.key,
                    meta.version,
                    meta.size,
                    format_duration(meta.remaining_ttl()),
                    state,
                    meta.algorithm.name(),
                );
            }
            None => println!(
                "{:<40} {}",
                header.path.display(),
                header.error.as_deref().unwrap_or("unreadable")
            ),
        }
    }
    println!("{} record(s)", headers.len());
    Ok(())
}

/// Open the directory as a durable tier and purge what is no longer usable
async fn sweep(dir: PathBuf, config: &TierCacheConfig) -> anyhow::Result<()> {
    let tier = DurableTier::open(DurableConfig {
        enabled: true,
        dir,
        capacity: config.durable.capacity,
    })
    .await?;

    let report = tier.load_report().clone();
    let purged = tier.purge_expired().await?;

    println!("loaded:    {}", report.loaded);
    println!("expired:   {}", report.expired + purged);
    println!("corrupt:   {}", report.corrupt);
    println!("evicted:   {}", report.evicted);
    println!("stray tmp: {}", report.stray_tmp);
    println!("remaining: {} ({} bytes)", tier.len(), tier.capacity_used());
    Ok(())
}
