use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use clap::Parser;
use nudge_core::metrics::hostname;
use nudge_core::sink::prepare_influxdb;
use nudge_core::{
    parse_percent, Channel, Config, EtcdGateway, HostMetrics, KeyValueStore, KeyWatchResponder,
    LoadDirective, NameMatch, Protocol, Request, Responder, Response, Role, SinkKind, SinkSet,
    StatsCollector,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "nudge-server")]
#[command(about = "nudge parser server - answers load generator requests")]
struct Args {
    /// Path to configuration file
    #[arg(long, env = "NUDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Parser name, checked against client names by --name-mismatch
    #[arg(long, env = "NUDGE_NAME")]
    name: Option<String>,

    /// Bind address, or the key-value gateway host for key-watch
    #[arg(long, env = "NUDGE_HOST")]
    host: Option<String>,

    #[arg(long, env = "NUDGE_PORT")]
    port: Option<u16>,

    /// rpc or key-watch
    #[arg(long, env = "NUDGE_PROTOCOL")]
    protocol: Option<Protocol>,

    /// Poll interval for key-watch requests
    #[arg(long, env = "NUDGE_INTERVAL_MS")]
    interval_ms: Option<u64>,

    /// Target failure percentage, e.g. 10 or 10%
    #[arg(long, env = "NUDGE_FAIL_RATIO", value_parser = parse_percent)]
    fail_ratio: Option<f64>,

    #[arg(long, env = "NUDGE_CHAOS")]
    chaos: Option<u64>,

    /// Reject clients whose name does not match: prefix, suffix or exact
    #[arg(long, env = "NUDGE_NAME_MISMATCH")]
    name_mismatch: Option<NameMatch>,

    #[arg(long, env = "NUDGE_META")]
    meta: Option<String>,

    #[arg(long, env = "NUDGE_STATS", value_delimiter = ',')]
    stats: Vec<SinkKind>,

    #[arg(long, env = "NUDGE_METRICS", value_delimiter = ',')]
    metrics: Vec<SinkKind>,

    /// Load directive KIND=VALUE applied to every request, repeatable
    #[arg(long = "load")]
    load: Vec<LoadDirective>,

    #[arg(long)]
    debug: bool,
}

impl Args {
    fn load_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)
                .with_context(|| format!("Failed to load config from {:?}", path))?,
            None => Config::default(),
        };

        if let Some(name) = &self.name {
            config.node.name = name.clone();
        }
        if let Some(host) = &self.host {
            config.target.host = host.clone();
        }
        if let Some(port) = self.port {
            config.target.port = port;
        }
        if let Some(protocol) = self.protocol {
            config.target.protocol = protocol;
        }
        if let Some(interval_ms) = self.interval_ms {
            config.stream.interval_ms = interval_ms;
        }
        if let Some(fail_ratio) = self.fail_ratio {
            config.faults.fail_ratio = fail_ratio;
        }
        if let Some(chaos) = self.chaos {
            config.faults.chaos = chaos;
        }
        if self.name_mismatch.is_some() {
            config.server.name_mismatch = self.name_mismatch;
        }
        if self.meta.is_some() {
            config.payload.meta = self.meta.clone();
        }
        if !self.stats.is_empty() {
            config.stats.sinks = self.stats.clone();
        }
        if !self.metrics.is_empty() {
            config.metrics.sinks = self.metrics.clone();
        }
        if !self.load.is_empty() {
            config.payload.load = self.load.clone();
        }
        config.node.debug |= self.debug;

        config.validate()?;
        if config.target.protocol == Protocol::Http {
            anyhow::bail!("nudge-server answers rpc and key-watch requests only");
        }
        Ok(config)
    }
}

#[derive(Clone)]
struct AppState {
    responder: Arc<Responder>,
}

async fn parse(
    State(state): State<AppState>,
    Json(request): Json<Request>,
) -> Result<Json<Response>, (StatusCode, String)> {
    state
        .responder
        .respond(request)
        .await
        .map(Json)
        .map_err(|fault| (StatusCode::INTERNAL_SERVER_ERROR, fault.to_string()))
}

fn router(responder: Arc<Responder>) -> Router {
    Router::new()
        .route("/parse", post(parse))
        .with_state(AppState { responder })
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    let config = args.load_config()?;

    let default_level = if config.node.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    let host = hostname();
    if let Err(e) = prepare_influxdb(&config).await {
        warn!("InfluxDB setup failed: {:#}", e);
    }

    let reporting = CancellationToken::new();
    let stats = Arc::new(StatsCollector::new());
    let mut reporters = JoinSet::new();
    let stats_sinks = SinkSet::from_config(&config, Channel::Stats, Role::Server, &host)?;
    reporters.spawn(stats.clone().run(stats_sinks, config.stats.interval(), reporting.clone()));
    if !config.metrics.sinks.is_empty() {
        let metric_sinks = SinkSet::from_config(&config, Channel::Metrics, Role::Server, &host)?;
        reporters.spawn(HostMetrics::new().run(metric_sinks, config.metrics.interval(), reporting.clone()));
    }

    let shutdown = CancellationToken::new();
    let responder = Arc::new(Responder::new(&config, stats.clone(), shutdown.clone())?);

    let signal = shutdown.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = signal.cancelled() => {}
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!("Failed to listen for Ctrl+C: {}", e);
                    return;
                }
                info!("Shutdown signal received");
                signal.cancel();
            }
        }
    });

    let served = match config.target.protocol {
        Protocol::KeyWatch => serve_key_watch(&config, responder.clone(), shutdown.clone()).await,
        _ => serve_rpc(&config, responder.clone(), shutdown.clone()).await,
    };

    reporting.cancel();
    while reporters.join_next().await.is_some() {}

    let summary = stats.summary();
    println!("\n=== nudge-server Summary ===");
    println!("Answered OK: {}", summary.success);
    println!("Answered with error: {}", summary.failure);
    println!();

    served?;
    match responder.fault() {
        Some(fault) => {
            error!("Server stopped: {}", fault);
            Ok(ExitCode::FAILURE)
        }
        None => Ok(ExitCode::SUCCESS),
    }
}

async fn serve_rpc(config: &Config, responder: Arc<Responder>, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind((config.target.host.as_str(), config.target.port))
        .await
        .with_context(|| format!("Failed to bind {}:{}", config.target.host, config.target.port))?;
    info!(
        "Parser server \"{}\" bound to {}",
        config.node.name,
        listener.local_addr()?
    );

    axum::serve(listener, router(responder))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    info!("Server shutdown complete");
    Ok(())
}

async fn serve_key_watch(
    config: &Config,
    responder: Arc<Responder>,
    shutdown: CancellationToken,
) -> Result<()> {
    let store = EtcdGateway::new(&config.target.host, config.target.port, config.timeout())?;
    info!(
        "Parser server \"{}\" polling {}:{} every {}ms",
        config.node.name, config.target.host, config.target.port, config.stream.interval_ms
    );
    run_key_watch(config, responder, Arc::new(store), shutdown).await;
    Ok(())
}

/// Answers key-watch requests until shutdown or the first fault. The fault
/// itself stays on the responder, which decides the exit status.
async fn run_key_watch(
    config: &Config,
    responder: Arc<Responder>,
    store: Arc<dyn KeyValueStore>,
    shutdown: CancellationToken,
) {
    let name = &config.node.name;
    let server = KeyWatchResponder::new(
        responder,
        store,
        config.target.key_watch.request_prefix_for(name),
        config.target.key_watch.response_prefix_for(name),
    );
    match server.run(config.interval(), shutdown).await {
        Ok(()) => info!("Key-watch responder stopped"),
        Err(fault) => warn!("Key-watch responder stopped on fault: {}", fault),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use tower::ServiceExt;

    fn responder(config: &Config, shutdown: CancellationToken) -> Arc<Responder> {
        Arc::new(Responder::new(config, Arc::new(StatsCollector::new()), shutdown).unwrap())
    }

    fn post_parse(request: &Request) -> HttpRequest<Body> {
        HttpRequest::post("/parse")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(request).unwrap()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_parse_endpoint() {
        let shutdown = CancellationToken::new();
        let app = router(responder(&Config::default(), shutdown));

        let response = app
            .oneshot(post_parse(&Request::new("NAME", 0, 0, 1, Vec::new())))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: Response = serde_json::from_slice(&body).unwrap();
        assert!(parsed.is_ok());
    }

    #[tokio::test]
    async fn test_parse_endpoint_name_mismatch() {
        let mut config = Config::default();
        config.server.name_mismatch = Some(NameMatch::Exact);
        let shutdown = CancellationToken::new();
        let app = router(responder(&config, shutdown.clone()));

        let response = app
            .oneshot(post_parse(&Request::new("someone-else", 0, 0, 1, Vec::new())))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn test_key_watch_fault_is_kept_for_exit_status() {
        let mut config = Config::default();
        config.node.name = "parser".to_string();
        config.stream.interval_ms = 10;
        config.faults.chaos = 3600;
        let shutdown = CancellationToken::new();
        let responder = responder(&config, shutdown.clone());

        let store = Arc::new(nudge_core::MemoryStore::new());
        let request = Request::new("parser", 0, 0, 1, Vec::new());
        store
            .put("/nudge/parser/request/0/1", serde_json::to_vec(&request).unwrap())
            .await
            .unwrap();

        tokio::time::timeout(
            std::time::Duration::from_secs(2),
            run_key_watch(&config, responder.clone(), store, shutdown.clone()),
        )
        .await
        .unwrap();

        assert!(matches!(responder.fault(), Some(nudge_core::Fault::Chaos(_))));
        assert!(shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn test_key_watch_stops_cleanly_on_shutdown() {
        let config = Config::default();
        let shutdown = CancellationToken::new();
        let responder = responder(&config, shutdown.clone());
        shutdown.cancel();

        run_key_watch(&config, responder.clone(), Arc::new(nudge_core::MemoryStore::new()), shutdown).await;
        assert!(responder.fault().is_none());
    }
}
