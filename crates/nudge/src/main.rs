use anyhow::{Context, Result};
use clap::Parser;
use nudge_core::metrics::hostname;
use nudge_core::sender::SenderContext;
use nudge_core::sink::prepare_influxdb;
use nudge_core::{
    parse_percent, Channel, Config, HostMetrics, LoadDirective, Protocol, Role, SinkKind, SinkSet,
    StatsCollector, StatsSummary, StreamScheduler, StreamSummary,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "nudge")]
#[command(about = "nudge load generator - paced request streams with retries and fault injection")]
struct Args {
    /// Path to configuration file
    #[arg(long, env = "NUDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Sender name (overrides config)
    #[arg(long, env = "NUDGE_NAME")]
    name: Option<String>,

    #[arg(long, env = "NUDGE_HOST")]
    host: Option<String>,

    #[arg(long, env = "NUDGE_PORT")]
    port: Option<u16>,

    /// rpc, key-watch or http
    #[arg(long, env = "NUDGE_PROTOCOL")]
    protocol: Option<Protocol>,

    /// Messages per interval per stream
    #[arg(long, env = "NUDGE_RATE")]
    rate: Option<u64>,

    #[arg(long, env = "NUDGE_INTERVAL_MS")]
    interval_ms: Option<u64>,

    /// Workers per stream
    #[arg(long, env = "NUDGE_WORKERS")]
    workers: Option<u32>,

    #[arg(long, env = "NUDGE_STREAMS")]
    streams: Option<u32>,

    /// Messages per stream before stopping, 0 for unlimited
    #[arg(long, env = "NUDGE_COUNT")]
    count: Option<u64>,

    /// Re-sends per failed message, -1 for unlimited
    #[arg(long, env = "NUDGE_RETRY_COUNT", allow_negative_numbers = true)]
    retry_count: Option<i64>,

    /// Target failure percentage, e.g. 10 or 10%
    #[arg(long, env = "NUDGE_FAIL_RATIO", value_parser = parse_percent)]
    fail_ratio: Option<f64>,

    /// Chaos threshold per hour of cycles
    #[arg(long, env = "NUDGE_CHAOS")]
    chaos: Option<u64>,

    /// Metadata: literal template, @path or @random
    #[arg(long, env = "NUDGE_META")]
    meta: Option<String>,

    /// Stats sinks, comma separated
    #[arg(long, env = "NUDGE_STATS", value_delimiter = ',')]
    stats: Vec<SinkKind>,

    /// Host metrics sinks, comma separated
    #[arg(long, env = "NUDGE_METRICS", value_delimiter = ',')]
    metrics: Vec<SinkKind>,

    /// Load directive KIND=VALUE, repeatable
    #[arg(long = "load")]
    load: Vec<LoadDirective>,

    /// Verbose logging
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
        if let Some(rate) = self.rate {
            config.stream.rate = rate;
        }
        if let Some(interval_ms) = self.interval_ms {
            config.stream.interval_ms = interval_ms;
        }
        if let Some(workers) = self.workers {
            config.stream.workers = workers;
        }
        if let Some(streams) = self.streams {
            config.stream.streams = streams;
        }
        if let Some(count) = self.count {
            config.stream.count = count;
        }
        if let Some(retry_count) = self.retry_count {
            config.faults.retry_count = retry_count;
        }
        if let Some(fail_ratio) = self.fail_ratio {
            config.faults.fail_ratio = fail_ratio;
        }
        if let Some(chaos) = self.chaos {
            config.faults.chaos = chaos;
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
        Ok(config)
    }
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

    info!(
        "Starting '{}' against {}:{} over {}",
        config.node.name, config.target.host, config.target.port, config.target.protocol
    );
    info!(
        "{} streams x {} workers, {} messages every {}ms",
        config.stream.streams, config.stream.workers, config.stream.rate, config.stream.interval_ms
    );

    let config = Arc::new(config);
    let started = std::time::Instant::now();
    let (streams, summary, failed) = run(config).await?;

    print_summary(&streams, &summary, started.elapsed().as_millis() as u64);
    Ok(if failed { ExitCode::FAILURE } else { ExitCode::SUCCESS })
}

async fn run(config: Arc<Config>) -> Result<(Vec<StreamSummary>, StatsSummary, bool)> {
    let host = hostname();
    if let Err(e) = prepare_influxdb(&config).await {
        warn!("InfluxDB setup failed: {:#}", e);
    }

    // reporters outlive the streams so the last batch still gets flushed
    let reporting = CancellationToken::new();
    let stats = Arc::new(StatsCollector::new());
    let stats_sinks = SinkSet::from_config(&config, Channel::Stats, Role::Client, &host)?;
    info!("Stats sinks: {:?}", stats_sinks.names());
    let mut reporters = JoinSet::new();
    reporters.spawn(stats.clone().run(stats_sinks, config.stats.interval(), reporting.clone()));

    if !config.metrics.sinks.is_empty() {
        let metric_sinks = SinkSet::from_config(&config, Channel::Metrics, Role::Client, &host)?;
        reporters.spawn(HostMetrics::new().run(metric_sinks, config.metrics.interval(), reporting.clone()));
    }

    let ctx = SenderContext::from_config(config.clone(), stats.clone())?;
    let shutdown = CancellationToken::new();
    let mut streams = JoinSet::new();
    for offset in 0..config.stream.streams {
        let stream_id = config.stream.initial_stream_index + offset;
        let scheduler = StreamScheduler::new(ctx.clone(), stream_id, shutdown.child_token());
        streams.spawn(scheduler.run());
    }

    let mut summaries = Vec::new();
    let mut failed = false;
    loop {
        tokio::select! {
            _ = shutdown_signal(), if !shutdown.is_cancelled() => {
                info!("Shutdown signal received, stopping streams");
                shutdown.cancel();
            }
            joined = streams.join_next() => match joined {
                None => break,
                Some(Ok(Ok(summary))) => {
                    info!(
                        "Stream {} finished: {} messages in {} cycles, {} overruns",
                        summary.stream_id, summary.enqueued, summary.sequences, summary.overruns
                    );
                    summaries.push(summary);
                }
                Some(Ok(Err(fault))) => {
                    error!("{}", fault);
                    failed = true;
                    shutdown.cancel();
                }
                Some(Err(e)) => {
                    error!("Stream task failed: {}", e);
                    failed = true;
                    shutdown.cancel();
                }
            }
        }
    }

    reporting.cancel();
    while reporters.join_next().await.is_some() {}

    summaries.sort_by_key(|s| s.stream_id);
    Ok((summaries, stats.summary(), failed))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn print_summary(streams: &[StreamSummary], summary: &StatsSummary, duration_ms: u64) {
    let total = summary.success + summary.failure;
    let fail_ratio = if total > 0 {
        summary.failure as f64 / total as f64 * 100.0
    } else {
        0.0
    };

    println!("\n=== nudge Summary ===");
    println!("Duration: {}ms", duration_ms);
    for stream in streams {
        println!(
            "Stream {}: {} messages, {} cycles, {} overruns",
            stream.stream_id, stream.enqueued, stream.sequences, stream.overruns
        );
    }
    println!("Successful attempts: {}", summary.success);
    println!("Failed attempts: {}", summary.failure);
    println!("Fail ratio: {:.2}%", fail_ratio);
    println!();
}
