//! Fan-out of rendered batches to stdout, files, InfluxDB and a Prometheus
//! push gateway. Every sink writes in its own task; a failing sink loses
//! its copy of the batch and nothing else.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::{Config, SinkKind};
use crate::render::{LineFormat, Render, RenderContext, Role};
use crate::BoxFuture;

/// Output destination for rendered records.
pub trait Sink: Send + Sync {
    fn name(&self) -> &'static str;

    fn format(&self) -> LineFormat;

    fn write(&self, lines: Vec<String>) -> BoxFuture<'_, Result<()>>;
}

/// Which record stream a sink set serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Stats,
    Metrics,
}

impl Channel {
    fn as_str(&self) -> &'static str {
        match self {
            Channel::Stats => "stats",
            Channel::Metrics => "metrics",
        }
    }
}

pub struct SinkSet {
    sinks: Vec<Arc<dyn Sink>>,
    context: RenderContext,
}

impl SinkSet {
    pub fn new(sinks: Vec<Arc<dyn Sink>>, context: RenderContext) -> Self {
        Self { sinks, context }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new(), RenderContext::new(Role::Client, "localhost"))
    }

    /// Builds the sinks enabled for `channel` in the configuration.
    pub fn from_config(
        config: &Config,
        channel: Channel,
        role: Role,
        hostname: &str,
    ) -> Result<Self> {
        let output = match channel {
            Channel::Stats => &config.stats,
            Channel::Metrics => &config.metrics,
        };

        let mut sinks: Vec<Arc<dyn Sink>> = Vec::new();
        for kind in &output.sinks {
            let sink: Arc<dyn Sink> = match kind {
                SinkKind::Stdout => Arc::new(StdoutSink),
                SinkKind::File => {
                    let path = output
                        .file_path
                        .clone()
                        .unwrap_or_else(|| format!("./nudge{}.out", channel.as_str()));
                    Arc::new(FileSink::new(path))
                }
                SinkKind::Influxdb => {
                    let database =
                        format!("{}{}", config.influxdb.database_prefix, channel.as_str());
                    Arc::new(InfluxDbSink::new(&config.influxdb.url, database)?)
                }
                SinkKind::Prometheus => {
                    Arc::new(PrometheusSink::new(&config.prometheus.url, role.as_str(), hostname)?)
                }
            };
            sinks.push(sink);
        }

        Ok(Self::new(sinks, RenderContext::new(role, hostname)))
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.sinks.iter().map(|s| s.name()).collect()
    }

    /// Renders `records` for every sink and writes them concurrently,
    /// returning once all sinks finished.
    pub async fn deliver<R: Render>(&self, records: &[R]) {
        if records.is_empty() || self.sinks.is_empty() {
            return;
        }

        let mut tasks = JoinSet::new();
        for sink in &self.sinks {
            let lines: Vec<String> = records
                .iter()
                .map(|r| r.render(sink.format(), &self.context))
                .collect();
            let sink = sink.clone();
            tasks.spawn(async move {
                let name = sink.name();
                (name, sink.write(lines).await)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((name, Err(e))) => warn!("{} sink failed, batch dropped: {:#}", name, e),
                Err(e) => warn!("Sink task aborted: {}", e),
            }
        }
    }
}

/// Logs every line through `tracing`.
pub struct StdoutSink;

impl Sink for StdoutSink {
    fn name(&self) -> &'static str {
        "stdout"
    }

    fn format(&self) -> LineFormat {
        LineFormat::Plain
    }

    fn write(&self, lines: Vec<String>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            for line in lines {
                info!(target: "nudge::stats", "{}", line);
            }
            Ok(())
        })
    }
}

/// Appends lines to a local file.
pub struct FileSink {
    path: PathBuf,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Sink for FileSink {
    fn name(&self) -> &'static str {
        "file"
    }

    fn format(&self) -> LineFormat {
        LineFormat::Plain
    }

    fn write(&self, lines: Vec<String>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            debug!("Writing {} items to {}", lines.len(), self.path.display());
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await
                .with_context(|| format!("Failed to open {}", self.path.display()))?;
            let mut data = lines.join("\n");
            data.push('\n');
            file.write_all(data.as_bytes()).await?;
            file.flush().await?;
            Ok(())
        })
    }
}

fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .pool_idle_timeout(Duration::from_secs(30))
        .build()
        .context("Failed to build HTTP client")
}

/// Batched line protocol writes against the InfluxDB 1.x HTTP API.
pub struct InfluxDbSink {
    client: reqwest::Client,
    base_url: String,
    database: String,
}

impl InfluxDbSink {
    pub fn new(base_url: &str, database: impl Into<String>) -> Result<Self> {
        Ok(Self {
            client: http_client()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            database: database.into(),
        })
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    /// Creates the target database, a no-op if it already exists.
    pub async fn ensure_database(&self) -> Result<()> {
        let query = format!("CREATE DATABASE \"{}\"", self.database);
        let response = self
            .client
            .post(format!("{}/query", self.base_url))
            .query(&[("q", query.as_str())])
            .send()
            .await
            .with_context(|| format!("Failed to reach InfluxDB at {}", self.base_url))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("InfluxDB refused {}: {} {}", query, status, body);
        }
        info!("InfluxDB database {} ready", self.database);
        Ok(())
    }
}

impl Sink for InfluxDbSink {
    fn name(&self) -> &'static str {
        "influxdb"
    }

    fn format(&self) -> LineFormat {
        LineFormat::InfluxLine
    }

    fn write(&self, lines: Vec<String>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            debug!("Writing {} items to InfluxDB", lines.len());
            let response = self
                .client
                .post(format!("{}/write", self.base_url))
                .query(&[("db", self.database.as_str()), ("precision", "ns")])
                .body(lines.join("\n"))
                .send()
                .await?;
            let status = response.status();
            if status != reqwest::StatusCode::NO_CONTENT {
                let body = response.text().await.unwrap_or_default();
                anyhow::bail!("InfluxDB response {}: {}", status, body);
            }
            Ok(())
        })
    }
}

/// Creates the stats and metrics databases for every channel that writes
/// to InfluxDB.
pub async fn prepare_influxdb(config: &Config) -> Result<()> {
    for (channel, output) in [
        (Channel::Stats, &config.stats),
        (Channel::Metrics, &config.metrics),
    ] {
        if output.sinks.contains(&SinkKind::Influxdb) {
            let database = format!("{}{}", config.influxdb.database_prefix, channel.as_str());
            InfluxDbSink::new(&config.influxdb.url, database)?
                .ensure_database()
                .await?;
        }
    }
    Ok(())
}

/// One push per record to a Prometheus push gateway.
pub struct PrometheusSink {
    client: reqwest::Client,
    url: String,
}

impl PrometheusSink {
    pub fn new(base_url: &str, job: &str, instance: &str) -> Result<Self> {
        Ok(Self {
            client: http_client()?,
            url: format!(
                "{}/metrics/job/{}/instance/{}",
                base_url.trim_end_matches('/'),
                job,
                instance
            ),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Sink for PrometheusSink {
    fn name(&self) -> &'static str {
        "prometheus"
    }

    fn format(&self) -> LineFormat {
        LineFormat::Prometheus
    }

    fn write(&self, lines: Vec<String>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            debug!("Writing {} items to Prometheus {}", lines.len(), self.url);
            let mut failed = 0usize;
            let mut last_error = String::new();
            for line in lines {
                match self.client.post(&self.url).body(line).send().await {
                    Ok(response) if response.status().is_success() => {}
                    Ok(response) => {
                        failed += 1;
                        last_error = format!(
                            "{} {}",
                            response.status(),
                            response.text().await.unwrap_or_default()
                        );
                    }
                    Err(e) => {
                        failed += 1;
                        last_error = e.to_string();
                    }
                }
            }
            if failed > 0 {
                anyhow::bail!("{} pushes failed, last: {}", failed, last_error);
            }
            Ok(())
        })
    }
}
