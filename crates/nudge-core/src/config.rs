use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::message::LoadDirective;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node: NodeConfig,
    pub target: TargetConfig,
    pub stream: StreamConfig,
    pub faults: FaultConfig,
    pub payload: PayloadConfig,
    pub stats: OutputConfig,
    pub metrics: OutputConfig,
    pub influxdb: InfluxDbConfig,
    pub prometheus: PrometheusConfig,
    pub server: ServerConfig,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Checks cross-field constraints once, before any engine component
    /// sees the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.node.name.is_empty() {
            anyhow::bail!("node.name must not be empty");
        }
        if self.stream.streams == 0 {
            anyhow::bail!("stream.streams must be at least 1");
        }
        if self.stream.workers == 0 {
            anyhow::bail!("stream.workers must be at least 1");
        }
        if self.stream.rate == 0 {
            anyhow::bail!("stream.rate must be at least 1");
        }
        if self.stream.interval_ms == 0 {
            anyhow::bail!("stream.interval_ms must be greater than 0");
        }
        if self.stream.interval_ms > 3_600_000 {
            anyhow::bail!("stream.interval_ms must not exceed one hour");
        }
        if !(0.0..=100.0).contains(&self.faults.fail_ratio) {
            anyhow::bail!(
                "faults.fail_ratio must be within [0, 100], got {}",
                self.faults.fail_ratio
            );
        }
        if self.stream.queue_capacity == Some(0) {
            anyhow::bail!("stream.queue_capacity must be at least 1");
        }
        if self.stats.interval_ms == 0 || self.metrics.interval_ms == 0 {
            anyhow::bail!("stats.interval_ms and metrics.interval_ms must be greater than 0");
        }
        if self.target.protocol == Protocol::Http {
            reqwest::Method::from_bytes(self.target.http.method.as_bytes()).map_err(|_| {
                anyhow::anyhow!("Invalid target.http.method: {}", self.target.http.method)
            })?;
        }
        Ok(())
    }

    /// Number of scheduling cycles that fit in one hour; the chaos draw
    /// range.
    pub fn cycles_per_hour(&self) -> u64 {
        (3_600_000 / self.stream.interval_ms.max(1)).max(1)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.stream.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.target.timeout_ms)
    }

    pub fn dns_ttl(&self) -> Duration {
        Duration::from_secs(self.target.dns_ttl_secs)
    }

    pub fn queue_capacity(&self) -> usize {
        self.stream
            .queue_capacity
            .unwrap_or_else(|| (self.stream.rate as usize).saturating_mul(4))
            .max(1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Logical sender (client) or parser (server) name
    pub name: String,
    /// Verbose per-message logging on the stdout sink
    pub debug: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "NAME".to_string(),
            debug: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Protocol {
    Rpc,
    KeyWatch,
    Http,
}

impl FromStr for Protocol {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rpc" | "grpc" => Ok(Protocol::Rpc),
            "key-watch" | "etcd" => Ok(Protocol::KeyWatch),
            "http" => Ok(Protocol::Http),
            other => anyhow::bail!(
                "Invalid protocol: {}, must be 'rpc', 'key-watch' or 'http'",
                other
            ),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Protocol::Rpc => "rpc",
            Protocol::KeyWatch => "key-watch",
            Protocol::Http => "http",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
    /// Seconds before a cached address must be re-resolved
    pub dns_ttl_secs: u64,
    /// Per-attempt dispatch timeout in milliseconds
    pub timeout_ms: u64,
    pub http: HttpConfig,
    pub key_watch: KeyWatchConfig,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5410,
            protocol: Protocol::Rpc,
            dns_ttl_secs: 10,
            timeout_ms: 1000,
            http: HttpConfig::default(),
            key_watch: KeyWatchConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub method: String,
    pub path: String,
    /// Body template, see `template::render` for placeholders
    pub body: String,
    pub headers: Vec<(String, String)>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            method: "POST".to_string(),
            path: "/".to_string(),
            body: r#"{{"name":"{name}","stream_id":{stream_id},"sequence_id":{sequence_id},"message_id":{message_id},"ctime":{ctime}}}"#
                .to_string(),
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyWatchConfig {
    /// Request key prefix, `{name}` is replaced with the node name
    pub request_prefix: String,
    pub response_prefix: String,
}

impl Default for KeyWatchConfig {
    fn default() -> Self {
        Self {
            request_prefix: "/nudge/{name}/request".to_string(),
            response_prefix: "/nudge/{name}/response".to_string(),
        }
    }
}

impl KeyWatchConfig {
    pub fn request_prefix_for(&self, name: &str) -> String {
        self.request_prefix.replace("{name}", name)
    }

    pub fn response_prefix_for(&self, name: &str) -> String {
        self.response_prefix.replace("{name}", name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub streams: u32,
    pub initial_stream_index: u32,
    /// Messages per interval
    pub rate: u64,
    pub interval_ms: u64,
    pub workers: u32,
    /// Total messages per stream, 0 means unlimited
    pub count: u64,
    /// Request queue bound, defaults to four cycles worth of messages
    pub queue_capacity: Option<usize>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            streams: 1,
            initial_stream_index: 0,
            rate: 1,
            interval_ms: 1000,
            workers: std::thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(1),
            count: 0,
            queue_capacity: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FaultConfig {
    /// Re-sends per failed message, negative means unbounded
    pub retry_count: i64,
    /// Target percentage of exchanges reported as failed
    pub fail_ratio: f64,
    /// Chaos threshold against a draw over `cycles_per_hour`, 0 disables
    pub chaos: u64,
    pub chaos_message: String,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            retry_count: -1,
            fail_ratio: 0.0,
            chaos: 0,
            chaos_message: "In all chaos there is a cosmos, in all disorder a secret order."
                .to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PayloadConfig {
    /// Literal template, `@path` or `@random`
    pub meta: Option<String>,
    pub meta_size: usize,
    pub load: Vec<LoadDirective>,
}

impl Default for PayloadConfig {
    fn default() -> Self {
        Self {
            meta: None,
            meta_size: 4_194_304 - 48,
            load: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    Stdout,
    File,
    Influxdb,
    Prometheus,
}

impl FromStr for SinkKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stdout" => Ok(SinkKind::Stdout),
            "file" => Ok(SinkKind::File),
            "influxdb" => Ok(SinkKind::Influxdb),
            "prometheus" => Ok(SinkKind::Prometheus),
            other => anyhow::bail!(
                "Invalid sink: {}, must be one of stdout, file, influxdb, prometheus",
                other
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub sinks: Vec<SinkKind>,
    pub interval_ms: u64,
    /// Append-only file used by the `file` sink
    pub file_path: Option<String>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            sinks: Vec::new(),
            interval_ms: 1000,
            file_path: None,
        }
    }
}

impl OutputConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InfluxDbConfig {
    /// Base URL of the InfluxDB HTTP API
    pub url: String,
    pub database_prefix: String,
}

impl Default for InfluxDbConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8086".to_string(),
            database_prefix: "nudge".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrometheusConfig {
    /// Base URL of the push gateway
    pub url: String,
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:9091".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NameMatch {
    Prefix,
    Suffix,
    Exact,
}

impl NameMatch {
    pub fn matches(&self, client: &str, server: &str) -> bool {
        match self {
            NameMatch::Prefix => client.starts_with(server),
            NameMatch::Suffix => client.ends_with(server),
            NameMatch::Exact => client == server,
        }
    }
}

impl fmt::Display for NameMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NameMatch::Prefix => "prefix",
            NameMatch::Suffix => "suffix",
            NameMatch::Exact => "exact",
        };
        f.write_str(s)
    }
}

impl FromStr for NameMatch {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "prefix" => Ok(NameMatch::Prefix),
            "suffix" => Ok(NameMatch::Suffix),
            "exact" => Ok(NameMatch::Exact),
            other => anyhow::bail!("Invalid name match rule: {}", other),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Reject requests whose sender name does not satisfy this rule
    pub name_mismatch: Option<NameMatch>,
}

/// Parses a fail ratio given as `50`, `12.5` or `50%`.
pub fn parse_percent(value: &str) -> anyhow::Result<f64> {
    let trimmed = value.trim().trim_end_matches('%').trim();
    if trimmed.is_empty() {
        return Ok(0.0);
    }
    let ratio: f64 = trimmed
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid percentage: {}", value))?;
    Ok(ratio)
}
