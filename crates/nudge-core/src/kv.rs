use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

use crate::BoxFuture;

/// Minimal key-value surface the key-watch exchange needs.
pub trait KeyValueStore: Send + Sync {
    /// Stores `value` under `key`, returning the store revision of the write.
    fn put<'a>(&'a self, key: &'a str, value: Vec<u8>) -> BoxFuture<'a, Result<i64>>;

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>>>;

    /// All entries whose key starts with `prefix`, in key order.
    fn list_prefix<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, Result<Vec<(String, Vec<u8>)>>>;

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Resolves with the value of the first put to `key` at or after
    /// `start_revision`.
    fn watch<'a>(&'a self, key: &'a str, start_revision: i64) -> BoxFuture<'a, Result<Vec<u8>>>;
}

/// etcd v3 through its JSON gateway.
pub struct EtcdGateway {
    client: reqwest::Client,
    base_url: String,
    /// Bounds every call except the watch stream
    timeout: Duration,
}

#[derive(Serialize)]
struct PutRequest {
    key: String,
    value: String,
}

#[derive(Serialize)]
struct RangeRequest {
    key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    range_end: Option<String>,
}

#[derive(Serialize)]
struct WatchRequest {
    create_request: WatchCreate,
}

#[derive(Serialize)]
struct WatchCreate {
    key: String,
    start_revision: String,
}

#[derive(Deserialize, Default)]
struct Header {
    #[serde(default)]
    revision: Option<String>,
}

#[derive(Deserialize)]
struct PutResponse {
    #[serde(default)]
    header: Header,
}

#[derive(Deserialize)]
struct KeyValue {
    key: String,
    #[serde(default)]
    value: String,
}

#[derive(Deserialize)]
struct RangeResponse {
    #[serde(default)]
    kvs: Vec<KeyValue>,
}

#[derive(Deserialize)]
struct WatchEnvelope {
    result: Option<WatchResult>,
    error: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct WatchResult {
    #[serde(default)]
    events: Vec<WatchEvent>,
    #[serde(default)]
    canceled: bool,
}

#[derive(Deserialize)]
struct WatchEvent {
    /// Absent for puts, the gateway omits enum defaults
    #[serde(default, rename = "type")]
    kind: Option<String>,
    kv: Option<KeyValue>,
}

impl EtcdGateway {
    pub fn new(host: &str, port: u16, timeout: Duration) -> Result<Self> {
        Self::with_base_url(&format!("http://{}:{}", host, port), timeout)
    }

    pub fn with_base_url(base_url: &str, timeout: Duration) -> Result<Self> {
        // no client-wide timeout: watch streams stay open, callers bound them
        let client = reqwest::Client::builder().connect_timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    async fn post<T: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
        timeout: Option<Duration>,
    ) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.client.post(&url).json(body);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("POST {}", url))?;
        if !response.status().is_success() {
            anyhow::bail!("POST {} returned {}", url, response.status());
        }
        Ok(response)
    }

    async fn range(&self, key: &str, range_end: Option<Vec<u8>>) -> Result<Vec<(String, Vec<u8>)>> {
        let request = RangeRequest {
            key: STANDARD.encode(key),
            range_end: range_end.map(|end| STANDARD.encode(end)),
        };
        let body: RangeResponse = self
            .post("/v3/kv/range", &request, Some(self.timeout))
            .await?
            .json()
            .await?;
        body.kvs.into_iter().map(decode_kv).collect()
    }
}

impl KeyValueStore for EtcdGateway {
    fn put<'a>(&'a self, key: &'a str, value: Vec<u8>) -> BoxFuture<'a, Result<i64>> {
        Box::pin(async move {
            let request = PutRequest {
                key: STANDARD.encode(key),
                value: STANDARD.encode(&value),
            };
            let body: PutResponse = self
                .post("/v3/kv/put", &request, Some(self.timeout))
                .await?
                .json()
                .await?;
            parse_revision(body.header.revision.as_deref())
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>>> {
        Box::pin(async move {
            let mut entries = self.range(key, None).await?;
            Ok(entries.pop().map(|(_, value)| value))
        })
    }

    fn list_prefix<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, Result<Vec<(String, Vec<u8>)>>> {
        Box::pin(async move { self.range(prefix, Some(prefix_range_end(prefix.as_bytes()))).await })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let request = RangeRequest {
                key: STANDARD.encode(key),
                range_end: None,
            };
            self.post("/v3/kv/deleterange", &request, Some(self.timeout)).await?;
            Ok(())
        })
    }

    fn watch<'a>(&'a self, key: &'a str, start_revision: i64) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(async move {
            let request = WatchRequest {
                create_request: WatchCreate {
                    key: STANDARD.encode(key),
                    start_revision: start_revision.to_string(),
                },
            };
            let response = self.post("/v3/watch", &request, None).await?;
            let mut stream = response.bytes_stream();
            let mut buffer: Vec<u8> = Vec::new();

            while let Some(chunk) = stream.next().await {
                buffer.extend_from_slice(&chunk?);
                while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    if let Some(value) = parse_watch_line(&line)? {
                        return Ok(value);
                    }
                }
            }
            // a final message may arrive without a trailing newline
            if let Some(value) = parse_watch_line(&buffer)? {
                return Ok(value);
            }
            anyhow::bail!("Watch on {} closed before a put was observed", key)
        })
    }
}

/// Returns the value of the first put event in one gateway stream message.
fn parse_watch_line(line: &[u8]) -> Result<Option<Vec<u8>>> {
    let text = std::str::from_utf8(line)?.trim();
    if text.is_empty() {
        return Ok(None);
    }
    let envelope: WatchEnvelope = serde_json::from_str(text)?;
    if let Some(error) = envelope.error {
        anyhow::bail!("Watch failed: {}", error);
    }
    let Some(result) = envelope.result else {
        return Ok(None);
    };
    for event in result.events {
        let is_put = event.kind.as_deref().map_or(true, |kind| kind == "PUT");
        if let (true, Some(kv)) = (is_put, event.kv) {
            let (_, value) = decode_kv(kv)?;
            return Ok(Some(value));
        }
    }
    if result.canceled {
        anyhow::bail!("Watch was canceled by the server");
    }
    Ok(None)
}

fn decode_kv(kv: KeyValue) -> Result<(String, Vec<u8>)> {
    let key = String::from_utf8(STANDARD.decode(kv.key)?)?;
    let value = STANDARD.decode(kv.value)?;
    Ok((key, value))
}

fn parse_revision(revision: Option<&str>) -> Result<i64> {
    let revision = revision.context("Response header carries no revision")?;
    revision
        .parse()
        .with_context(|| format!("Invalid revision {}", revision))
}

/// Smallest key greater than every key starting with `prefix`.
fn prefix_range_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return end;
        }
    }
    // every byte was 0xff: range to the end of the keyspace
    vec![0]
}

#[derive(Default)]
struct MemoryState {
    revision: i64,
    entries: BTreeMap<String, (Vec<u8>, i64)>,
}

/// Buffered put revisions per watcher; a lagging watcher just re-checks.
const CHANGE_BUFFER_SIZE: usize = 64;

/// In-process store with the same revision semantics as etcd.
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    changes: broadcast::Sender<i64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER_SIZE);
        Self {
            state: Mutex::new(MemoryState::default()),
            changes,
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn find_since(&self, key: &str, start_revision: i64) -> Option<Vec<u8>> {
        let state = self.state.lock();
        match state.entries.get(key) {
            Some((value, revision)) if *revision >= start_revision => Some(value.clone()),
            _ => None,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueStore for MemoryStore {
    fn put<'a>(&'a self, key: &'a str, value: Vec<u8>) -> BoxFuture<'a, Result<i64>> {
        Box::pin(async move {
            let revision = {
                let mut state = self.state.lock();
                state.revision += 1;
                let revision = state.revision;
                state.entries.insert(key.to_string(), (value, revision));
                revision
            };
            if self.changes.send(revision).is_err() {
                debug!("No watchers for revision {}", revision);
            }
            Ok(revision)
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>>> {
        Box::pin(async move { Ok(self.state.lock().entries.get(key).map(|(value, _)| value.clone())) })
    }

    fn list_prefix<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, Result<Vec<(String, Vec<u8>)>>> {
        Box::pin(async move {
            let state = self.state.lock();
            Ok(state
                .entries
                .range(prefix.to_string()..)
                .take_while(|(key, _)| key.starts_with(prefix))
                .map(|(key, (value, _))| (key.clone(), value.clone()))
                .collect())
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut state = self.state.lock();
            if state.entries.remove(key).is_some() {
                state.revision += 1;
            }
            Ok(())
        })
    }

    fn watch<'a>(&'a self, key: &'a str, start_revision: i64) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(async move {
            // subscribe before checking so a concurrent put is not missed
            let mut changes = self.changes.subscribe();
            loop {
                if let Some(value) = self.find_since(key, start_revision) {
                    debug!("Watch on {} fired", key);
                    return Ok(value);
                }
                match changes.recv().await {
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => {
                        anyhow::bail!("Store closed while watching {}", key)
                    }
                }
            }
        })
    }
}
