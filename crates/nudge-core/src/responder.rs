use anyhow::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::chaos::ChaosInjector;
use crate::client::key_watch::response_key_for;
use crate::config::{Config, NameMatch};
use crate::error::Fault;
use crate::kv::KeyValueStore;
use crate::load;
use crate::message::{now_ns, status, LoadDirective, Request, Response, Stat};
use crate::payload::MetaSource;
use crate::stats::StatsCollector;

/// Receiving side of an exchange, shared by every server transport.
pub struct Responder {
    name: String,
    name_rule: Option<NameMatch>,
    fail_ratio: f64,
    load: Vec<LoadDirective>,
    meta: MetaSource,
    chaos: ChaosInjector,
    stats: Arc<StatsCollector>,
    shutdown: CancellationToken,
    fault: Mutex<Option<Fault>>,
}

impl Responder {
    pub fn new(config: &Config, stats: Arc<StatsCollector>, shutdown: CancellationToken) -> Result<Self> {
        Ok(Self {
            name: config.node.name.clone(),
            name_rule: config.server.name_mismatch,
            fail_ratio: config.faults.fail_ratio,
            load: config.payload.load.clone(),
            meta: MetaSource::from_config(config.payload.meta.as_deref(), config.payload.meta_size)?,
            chaos: ChaosInjector::from_config(config),
            stats,
            shutdown,
            fault: Mutex::new(None),
        })
    }

    pub fn stats(&self) -> &Arc<StatsCollector> {
        &self.stats
    }

    /// First fault raised, if any.
    pub fn fault(&self) -> Option<Fault> {
        self.fault.lock().clone()
    }

    fn fail(&self, fault: Fault) -> Fault {
        error!("{}", fault);
        self.fault.lock().get_or_insert_with(|| fault.clone());
        self.shutdown.cancel();
        fault
    }

    /// Answers one request. Faults cancel the server before being returned.
    pub async fn respond(&self, request: Request) -> Result<Response, Fault> {
        let received_at = now_ns();
        debug!("Parsing {:?}", request.message_id);

        load::apply_all(&self.load, &[]).await;

        if let Some(rule) = self.name_rule {
            if !rule.matches(&request.name, &self.name) {
                return Err(self.fail(Fault::NameMismatch {
                    client: request.name.clone(),
                    server: self.name.clone(),
                    rule,
                }));
            }
        }

        let status_code = if self.stats.fail_ratio() >= self.fail_ratio {
            self.stats.add_success();
            status::OK
        } else {
            self.stats.add_failure();
            status::SERVER_ERROR
        };

        let response = Response {
            status_code,
            ctime: received_at,
            stime: now_ns(),
            meta: self.meta.resolve(&request),
        };
        let stime = response.stime;
        self.stats.append(Stat::new(request, response.clone(), stime));

        if let Err(fault) = self.chaos.maybe_trigger() {
            return Err(self.fail(fault));
        }
        Ok(response)
    }
}

/// Polls the store for requests under the request prefix and answers
/// each under the matching response key.
pub struct KeyWatchResponder {
    responder: Arc<Responder>,
    store: Arc<dyn KeyValueStore>,
    request_prefix: String,
    response_prefix: String,
}

impl KeyWatchResponder {
    pub fn new(
        responder: Arc<Responder>,
        store: Arc<dyn KeyValueStore>,
        request_prefix: impl Into<String>,
        response_prefix: impl Into<String>,
    ) -> Self {
        Self {
            responder,
            store,
            request_prefix: request_prefix.into(),
            response_prefix: response_prefix.into(),
        }
    }

    /// Answers everything currently pending; returns how many requests
    /// were handled.
    pub async fn poll_once(&self) -> Result<usize, Fault> {
        let pending = match self.store.list_prefix(&format!("{}/", self.request_prefix)).await {
            Ok(pending) => pending,
            Err(e) => {
                warn!("Failed to list {}: {}", self.request_prefix, e);
                return Ok(0);
            }
        };

        let mut handled = 0;
        for (key, value) in pending {
            let request: Request = match serde_json::from_slice(&value) {
                Ok(request) => request,
                Err(e) => {
                    warn!("Dropping unreadable request at {}: {}", key, e);
                    self.delete(&key).await;
                    continue;
                }
            };

            let response = self.responder.respond(request).await?;
            let response_key = response_key_for(&key, &self.request_prefix, &self.response_prefix);
            match serde_json::to_vec(&response) {
                Ok(body) => {
                    if let Err(e) = self.store.put(&response_key, body).await {
                        warn!("Failed to write response {}: {}", response_key, e);
                    }
                }
                Err(e) => warn!("Failed to encode response for {}: {}", key, e),
            }
            self.delete(&key).await;
            handled += 1;
        }
        Ok(handled)
    }

    async fn delete(&self, key: &str) {
        if let Err(e) = self.store.delete(key).await {
            warn!("Failed to delete {}: {}", key, e);
        }
    }

    /// Polls every `interval` until `shutdown` fires or a fault occurs.
    pub async fn run(self, interval: Duration, shutdown: CancellationToken) -> Result<(), Fault> {
        while !shutdown.is_cancelled() {
            let started = Instant::now();
            let handled = self.poll_once().await?;
            if handled > 0 {
                debug!("Answered {} requests", handled);
            }

            let elapsed = started.elapsed();
            if elapsed < interval {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval - elapsed) => {}
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Dispatch, KeyWatchClient};
    use crate::kv::MemoryStore;

    fn responder(config: &Config) -> (Arc<Responder>, CancellationToken) {
        let shutdown = CancellationToken::new();
        let responder = Responder::new(config, Arc::new(StatsCollector::new()), shutdown.clone()).unwrap();
        (Arc::new(responder), shutdown)
    }

    fn server_config() -> Config {
        let mut config = Config::default();
        config.node.name = "parser".to_string();
        config
    }

    #[tokio::test]
    async fn test_respond_ok() {
        let (responder, shutdown) = responder(&server_config());
        let request = Request::new("parser-client", 0, 0, 1, Vec::new());

        let response = responder.respond(request).await.unwrap();

        assert!(response.is_ok());
        assert!(response.stime >= response.ctime);
        assert_eq!(responder.stats().take_batch().len(), 1);
        assert!(!shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn test_name_mismatch_is_fatal() {
        let mut config = server_config();
        config.server.name_mismatch = Some(NameMatch::Prefix);
        let (responder, shutdown) = responder(&config);

        let ok = responder.respond(Request::new("parser-1", 0, 0, 0, Vec::new())).await;
        assert!(ok.is_ok());

        let err = responder
            .respond(Request::new("intruder", 0, 0, 1, Vec::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, Fault::NameMismatch { rule: NameMatch::Prefix, .. }));
        assert!(shutdown.is_cancelled());
        assert_eq!(responder.fault(), Some(err));
    }

    #[tokio::test]
    async fn test_server_fail_ratio() {
        let mut config = server_config();
        config.faults.fail_ratio = 50.0;
        let (responder, _) = responder(&config);

        let mut failures = 0;
        for message_id in 0..100 {
            let response = responder
                .respond(Request::new("c", 0, 0, message_id, Vec::new()))
                .await
                .unwrap();
            if response.status_code == status::SERVER_ERROR {
                failures += 1;
            }
        }
        assert_eq!(failures, 50);
    }

    #[tokio::test]
    async fn test_server_chaos() {
        let mut config = server_config();
        config.faults.chaos = 3600;
        let (responder, shutdown) = responder(&config);

        let result = responder.respond(Request::new("c", 0, 0, 0, Vec::new())).await;
        assert!(matches!(result, Err(Fault::Chaos(_))));
        assert!(shutdown.is_cancelled());
        // the stat is recorded before the fault
        assert_eq!(responder.stats().pending(), 1);
    }

    #[tokio::test]
    async fn test_key_watch_round_trip() {
        let (responder, _) = responder(&server_config());
        let store = Arc::new(MemoryStore::new());
        let shutdown = CancellationToken::new();

        let server = KeyWatchResponder::new(
            responder.clone(),
            store.clone(),
            "/nudge/parser/request",
            "/nudge/parser/response",
        );
        let handle = tokio::spawn(server.run(Duration::from_millis(10), shutdown.clone()));

        let client = KeyWatchClient::new(
            store.clone(),
            "/nudge/parser/request",
            "/nudge/parser/response",
            Duration::from_secs(2),
        );
        for message_id in 0..3 {
            let request = Request::new("parser", 0, 0, message_id, Vec::new());
            let response = client.dispatch(&request).await.unwrap();
            assert!(response.is_ok());
        }

        shutdown.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(responder.stats().summary().success, 3);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_unreadable_request_is_dropped() {
        let (responder, _) = responder(&server_config());
        let store = Arc::new(MemoryStore::new());
        store.put("/req/1", b"not json".to_vec()).await.unwrap();

        let server = KeyWatchResponder::new(responder, store.clone(), "/req", "/res");
        assert_eq!(server.poll_once().await.unwrap(), 0);
        assert!(store.is_empty());
    }
}
