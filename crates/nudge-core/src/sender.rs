use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, OwnedSemaphorePermit};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::{connector_for, Connect, Dispatch};
use crate::config::Config;
use crate::load;
use crate::message::{now_ns, status, Request, Response, Stat};
use crate::payload::MetaSource;
use crate::resolver::{EndpointResolver, NameLookup, SystemLookup};
use crate::retry::RetryPolicy;
use crate::stats::StatsCollector;

/// Receiving half of a stream's request queue, shared by its workers.
pub type SharedQueue = Arc<Mutex<mpsc::Receiver<Request>>>;

/// Everything a stream and its workers share with the rest of the process.
#[derive(Clone)]
pub struct SenderContext {
    pub config: Arc<Config>,
    pub stats: Arc<StatsCollector>,
    pub connector: Arc<dyn Connect>,
    pub lookup: Arc<dyn NameLookup>,
    pub meta: Arc<MetaSource>,
}

impl SenderContext {
    pub fn from_config(config: Arc<Config>, stats: Arc<StatsCollector>) -> Result<Self> {
        let connector = connector_for(&config)?;
        let meta = MetaSource::from_config(config.payload.meta.as_deref(), config.payload.meta_size)?;
        Ok(Self {
            config,
            stats,
            connector,
            lookup: Arc::new(SystemLookup),
            meta: Arc::new(meta),
        })
    }
}

/// One worker of a stream: pulls requests off the shared queue and drives
/// each through its retry loop.
pub struct MessageSender {
    name: String,
    worker_id: u32,
    ctx: SenderContext,
    queue: SharedQueue,
    resolver: EndpointResolver,
    client: Option<Arc<dyn Dispatch>>,
    policy: RetryPolicy,
    shutdown: CancellationToken,
}

impl MessageSender {
    pub fn new(
        ctx: SenderContext,
        stream_id: u32,
        worker_id: u32,
        queue: SharedQueue,
        shutdown: CancellationToken,
    ) -> Self {
        let config = ctx.config.clone();
        let resolver = EndpointResolver::new(
            config.target.host.clone(),
            config.target.port,
            config.dns_ttl(),
            ctx.lookup.clone(),
        );
        Self {
            name: format!("{}-{}-{}", config.node.name, stream_id, worker_id),
            worker_id,
            ctx,
            queue,
            resolver,
            client: None,
            policy: RetryPolicy::from_config(&config),
            shutdown,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn exit(&self) {
        self.shutdown.cancel();
    }

    /// Initializes the client, releases `ready`, then serves the queue
    /// until it closes or the worker is cancelled.
    pub async fn run(mut self, ready: OwnedSemaphorePermit) {
        let initialized = self.refresh(true).await;
        drop(ready);
        if !initialized {
            debug!("MessageSender {} cancelled before initialization", self.name);
            return;
        }
        debug!("MessageSender {} initiated", self.name);

        loop {
            if !self.refresh(false).await {
                break;
            }

            let queue = self.queue.clone();
            let request = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                request = async move { queue.lock().await.recv().await } => request,
            };
            let Some(request) = request else {
                debug!("Queue closed, {} is done", self.name);
                break;
            };

            let stat = self.process(request).await;
            self.ctx.stats.append(stat);
        }
        debug!("MessageSender {} has left the building", self.name);
    }

    /// Runs the retry loop for one request and returns its terminal stat.
    /// A stat is produced even when cancellation cuts the loop short.
    pub async fn process(&mut self, mut request: Request) -> Stat {
        request.worker_id = self.worker_id;
        debug!("Handling message_id {}", request.message_id);

        let stats = self.ctx.stats.clone();
        let mut budget = self.policy.budget();
        let (response, completed_at) = loop {
            request.stime = now_ns();
            request.meta = self.ctx.meta.resolve(&request);
            load::apply_all(&request.load, &request.meta).await;

            let response = self.attempt(&request).await;
            let completed_at = now_ns();
            budget.consume();

            if self.policy.is_success(Some(&response), &stats) {
                stats.add_success();
                break (response, completed_at);
            }

            stats.add_failure();
            warn!(
                "Request {} was not successful, status {}",
                request.message_id, response.status_code
            );
            if budget.exhausted() || self.shutdown.is_cancelled() {
                break (response, completed_at);
            }
            request.mark_retry();
        };

        self.check_pace(&request, completed_at);
        Stat::new(request, response, completed_at)
    }

    /// One exchange. Transport failures become a synthetic 500 and force
    /// the client to be rebuilt.
    async fn attempt(&mut self, request: &Request) -> Response {
        if self.client.is_none() && !self.refresh(true).await {
            return Response::failure(status::SERVER_ERROR);
        }
        let Some(client) = self.client.clone() else {
            return Response::failure(status::SERVER_ERROR);
        };

        match client.dispatch(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Reinitializing {} client due to {}", client.name(), e);
                self.refresh(true).await;
                Response::failure(status::SERVER_ERROR)
            }
        }
    }

    /// Re-resolves and reconnects when forced, when the cached endpoint is
    /// stale, or when no client exists yet. Keeps trying with a growing
    /// backoff; returns false only if cancelled first.
    async fn refresh(&mut self, force: bool) -> bool {
        if !force && self.client.is_some() && !self.resolver.is_stale() {
            return true;
        }

        let mut index: u64 = 0;
        loop {
            let Some(address) = self.resolver.resolve(true, &self.shutdown).await else {
                return false;
            };
            match self.ctx.connector.connect(address).await {
                Ok(client) => {
                    debug!("{} client to {} initialized for {}", client.name(), address, self.name);
                    self.client = Some(client);
                    return true;
                }
                Err(e) => warn!("Reinitializing client to {} due to {}", address, e),
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => return false,
                _ = tokio::time::sleep(Duration::from_millis(index * 100)) => {}
            }
            index += 1;
        }
    }

    fn check_pace(&self, request: &Request, completed_at: u64) {
        let config = &self.ctx.config;
        let rtt = completed_at.saturating_sub(request.ctime) as u128;
        let predicted = rtt.saturating_mul(config.stream.rate as u128);
        let interval = config.interval().as_nanos();
        if predicted > interval {
            warn!(
                "Predicted total rtt {}ms for rate {} exceeds interval {}ms",
                predicted / 1_000_000,
                config.stream.rate,
                interval / 1_000_000
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::LoadDirective;
    use crate::testing::{CountingLookup, Outcome, StubConnector, StubDispatch};
    use tokio::sync::Semaphore;

    fn context(config: Config, dispatch: Arc<StubDispatch>) -> (SenderContext, Arc<StubConnector>) {
        let connector = StubConnector::new(dispatch);
        let ctx = SenderContext {
            config: Arc::new(config),
            stats: Arc::new(StatsCollector::new()),
            connector: connector.clone(),
            lookup: Arc::new(CountingLookup::localhost()),
            meta: Arc::new(MetaSource::Empty),
        };
        (ctx, connector)
    }

    fn sender(ctx: &SenderContext, shutdown: CancellationToken) -> MessageSender {
        let (_tx, rx) = mpsc::channel(1);
        MessageSender::new(ctx.clone(), 0, 1, Arc::new(Mutex::new(rx)), shutdown)
    }

    fn config(retry_count: i64, fail_ratio: f64) -> Config {
        let mut config = Config::default();
        config.faults.retry_count = retry_count;
        config.faults.fail_ratio = fail_ratio;
        config
    }

    #[tokio::test]
    async fn test_success_first_attempt() {
        let dispatch = StubDispatch::always_ok();
        let (ctx, _) = context(config(2, 0.0), dispatch.clone());
        let mut sender = sender(&ctx, CancellationToken::new());

        let stat = sender.process(Request::new("a", 0, 0, 7, Vec::new())).await;

        assert_eq!(dispatch.attempts(), 1);
        assert_eq!(stat.response.status_code, status::OK);
        assert_eq!(stat.request.rcount, 0);
        assert_eq!(stat.request.worker_id, 1);
        assert!(stat.request.stime >= stat.request.ctime);
        assert_eq!(ctx.stats.summary().success, 1);
    }

    #[tokio::test]
    async fn test_retry_budget_of_two() {
        let dispatch = StubDispatch::always_fail();
        let (ctx, connector) = context(config(2, 0.0), dispatch.clone());
        let mut sender = sender(&ctx, CancellationToken::new());

        let stat = sender.process(Request::new("a", 0, 0, 0, Vec::new())).await;

        assert_eq!(dispatch.attempts(), 3);
        assert_eq!(stat.request.rcount, 2);
        assert!(stat.request.rtime > 0);
        assert_eq!(stat.response.status_code, status::SERVER_ERROR);
        let summary = ctx.stats.summary();
        assert_eq!(summary.failure, 3);
        assert_eq!(summary.success, 0);
        // initial connect plus one rebuild per failed attempt
        assert_eq!(connector.connects(), 4);
    }

    #[tokio::test]
    async fn test_status_failure_is_retried() {
        let dispatch = StubDispatch::always_ok();
        dispatch.script([Outcome::Status(503)]);
        let (ctx, _) = context(config(-1, 0.0), dispatch.clone());
        let mut sender = sender(&ctx, CancellationToken::new());

        let stat = sender.process(Request::new("a", 0, 0, 0, Vec::new())).await;

        assert_eq!(dispatch.attempts(), 2);
        assert_eq!(stat.request.rcount, 1);
        assert!(stat.response.is_ok());
    }

    #[tokio::test]
    async fn test_unbounded_retries_stop_on_cancel() {
        let dispatch = StubDispatch::always_fail();
        let shutdown = CancellationToken::new();
        dispatch.cancel_after(50, shutdown.clone());
        let (ctx, _) = context(config(-1, 0.0), dispatch.clone());
        let mut sender = sender(&ctx, shutdown.clone());

        let stat = tokio::time::timeout(
            Duration::from_secs(5),
            sender.process(Request::new("a", 0, 0, 0, Vec::new())),
        )
        .await
        .unwrap();

        assert!(shutdown.is_cancelled());
        assert_eq!(dispatch.attempts(), 50);
        assert_eq!(stat.request.rcount, 49);
        assert_eq!(stat.response.status_code, status::SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_fail_ratio_converges_over_exchanges() {
        let dispatch = StubDispatch::always_ok();
        let (ctx, _) = context(config(0, 50.0), dispatch);
        let mut sender = sender(&ctx, CancellationToken::new());

        for message_id in 0..1000 {
            sender.process(Request::new("a", 0, 0, message_id, Vec::new())).await;
        }

        let observed = ctx.stats.fail_ratio();
        assert!((45.0..=55.0).contains(&observed), "observed {}", observed);
    }

    #[tokio::test]
    async fn test_load_applied_before_dispatch() {
        let dispatch = StubDispatch::always_ok();
        let (ctx, _) = context(config(0, 0.0), dispatch);
        let mut sender = sender(&ctx, CancellationToken::new());

        let load = vec!["rtt=0.05".parse::<LoadDirective>().unwrap()];
        let stat = sender.process(Request::new("a", 0, 0, 0, load)).await;

        assert!(stat.rtt() >= 50_000_000, "rtt {}", stat.rtt());
    }

    #[tokio::test]
    async fn test_run_drains_queue_until_closed() {
        let dispatch = StubDispatch::always_ok();
        let (ctx, _) = context(config(0, 0.0), dispatch);
        let (tx, rx) = mpsc::channel(8);
        let queue: SharedQueue = Arc::new(Mutex::new(rx));
        let ready = Arc::new(Semaphore::new(1));

        let permit = ready.clone().acquire_owned().await.unwrap();
        let worker = MessageSender::new(ctx.clone(), 0, 0, queue, CancellationToken::new());
        let handle = tokio::spawn(worker.run(permit));

        // bring-up releases the permit
        let _all = ready.acquire_many(1).await.unwrap();
        for message_id in 0..3 {
            tx.send(Request::new("a", 0, 0, message_id, Vec::new())).await.unwrap();
        }
        drop(tx);

        tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
        assert_eq!(ctx.stats.take_batch().len(), 3);
    }

    #[tokio::test]
    async fn test_run_exits_on_cancel_with_idle_queue() {
        let dispatch = StubDispatch::always_ok();
        let (ctx, _) = context(config(0, 0.0), dispatch);
        let (_tx, rx) = mpsc::channel(8);
        let shutdown = CancellationToken::new();
        let ready = Arc::new(Semaphore::new(1));

        let permit = ready.clone().acquire_owned().await.unwrap();
        let worker = MessageSender::new(ctx, 0, 0, Arc::new(Mutex::new(rx)), shutdown.clone());
        assert_eq!(worker.name(), "NAME-0-0");
        let handle = tokio::spawn(worker.run(permit));

        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_millis(250), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
