use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::chaos::ChaosInjector;
use crate::error::Fault;
use crate::message::Request;
use crate::sender::{MessageSender, SenderContext, SharedQueue};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSummary {
    pub stream_id: u32,
    /// Completed scheduling cycles
    pub sequences: u64,
    pub enqueued: u64,
    /// Cycles that took longer than the interval
    pub overruns: u64,
}

/// Message ids of cycle `sequence_id`, cut at `count` when it is non-zero.
pub fn cycle_message_ids(sequence_id: u64, rate: u64, count: u64) -> Range<u64> {
    let start = sequence_id.saturating_mul(rate);
    let mut end = start.saturating_add(rate);
    if count > 0 {
        end = end.min(count);
    }
    start..end.max(start)
}

/// One rate-paced sequence of requests feeding its own worker pool.
pub struct StreamScheduler {
    stream_id: u32,
    name: String,
    ctx: SenderContext,
    chaos: ChaosInjector,
    shutdown: CancellationToken,
}

impl StreamScheduler {
    pub fn new(ctx: SenderContext, stream_id: u32, shutdown: CancellationToken) -> Self {
        let chaos = ChaosInjector::from_config(&ctx.config);
        Self {
            stream_id,
            name: format!("{}-{}", ctx.config.node.name, stream_id),
            ctx,
            chaos,
            shutdown,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stops production and every worker of this stream.
    pub fn exit(&self) {
        self.shutdown.cancel();
    }

    /// Brings up the workers, then produces `rate` requests per interval
    /// until cancelled or until `count` requests were enqueued. Returns
    /// once every worker has exited. A chaos fault cancels the stream and
    /// is returned to the caller.
    pub async fn run(self) -> Result<StreamSummary, Fault> {
        let config = self.ctx.config.clone();
        let rate = config.stream.rate;
        let interval = config.interval();
        info!(
            "Stream {} started, sending {} messages every {}ms",
            self.name,
            rate,
            interval.as_millis()
        );

        let (tx, rx) = mpsc::channel::<Request>(config.queue_capacity());
        let queue: SharedQueue = Arc::new(Mutex::new(rx));
        let mut workers = self.spawn_workers(queue).await;

        let mut summary = StreamSummary {
            stream_id: self.stream_id,
            ..StreamSummary::default()
        };
        let mut sequence_id: u64 = 0;
        let mut fault = None;

        'cycles: while !self.shutdown.is_cancelled() {
            let started = Instant::now();

            let ids = cycle_message_ids(sequence_id, rate, config.stream.count);
            let last_cycle = config.stream.count > 0 && ids.end >= config.stream.count;
            for message_id in ids {
                let request = Request::new(
                    config.node.name.clone(),
                    self.stream_id,
                    sequence_id,
                    message_id,
                    config.payload.load.clone(),
                );
                tokio::select! {
                    _ = self.shutdown.cancelled() => break 'cycles,
                    sent = tx.send(request) => {
                        if sent.is_err() {
                            warn!("Stream {} has no workers left", self.name);
                            break 'cycles;
                        }
                    }
                }
                summary.enqueued += 1;
            }
            debug!("Stream {} queued sequence {}", self.name, sequence_id);
            sequence_id += 1;
            summary.sequences = sequence_id;

            if last_cycle {
                info!("Stream {} reached count {}", self.name, config.stream.count);
                break;
            }

            if let Err(e) = self.chaos.maybe_trigger() {
                error!("Stream {}: {}", self.name, e);
                fault = Some(e);
                self.shutdown.cancel();
                break;
            }

            let elapsed = started.elapsed();
            if elapsed < interval {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval - elapsed) => {}
                }
            } else {
                summary.overruns += 1;
                warn!(
                    "Stream {} cycle took {}ms, longer than the {}ms interval",
                    self.name,
                    elapsed.as_millis(),
                    interval.as_millis()
                );
            }
        }

        // closing the queue lets workers drain what is left and exit
        drop(tx);
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                warn!("Worker of stream {} failed: {}", self.name, e);
            }
        }
        debug!("Stream {} stopped after {} messages", self.name, summary.enqueued);

        match fault {
            Some(fault) => Err(fault),
            None => Ok(summary),
        }
    }

    /// Spawns the workers and waits until each finished its first client
    /// initialization.
    async fn spawn_workers(&self, queue: SharedQueue) -> JoinSet<()> {
        let count = self.ctx.config.stream.workers;
        let ready = Arc::new(Semaphore::new(count as usize));
        let mut workers = JoinSet::new();

        for worker_id in 0..count {
            let Ok(permit) = ready.clone().acquire_owned().await else {
                break;
            };
            let worker = MessageSender::new(
                self.ctx.clone(),
                self.stream_id,
                worker_id,
                queue.clone(),
                self.shutdown.child_token(),
            );
            workers.spawn(worker.run(permit));
        }

        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = ready.acquire_many(count) => {
                debug!("Stream {}: {} workers ready", self.name, count);
            }
        }
        workers
    }
}
