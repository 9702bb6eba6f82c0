use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::message::Stat;
use crate::sink::SinkSet;

#[derive(Debug, Default)]
struct Counters {
    success: u64,
    failure: u64,
}

/// Process-wide accumulator of stat records and success/failure counters.
pub struct StatsCollector {
    batch: Mutex<Vec<Stat>>,
    counters: Mutex<Counters>,
    start_time: Instant,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self {
            batch: Mutex::new(Vec::new()),
            counters: Mutex::new(Counters::default()),
            start_time: Instant::now(),
        }
    }

    pub fn append(&self, stat: Stat) {
        self.batch.lock().push(stat);
    }

    /// Atomically takes everything appended so far.
    pub fn take_batch(&self) -> Vec<Stat> {
        std::mem::take(&mut *self.batch.lock())
    }

    pub fn pending(&self) -> usize {
        self.batch.lock().len()
    }

    pub fn add_success(&self) {
        self.counters.lock().success += 1;
    }

    pub fn add_failure(&self) {
        self.counters.lock().failure += 1;
    }

    /// Observed failure percentage, 100 when nothing was recorded yet.
    pub fn fail_ratio(&self) -> f64 {
        let counters = self.counters.lock();
        let total = counters.success + counters.failure;
        if total == 0 {
            return 100.0;
        }
        (counters.failure as f64 / total as f64) * 100.0
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }

    pub fn summary(&self) -> StatsSummary {
        let counters = self.counters.lock();
        StatsSummary {
            success: counters.success,
            failure: counters.failure,
            pending: self.batch.lock().len() as u64,
            duration_ms: self.elapsed_ms(),
        }
    }

    /// Delivers the current batch to every sink and waits for all of them.
    pub async fn flush(&self, sinks: &SinkSet) {
        let batch = self.take_batch();
        if batch.is_empty() {
            debug!("Nothing to report");
            return;
        }
        debug!("Reporting {} items", batch.len());
        sinks.deliver(&batch).await;
    }

    /// Flushes on a fixed interval until cancelled, then flushes once more.
    pub async fn run(self: Arc<Self>, sinks: SinkSet, interval: Duration, shutdown: CancellationToken) {
        debug!("Stats reporter started, interval {}ms", interval.as_millis());
        loop {
            let started = Instant::now();
            self.flush(&sinks).await;

            let remaining = interval.saturating_sub(started.elapsed());
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(remaining) => {}
            }
        }
        self.flush(&sinks).await;
        debug!("Stats reporter stopped");
    }
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSummary {
    pub success: u64,
    pub failure: u64,
    pub pending: u64,
    pub duration_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Request, Response};

    fn stat(message_id: u64) -> Stat {
        Stat::new(
            Request::new("a", 1, 0, message_id, Vec::new()),
            Response::ok(0, 0),
            0,
        )
    }

    #[test]
    fn test_fail_ratio_without_samples() {
        let stats = StatsCollector::new();
        assert_eq!(stats.fail_ratio(), 100.0);
    }

    #[test]
    fn test_fail_ratio_bounded() {
        let stats = StatsCollector::new();
        // deterministic but irregular history
        for i in 0..500u64 {
            if (i * 7919) % 13 < 5 {
                stats.add_failure();
            } else {
                stats.add_success();
            }
            let ratio = stats.fail_ratio();
            assert!((0.0..=100.0).contains(&ratio), "ratio: {}", ratio);
        }
    }

    #[test]
    fn test_fail_ratio_calculation() {
        let stats = StatsCollector::new();
        stats.add_success();
        stats.add_success();
        stats.add_success();
        stats.add_failure();
        assert_eq!(stats.fail_ratio(), 25.0);

        let summary = stats.summary();
        assert_eq!(summary.success, 3);
        assert_eq!(summary.failure, 1);
    }

    #[test]
    fn test_take_batch_clears() {
        let stats = StatsCollector::new();
        stats.append(stat(0));
        stats.append(stat(1));
        assert_eq!(stats.pending(), 2);

        let batch = stats.take_batch();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[1].request.message_id, 1);
        assert_eq!(stats.pending(), 0);
        assert!(stats.take_batch().is_empty());
    }

    #[test]
    fn test_concurrent_counters() {
        let stats = Arc::new(StatsCollector::new());
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let stats = stats.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        if i % 2 == 0 {
                            stats.add_success();
                        } else {
                            stats.add_failure();
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(stats.fail_ratio(), 50.0);
    }

    #[tokio::test]
    async fn test_run_flushes_on_shutdown() {
        let stats = Arc::new(StatsCollector::new());
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(stats.clone().run(
            SinkSet::empty(),
            Duration::from_secs(60),
            shutdown.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(20)).await;
        stats.append(stat(0));
        shutdown.cancel();
        handle.await.unwrap();

        assert_eq!(stats.pending(), 0);
    }
}
