use std::time::{Duration, Instant};
use sysinfo::System;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::message::now_ns;
use crate::sink::SinkSet;

/// One host resource sample.
#[derive(Debug, Clone, PartialEq)]
pub struct HostMetric {
    pub timestamp: u64,
    pub hostname: String,
    /// Global CPU usage in percent
    pub cpu_usage: f64,
    pub mem_used: u64,
    pub mem_total: u64,
}

impl HostMetric {
    pub fn mem_percent(&self) -> f64 {
        if self.mem_total == 0 {
            return 0.0;
        }
        self.mem_used as f64 / self.mem_total as f64 * 100.0
    }
}

pub fn hostname() -> String {
    System::host_name().unwrap_or_else(|| "localhost".to_string())
}

/// Periodically samples CPU and memory usage and reports it through its
/// own sinks.
pub struct HostMetrics {
    system: System,
    hostname: String,
}

impl HostMetrics {
    pub fn new() -> Self {
        let mut system = System::new();
        // first CPU reading is a baseline
        system.refresh_cpu_usage();
        Self {
            system,
            hostname: hostname(),
        }
    }

    pub fn sample(&mut self) -> HostMetric {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();
        HostMetric {
            timestamp: now_ns(),
            hostname: self.hostname.clone(),
            cpu_usage: self.system.global_cpu_usage() as f64,
            mem_used: self.system.used_memory(),
            mem_total: self.system.total_memory(),
        }
    }

    pub async fn run(mut self, sinks: SinkSet, interval: Duration, shutdown: CancellationToken) {
        debug!("Host metrics reporter started, interval {}ms", interval.as_millis());
        loop {
            let started = Instant::now();
            let metric = self.sample();
            sinks.deliver(std::slice::from_ref(&metric)).await;

            let remaining = interval.saturating_sub(started.elapsed());
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(remaining) => {}
            }
        }
        debug!("Host metrics reporter stopped");
    }
}

impl Default for HostMetrics {
    fn default() -> Self {
        Self::new()
    }
}
