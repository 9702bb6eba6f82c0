use crate::config::Config;
use crate::message::Response;
use crate::stats::StatsCollector;

/// How many times a failed exchange is re-sent, and which share of
/// exchanges is reported as failed on purpose.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Negative means retry until cancelled
    pub retry_count: i64,
    /// Target failure percentage, 0 disables the overlay
    pub fail_ratio: f64,
}

impl RetryPolicy {
    pub fn new(retry_count: i64, fail_ratio: f64) -> Self {
        Self {
            retry_count,
            fail_ratio,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.faults.retry_count, config.faults.fail_ratio)
    }

    pub fn is_unbounded(&self) -> bool {
        self.retry_count < 0
    }

    /// Attempt budget for one request.
    pub fn budget(&self) -> RetryBudget {
        RetryBudget {
            remaining: if self.is_unbounded() {
                None
            } else {
                Some(self.retry_count as u64 + 1)
            },
        }
    }

    /// An attempt counts as successful only when the exchange returned
    /// status 0 and the observed failure ratio already meets the target.
    /// With no samples the observed ratio is 100, so the first success is
    /// never overridden.
    pub fn is_success(&self, response: Option<&Response>, stats: &StatsCollector) -> bool {
        match response {
            Some(response) if response.is_ok() => stats.fail_ratio() >= self.fail_ratio,
            _ => false,
        }
    }
}

/// Remaining attempts for one request; `None` is unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    remaining: Option<u64>,
}

impl RetryBudget {
    pub fn consume(&mut self) {
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining = remaining.saturating_sub(1);
        }
    }

    pub fn exhausted(&self) -> bool {
        self.remaining == Some(0)
    }
}
