use rand::Rng;

use crate::config::Config;
use crate::error::Fault;

/// Statistically bounded fatal faults: once per cycle, a draw over
/// `[0, cycles_per_hour]` at or below `rate` raises `Fault::Chaos`.
#[derive(Debug, Clone)]
pub struct ChaosInjector {
    rate: u64,
    cycles_per_hour: u64,
    message: String,
}

impl ChaosInjector {
    pub fn new(rate: u64, cycles_per_hour: u64, message: impl Into<String>) -> Self {
        Self {
            rate,
            cycles_per_hour,
            message: message.into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.faults.chaos,
            config.cycles_per_hour(),
            config.faults.chaos_message.clone(),
        )
    }

    pub fn is_enabled(&self) -> bool {
        self.rate > 0
    }

    pub fn maybe_trigger(&self) -> Result<(), Fault> {
        self.maybe_trigger_with(&mut rand::thread_rng())
    }

    pub fn maybe_trigger_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<(), Fault> {
        if !self.is_enabled() {
            return Ok(());
        }
        let draw = rng.gen_range(0..=self.cycles_per_hour);
        if draw <= self.rate {
            return Err(Fault::Chaos(self.message.clone()));
        }
        Ok(())
    }
}
