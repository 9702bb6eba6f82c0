//! Synthetic load applied around an exchange.
//!
//! CPU burn is a busy loop on dedicated OS threads, never on the runtime's
//! worker threads.

use rand::Rng;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::message::{LoadDirective, LoadKind};

const MIB: usize = 1024 * 1024;
const PAGE: usize = 4096;

/// Applies every directive in order.
pub async fn apply_all(directives: &[LoadDirective], meta: &[u8]) {
    for directive in directives {
        generate_load(directive, meta).await;
    }
}

/// Applies one directive. Invalid values are logged and skipped.
pub async fn generate_load(directive: &LoadDirective, meta: &[u8]) {
    match directive.kind {
        LoadKind::Rtt => {
            let Some(secs) = parse_secs(directive) else {
                return;
            };
            debug!("Sleeping for {}s", secs);
            sleep(Duration::from_secs_f64(secs)).await;
        }
        LoadKind::Rttr => {
            let Some(secs) = parse_secs(directive) else {
                return;
            };
            let secs = rand::thread_rng().gen_range(0.0..=secs);
            debug!("Sleeping for random value {}s", secs);
            sleep(Duration::from_secs_f64(secs)).await;
        }
        LoadKind::Cpu => {
            let Some(secs) = parse_secs(directive) else {
                return;
            };
            let cores = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1);
            debug!("CPU loading {} cores for {}s", cores, secs);
            for _ in 0..cores {
                let budget = Duration::from_secs_f64(secs);
                std::thread::spawn(move || burn_cpu(budget));
            }
        }
        LoadKind::Mem => {
            let Ok(mib) = directive.value.trim().parse::<usize>() else {
                warn!("Invalid mem load value: {}", directive.value);
                return;
            };
            debug!("Loading {} MiB to RAM", mib);
            tokio::task::spawn_blocking(move || touch_memory(mib));
        }
        LoadKind::Bcmd | LoadKind::Fcmd => {
            let line = if directive.value == "meta" {
                String::from_utf8_lossy(meta).into_owned()
            } else {
                directive.value.clone()
            };
            let mut parts = line.split_whitespace();
            let Some(program) = parts.next() else {
                warn!("Empty command for {} load", directive.kind);
                return;
            };
            let mut cmd = Command::new(program);
            cmd.args(parts);
            debug!("Executing process {}", line);

            if directive.kind == LoadKind::Fcmd {
                if let Err(e) = cmd.output().await {
                    warn!("Command '{}' failed: {}", line, e);
                }
            } else {
                tokio::spawn(async move {
                    if let Err(e) = cmd.output().await {
                        warn!("Background command '{}' failed: {}", line, e);
                    }
                });
            }
        }
    }
}

fn parse_secs(directive: &LoadDirective) -> Option<f64> {
    match directive.value.trim().parse::<f64>() {
        Ok(secs) if (0.0..1e9).contains(&secs) => Some(secs),
        _ => {
            warn!("Invalid {} load value: {}", directive.kind, directive.value);
            None
        }
    }
}

/// Spins until `budget` elapses.
fn burn_cpu(budget: Duration) {
    let start = Instant::now();
    let mut x = 0u64;
    while start.elapsed() < budget {
        x = std::hint::black_box(x.wrapping_add(1));
    }
}

/// Allocates `mib` MiB and writes one byte per page so it is resident.
fn touch_memory(mib: usize) -> usize {
    let len = mib.saturating_mul(MIB);
    let mut block = vec![0u8; len];
    for i in (0..len).step_by(PAGE) {
        block[i] = (i % 251) as u8 + 1;
    }
    std::hint::black_box(&block);
    block.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rtt_sleeps() {
        let start = Instant::now();
        generate_load(&LoadDirective::new(LoadKind::Rtt, "0.05"), &[]).await;
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_rttr_is_bounded() {
        let start = Instant::now();
        generate_load(&LoadDirective::new(LoadKind::Rttr, "0.05"), &[]).await;
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_invalid_value_is_skipped() {
        let start = Instant::now();
        generate_load(&LoadDirective::new(LoadKind::Rtt, "-3"), &[]).await;
        generate_load(&LoadDirective::new(LoadKind::Mem, "lots"), &[]).await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn test_burn_cpu_respects_budget() {
        let start = Instant::now();
        burn_cpu(Duration::from_millis(20));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(20));
        assert!(elapsed < Duration::from_secs(1));
    }

    #[test]
    fn test_touch_memory() {
        assert_eq!(touch_memory(2), 2 * MIB);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_foreground_command_uses_meta() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");
        let meta = format!("touch {}", marker.display());

        generate_load(&LoadDirective::new(LoadKind::Fcmd, "meta"), meta.as_bytes()).await;
        assert!(marker.exists());
    }
}
