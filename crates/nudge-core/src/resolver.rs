use rand::seq::SliceRandom;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::BoxFuture;

/// Name resolution backend.
pub trait NameLookup: Send + Sync {
    fn lookup<'a>(&'a self, host: &'a str, port: u16) -> BoxFuture<'a, std::io::Result<Vec<SocketAddr>>>;
}

/// Resolves through the operating system resolver.
pub struct SystemLookup;

impl NameLookup for SystemLookup {
    fn lookup<'a>(&'a self, host: &'a str, port: u16) -> BoxFuture<'a, std::io::Result<Vec<SocketAddr>>> {
        Box::pin(async move {
            let addrs = tokio::net::lookup_host((host, port)).await?;
            Ok(addrs.collect())
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EndpointCacheEntry {
    pub address: SocketAddr,
    pub resolved_at: Instant,
}

/// Per-worker cached resolution of the target host.
pub struct EndpointResolver {
    host: String,
    port: u16,
    ttl: Duration,
    lookup: Arc<dyn NameLookup>,
    cached: Option<EndpointCacheEntry>,
}

impl EndpointResolver {
    pub fn new(host: impl Into<String>, port: u16, ttl: Duration, lookup: Arc<dyn NameLookup>) -> Self {
        Self {
            host: host.into(),
            port,
            ttl,
            lookup,
            cached: None,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn cached(&self) -> Option<EndpointCacheEntry> {
        self.cached
    }

    /// True when nothing is cached or the cached entry outlived the TTL.
    pub fn is_stale(&self) -> bool {
        match self.cached {
            Some(entry) => entry.resolved_at.elapsed() >= self.ttl,
            None => true,
        }
    }

    /// Returns the cached address unless `force` is set or the entry is
    /// stale. Otherwise resolves again, backing off `attempt * 100ms`
    /// between failed lookups, and picks one of the returned addresses at
    /// random. `None` only when `shutdown` fires first.
    pub async fn resolve(&mut self, force: bool, shutdown: &CancellationToken) -> Option<SocketAddr> {
        if !force && !self.is_stale() {
            return self.cached.map(|entry| entry.address);
        }

        let mut attempt: u64 = 0;
        loop {
            if shutdown.is_cancelled() {
                return None;
            }

            match self.lookup.lookup(&self.host, self.port).await {
                Ok(addrs) if !addrs.is_empty() => {
                    let address = *addrs.choose(&mut rand::thread_rng())?;
                    debug!("Resolved {} to {} ({} candidates)", self.host, address, addrs.len());
                    self.cached = Some(EndpointCacheEntry {
                        address,
                        resolved_at: Instant::now(),
                    });
                    return Some(address);
                }
                Ok(_) => warn!("No addresses returned for {}", self.host),
                Err(e) => warn!("Failed to resolve {}: {}", self.host, e),
            }

            attempt += 1;
            tokio::select! {
                _ = shutdown.cancelled() => return None,
                _ = tokio::time::sleep(Duration::from_millis(attempt * 100)) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::CountingLookup;

    fn resolver(lookup: Arc<CountingLookup>, ttl: Duration) -> EndpointResolver {
        EndpointResolver::new("service.local", 5410, ttl, lookup)
    }

    #[tokio::test]
    async fn test_cached_within_ttl() {
        let lookup = Arc::new(CountingLookup::new(vec!["10.0.0.1:5410".parse().unwrap()]));
        let mut resolver = resolver(lookup.clone(), Duration::from_secs(60));
        let shutdown = CancellationToken::new();

        let first = resolver.resolve(false, &shutdown).await.unwrap();
        let second = resolver.resolve(false, &shutdown).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(lookup.calls(), 1);
    }

    #[tokio::test]
    async fn test_force_resolves_again() {
        let lookup = Arc::new(CountingLookup::new(vec!["10.0.0.1:5410".parse().unwrap()]));
        let mut resolver = resolver(lookup.clone(), Duration::from_secs(60));
        let shutdown = CancellationToken::new();

        resolver.resolve(false, &shutdown).await.unwrap();
        resolver.resolve(true, &shutdown).await.unwrap();
        assert_eq!(lookup.calls(), 2);
    }

    #[tokio::test]
    async fn test_expired_ttl_resolves_again() {
        let lookup = Arc::new(CountingLookup::new(vec!["10.0.0.1:5410".parse().unwrap()]));
        let mut resolver = resolver(lookup.clone(), Duration::from_millis(20));
        let shutdown = CancellationToken::new();

        resolver.resolve(false, &shutdown).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(resolver.is_stale());
        resolver.resolve(false, &shutdown).await.unwrap();
        assert_eq!(lookup.calls(), 2);
    }

    #[tokio::test]
    async fn test_retries_until_addresses_appear() {
        let lookup = Arc::new(CountingLookup::new(vec!["10.0.0.1:5410".parse().unwrap()]));
        lookup.fail_next(2);
        let mut resolver = resolver(lookup.clone(), Duration::from_secs(60));
        let shutdown = CancellationToken::new();

        let started = Instant::now();
        let address = resolver.resolve(false, &shutdown).await;

        assert_eq!(address, Some("10.0.0.1:5410".parse().unwrap()));
        assert_eq!(lookup.calls(), 3);
        // 100ms + 200ms of backoff
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_picks_among_candidates() {
        let candidates: Vec<SocketAddr> = vec![
            "10.0.0.1:5410".parse().unwrap(),
            "10.0.0.2:5410".parse().unwrap(),
        ];
        let lookup = Arc::new(CountingLookup::new(candidates.clone()));
        let mut resolver = resolver(lookup, Duration::from_secs(60));
        let shutdown = CancellationToken::new();

        for _ in 0..20 {
            let address = resolver.resolve(true, &shutdown).await.unwrap();
            assert!(candidates.contains(&address));
        }
    }

    #[tokio::test]
    async fn test_cancelled_while_failing() {
        let lookup = Arc::new(CountingLookup::new(Vec::new()));
        let mut resolver = resolver(lookup, Duration::from_secs(60));
        let shutdown = CancellationToken::new();

        let token = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });

        assert_eq!(resolver.resolve(false, &shutdown).await, None);
    }

    #[tokio::test]
    async fn test_system_lookup_localhost() {
        let addrs = SystemLookup.lookup("127.0.0.1", 80).await.unwrap();
        assert_eq!(addrs, vec!["127.0.0.1:80".parse().unwrap()]);
    }
}
