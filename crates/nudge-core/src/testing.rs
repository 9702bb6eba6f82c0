//! Network-free stand-ins for the client and resolver seams.

use anyhow::Result;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::client::{Connect, Dispatch};
use crate::error::DispatchError;
use crate::message::{now_ns, Request, Response};
use crate::resolver::NameLookup;
use crate::BoxFuture;

/// Returns a fixed address list and counts lookups.
pub struct CountingLookup {
    addrs: Vec<SocketAddr>,
    calls: AtomicUsize,
    failures_left: AtomicUsize,
}

impl CountingLookup {
    pub fn new(addrs: Vec<SocketAddr>) -> Self {
        Self {
            addrs,
            calls: AtomicUsize::new(0),
            failures_left: AtomicUsize::new(0),
        }
    }

    pub fn localhost() -> Self {
        Self::new(vec![SocketAddr::from(([127, 0, 0, 1], 5410))])
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Makes the next `n` lookups fail.
    pub fn fail_next(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }
}

impl NameLookup for CountingLookup {
    fn lookup<'a>(&'a self, _host: &'a str, _port: u16) -> BoxFuture<'a, std::io::Result<Vec<SocketAddr>>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let failing = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(std::io::Error::new(std::io::ErrorKind::Other, "lookup failed"));
            }
            Ok(self.addrs.clone())
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Outcome {
    Ok,
    Status(u32),
    Transport,
}

/// Scripted dispatcher: plays queued outcomes first, then repeats the
/// default one. Optionally cancels a token after a number of attempts.
pub struct StubDispatch {
    default: Outcome,
    script: Mutex<VecDeque<Outcome>>,
    attempts: AtomicUsize,
    cancel_after: Mutex<Option<(usize, CancellationToken)>>,
}

impl StubDispatch {
    pub fn new(default: Outcome) -> Arc<Self> {
        Arc::new(Self {
            default,
            script: Mutex::new(VecDeque::new()),
            attempts: AtomicUsize::new(0),
            cancel_after: Mutex::new(None),
        })
    }

    pub fn always_ok() -> Arc<Self> {
        Self::new(Outcome::Ok)
    }

    pub fn always_fail() -> Arc<Self> {
        Self::new(Outcome::Transport)
    }

    pub fn script(&self, outcomes: impl IntoIterator<Item = Outcome>) {
        self.script.lock().extend(outcomes);
    }

    pub fn cancel_after(&self, attempts: usize, token: CancellationToken) {
        *self.cancel_after.lock() = Some((attempts, token));
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Dispatch for StubDispatch {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn dispatch<'a>(&'a self, _request: &'a Request) -> BoxFuture<'a, Result<Response, DispatchError>> {
        Box::pin(async move {
            let attempts = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some((limit, token)) = self.cancel_after.lock().as_ref() {
                if attempts >= *limit {
                    token.cancel();
                }
            }

            let outcome = self.script.lock().pop_front().unwrap_or(self.default);
            match outcome {
                Outcome::Ok => {
                    let now = now_ns();
                    Ok(Response::ok(now, now))
                }
                Outcome::Status(code) => Ok(Response::failure(code)),
                Outcome::Transport => Err(DispatchError::Transport(anyhow::anyhow!("connection reset"))),
            }
        })
    }
}

/// Hands out the same dispatcher on every connect and counts connects.
pub struct StubConnector {
    dispatch: Arc<StubDispatch>,
    connects: AtomicUsize,
}

impl StubConnector {
    pub fn new(dispatch: Arc<StubDispatch>) -> Arc<Self> {
        Arc::new(Self {
            dispatch,
            connects: AtomicUsize::new(0),
        })
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl Connect for StubConnector {
    fn connect(&self, _address: SocketAddr) -> BoxFuture<'_, Result<Arc<dyn Dispatch>>> {
        Box::pin(async move {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let dispatch: Arc<dyn Dispatch> = self.dispatch.clone();
            Ok(dispatch)
        })
    }
}
