use std::future::Future;
use std::pin::Pin;

pub mod chaos;
pub mod client;
pub mod config;
pub mod error;
pub mod kv;
pub mod load;
pub mod message;
pub mod metrics;
pub mod payload;
pub mod render;
pub mod resolver;
pub mod responder;
pub mod retry;
pub mod sender;
pub mod sink;
pub mod stats;
pub mod stream;
pub mod template;

#[cfg(test)]
mod testing;

/// Boxed future returned by the object-safe traits in this crate.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub use chaos::ChaosInjector;
pub use client::{connector_for, Connect, Dispatch};
pub use config::*;
pub use error::{DispatchError, Fault};
pub use kv::{EtcdGateway, KeyValueStore, MemoryStore};
pub use message::{LoadDirective, LoadKind, Request, Response, Stat};
pub use metrics::{HostMetric, HostMetrics};
pub use payload::MetaSource;
pub use render::{LineFormat, Render, RenderContext, Role};
pub use resolver::{EndpointResolver, NameLookup, SystemLookup};
pub use responder::{KeyWatchResponder, Responder};
pub use retry::RetryPolicy;
pub use sender::MessageSender;
pub use sink::{Channel, Sink, SinkSet};
pub use stats::{StatsCollector, StatsSummary};
pub use stream::{StreamScheduler, StreamSummary};
