//! Protocol clients. A `Connect` implementation is chosen once per run
//! from the configured protocol; each worker calls it to build a fresh
//! `Dispatch` whenever its endpoint is (re)resolved.

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::{Config, Protocol};
use crate::error::DispatchError;
use crate::message::{Request, Response};
use crate::BoxFuture;

pub mod http;
pub mod key_watch;
pub mod rpc;

pub use http::{HttpClient, HttpConnector};
pub use key_watch::{KeyWatchClient, KeyWatchConnector};
pub use rpc::{RpcClient, RpcConnector};

/// One connected client able to perform a single request/response
/// exchange per call.
pub trait Dispatch: Send + Sync {
    fn name(&self) -> &'static str;

    fn dispatch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response, DispatchError>>;
}

/// Builds a `Dispatch` bound to a resolved address.
pub trait Connect: Send + Sync {
    fn connect(&self, address: SocketAddr) -> BoxFuture<'_, Result<Arc<dyn Dispatch>>>;
}

pub fn connector_for(config: &Config) -> Result<Arc<dyn Connect>> {
    let timeout = config.timeout();
    let connector: Arc<dyn Connect> = match config.target.protocol {
        Protocol::Rpc => Arc::new(RpcConnector::new(timeout)),
        Protocol::Http => Arc::new(HttpConnector::new(&config.target.http, timeout)?),
        Protocol::KeyWatch => Arc::new(KeyWatchConnector::new(
            config.target.key_watch.request_prefix_for(&config.node.name),
            config.target.key_watch.response_prefix_for(&config.node.name),
            timeout,
        )),
    };
    Ok(connector)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connector_per_protocol() {
        let address: SocketAddr = "127.0.0.1:5410".parse().unwrap();
        let mut config = Config::default();

        for (protocol, name) in [
            (Protocol::Rpc, "rpc"),
            (Protocol::Http, "http"),
            (Protocol::KeyWatch, "key-watch"),
        ] {
            config.target.protocol = protocol;
            let client = connector_for(&config).unwrap().connect(address).await.unwrap();
            assert_eq!(client.name(), name);
        }
    }
}
