use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{Connect, Dispatch};
use crate::error::DispatchError;
use crate::message::{Request, Response};
use crate::BoxFuture;

/// JSON request/response call against the server's `/parse` endpoint.
pub struct RpcClient {
    client: reqwest::Client,
    url: String,
}

impl RpcClient {
    pub fn new(address: SocketAddr, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: format!("http://{}/parse", address),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Dispatch for RpcClient {
    fn name(&self) -> &'static str {
        "rpc"
    }

    fn dispatch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response, DispatchError>> {
        Box::pin(async move {
            let response = self.client.post(&self.url).json(request).send().await?;
            let status = response.status();
            if !status.is_success() {
                debug!("Parser at {} answered {}", self.url, status);
                return Ok(Response::failure(status.as_u16() as u32));
            }
            Ok(response.json::<Response>().await?)
        })
    }
}

pub struct RpcConnector {
    timeout: Duration,
}

impl RpcConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Connect for RpcConnector {
    fn connect(&self, address: SocketAddr) -> BoxFuture<'_, Result<Arc<dyn Dispatch>>> {
        Box::pin(async move {
            let client: Arc<dyn Dispatch> = Arc::new(RpcClient::new(address, self.timeout)?);
            Ok(client)
        })
    }
}
