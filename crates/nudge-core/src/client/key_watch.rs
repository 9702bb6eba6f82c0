use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{Connect, Dispatch};
use crate::error::DispatchError;
use crate::kv::{EtcdGateway, KeyValueStore};
use crate::message::{Request, Response};
use crate::BoxFuture;

/// Exchange through a key-value store: the request is written under the
/// request prefix and the answer is awaited under the response prefix.
pub struct KeyWatchClient {
    store: Arc<dyn KeyValueStore>,
    request_prefix: String,
    response_prefix: String,
    timeout: Duration,
}

impl KeyWatchClient {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        request_prefix: impl Into<String>,
        response_prefix: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            request_prefix: request_prefix.into(),
            response_prefix: response_prefix.into(),
            timeout,
        }
    }

    pub fn request_key(&self, request: &Request) -> String {
        format!(
            "{}/{}/{}",
            self.request_prefix, request.sequence_id, request.message_id
        )
    }

    pub fn response_key(&self, request_key: &str) -> String {
        response_key_for(request_key, &self.request_prefix, &self.response_prefix)
    }

    async fn exchange(&self, request: &Request) -> Result<Response, DispatchError> {
        let key = self.request_key(request);
        let response_key = self.response_key(&key);

        let revision = self.store.put(&key, serde_json::to_vec(request)?).await?;
        debug!("Waiting for response at {}", response_key);

        let value = self.store.watch(&response_key, revision + 1).await?;
        let response: Response = serde_json::from_slice(&value)?;
        self.store.delete(&response_key).await?;
        Ok(response)
    }
}

/// Maps a request key onto its response key by swapping the first
/// occurrence of the request prefix.
pub fn response_key_for(request_key: &str, request_prefix: &str, response_prefix: &str) -> String {
    request_key.replacen(request_prefix, response_prefix, 1)
}

impl Dispatch for KeyWatchClient {
    fn name(&self) -> &'static str {
        "key-watch"
    }

    fn dispatch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response, DispatchError>> {
        Box::pin(async move {
            // one deadline for the whole exchange, store calls included
            tokio::time::timeout(self.timeout, self.exchange(request))
                .await
                .map_err(|_| DispatchError::Timeout)?
        })
    }
}

pub struct KeyWatchConnector {
    request_prefix: String,
    response_prefix: String,
    timeout: Duration,
}

impl KeyWatchConnector {
    pub fn new(request_prefix: String, response_prefix: String, timeout: Duration) -> Self {
        Self {
            request_prefix,
            response_prefix,
            timeout,
        }
    }
}

impl Connect for KeyWatchConnector {
    fn connect(&self, address: SocketAddr) -> BoxFuture<'_, Result<Arc<dyn Dispatch>>> {
        Box::pin(async move {
            let gateway = EtcdGateway::with_base_url(&format!("http://{}", address), self.timeout)
                .with_context(|| format!("Failed to build key-value client for {}", address))?;
            let client: Arc<dyn Dispatch> = Arc::new(KeyWatchClient::new(
                Arc::new(gateway),
                self.request_prefix.clone(),
                self.response_prefix.clone(),
                self.timeout,
            ));
            Ok(client)
        })
    }
}
