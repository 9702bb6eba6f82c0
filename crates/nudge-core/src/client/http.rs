use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use super::{Connect, Dispatch};
use crate::config::HttpConfig;
use crate::error::DispatchError;
use crate::message::{status, Request, Response};
use crate::template;
use crate::BoxFuture;

/// Plain HTTP request built from the `[target.http]` settings.
pub struct HttpClient {
    client: reqwest::Client,
    method: Method,
    url: String,
    body: String,
}

impl HttpClient {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn render_body(&self, request: &Request) -> String {
        template::render(&self.body, request)
    }
}

/// 2xx is success and maps to status 0, anything else passes through.
fn map_status(code: u16) -> u32 {
    if (200..300).contains(&code) {
        status::OK
    } else {
        code as u32
    }
}

impl Dispatch for HttpClient {
    fn name(&self) -> &'static str {
        "http"
    }

    fn dispatch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response, DispatchError>> {
        Box::pin(async move {
            let response = self
                .client
                .request(self.method.clone(), &self.url)
                .body(self.render_body(request))
                .send()
                .await?;
            let mut result = Response::failure(map_status(response.status().as_u16()));
            result.meta = response.bytes().await?.to_vec();
            Ok(result)
        })
    }
}

pub struct HttpConnector {
    method: Method,
    path: String,
    body: String,
    headers: HeaderMap,
    timeout: Duration,
}

impl HttpConnector {
    pub fn new(config: &HttpConfig, timeout: Duration) -> Result<Self> {
        let method = Method::from_bytes(config.method.as_bytes())
            .with_context(|| format!("Invalid HTTP method {}", config.method))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .with_context(|| format!("Invalid header name {}", name))?;
            let value = HeaderValue::from_str(value)
                .with_context(|| format!("Invalid value for header {}", name))?;
            headers.append(name, value);
        }

        let path = if config.path.starts_with('/') {
            config.path.clone()
        } else {
            format!("/{}", config.path)
        };

        Ok(Self {
            method,
            path,
            body: config.body.clone(),
            headers,
            timeout,
        })
    }
}

impl Connect for HttpConnector {
    fn connect(&self, address: SocketAddr) -> BoxFuture<'_, Result<Arc<dyn Dispatch>>> {
        Box::pin(async move {
            let client = reqwest::Client::builder()
                .timeout(self.timeout)
                .default_headers(self.headers.clone())
                .build()?;
            let client: Arc<dyn Dispatch> = Arc::new(HttpClient {
                client,
                method: self.method.clone(),
                url: format!("http://{}{}", address, self.path),
                body: self.body.clone(),
            });
            Ok(client)
        })
    }
}
