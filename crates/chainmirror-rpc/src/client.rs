//! HTTP JSON-RPC client backed by `reqwest`.
//!
//! - HTTP basic auth with the node's `rpcuser`/`rpcpassword`
//! - Per-request timeout
//! - Exponential backoff for connection failures and node warm-up

use std::time::Duration;

use async_trait::async_trait;

use crate::error::TransportError;
use crate::request::{codes, JsonRpcRequest, JsonRpcResponse};
use crate::retry::{RetryConfig, RetryPolicy};
use crate::transport::RpcTransport;

/// Configuration for `HttpRpcClient`.
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub user: Option<String>,
    pub password: Option<String>,
    pub retry: RetryConfig,
    pub request_timeout: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            user: None,
            password: None,
            retry: RetryConfig::default(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// HTTP JSON-RPC client for a single node.
#[derive(Debug)]
pub struct HttpRpcClient {
    url: String,
    http: reqwest::Client,
    user: Option<String>,
    password: Option<String>,
    retry: RetryPolicy,
    request_timeout: Duration,
}

impl HttpRpcClient {
    /// Create a client for the node at `url` (e.g. `http://127.0.0.1:8332`).
    pub fn new(url: impl Into<String>, config: HttpClientConfig) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| TransportError::Other(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            url: url.into(),
            http,
            user: config.user,
            password: config.password,
            retry: RetryPolicy::new(config.retry),
            request_timeout: config.request_timeout,
        })
    }

    async fn send_once(&self, req: &JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
        let mut builder = self.http.post(&self.url).json(req);
        if let Some(user) = &self.user {
            builder = builder.basic_auth(user, self.password.as_deref());
        }

        let resp = builder.send().await.map_err(|e| self.map_reqwest(e))?;
        let status = resp.status().as_u16();
        let body = resp.text().await.map_err(|e| self.map_reqwest(e))?;
        decode_body(status, &body)
    }

    fn map_reqwest(&self, e: reqwest::Error) -> TransportError {
        if e.is_timeout() {
            TransportError::Timeout {
                ms: self.request_timeout.as_millis() as u64,
            }
        } else {
            TransportError::Http(e.to_string())
        }
    }
}

/// Interpret an HTTP response body.
///
/// bitcoind reports JSON-RPC errors with HTTP 404/500 status codes, so any
/// body that parses as an error envelope is a delivered response regardless
/// of status.
fn decode_body(status: u16, body: &str) -> Result<JsonRpcResponse, TransportError> {
    let success = (200..300).contains(&status);
    match serde_json::from_str::<JsonRpcResponse>(body) {
        Ok(resp) if success || resp.error.is_some() => Ok(resp),
        Err(e) if success => Err(TransportError::Deserialization(e)),
        _ if status == 401 || status == 403 => Err(TransportError::Other(format!(
            "HTTP {status}: node rejected the RPC credentials"
        ))),
        _ => Err(TransportError::Http(format!("HTTP {status}: {body}"))),
    }
}

#[async_trait]
impl RpcTransport for HttpRpcClient {
    async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let outcome = self.send_once(&req).await.and_then(|resp| match &resp.error {
                Some(err) if err.code == codes::RPC_IN_WARMUP => {
                    Err(TransportError::Rpc(err.clone()))
                }
                _ => Ok(resp),
            });

            match outcome {
                Ok(resp) => return Ok(resp),
                Err(e) if e.is_retryable() => match self.retry.next_delay(attempt) {
                    Some(delay) => {
                        tracing::warn!(
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            method = %req.method,
                            error = %e,
                            url = %self.url,
                            "Retrying RPC request"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        tracing::error!(
                            attempt,
                            method = %req.method,
                            error = %e,
                            url = %self.url,
                            "RPC retries exhausted"
                        );
                        return Err(e);
                    }
                },
                Err(e) => return Err(e),
            }
        }
    }

    fn url(&self) -> &str {
        &self.url
    }
}
