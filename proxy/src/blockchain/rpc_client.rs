/// Node RPC Client - JSON-RPC 2.0 over HTTP POST
///
/// Transport failures trip a circuit breaker so a dead node is not hammered
/// by every session that finds a block at once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{ProxyError, Result};
use crate::metrics::prometheus as metrics;

/// `call(method, params) -> result`, as consumed by sessions and the
/// template poller.
#[async_trait]
pub trait RpcCall: Send + Sync {
    async fn call(&self, method: &str, params: Value) -> Result<Value>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    #[serde(default)]
    pub id: Value,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
}

#[derive(Debug, Clone)]
struct CircuitBreaker {
    failures: u32,
    last_failure: Option<Instant>,
    is_open: bool,
    max_failures: u32,
    reset_timeout: Duration,
}

impl CircuitBreaker {
    fn new() -> Self {
        Self {
            failures: 0,
            last_failure: None,
            is_open: false,
            max_failures: 5,
            reset_timeout: Duration::from_secs(60),
        }
    }

    fn record_failure(&mut self) {
        self.failures += 1;
        self.last_failure = Some(Instant::now());

        if self.failures >= self.max_failures && !self.is_open {
            self.is_open = true;
            tracing::error!(
                failures = self.failures,
                pause_secs = self.reset_timeout.as_secs(),
                "RPC circuit breaker tripped"
            );
        }
    }

    fn record_success(&mut self) {
        if self.failures > 0 {
            self.failures = 0;
            tracing::info!("RPC circuit breaker reset");
        }
    }

    fn check(&mut self) -> Result<()> {
        if self.is_open {
            if let Some(last_fail) = self.last_failure {
                if last_fail.elapsed() > self.reset_timeout {
                    tracing::info!("RPC circuit breaker half-open, retrying");
                    self.is_open = false;
                    self.failures = 0;
                } else {
                    return Err(ProxyError::Rpc("circuit breaker is open".to_string()));
                }
            }
        }
        Ok(())
    }
}

pub struct RpcClient {
    url: String,
    timeout: Duration,
    client: Client<HttpConnector, Full<Bytes>>,
    next_id: AtomicU64,
    breaker: Mutex<CircuitBreaker>,
}

impl RpcClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        let url = url.into();
        let client = Client::builder(hyper_util::rt::TokioExecutor::new()).build_http();

        tracing::info!(url = %url, "RPC client initialized");

        Self {
            url,
            timeout,
            client,
            next_id: AtomicU64::new(0),
            breaker: Mutex::new(CircuitBreaker::new()),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn post(&self, method: &str, params: Value) -> Result<Value> {
        self.breaker.lock().check()?;

        let payload = RpcRequest {
            jsonrpc: "2.0".to_string(),
            id: self.next_id.fetch_add(1, Ordering::Relaxed) + 1,
            method: method.to_string(),
            params,
        };
        let body = Full::new(Bytes::from(serde_json::to_vec(&payload)?));

        let req = Request::builder()
            .method(Method::POST)
            .uri(&self.url)
            .header("Content-Type", "application/json")
            .body(body)
            .map_err(|e| ProxyError::Rpc(format!("bad request: {}", e)))?;

        let sent = tokio::time::timeout(self.timeout, self.client.request(req)).await;
        let response = match sent {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                self.breaker.lock().record_failure();
                return Err(ProxyError::Rpc(format!("connection failed: {}", e)));
            }
            Err(_) => {
                self.breaker.lock().record_failure();
                return Err(ProxyError::Rpc("request timeout".to_string()));
            }
        };

        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| ProxyError::Rpc(format!("reading body: {}", e)))?
            .to_bytes();

        // Bitcoin-style nodes answer RPC errors with HTTP 500 and a JSON body.
        let rpc_response: RpcResponse = match serde_json::from_slice(&body) {
            Ok(r) => r,
            Err(e) => {
                if !status.is_success() {
                    self.breaker.lock().record_failure();
                    return Err(ProxyError::Rpc(format!("HTTP error: {}", status)));
                }
                return Err(ProxyError::Rpc(format!("bad response: {}", e)));
            }
        };

        if let Some(error) = rpc_response.error.filter(|e| !e.is_null()) {
            // Application errors do not count against the breaker.
            return Err(ProxyError::Rpc(error.to_string()));
        }

        self.breaker.lock().record_success();
        Ok(rpc_response.result.unwrap_or(Value::Null))
    }

    /// Submit a solved block. `Ok(false)` means the node refused it.
    pub async fn submit_block(&self, block: &[u8]) -> Result<bool> {
        submit_block(self, block).await
    }
}

#[async_trait]
impl RpcCall for RpcClient {
    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        metrics::inc_rpc_requests();
        let res = self.post(method, params).await;
        if res.is_err() {
            metrics::inc_rpc_errors();
        }
        res
    }
}

/// `submitblock [hex]`; null or `true` is acceptance, a string is the
/// rejection reason.
pub async fn submit_block(rpc: &(impl RpcCall + ?Sized), block: &[u8]) -> Result<bool> {
    let result = rpc.call("submitblock", json!([hex::encode(block)])).await?;

    let accepted = match &result {
        Value::Null => true,
        Value::Bool(b) => *b,
        Value::Object(obj) => obj
            .get("accepted")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
        _ => false,
    };

    if !accepted {
        metrics::inc_block_submit_rejected();
        tracing::error!(reason = %result, "submitblock rejected");
    }

    Ok(accepted)
}
