/// Daemon RPC client
///
/// JSON-RPC 2.0 over HTTP(S) with a circuit breaker so a dead daemon does
/// not get hammered by every session poller at once.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use super::daemon::{BlockTemplate, Daemon, DaemonConnector, DaemonInfo, DaemonSettings};
use crate::metrics::prometheus as metrics;

const USER_AGENT: &str = concat!("solo-pool/", env!("CARGO_PKG_VERSION"));

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
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub id: Value,
    pub result: Option<Value>,
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
                "Circuit breaker tripped after {} failures, pausing RPC for {}s",
                self.failures,
                self.reset_timeout.as_secs()
            );
        }
    }

    fn record_success(&mut self) {
        if self.failures > 0 {
            self.failures = 0;
            tracing::info!("Circuit breaker reset");
        }
    }

    fn check(&mut self) -> Result<()> {
        if self.is_open {
            if let Some(last_fail) = self.last_failure {
                if last_fail.elapsed() > self.reset_timeout {
                    tracing::info!("Circuit breaker half-open, retrying");
                    self.is_open = false;
                    self.failures = 0;
                } else {
                    return Err(anyhow!("RPC circuit breaker is open"));
                }
            }
        }
        Ok(())
    }
}

pub struct RpcClient {
    settings: DaemonSettings,
    client: reqwest::Client,
    circuit_breaker: Arc<RwLock<CircuitBreaker>>,
}

impl RpcClient {
    pub fn new(settings: DaemonSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| anyhow!("Failed to build HTTP client: {}", e))?;

        tracing::debug!("RpcClient initialized: {}", settings.url("/json_rpc"));

        Ok(Self {
            settings,
            client,
            circuit_breaker: Arc::new(RwLock::new(CircuitBreaker::new())),
        })
    }

    pub fn settings(&self) -> &DaemonSettings {
        &self.settings
    }

    async fn guarded<F, T>(&self, request: F) -> Result<T>
    where
        F: std::future::Future<Output = std::result::Result<T, reqwest::Error>>,
    {
        metrics::inc_rpc_requests();

        {
            let mut breaker = self.circuit_breaker.write().await;
            if let Err(e) = breaker.check() {
                metrics::inc_rpc_errors();
                return Err(e);
            }
        }

        match request.await {
            Ok(v) => {
                self.circuit_breaker.write().await.record_success();
                Ok(v)
            }
            Err(e) => {
                self.circuit_breaker.write().await.record_failure();
                metrics::inc_rpc_errors();
                Err(anyhow!("RPC transport error: {}", e))
            }
        }
    }

    /// Make a JSON-RPC call against `/json_rpc`
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let payload = RpcRequest {
            jsonrpc: "2.0".to_string(),
            id: 1,
            method: method.to_string(),
            params,
        };
        let url = self.settings.url("/json_rpc");

        let response: RpcResponse = self
            .guarded(async {
                self.client
                    .post(&url)
                    .json(&payload)
                    .send()
                    .await?
                    .error_for_status()?
                    .json()
                    .await
            })
            .await?;

        // application errors do not trip the breaker
        if let Some(error) = response.error.filter(|e| !e.is_null()) {
            metrics::inc_rpc_errors();
            return Err(anyhow!("RPC error from {}: {}", method, error));
        }

        Ok(response.result.unwrap_or(Value::Null))
    }

    /// Plain GET against a REST path such as `/info`
    pub async fn get(&self, path: &str) -> Result<Value> {
        let url = self.settings.url(path);
        self.guarded(async {
            self.client
                .get(&url)
                .send()
                .await?
                .error_for_status()?
                .json::<Value>()
                .await
        })
        .await
    }
}

fn accepted_hash(result: &Value) -> Option<String> {
    if let Some(s) = result.as_str() {
        return Some(s.to_string());
    }
    ["hash", "block_id", "blockHash"]
        .iter()
        .find_map(|k| result.get(*k).and_then(|v| v.as_str()))
        .map(|s| s.to_string())
}

#[async_trait]
impl Daemon for RpcClient {
    async fn block_template(&self, wallet: &str, reserve_size: usize) -> Result<BlockTemplate> {
        let result = self
            .call(
                "getblocktemplate",
                json!({ "wallet_address": wallet, "reserve_size": reserve_size }),
            )
            .await?;
        BlockTemplate::from_rpc_response(&result)
    }

    async fn submit_block(&self, block_hex: &str) -> Result<String> {
        let result = self.call("submitblock", json!([block_hex])).await?;
        accepted_hash(&result).ok_or_else(|| anyhow!("submitblock returned no hash: {}", result))
    }

    async fn last_block(&self) -> Result<Value> {
        let result = self.call("getlastblockheader", json!({})).await?;
        Ok(result.get("block_header").cloned().unwrap_or(result))
    }

    async fn info(&self) -> Result<DaemonInfo> {
        let value = self.get("/info").await?;
        Ok(DaemonInfo {
            height: value.get("height").and_then(|v| v.as_u64()).unwrap_or(0),
            difficulty: value.get("difficulty").and_then(|v| v.as_u64()).unwrap_or(0),
        })
    }
}

/// Production connector: one `RpcClient` per settings value.
#[derive(Debug, Default, Clone)]
pub struct RpcConnector;

impl DaemonConnector for RpcConnector {
    fn connect(&self, settings: &DaemonSettings) -> Result<Arc<dyn Daemon>> {
        Ok(Arc::new(RpcClient::new(settings.clone())?))
    }
}
