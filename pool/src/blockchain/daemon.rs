/// Daemon capability boundary
///
/// The pool only needs a handful of calls from the blockchain daemon. They
/// are expressed as a trait so sessions can be driven by the JSON-RPC client
/// in production and by in-process fakes in tests.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Smallest per-request timeout accepted from login overrides.
pub const MIN_TIMEOUT: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockTemplate {
    /// Hex-encoded block template bytes
    pub blob: String,
    pub height: u64,
    pub difficulty: u64,
    /// Offset of the reserved space used for the pool nonce
    #[serde(rename = "reservedOffset")]
    pub reserved_offset: usize,
}

impl BlockTemplate {
    /// Parse a `getblocktemplate` result
    pub fn from_rpc_response(value: &Value) -> Result<Self> {
        let blob = value
            .get("blocktemplate_blob")
            .or_else(|| value.get("blob"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("block template missing blob"))?
            .to_string();

        let height = value
            .get("height")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| anyhow!("block template missing height"))?;

        let difficulty = value
            .get("difficulty")
            .and_then(|v| v.as_u64())
            .filter(|d| *d > 0)
            .ok_or_else(|| anyhow!("block template missing difficulty"))?;

        let reserved_offset = value
            .get("reserved_offset")
            .or_else(|| value.get("reservedOffset"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as usize;

        Ok(Self {
            blob,
            height,
            difficulty,
            reserved_offset,
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonInfo {
    pub height: u64,
    pub difficulty: u64,
}

#[async_trait]
pub trait Daemon: Send + Sync {
    async fn block_template(&self, wallet: &str, reserve_size: usize) -> Result<BlockTemplate>;

    /// Submit a serialized block, returning the hash the daemon accepted.
    async fn submit_block(&self, block_hex: &str) -> Result<String>;

    async fn last_block(&self) -> Result<Value>;

    async fn info(&self) -> Result<DaemonInfo>;
}

/// Where a session's daemon lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonSettings {
    pub host: String,
    pub port: u16,
    pub ssl: bool,
    #[serde(with = "millis")]
    pub timeout: Duration,
}

impl DaemonSettings {
    pub fn new(host: impl Into<String>, port: u16, ssl: bool, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            ssl: ssl || port == 443,
            timeout: timeout.max(MIN_TIMEOUT),
        }
    }

    /// Apply `key=value;key=value` directives from a login password.
    ///
    /// Recognized keys are `host`, `port`, `ssl` and `timeout` (milliseconds),
    /// matched case-insensitively. Anything else is ignored.
    pub fn with_overrides(&self, pass: &str) -> Self {
        let mut out = self.clone();

        for part in pass.split(';') {
            let Some((key, value)) = part.split_once('=') else {
                continue;
            };
            let value = value.trim();
            match key.trim().to_ascii_lowercase().as_str() {
                "host" if !value.is_empty() => out.host = value.to_string(),
                "port" => {
                    if let Ok(port) = value.parse() {
                        out.port = port;
                    }
                }
                "ssl" => out.ssl = value == "true" || value == "1",
                "timeout" => {
                    if let Ok(ms) = value.parse::<u64>() {
                        out.timeout = Duration::from_millis(ms);
                    }
                }
                _ => {}
            }
        }

        out.timeout = out.timeout.max(MIN_TIMEOUT);
        out
    }

    pub fn url(&self, path: &str) -> String {
        let scheme = if self.ssl { "https" } else { "http" };
        format!("{}://{}:{}{}", scheme, self.host, self.port, path)
    }
}

/// A daemon client together with the settings it was built from. Swapped
/// as one value so readers never see a client paired with stale settings.
#[derive(Clone)]
pub struct DaemonHandle {
    pub settings: DaemonSettings,
    pub client: Arc<dyn Daemon>,
}

impl std::fmt::Debug for DaemonHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonHandle")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// Builds daemon clients for a given set of settings.
pub trait DaemonConnector: Send + Sync {
    fn connect(&self, settings: &DaemonSettings) -> Result<Arc<dyn Daemon>>;

    fn handle(&self, settings: &DaemonSettings) -> Result<DaemonHandle> {
        Ok(DaemonHandle {
            settings: settings.clone(),
            client: self.connect(settings)?,
        })
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> DaemonSettings {
        DaemonSettings::new("127.0.0.1", 11898, false, Duration::from_secs(5))
    }

    #[test]
    fn overrides_parse_all_keys() {
        let s = base().with_overrides("host=node.example;port=443;ssl=true;timeout=10");
        assert_eq!(s.host, "node.example");
        assert_eq!(s.port, 443);
        assert!(s.ssl);
        assert_eq!(s.timeout, MIN_TIMEOUT);
    }

    #[test]
    fn overrides_are_case_insensitive_and_tolerant() {
        let s = base().with_overrides("HOST=a.b;Port=nope;bogus=1;timeout=2500;;x");
        assert_eq!(s.host, "a.b");
        assert_eq!(s.port, 11898);
        assert!(!s.ssl);
        assert_eq!(s.timeout, Duration::from_millis(2500));
    }

    #[test]
    fn plain_password_keeps_defaults() {
        assert_eq!(base().with_overrides("x"), base());
        assert_eq!(base().with_overrides(""), base());
    }

    #[test]
    fn port_443_forces_ssl() {
        let s = DaemonSettings::new("node", 443, false, Duration::from_secs(1));
        assert!(s.ssl);
        assert_eq!(s.url("/json_rpc"), "https://node:443/json_rpc");
    }

    #[test]
    fn template_parsing() {
        let json = serde_json::json!({
            "blocktemplate_blob": "0102",
            "difficulty": 250000,
            "height": 42,
            "reserved_offset": 77,
        });
        let t = BlockTemplate::from_rpc_response(&json).unwrap();
        assert_eq!(t.blob, "0102");
        assert_eq!(t.height, 42);
        assert_eq!(t.difficulty, 250000);
        assert_eq!(t.reserved_offset, 77);

        assert!(BlockTemplate::from_rpc_response(&serde_json::json!({"height": 1})).is_err());
    }
}
