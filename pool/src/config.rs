use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::blockchain::DaemonSettings;
use crate::pool::PoolOptions;
use crate::session::SessionOptions;
use crate::vardiff::VarDiffConfig;

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
    pub node_host: String,
    pub node_port: u16,
    pub node_ssl: bool,
    pub node_timeout_ms: u64,

    pub bind_ip: IpAddr,
    pub port: u16,
    pub http_port: u16,
    pub hostname: String,

    pub default_difficulty: u64,
    pub stale_session_secs: u64,
    pub reaper_interval_secs: u64,
    pub template_poll_ms: u64,
    pub first_template_timeout_secs: u64,

    pub address_prefix: String,
    pub address_length: usize,

    /// Unset keeps block history in memory
    #[serde(default)]
    pub redis_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_host: "127.0.0.1".to_string(),
            node_port: 11898,
            node_ssl: false,
            node_timeout_ms: 5000,
            bind_ip: IpAddr::from([0, 0, 0, 0]),
            port: 3333,
            http_port: 8080,
            hostname: "localhost".to_string(),
            default_difficulty: 10_000,
            stale_session_secs: 120,
            reaper_interval_secs: 60,
            template_poll_ms: 1000,
            first_template_timeout_secs: 30,
            address_prefix: "TRTL".to_string(),
            address_length: 99,
            redis_url: None,
        }
    }
}

fn parse_or<T: FromStr>(value: Option<String>, fallback: T) -> T {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or(fallback)
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes")
}

impl Config {
    pub fn load() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from any key lookup; unset or unparsable values keep
    /// their defaults.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let mut cfg = Self {
            node_host: get("NODE_HOST").filter(|h| !h.is_empty()).unwrap_or(d.node_host),
            node_port: parse_or(get("NODE_PORT"), d.node_port),
            node_ssl: get("NODE_SSL").map(|v| parse_flag(&v)).unwrap_or(d.node_ssl),
            node_timeout_ms: parse_or(get("NODE_TIMEOUT"), d.node_timeout_ms),
            bind_ip: parse_or(get("POOL_BIND_IP"), d.bind_ip),
            port: parse_or(get("POOL_PORT"), d.port),
            http_port: parse_or(get("POOL_HTTP_PORT"), d.http_port),
            hostname: get("POOL_HOSTNAME").filter(|h| !h.is_empty()).unwrap_or(d.hostname),
            default_difficulty: parse_or(get("POOL_DEFAULT_DIFFICULTY"), d.default_difficulty),
            stale_session_secs: parse_or(get("POOL_STALE_SESSION_SECS"), d.stale_session_secs),
            reaper_interval_secs: parse_or(get("POOL_REAPER_INTERVAL_SECS"), d.reaper_interval_secs),
            template_poll_ms: parse_or(get("POOL_TEMPLATE_POLL_MS"), d.template_poll_ms),
            first_template_timeout_secs: parse_or(
                get("POOL_FIRST_TEMPLATE_TIMEOUT_SECS"),
                d.first_template_timeout_secs,
            ),
            address_prefix: get("POOL_ADDRESS_PREFIX").unwrap_or(d.address_prefix),
            address_length: parse_or(get("POOL_ADDRESS_LENGTH"), d.address_length),
            redis_url: get("POOL_REDIS_URL").filter(|u| !u.is_empty()),
        };

        // zero is not a usable value for these
        if cfg.default_difficulty == 0 {
            cfg.default_difficulty = d.default_difficulty;
        }
        if cfg.reaper_interval_secs == 0 {
            cfg.reaper_interval_secs = d.reaper_interval_secs;
        }
        if cfg.template_poll_ms == 0 {
            cfg.template_poll_ms = d.template_poll_ms;
        }

        cfg
    }

    pub fn daemon_settings(&self) -> DaemonSettings {
        DaemonSettings::new(
            self.node_host.clone(),
            self.node_port,
            self.node_ssl,
            Duration::from_millis(self.node_timeout_ms),
        )
    }

    pub fn pool_options(&self) -> PoolOptions {
        PoolOptions {
            default_settings: self.daemon_settings(),
            session: SessionOptions {
                vardiff: VarDiffConfig::with_start(self.default_difficulty),
                poll_interval: Duration::from_millis(self.template_poll_ms),
                first_template_timeout: Duration::from_secs(self.first_template_timeout_secs),
            },
            stale_after: Duration::from_secs(self.stale_session_secs),
            reaper_interval: Duration::from_secs(self.reaper_interval_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from(pairs: &[(&str, &str)]) -> Config {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let cfg = from(&[]);
        assert_eq!(cfg.node_port, 11898);
        assert_eq!(cfg.port, 3333);
        assert_eq!(cfg.http_port, 8080);
        assert_eq!(cfg.default_difficulty, 10_000);
        assert_eq!(cfg.stale_session_secs, 120);
        assert!(cfg.redis_url.is_none());
        assert_eq!(cfg.bind_ip.to_string(), "0.0.0.0");
    }

    #[test]
    fn overrides_and_fallbacks() {
        let cfg = from(&[
            ("NODE_HOST", "node.example"),
            ("NODE_PORT", "not-a-port"),
            ("NODE_SSL", "1"),
            ("POOL_BIND_IP", "127.0.0.1"),
            ("POOL_DEFAULT_DIFFICULTY", "0"),
            ("POOL_STALE_SESSION_SECS", "300"),
            ("POOL_REDIS_URL", "redis://cache:6379"),
        ]);
        assert_eq!(cfg.node_host, "node.example");
        assert_eq!(cfg.node_port, 11898);
        assert!(cfg.node_ssl);
        assert_eq!(cfg.bind_ip.to_string(), "127.0.0.1");
        assert_eq!(cfg.default_difficulty, 10_000);
        assert_eq!(cfg.pool_options().stale_after, Duration::from_secs(300));
        assert_eq!(cfg.redis_url.as_deref(), Some("redis://cache:6379"));
    }

    #[test]
    fn port_443_enables_ssl() {
        let cfg = from(&[("NODE_PORT", "443")]);
        assert!(!cfg.node_ssl);
        assert!(cfg.daemon_settings().ssl);
    }
}
