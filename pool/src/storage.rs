/// Block history - every block the pool got accepted by the daemon
///
/// Two stores:
/// - `RedisBlockStore`: `blocks:list` (newest first) plus `blocks:miner:<address>`
/// - `MemoryBlockStore`: process-local, used when no Redis URL is configured

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Placeholder hash for "no block yet"
pub const NEVER: &str = "Never";

/// Default page size for `last_blocks`
pub const RECENT_BLOCKS: usize = 30;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub address: String,
    pub hash: String,
    /// Unix seconds
    pub timestamp: i64,
}

impl BlockRecord {
    pub fn never() -> Self {
        Self {
            address: NEVER.to_string(),
            hash: NEVER.to_string(),
            timestamp: 0,
        }
    }
}

#[async_trait]
pub trait BlockStore: Send + Sync {
    async fn add_block(&self, address: &str, hash: &str, timestamp: i64) -> Result<()>;

    /// Most recent block, or `BlockRecord::never()`
    async fn last_block(&self) -> Result<BlockRecord>;

    async fn last_blocks(&self, count: usize) -> Result<Vec<BlockRecord>>;

    /// Most recent block found by `address`, or `BlockRecord::never()`
    async fn last_miner_block(&self, address: &str) -> Result<BlockRecord>;
}

fn miner_key(address: &str) -> String {
    format!("blocks:miner:{}", address)
}

pub struct RedisBlockStore {
    client: redis::Client,
    connection: Arc<RwLock<Option<redis::aio::ConnectionManager>>>,
}

impl RedisBlockStore {
    pub fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| anyhow!("Failed to create Redis client: {}", e))?;

        Ok(Self {
            client,
            connection: Arc::new(RwLock::new(None)),
        })
    }

    /// Get async connection (lazy initialization)
    async fn get_connection(&self) -> Result<redis::aio::ConnectionManager> {
        let mut conn_guard = self.connection.write().await;

        match conn_guard.as_ref() {
            Some(manager) => Ok(manager.clone()),
            None => {
                let manager = self
                    .client
                    .get_connection_manager()
                    .await
                    .map_err(|e| anyhow!("Failed to get connection manager: {}", e))?;
                *conn_guard = Some(manager.clone());
                Ok(manager)
            }
        }
    }

    async fn head(&self, key: &str) -> Result<BlockRecord> {
        let mut conn = self.get_connection().await?;
        let newest: Option<String> = conn
            .lindex(key, 0)
            .await
            .map_err(|e| anyhow!("Failed to read {}: {}", key, e))?;

        match newest {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(BlockRecord::never()),
        }
    }

    /// Health check
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.get_connection().await?;
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow!("Redis PING failed: {}", e))?;

        if pong != "PONG" {
            return Err(anyhow!("Redis health check failed: got {}", pong));
        }

        Ok(())
    }
}

#[async_trait]
impl BlockStore for RedisBlockStore {
    async fn add_block(&self, address: &str, hash: &str, timestamp: i64) -> Result<()> {
        let record = BlockRecord {
            address: address.to_string(),
            hash: hash.to_string(),
            timestamp,
        };
        let json = serde_json::to_string(&record)?;
        let mut conn = self.get_connection().await?;

        redis::pipe()
            .atomic()
            .lpush("blocks:list", &json)
            .ignore()
            .lpush(miner_key(address), &json)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| anyhow!("Failed to store block {}: {}", hash, e))?;

        Ok(())
    }

    async fn last_block(&self) -> Result<BlockRecord> {
        self.head("blocks:list").await
    }

    async fn last_blocks(&self, count: usize) -> Result<Vec<BlockRecord>> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.get_connection().await?;
        let rows: Vec<String> = conn
            .lrange("blocks:list", 0, (count - 1) as isize)
            .await
            .map_err(|e| anyhow!("Failed to get blocks list: {}", e))?;

        Ok(rows
            .iter()
            .filter_map(|json| serde_json::from_str::<BlockRecord>(json).ok())
            .collect())
    }

    async fn last_miner_block(&self, address: &str) -> Result<BlockRecord> {
        self.head(&miner_key(address)).await
    }
}

/// In-process block history, newest first
#[derive(Default)]
pub struct MemoryBlockStore {
    blocks: RwLock<Vec<BlockRecord>>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlockStore for MemoryBlockStore {
    async fn add_block(&self, address: &str, hash: &str, timestamp: i64) -> Result<()> {
        self.blocks.write().await.insert(
            0,
            BlockRecord {
                address: address.to_string(),
                hash: hash.to_string(),
                timestamp,
            },
        );
        Ok(())
    }

    async fn last_block(&self) -> Result<BlockRecord> {
        Ok(self
            .blocks
            .read()
            .await
            .first()
            .cloned()
            .unwrap_or_else(BlockRecord::never))
    }

    async fn last_blocks(&self, count: usize) -> Result<Vec<BlockRecord>> {
        Ok(self.blocks.read().await.iter().take(count).cloned().collect())
    }

    async fn last_miner_block(&self, address: &str) -> Result<BlockRecord> {
        Ok(self
            .blocks
            .read()
            .await
            .iter()
            .find(|b| b.address == address)
            .cloned()
            .unwrap_or_else(BlockRecord::never))
    }
}
