use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unit of work handed to a worker (XMRig job format).
///
/// `id` duplicates `job_id` for miners that read either field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub job_id: String,
    /// Hashing blob, hex
    pub blob: String,
    /// Compact share target, hex
    pub target: String,
    pub height: u64,
    #[serde(rename = "poolNonce")]
    pub pool_nonce: u32,
    pub difficulty: u64,
}

impl Job {
    pub fn new(blob: String, target: String, height: u64, pool_nonce: u32, difficulty: u64) -> Self {
        let job_id = next_job_id();
        Self {
            id: job_id.clone(),
            job_id,
            blob,
            target,
            height,
            pool_nonce,
            difficulty,
        }
    }
}

pub fn next_job_id() -> String {
    Uuid::new_v4().to_string()
}

/// Connection ids are hyphen-less v4 uuids.
pub fn next_connection_id() -> String {
    Uuid::new_v4().simple().to_string()
}
