pub mod api;
pub mod blockchain;
pub mod config;
pub mod difficulty;
pub mod error;
pub mod jobs;
pub mod metrics;
pub mod pool;
pub mod pow;
pub mod session;
pub mod storage;
pub mod stratum;
pub mod vardiff;

pub use error::{PoolError, Result};
