use thiserror::Error;

/// Errors raised by the pool core.
///
/// `Request` carries the message sent back to the worker in a `-1` error
/// reply; the other variants never reach the wire verbatim.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("write to connection {0} failed")]
    Write(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("{0}")]
    Request(String),

    #[error("upstream failure: {0}")]
    Upstream(String),

    #[error("session for {0} is closed")]
    SessionClosed(String),

    #[error("invalid difficulty: {0}")]
    InvalidDifficulty(u64),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PoolError {
    pub fn request(message: impl Into<String>) -> Self {
        Self::Request(message.into())
    }

    pub fn upstream(err: impl std::fmt::Display) -> Self {
        Self::Upstream(err.to_string())
    }
}

impl From<anyhow::Error> for PoolError {
    fn from(err: anyhow::Error) -> Self {
        Self::Upstream(format!("{err:#}"))
    }
}

pub type Result<T> = std::result::Result<T, PoolError>;
