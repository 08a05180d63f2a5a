use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unreachable: {0}")]
    Unavailable(String),
    #[error("store command failed: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("current speaker slot held by {holder}")]
    Busy { holder: String },
    #[error("stored value could not be decoded: {0}")]
    Decode(String),
}

impl StoreError {
    /// `BUSY` is a protocol outcome, not a transport failure.
    pub fn is_busy(&self) -> bool {
        matches!(self, StoreError::Busy { .. })
    }
}
