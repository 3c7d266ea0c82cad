use thiserror::Error;

/// Errors that can occur in walcap-core.
#[derive(Debug, Error)]
pub enum Error {
    #[error("sink is closed")]
    SinkClosed,

    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
