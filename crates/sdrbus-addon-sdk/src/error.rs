use sdrbus_protocol::BrokerError;

#[derive(Debug, thiserror::Error)]
pub enum AddonError {
    #[error("protocol error: {0}")]
    Protocol(#[from] BrokerError),

    #[error("i/o error: {0}")]
    Io(std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, AddonError>;
