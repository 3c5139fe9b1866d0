use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame too large: {0} bytes (max 65536)")]
    FrameTooLarge(usize),

    #[error("invalid signaling message: {0}")]
    InvalidSignal(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),
}
