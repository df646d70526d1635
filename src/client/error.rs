use thiserror::Error;

/// Conditions surfaced by the public client API. Protocol-level failures
/// never reach here; they are handled by the owning background task.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("no such torrent")]
    NotFound,

    #[error("client is closed")]
    AlreadyClosed,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("info bytes do not match the info hash")]
    InfoHashMismatch,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
