use thiserror::Error;

/// Errors in peer wire traffic. All of these are connection-fatal.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid handshake")]
    InvalidHandshake,

    #[error("info hash mismatch")]
    InfoHashMismatch,

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("invalid message id: {0}")]
    InvalidMessageId(u8),

    #[error("message of {0} bytes exceeds limit")]
    MessageTooLarge(usize),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("timeout")]
    Timeout,

    #[error("extension error: {0}")]
    Extension(String),

    #[error("bencode error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),
}
