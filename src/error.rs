use thiserror::Error;

/// Errors that can occur in streaming operations
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol error (malformed packet, invalid state transition, etc.)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Packet exceeds the maximum wire size
    #[error("Packet too large: {0} bytes (max {1})")]
    PacketTooLarge(usize, usize),

    /// Signature type is not supported by this implementation
    #[error("Unsupported signature type: {0}")]
    UnsupportedSignatureType(u16),

    /// Identity could not be parsed
    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    /// Offline signature block could not be parsed or did not verify
    #[error("Invalid offline signature: {0}")]
    InvalidOfflineSignature(String),

    /// Packet signature did not verify
    #[error("Signature verification failed")]
    SignatureInvalid,

    /// Stream was reset (aborted)
    #[error("Stream reset")]
    StreamReset,

    /// Stream closed by remote peer
    #[error("Stream closed")]
    StreamClosed,

    /// Queued send was cancelled before transmission
    #[error("Send aborted")]
    SendAborted,

    /// Timeout waiting for operation
    #[error("Operation timed out")]
    Timeout,

    /// Remote lease set is unknown or fully expired
    #[error("No usable lease set")]
    NoLeaseSet,
}

pub type Result<T> = std::result::Result<T, Error>;
