//! Network error types.

use crate::types::ResultStatus;
use thiserror::Error;

/// Network errors.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Connection failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Handshake failed.
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// Wire handshake started with an unknown magic.
    #[error("Wrong magic: {0:#010x}")]
    WrongMagic(u32),

    /// No protocol version supported by both sides.
    #[error("No matched protocol version")]
    NoMatchedVersion,

    /// Remote peer refused the handshake or the session with a go-away notice.
    #[error("Remote peer went away: {0}")]
    GoAway(String),

    /// Invalid message.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Message too large.
    #[error("Message too large: {size} bytes, max {max} bytes")]
    MessageTooLarge { size: usize, max: usize },

    /// Peer not found.
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// Peer session is stopping or stopped.
    #[error("Peer is not running")]
    PeerStopped,

    /// Timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Certificate was malformed, expired or failed verification.
    #[error("Invalid certificate: {0}")]
    InvalidCertificate(String),

    /// Operation is not allowed for the local or remote role.
    #[error("Invalid role for operation")]
    InvalidRole,

    /// Remote or local worker is too busy.
    #[error("Resource exhausted")]
    ResourceExhausted,

    /// Remote returned a non-OK status.
    #[error("Remote replied with status {0:?}")]
    RemoteStatus(ResultStatus),

    /// Key material could not be parsed or loaded.
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Configuration is inconsistent.
    #[error("Configuration error: {0}")]
    Config(String),

    /// External actor (chain, mempool) did not answer.
    #[error("Actor unavailable: {0}")]
    ActorUnavailable(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl NetworkError {
    /// Whether the error ends the peer session it occurred on.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            NetworkError::Io(_)
                | NetworkError::ConnectionClosed
                | NetworkError::MessageTooLarge { .. }
                | NetworkError::GoAway(_)
                | NetworkError::PeerStopped
        )
    }
}

impl From<secp256k1::Error> for NetworkError {
    fn from(e: secp256k1::Error) -> Self {
        NetworkError::InvalidKey(e.to_string())
    }
}

/// Result type for network operations.
pub type NetworkResult<T> = Result<T, NetworkError>;
