//! Typed error hierarchy for peerwire
//!
//! Every error type carries context about what went wrong and whether
//! the operation can be retried. Protocol and timeout errors are fatal
//! to their connection; integrity and storage errors release the piece
//! for a later retry and leave the connection alive.

use thiserror::Error;

/// Main error type for the exchange core
#[derive(Debug, Error)]
pub enum SwarmError {
    /// Socket-level errors (connect, read, write)
    #[error("Network error: {message}")]
    Network {
        kind: NetworkErrorKind,
        message: String,
        retryable: bool,
    },

    /// Peer-wire protocol violations (malformed frame, handshake mismatch,
    /// message out of order). Always close the connection.
    #[error("Protocol error: {message}")]
    Protocol {
        kind: ProtocolErrorKind,
        message: String,
    },

    /// No progress within a connection state's deadline
    #[error("Timed out during {during}")]
    Timeout { during: &'static str },

    /// Piece digest did not match the expected hash. The piece goes back
    /// to idle; the connection survives.
    #[error("Integrity failure: piece {index} digest mismatch")]
    Integrity { index: u32 },

    /// Piece store errors
    #[error("Storage error: {message}")]
    Storage {
        kind: StorageErrorKind,
        message: String,
    },

    /// Invalid input from the embedder
    #[error("Invalid input for '{field}': {message}")]
    InvalidInput {
        field: &'static str,
        message: String,
    },

    /// Invalid internal state transition
    #[error("Invalid state in {action}: {message}")]
    InvalidState {
        action: &'static str,
        message: String,
    },

    /// Resource limits exceeded
    #[error("Resource limit exceeded: {resource} (limit: {limit})")]
    ResourceLimit {
        resource: &'static str,
        limit: usize,
    },

    /// Swarm is shutting down
    #[error("Swarm is shutting down")]
    Shutdown,
}

/// Network error subtypes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    /// Connection refused
    ConnectionRefused,
    /// Connection reset or broken pipe
    ConnectionReset,
    /// Connection timeout at the OS level
    Timeout,
    /// Peer not reachable
    Unreachable,
    /// Stream ended mid-frame
    Closed,
    /// Other network error
    Other,
}

/// Protocol error subtypes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolErrorKind {
    /// Handshake tag, length, or info-hash mismatch
    Handshake,
    /// Unrecognized message id
    UnknownMessage,
    /// Declared frame length inconsistent with the message id
    LengthMismatch,
    /// Piece index or byte range outside the torrent
    OutOfRange,
    /// Message valid in isolation but illegal in the current state
    /// (late bitfield, piece not matching the request queue head)
    UnexpectedMessage,
}

/// Storage error subtypes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// Piece or file not found
    NotFound,
    /// Permission denied
    PermissionDenied,
    /// I/O error
    Io,
}

impl SwarmError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { retryable, .. } => *retryable,
            Self::Timeout { .. } => true,
            Self::Integrity { .. } => true,
            Self::Storage { kind, .. } => matches!(kind, StorageErrorKind::Io),
            _ => false,
        }
    }

    /// Create a network error
    pub fn network(kind: NetworkErrorKind, message: impl Into<String>) -> Self {
        let retryable = matches!(
            kind,
            NetworkErrorKind::Timeout
                | NetworkErrorKind::ConnectionRefused
                | NetworkErrorKind::ConnectionReset
                | NetworkErrorKind::Unreachable
                | NetworkErrorKind::Closed
        );
        Self::Network {
            kind,
            message: message.into(),
            retryable,
        }
    }

    /// Create a protocol error
    pub fn protocol(kind: ProtocolErrorKind, message: impl Into<String>) -> Self {
        Self::Protocol {
            kind,
            message: message.into(),
        }
    }

    /// Create a timeout error for a named connection phase
    pub fn timeout(during: &'static str) -> Self {
        Self::Timeout { during }
    }

    /// Create a storage error
    pub fn storage(kind: StorageErrorKind, message: impl Into<String>) -> Self {
        Self::Storage {
            kind,
            message: message.into(),
        }
    }

    /// Create an invalid input error
    pub fn invalid_input(field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidInput {
            field,
            message: message.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(action: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidState {
            action,
            message: message.into(),
        }
    }
}

/// Result type alias for swarm operations
pub type Result<T> = std::result::Result<T, SwarmError>;

// Socket I/O is the dominant io::Error source in this crate; the piece
// stores map their own errors through `SwarmError::storage` explicitly.
impl From<std::io::Error> for SwarmError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        let kind = match err.kind() {
            ErrorKind::ConnectionRefused => NetworkErrorKind::ConnectionRefused,
            ErrorKind::ConnectionReset | ErrorKind::BrokenPipe => NetworkErrorKind::ConnectionReset,
            ErrorKind::TimedOut => NetworkErrorKind::Timeout,
            ErrorKind::UnexpectedEof => NetworkErrorKind::Closed,
            _ => NetworkErrorKind::Other,
        };
        Self::network(kind, err.to_string())
    }
}
