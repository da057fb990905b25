//! Protocol error types

use thiserror::Error;

/// Protocol error types
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Underlying transport failed while reading or writing a frame
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Peer closed the connection in the middle of a frame
    #[error("Connection closed by peer")]
    ConnectionClosed,

    /// Message too large
    #[error("Message size {0} exceeds maximum {1}")]
    MessageTooLarge(usize, usize),

    /// Invalid message format
    #[error("Invalid message format: {0}")]
    InvalidFormat(String),

    /// A packing instruction lacks a required tag
    #[error("Missing tag <{tag}> in {message}")]
    MissingTag { message: String, tag: String },

    /// A tag value could not be interpreted
    #[error("Invalid value for <{tag}>: {value}")]
    InvalidValue { tag: String, value: String },

    /// Packing instruction had a different root tag than expected
    #[error("Unexpected message: expected {expected}, got {actual}")]
    UnexpectedMessage { expected: String, actual: String },
}

impl ProtocolError {
    pub(crate) fn missing(message: &str, tag: &str) -> Self {
        ProtocolError::MissingTag {
            message: message.to_string(),
            tag: tag.to_string(),
        }
    }

    /// Whether the error came from the transport rather than from message content
    pub fn is_transport(&self) -> bool {
        matches!(self, ProtocolError::Io(_) | ProtocolError::ConnectionClosed)
    }
}

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProtocolError::MessageTooLarge(1000, 500);
        assert_eq!(err.to_string(), "Message size 1000 exceeds maximum 500");

        let err = ProtocolError::InvalidFormat("missing field".to_string());
        assert_eq!(err.to_string(), "Invalid message format: missing field");

        let err = ProtocolError::missing("Version_PI", "cookie");
        assert_eq!(err.to_string(), "Missing tag <cookie> in Version_PI");

        let err = ProtocolError::UnexpectedMessage {
            expected: "CS_NEG_PI".to_string(),
            actual: "Version_PI".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Unexpected message: expected CS_NEG_PI, got Version_PI"
        );
    }

    #[test]
    fn test_is_transport() {
        assert!(ProtocolError::ConnectionClosed.is_transport());
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        assert!(ProtocolError::from(io).is_transport());
        assert!(!ProtocolError::InvalidFormat("x".into()).is_transport());
    }
}
