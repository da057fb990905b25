use irods_core::tls::TlsError;
use irods_protocol::ProtocolError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A frame from the peer could not be read to its end; the stream
    /// position is lost
    #[error("Unreadable frame from {peer}: {source}")]
    Framing {
        peer: String,
        #[source]
        source: ProtocolError,
    },

    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),

    #[error("Unknown authentication scheme: {0}")]
    AuthenticationSchemeUnknown(String),

    #[error("Illegal argument: {0}")]
    IllegalArgument(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Server error {}: {message}", status_label(.code))]
    ServerError { code: i32, message: String },

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Not connected")]
    NotConnected,

    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    #[error("Encryption setup failed: {0}")]
    Encryption(String),

    #[error("{0}")]
    Core(irods_core::Error),
}

fn status_label(code: &i32) -> String {
    irods_protocol::api::describe_status(*code)
}

impl From<irods_core::Error> for Error {
    fn from(err: irods_core::Error) -> Self {
        match err {
            irods_core::Error::InvalidArgument(msg) => Error::IllegalArgument(msg),
            irods_core::Error::Tls(e) => Error::Tls(e),
            irods_core::Error::IoError(e) => Error::IoError(e),
            other => Error::Core(other),
        }
    }
}

impl Error {
    /// Read or connect deadline expired
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }

    /// Caller mistake detected before any I/O
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            Error::IllegalArgument(_) | Error::AuthenticationSchemeUnknown(_)
        )
    }

    pub fn is_negotiation_failure(&self) -> bool {
        matches!(self, Error::NegotiationFailed(_))
    }

    /// Socket-level failure; the connection cannot be used any more
    pub fn is_transport(&self) -> bool {
        match self {
            Error::IoError(_) | Error::Timeout(_) | Error::NotConnected | Error::Framing { .. } => {
                true
            }
            Error::Protocol(e) => e.is_transport(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_error_uses_status_name() {
        let err = Error::ServerError {
            code: -826000,
            message: "bad password".into(),
        };
        assert_eq!(
            err.to_string(),
            "Server error CAT_INVALID_AUTHENTICATION (-826000): bad password"
        );
    }

    #[test]
    fn test_classification() {
        assert!(Error::Timeout("read".into()).is_timeout());
        assert!(Error::IllegalArgument("x".into()).is_usage_error());
        assert!(Error::AuthenticationSchemeUnknown("BOGUS".into()).is_usage_error());
        assert!(Error::NegotiationFailed("refused".into()).is_negotiation_failure());
        assert!(Error::Protocol(ProtocolError::ConnectionClosed).is_transport());
        assert!(!Error::AuthenticationFailed("no".into()).is_transport());
        assert!(Error::Framing {
            peer: "h:1247".into(),
            source: ProtocolError::MessageTooLarge(4096, 1024),
        }
        .is_transport());
    }

    #[test]
    fn test_core_invalid_argument_maps_to_illegal_argument() {
        let err: Error = irods_core::Error::InvalidArgument("empty zone".into()).into();
        assert!(err.is_usage_error());
        let err: Error = irods_core::Error::LockTimeout("k".into()).into();
        assert!(matches!(err, Error::Core(_)));
    }
}
