use crate::tls::TlsError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Replica token already cached for {0}")]
    DuplicateReplicaToken(String),

    #[error("Timed out waiting for lock on {0}")]
    LockTimeout(String),

    #[error("Invalid release version: {0}")]
    InvalidVersion(String),

    #[error("Security context error: {0}")]
    SecurityContext(String),

    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
