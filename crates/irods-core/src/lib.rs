//! Core types for the iRODS client
//!
//! Accounts and credentials, connection configuration, the shared caches
//! (server properties, replica tokens) and TLS plumbing. Nothing here does
//! network I/O on its own; `irods-client` drives the protocol.

pub mod account;
pub mod config;
pub mod error;
pub mod replica_tokens;
pub mod server_properties;
pub mod tls;

pub use account::{
    Account, AuthScheme, ExternalCredential, Password, ProxyIdentity, SecurityContext,
    ANONYMOUS_USER,
};
pub use config::{ConnectionConfig, EncryptionSettings};
pub use error::{Error, Result};
pub use replica_tokens::{ReplicaTokenCacheManager, ReplicaTokenEntry, ReplicaTokenKey};
pub use server_properties::{ReleaseVersion, ServerProperties, ServerPropertiesCache};
