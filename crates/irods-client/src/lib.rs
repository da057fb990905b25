//! Async iRODS connection client
//!
//! [`ConnectionManager::current_connection`] opens a socket, negotiates
//! plaintext or SSL with the server, sets up the encrypted channel when
//! required and authenticates the account. The returned [`Connection`]
//! exposes the framed packet primitives used by higher layers.
//!
//! ```no_run
//! # async fn demo() -> irods_client::Result<()> {
//! use irods_client::{Account, ConnectionConfig, ConnectionManager};
//!
//! let manager = ConnectionManager::new(ConnectionConfig::default())?;
//! let account = Account::new("irods.example.org", 1247, "alice", "tempZone", "secret");
//! let (connection, auth) = manager.current_connection(&account).await?;
//! assert!(auth.is_successful());
//! connection.disconnect().await;
//! # Ok(())
//! # }
//! ```

pub mod auth;
mod channel;
pub mod connection;
pub mod encryption;
pub mod error;
pub mod negotiation;
mod reconnect;
pub mod startup;
mod stream;

pub use auth::{AuthMechanism, AuthResponse, AuthenticationDispatcher};
pub use connection::{Connection, ConnectionManager, ConnectionState};
pub use encryption::TransportKey;
pub use error::{Error, Result};
pub use reconnect::ReconnectStats;
pub use startup::StartupResponseData;

pub use irods_core::{Account, AuthScheme, ConnectionConfig, EncryptionSettings};
pub use irods_protocol::{NegotiatedOutcome, NegotiationPolicy};
