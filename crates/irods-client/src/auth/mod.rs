//! Authentication mechanisms
//!
//! Each scheme implements [`AuthMechanism`] and runs over a connection that
//! has finished startup (and encryption, when negotiated). The set is
//! closed: [`AuthenticationDispatcher`] is the only way to obtain one.

mod external;
mod pam;
mod standard;

pub use external::ExternalAuth;
pub use pam::PamAuth;
pub use standard::{challenge_response, StandardAuth};

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::startup::StartupResponseData;
use async_trait::async_trait;
use irods_core::{Account, AuthScheme};
use std::fmt;
use tracing::debug;

/// One authentication scheme
#[async_trait]
pub trait AuthMechanism: Send + Sync + fmt::Debug {
    fn scheme(&self) -> AuthScheme;

    /// Log `account` in over `connection`.
    ///
    /// Unusable arguments fail with [`Error::IllegalArgument`] before any
    /// I/O. A server-side rejection is an unsuccessful [`AuthResponse`],
    /// not an error.
    async fn authenticate(&self, connection: &Connection, account: &Account)
        -> Result<AuthResponse>;
}

/// Outcome of one authentication
#[derive(Debug, Clone)]
pub struct AuthResponse {
    auth_scheme: AuthScheme,
    authenticating_account: Account,
    authenticated_account: Account,
    successful: bool,
    challenge_value: String,
    startup_response: StartupResponseData,
    status: i32,
    message: String,
}

impl AuthResponse {
    pub(crate) fn new(
        authenticating_account: Account,
        authenticated_account: Account,
        startup_response: StartupResponseData,
    ) -> Self {
        Self {
            auth_scheme: authenticating_account.auth_scheme(),
            authenticating_account,
            authenticated_account,
            successful: true,
            challenge_value: String::new(),
            startup_response,
            status: 0,
            message: String::new(),
        }
    }

    pub(crate) fn with_challenge(mut self, challenge: impl Into<String>) -> Self {
        self.challenge_value = challenge.into();
        self
    }

    pub(crate) fn rejected(mut self, status: i32, message: impl Into<String>) -> Self {
        self.successful = false;
        self.status = status;
        self.message = message.into();
        self
    }

    /// Scheme the caller asked for
    pub fn auth_scheme(&self) -> AuthScheme {
        self.auth_scheme
    }

    /// Account as supplied by the caller
    pub fn authenticating_account(&self) -> &Account {
        &self.authenticating_account
    }

    /// Account that actually logged in. Differs from the authenticating
    /// account when a scheme completes through another (PAM).
    pub fn authenticated_account(&self) -> &Account {
        &self.authenticated_account
    }

    pub fn is_successful(&self) -> bool {
        self.successful
    }

    pub fn challenge_value(&self) -> &str {
        &self.challenge_value
    }

    pub fn startup_response(&self) -> &StartupResponseData {
        &self.startup_response
    }

    /// Server status of a rejected login (0 when successful)
    pub fn status(&self) -> i32 {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Factory for authentication mechanisms
pub struct AuthenticationDispatcher;

impl AuthenticationDispatcher {
    /// Mechanism for a scheme name (`standard`, `native`, `pam`,
    /// `kerberos`, `krb`, `gsi`; case-insensitive)
    pub fn instance_for(scheme_name: &str) -> Result<Box<dyn AuthMechanism>> {
        let scheme: AuthScheme = scheme_name
            .parse()
            .map_err(|_| Error::AuthenticationSchemeUnknown(scheme_name.to_string()))?;
        Ok(Self::mechanism_for(scheme))
    }

    pub fn mechanism_for(scheme: AuthScheme) -> Box<dyn AuthMechanism> {
        match scheme {
            AuthScheme::Standard => Box::new(StandardAuth),
            AuthScheme::Pam => Box::new(PamAuth),
            AuthScheme::Kerberos => Box::new(ExternalAuth::kerberos()),
            AuthScheme::Gsi => Box::new(ExternalAuth::gsi()),
        }
    }

    /// Mechanism for the account's scheme. Anonymous PAM logins have no
    /// password to exchange and use Standard instead.
    pub fn mechanism_for_account(account: &Account) -> Box<dyn AuthMechanism> {
        let scheme = match account.auth_scheme() {
            AuthScheme::Pam if account.is_anonymous() => {
                debug!("Anonymous PAM login downgraded to standard");
                AuthScheme::Standard
            }
            other => other,
        };
        Self::mechanism_for(scheme)
    }
}

/// Arguments every mechanism checks before touching the socket
pub(crate) fn preflight(connection: &Connection, account: &Account) -> Result<StartupResponseData> {
    if !connection.is_channel_open() {
        return Err(Error::IllegalArgument("connection is not open".into()));
    }
    account.validate()?;
    connection
        .startup_response()
        .cloned()
        .ok_or_else(|| Error::IllegalArgument("connection has not completed startup".into()))
}

/// Negative `intInfo` on a reply, as (status, message)
pub(crate) fn rejection(reply: &irods_protocol::Message) -> Option<(i32, String)> {
    let status = reply.int_info();
    if status >= 0 {
        return None;
    }
    let message = reply
        .error_text()
        .filter(|text| !text.is_empty())
        .unwrap_or_else(|| irods_protocol::api::describe_status(status));
    Some((status, message))
}
