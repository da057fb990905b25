use super::{preflight, rejection, AuthMechanism, AuthResponse};
use crate::connection::Connection;
use crate::error::{Error, Result};
use async_trait::async_trait;
use irods_core::{Account, AuthScheme};
use irods_protocol::api::numbers::{GSI_AUTH_REQUEST_AN, KRB_AUTH_REQUEST_AN};
use irods_protocol::messages::ServerNameOut;
use irods_protocol::Message;
use tracing::{debug, info, warn};

/// Token rounds tolerated before giving up on a context
const MAX_ROUNDS: usize = 32;

/// Kerberos or GSI login through a credential supplied with the account.
///
/// The server answers the auth request with its principal, then both sides
/// exchange length-prefixed tokens until the security context is
/// established. A final API reply carries the verdict.
#[derive(Debug, Clone, Copy)]
pub struct ExternalAuth {
    scheme: AuthScheme,
    api_number: i32,
}

impl ExternalAuth {
    pub fn kerberos() -> Self {
        Self {
            scheme: AuthScheme::Kerberos,
            api_number: KRB_AUTH_REQUEST_AN,
        }
    }

    pub fn gsi() -> Self {
        Self {
            scheme: AuthScheme::Gsi,
            api_number: GSI_AUTH_REQUEST_AN,
        }
    }
}

#[async_trait]
impl AuthMechanism for ExternalAuth {
    fn scheme(&self) -> AuthScheme {
        self.scheme
    }

    async fn authenticate(
        &self,
        connection: &Connection,
        account: &Account,
    ) -> Result<AuthResponse> {
        let startup = preflight(connection, account)?;
        let credential = account.credential().cloned().ok_or_else(|| {
            Error::IllegalArgument(format!("{} login needs an external credential", self.scheme))
        })?;
        let pending = AuthResponse::new(account.clone(), account.clone(), startup);

        let reply = connection
            .request(&Message::api_request(self.api_number, None))
            .await?;
        if let Some((status, message)) = rejection(&reply) {
            warn!("{} request for {} rejected: {}", self.scheme, account, message);
            return Ok(pending.rejected(status, message));
        }
        let server_name = ServerNameOut::from_pack(&reply.body_pack()?)?.name;
        debug!(
            principal = credential.principal(),
            server = %server_name,
            "Starting {} security context",
            self.scheme
        );

        let mut context = credential.init_context(&server_name)?;
        let mut input: Option<Vec<u8>> = None;
        let mut rounds = 0;
        loop {
            if rounds == MAX_ROUNDS {
                return Err(Error::AuthenticationFailed(format!(
                    "{} context not established after {} rounds",
                    self.scheme, MAX_ROUNDS
                )));
            }
            rounds += 1;

            if let Some(token) = context.step(input.as_deref()).await? {
                connection.write_token(&token).await?;
            }
            if context.is_established() {
                break;
            }
            input = Some(connection.read_token().await?);
        }
        debug!("{} context established after {} rounds", self.scheme, rounds);

        let verdict = connection.receive_packet().await?;
        if let Some((status, message)) = rejection(&verdict) {
            warn!("{} login for {} rejected: {}", self.scheme, account, message);
            return Ok(pending.rejected(status, message));
        }

        info!("Authenticated {} with {}", account, self.scheme);
        Ok(pending)
    }
}
