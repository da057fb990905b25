use super::{preflight, rejection, AuthMechanism, AuthResponse, StandardAuth};
use crate::connection::Connection;
use crate::error::{Error, Result};
use async_trait::async_trait;
use irods_core::{Account, AuthScheme};
use irods_protocol::api::numbers::{AUTH_PLUG_REQ_AN, PAM_AUTH_REQUEST_AN};
use irods_protocol::api::status::PAM_AUTH_ERROR;
use irods_protocol::messages::{
    AuthPluginRequestInp, AuthPluginRequestOut, PamAuthRequestInp, PamAuthRequestOut,
};
use irods_protocol::Message;
use tracing::{debug, info, warn};

/// PAM login: trade the PAM password for a temporary iRODS password, then
/// complete a standard login with it on the same connection.
///
/// The PAM password crosses the wire, so the channel must be encrypted.
#[derive(Debug, Default, Clone, Copy)]
pub struct PamAuth;

#[async_trait]
impl AuthMechanism for PamAuth {
    fn scheme(&self) -> AuthScheme {
        AuthScheme::Pam
    }

    async fn authenticate(
        &self,
        connection: &Connection,
        account: &Account,
    ) -> Result<AuthResponse> {
        let startup = preflight(connection, account)?;
        if account.is_anonymous() {
            debug!("Anonymous PAM login uses the standard scheme");
            return StandardAuth.authenticate(connection, account).await;
        }
        if !connection.is_encrypted() {
            return Err(Error::IllegalArgument(
                "PAM authentication requires an encrypted connection".into(),
            ));
        }

        let user = account.proxy_user_name();
        let password = account.password().expose_secret();
        let ttl = connection.config().pam_time_to_live;
        let plugin = startup.release().at_least(4, 0, 0);
        let request = if plugin {
            let inp = AuthPluginRequestInp::pam(user, password, ttl);
            Message::api_request(AUTH_PLUG_REQ_AN, Some(&inp.to_pack()))
        } else {
            let inp = PamAuthRequestInp {
                pam_user: user.to_string(),
                pam_password: password.to_string(),
                time_to_live: ttl,
            };
            Message::api_request(PAM_AUTH_REQUEST_AN, Some(&inp.to_pack()))
        };
        debug!(plugin, ttl, "Requesting temporary password for {}", user);

        let reply = connection.request(&request).await?;
        let pending = AuthResponse::new(account.clone(), account.clone(), startup.clone());
        if let Some((status, message)) = rejection(&reply) {
            warn!("PAM request for {} rejected: {}", account, message);
            return Ok(pending.rejected(status, message));
        }

        let body = reply.body_pack()?;
        let temporary = if plugin {
            AuthPluginRequestOut::from_pack(&body)?.result
        } else {
            PamAuthRequestOut::from_pack(&body)?.irods_pam_password
        };
        if temporary.is_empty() {
            return Ok(pending.rejected(PAM_AUTH_ERROR, "server issued no temporary password"));
        }

        let derived = account.derive(AuthScheme::Standard, temporary);
        let inner = StandardAuth.authenticate(connection, &derived).await?;
        let response = AuthResponse::new(account.clone(), derived, startup)
            .with_challenge(inner.challenge_value());
        if !inner.is_successful() {
            return Ok(response.rejected(inner.status(), inner.message()));
        }

        info!("Authenticated {} with PAM", account);
        Ok(response)
    }
}
