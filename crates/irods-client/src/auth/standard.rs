use super::{preflight, rejection, AuthMechanism, AuthResponse};
use crate::connection::Connection;
use crate::error::{Error, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use irods_core::{Account, AuthScheme};
use irods_protocol::api::numbers::{AUTH_REQUEST_AN, AUTH_RESPONSE_AN};
use irods_protocol::messages::{AuthRequestOut, AuthResponseInp};
use irods_protocol::{Message, ProtocolError};
use md5::{Digest, Md5};
use tracing::{debug, info, warn};

/// Bytes of the decoded challenge that enter the digest
const CHALLENGE_LEN: usize = 64;
/// Password is zero-padded or truncated to this length
const MAX_PASSWORD_LEN: usize = 50;

/// Challenge/response login with the account password
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardAuth;

/// Answer to a base64 challenge:
/// `base64(md5(challenge[..64] || password padded to 50 bytes))` with zero
/// bytes of the digest replaced by 1
pub fn challenge_response(challenge: &str, password: &str) -> Result<String> {
    let decoded = BASE64.decode(challenge.trim()).map_err(|e| invalid_challenge(e.to_string()))?;
    if decoded.len() < CHALLENGE_LEN {
        return Err(invalid_challenge(format!(
            "{} bytes, need {}",
            decoded.len(),
            CHALLENGE_LEN
        )));
    }

    let mut padded = [0u8; MAX_PASSWORD_LEN];
    let bytes = password.as_bytes();
    let n = bytes.len().min(MAX_PASSWORD_LEN);
    padded[..n].copy_from_slice(&bytes[..n]);

    let mut hasher = Md5::new();
    hasher.update(&decoded[..CHALLENGE_LEN]);
    hasher.update(padded);
    let mut digest = hasher.finalize();
    // the server treats the digest as a C string
    for b in digest.iter_mut() {
        if *b == 0 {
            *b = 1;
        }
    }
    Ok(BASE64.encode(digest))
}

fn invalid_challenge(detail: String) -> Error {
    Error::Protocol(ProtocolError::InvalidValue {
        tag: "challenge".to_string(),
        value: detail,
    })
}

#[async_trait]
impl AuthMechanism for StandardAuth {
    fn scheme(&self) -> AuthScheme {
        AuthScheme::Standard
    }

    async fn authenticate(
        &self,
        connection: &Connection,
        account: &Account,
    ) -> Result<AuthResponse> {
        let startup = preflight(connection, account)?;
        let response = AuthResponse::new(account.clone(), account.clone(), startup);

        let reply = connection
            .request(&Message::api_request(AUTH_REQUEST_AN, None))
            .await?;
        if let Some((status, message)) = rejection(&reply) {
            warn!("Challenge request for {} rejected: {}", account, message);
            return Ok(response.rejected(status, message));
        }
        let challenge = AuthRequestOut::from_pack(&reply.body_pack()?)?.challenge;
        connection.cache_challenge(&challenge);
        debug!("Received challenge from {}", account.host());

        let answer = AuthResponseInp {
            response: challenge_response(&challenge, account.password().expose_secret())?,
            username: format!("{}#{}", account.proxy_user_name(), account.proxy_zone()),
        };
        let reply = connection
            .request(&Message::api_request(
                AUTH_RESPONSE_AN,
                Some(&answer.to_pack()),
            ))
            .await?;
        let response = response.with_challenge(challenge);
        if let Some((status, message)) = rejection(&reply) {
            warn!("Standard login for {} rejected: {}", account, message);
            return Ok(response.rejected(status, message));
        }

        info!("Authenticated {} with standard scheme", account);
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHALLENGE: &str =
        "AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8gISIjJCUmJygpKissLS4vMDEyMzQ1Njc4OTo7PD0+Pw==";

    #[test]
    fn test_known_response() {
        assert_eq!(
            challenge_response(CHALLENGE, "rods").unwrap(),
            "l6aTYPiS/udYmo/jC6wl6Q=="
        );
    }

    #[test]
    fn test_zero_digest_bytes_replaced() {
        // md5 for this password ends in 0x00
        let response = challenge_response(CHALLENGE, "pw12").unwrap();
        assert_eq!(response, "n47u+rUOK/G3WNqtYVWDAQ==");
        let digest = BASE64.decode(response).unwrap();
        assert!(!digest.contains(&0));
    }

    #[test]
    fn test_password_truncated_to_fifty_bytes() {
        let long = "x".repeat(MAX_PASSWORD_LEN);
        let longer = format!("{}tail", long);
        assert_eq!(
            challenge_response(CHALLENGE, &long).unwrap(),
            challenge_response(CHALLENGE, &longer).unwrap()
        );
    }

    #[test]
    fn test_malformed_challenge() {
        assert!(challenge_response("not base64!", "rods").is_err());
        assert!(challenge_response("AAEC", "rods").is_err());
    }
}
