//! Client-server SSL negotiation

use crate::channel::Channel;
use crate::error::{Error, Result};
use irods_protocol::messages::{CsNegPi, VersionPi};
use irods_protocol::negotiation::{
    NEGOTIATION_STATUS_FAILURE, NEGOTIATION_STATUS_SUCCESS, REQUEST_NEGOTIATION,
};
use irods_protocol::{Message, MessageType, NegotiatedOutcome, NegotiationPolicy};
use tracing::{debug, info, warn};

/// Startup `option` value for the client policy
pub fn build_startup_option(policy: NegotiationPolicy) -> String {
    match policy {
        NegotiationPolicy::NoNegotiation => String::new(),
        _ => REQUEST_NEGOTIATION.to_string(),
    }
}

/// Decide the channel type from both policies. `server_policy` is the raw
/// token the server sent; anything unrecognised fails.
pub fn resolve_outcome(client: NegotiationPolicy, server_policy: &str) -> NegotiatedOutcome {
    use irods_protocol::NegotiatedOutcome::*;
    use irods_protocol::NegotiationPolicy::*;

    if client == NoNegotiation {
        return UseTcp;
    }
    let Some(server) = NegotiationPolicy::from_wire(server_policy) else {
        return Failure;
    };
    match (client, server) {
        (Require, Require) | (Require, DontCare) => UseSsl,
        (Require, Refuse) => Failure,
        (DontCare, Require) => UseSsl,
        (DontCare, DontCare) | (DontCare, Refuse) => UseTcp,
        (Refuse, Require) => Failure,
        (Refuse, DontCare) | (Refuse, Refuse) => UseTcp,
        (NoNegotiation, _) | (_, NoNegotiation) => Failure,
    }
}

/// Result of the startup exchange
#[derive(Debug, Clone)]
pub(crate) struct Negotiated {
    pub outcome: NegotiatedOutcome,
    pub version: VersionPi,
}

/// Run the exchange that follows the startup pack and read the server's
/// `Version_PI`. Fails without falling back to plaintext.
pub(crate) async fn negotiate(channel: &mut Channel, policy: NegotiationPolicy) -> Result<Negotiated> {
    if policy == NegotiationPolicy::NoNegotiation {
        let version = read_version(channel).await?;
        return Ok(Negotiated {
            outcome: NegotiatedOutcome::UseTcp,
            version,
        });
    }

    let first = channel.receive().await?;
    match first.msg_type() {
        MessageType::Negotiation => {}
        MessageType::Version => {
            // server does not negotiate
            if policy == NegotiationPolicy::Require {
                return Err(Error::NegotiationFailed(
                    "SSL required but the server does not negotiate".into(),
                ));
            }
            info!("Server skipped negotiation, using TCP");
            return Ok(Negotiated {
                outcome: NegotiatedOutcome::UseTcp,
                version: version_from(&first)?,
            });
        }
        other => {
            return Err(Error::NegotiationFailed(format!(
                "expected negotiation message, got {}",
                other
            )))
        }
    }

    let outcome = match first.body_pack().and_then(|pi| CsNegPi::from_pack(&pi)) {
        Ok(server) if server.status == NEGOTIATION_STATUS_SUCCESS => {
            resolve_outcome(policy, &server.result)
        }
        Ok(server) => {
            warn!("Server reported negotiation status {}", server.status);
            NegotiatedOutcome::Failure
        }
        Err(e) => {
            warn!("Malformed negotiation message: {}", e);
            NegotiatedOutcome::Failure
        }
    };
    debug!(client = %policy, outcome = %outcome, "Negotiation resolved");

    if outcome == NegotiatedOutcome::Failure {
        let notice = CsNegPi::new(NEGOTIATION_STATUS_FAILURE, outcome.result_keyword());
        if let Err(e) = channel
            .send(&Message::from_pack(MessageType::Negotiation, &notice.to_pack()))
            .await
        {
            debug!("Failed to notify server of negotiation failure: {}", e);
        }
        return Err(Error::NegotiationFailed(format!(
            "client policy {} is incompatible with the server",
            policy
        )));
    }

    let reply = CsNegPi::new(NEGOTIATION_STATUS_SUCCESS, outcome.result_keyword());
    channel
        .send(&Message::from_pack(MessageType::Negotiation, &reply.to_pack()))
        .await?;

    let version = read_version(channel).await?;
    info!("Negotiated {} with {}", outcome, channel.peer());
    Ok(Negotiated { outcome, version })
}

async fn read_version(channel: &mut Channel) -> Result<VersionPi> {
    let message = channel.receive().await?;
    if message.msg_type() != &MessageType::Version {
        return Err(Error::ConnectionError(format!(
            "expected {}, got {}",
            MessageType::Version,
            message.msg_type()
        )));
    }
    version_from(&message)
}

fn version_from(message: &Message) -> Result<VersionPi> {
    if message.int_info() < 0 {
        return Err(Error::ServerError {
            code: message.int_info(),
            message: message.error_text().unwrap_or_default(),
        });
    }
    let version = VersionPi::from_pack(&message.body_pack()?)?;
    if version.status < 0 {
        return Err(Error::ServerError {
            code: version.status,
            message: "startup rejected".into(),
        });
    }
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use irods_protocol::NegotiatedOutcome::*;
    use irods_protocol::NegotiationPolicy::*;

    #[test]
    fn test_resolution_table() {
        let cases = [
            (Require, "CS_NEG_REQUIRE", UseSsl),
            (Require, "CS_NEG_DONT_CARE", UseSsl),
            (Require, "CS_NEG_REFUSE", Failure),
            (DontCare, "CS_NEG_REQUIRE", UseSsl),
            (DontCare, "CS_NEG_DONT_CARE", UseTcp),
            (DontCare, "CS_NEG_REFUSE", UseTcp),
            (Refuse, "CS_NEG_REQUIRE", Failure),
            (Refuse, "CS_NEG_DONT_CARE", UseTcp),
            (Refuse, "CS_NEG_REFUSE", UseTcp),
        ];
        for (client, server, expected) in cases {
            assert_eq!(
                resolve_outcome(client, server),
                expected,
                "{} vs {}",
                client,
                server
            );
        }
    }

    #[test]
    fn test_unknown_server_policy_fails() {
        for client in [Require, DontCare, Refuse] {
            assert_eq!(resolve_outcome(client, "CS_NEG_SOMETIMES"), Failure);
            assert_eq!(resolve_outcome(client, ""), Failure);
            assert_eq!(resolve_outcome(client, "NO_NEGOTIATION"), Failure);
        }
    }

    #[test]
    fn test_startup_option() {
        assert_eq!(build_startup_option(NoNegotiation), "");
        for policy in [Require, DontCare, Refuse] {
            assert_eq!(build_startup_option(policy), "request_server_negotiation");
        }
    }
}
