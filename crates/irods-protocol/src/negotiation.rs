//! Client-server negotiation vocabulary

use serde::{Deserialize, Serialize};
use std::fmt;

/// Startup option telling the server to expect a negotiation exchange
pub const REQUEST_NEGOTIATION: &str = "request_server_negotiation";

/// Keyword prefix of the client's negotiation result
pub const RESULT_KEYWORD: &str = "cs_neg_result_kw";

pub const NEGOTIATION_STATUS_SUCCESS: i32 = 1;
pub const NEGOTIATION_STATUS_FAILURE: i32 = 0;

/// SSL negotiation policy held by each side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum NegotiationPolicy {
    /// Skip negotiation entirely (plaintext, pre-4.x behaviour)
    #[serde(rename = "NO_NEGOTIATION")]
    NoNegotiation,
    #[serde(rename = "CS_NEG_REQUIRE")]
    Require,
    #[default]
    #[serde(rename = "CS_NEG_DONT_CARE")]
    DontCare,
    #[serde(rename = "CS_NEG_REFUSE")]
    Refuse,
}

impl NegotiationPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            NegotiationPolicy::NoNegotiation => "NO_NEGOTIATION",
            NegotiationPolicy::Require => "CS_NEG_REQUIRE",
            NegotiationPolicy::DontCare => "CS_NEG_DONT_CARE",
            NegotiationPolicy::Refuse => "CS_NEG_REFUSE",
        }
    }

    /// Parse a policy token as sent by the server. Only the three
    /// negotiable policies are valid on the wire.
    pub fn from_wire(token: &str) -> Option<Self> {
        match token.trim() {
            "CS_NEG_REQUIRE" => Some(NegotiationPolicy::Require),
            "CS_NEG_DONT_CARE" => Some(NegotiationPolicy::DontCare),
            "CS_NEG_REFUSE" => Some(NegotiationPolicy::Refuse),
            _ => None,
        }
    }
}

impl fmt::Display for NegotiationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiatedOutcome {
    UseSsl,
    UseTcp,
    Failure,
}

impl NegotiatedOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            NegotiatedOutcome::UseSsl => "CS_NEG_USE_SSL",
            NegotiatedOutcome::UseTcp => "CS_NEG_USE_TCP",
            NegotiatedOutcome::Failure => "CS_NEG_FAILURE",
        }
    }

    /// `cs_neg_result_kw=<outcome>;` as sent back to the server
    pub fn result_keyword(&self) -> String {
        format!("{}={};", RESULT_KEYWORD, self.as_str())
    }

    /// Parse a `cs_neg_result_kw=...;` string
    pub fn from_result_keyword(value: &str) -> Option<Self> {
        let outcome = value
            .split(';')
            .filter_map(|kv| kv.split_once('='))
            .find(|(k, _)| k.trim() == RESULT_KEYWORD)
            .map(|(_, v)| v.trim())?;
        match outcome {
            "CS_NEG_USE_SSL" => Some(NegotiatedOutcome::UseSsl),
            "CS_NEG_USE_TCP" => Some(NegotiatedOutcome::UseTcp),
            "CS_NEG_FAILURE" => Some(NegotiatedOutcome::Failure),
            _ => None,
        }
    }

    pub fn is_ssl(&self) -> bool {
        matches!(self, NegotiatedOutcome::UseSsl)
    }
}

impl fmt::Display for NegotiatedOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
