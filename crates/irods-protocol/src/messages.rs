//! Typed packing instructions exchanged during connection setup and
//! authentication

use crate::error::Result;
use crate::packing::PackInstruction;

/// Protocol flavour announced in the startup pack (1 = XML)
pub const XML_PROTOCOL: i32 = 1;

/// `reconnFlag` value asking the server to allow reconnection
pub const RECONNECT_FLAG: i32 = 200;

/// Client startup request (`StartupPack_PI`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupPack {
    pub irods_prot: i32,
    pub reconn_flag: i32,
    pub connect_cnt: i32,
    pub proxy_user: String,
    pub proxy_zone: String,
    pub client_user: String,
    pub client_zone: String,
    pub rel_version: String,
    pub api_version: String,
    pub option: String,
}

impl StartupPack {
    pub const NAME: &'static str = "StartupPack_PI";

    pub fn to_pack(&self) -> PackInstruction {
        PackInstruction::new(Self::NAME)
            .with("irodsProt", self.irods_prot)
            .with("reconnFlag", self.reconn_flag)
            .with("connectCnt", self.connect_cnt)
            .with("proxyUser", &self.proxy_user)
            .with("proxyRcatZone", &self.proxy_zone)
            .with("clientUser", &self.client_user)
            .with("clientRcatZone", &self.client_zone)
            .with("relVersion", &self.rel_version)
            .with("apiVersion", &self.api_version)
            .with("option", &self.option)
    }

    pub fn from_pack(pi: &PackInstruction) -> Result<Self> {
        Ok(Self {
            irods_prot: pi.require_parsed("irodsProt")?,
            reconn_flag: pi.require_parsed("reconnFlag")?,
            connect_cnt: pi.require_parsed("connectCnt")?,
            proxy_user: pi.require("proxyUser")?.to_string(),
            proxy_zone: pi.require("proxyRcatZone")?.to_string(),
            client_user: pi.require("clientUser")?.to_string(),
            client_zone: pi.require("clientRcatZone")?.to_string(),
            rel_version: pi.require("relVersion")?.to_string(),
            api_version: pi.require("apiVersion")?.to_string(),
            option: pi.get("option").unwrap_or_default().to_string(),
        })
    }

    pub fn wants_reconnect(&self) -> bool {
        self.reconn_flag == RECONNECT_FLAG
    }
}

/// Server version reply (`Version_PI`)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VersionPi {
    pub status: i32,
    pub rel_version: String,
    pub api_version: String,
    pub reconn_port: i32,
    pub reconn_addr: String,
    pub cookie: i32,
}

impl VersionPi {
    pub const NAME: &'static str = "Version_PI";

    pub fn to_pack(&self) -> PackInstruction {
        PackInstruction::new(Self::NAME)
            .with("status", self.status)
            .with("relVersion", &self.rel_version)
            .with("apiVersion", &self.api_version)
            .with("reconnPort", self.reconn_port)
            .with("reconnAddr", &self.reconn_addr)
            .with("cookie", self.cookie)
    }

    /// Older servers omit the reconnection fields; they default to zero/empty.
    pub fn from_pack(pi: &PackInstruction) -> Result<Self> {
        Ok(Self {
            status: pi.require_parsed("status")?,
            rel_version: pi.require("relVersion")?.trim().to_string(),
            api_version: pi.require("apiVersion")?.trim().to_string(),
            reconn_port: optional_int(pi, "reconnPort")?,
            reconn_addr: pi.get("reconnAddr").unwrap_or_default().trim().to_string(),
            cookie: optional_int(pi, "cookie")?,
        })
    }
}

/// Negotiation message (`CS_NEG_PI`), used in both directions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsNegPi {
    pub status: i32,
    pub result: String,
}

impl CsNegPi {
    pub const NAME: &'static str = "CS_NEG_PI";

    pub fn new(status: i32, result: impl Into<String>) -> Self {
        Self {
            status,
            result: result.into(),
        }
    }

    pub fn to_pack(&self) -> PackInstruction {
        PackInstruction::new(Self::NAME)
            .with("status", self.status)
            .with("result", &self.result)
    }

    pub fn from_pack(pi: &PackInstruction) -> Result<Self> {
        Ok(Self {
            status: pi.require_parsed("status")?,
            result: pi.require("result")?.trim().to_string(),
        })
    }
}

/// Standard auth challenge (`authRequestOut_PI`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequestOut {
    /// Base64 challenge
    pub challenge: String,
}

impl AuthRequestOut {
    pub const NAME: &'static str = "authRequestOut_PI";

    pub fn to_pack(&self) -> PackInstruction {
        PackInstruction::new(Self::NAME).with("challenge", &self.challenge)
    }

    pub fn from_pack(pi: &PackInstruction) -> Result<Self> {
        Ok(Self {
            challenge: pi.require("challenge")?.trim().to_string(),
        })
    }
}

/// Standard auth answer (`authResponseInp_PI`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResponseInp {
    pub response: String,
    /// `user#zone`
    pub username: String,
}

impl AuthResponseInp {
    pub const NAME: &'static str = "authResponseInp_PI";

    pub fn to_pack(&self) -> PackInstruction {
        PackInstruction::new(Self::NAME)
            .with("response", &self.response)
            .with("username", &self.username)
    }

    pub fn from_pack(pi: &PackInstruction) -> Result<Self> {
        Ok(Self {
            response: pi.require("response")?.to_string(),
            username: pi.require("username")?.to_string(),
        })
    }
}

/// Legacy PAM request (`pamAuthRequestInp_PI`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PamAuthRequestInp {
    pub pam_user: String,
    pub pam_password: String,
    /// Hours; 0 lets the server pick its default
    pub time_to_live: i32,
}

impl PamAuthRequestInp {
    pub const NAME: &'static str = "pamAuthRequestInp_PI";

    pub fn to_pack(&self) -> PackInstruction {
        PackInstruction::new(Self::NAME)
            .with("pamUser", &self.pam_user)
            .with("pamPassword", &self.pam_password)
            .with("timeToLive", self.time_to_live)
    }

    pub fn from_pack(pi: &PackInstruction) -> Result<Self> {
        Ok(Self {
            pam_user: pi.require("pamUser")?.to_string(),
            pam_password: pi.require("pamPassword")?.to_string(),
            time_to_live: pi.require_parsed("timeToLive")?,
        })
    }
}

/// Legacy PAM reply (`pamAuthRequestOut_PI`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PamAuthRequestOut {
    pub irods_pam_password: String,
}

impl PamAuthRequestOut {
    pub const NAME: &'static str = "pamAuthRequestOut_PI";

    pub fn to_pack(&self) -> PackInstruction {
        PackInstruction::new(Self::NAME).with("irodsPamPassword", &self.irods_pam_password)
    }

    pub fn from_pack(pi: &PackInstruction) -> Result<Self> {
        Ok(Self {
            irods_pam_password: pi.require("irodsPamPassword")?.trim().to_string(),
        })
    }
}

/// Auth plugin request (`authPlugReqInp_PI`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthPluginRequestInp {
    pub auth_scheme: String,
    /// `key=value;` pairs interpreted by the plugin
    pub context: String,
}

impl AuthPluginRequestInp {
    pub const NAME: &'static str = "authPlugReqInp_PI";

    /// PAM context: `a_user=..;a_pw=..;a_ttl=..`
    pub fn pam(user: &str, password: &str, ttl: i32) -> Self {
        Self {
            auth_scheme: "pam".to_string(),
            context: format!("a_user={};a_pw={};a_ttl={}", user, password, ttl),
        }
    }

    /// Look up one value of the context string
    pub fn context_value(&self, key: &str) -> Option<&str> {
        self.context
            .split(';')
            .filter_map(|kv| kv.split_once('='))
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }

    pub fn to_pack(&self) -> PackInstruction {
        PackInstruction::new(Self::NAME)
            .with("auth_scheme_", &self.auth_scheme)
            .with("context_", &self.context)
    }

    pub fn from_pack(pi: &PackInstruction) -> Result<Self> {
        Ok(Self {
            auth_scheme: pi.require("auth_scheme_")?.trim().to_string(),
            context: pi.require("context_")?.to_string(),
        })
    }
}

/// Auth plugin reply (`authPlugReqOut_PI`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthPluginRequestOut {
    pub result: String,
}

impl AuthPluginRequestOut {
    pub const NAME: &'static str = "authPlugReqOut_PI";

    pub fn to_pack(&self) -> PackInstruction {
        PackInstruction::new(Self::NAME).with("result_", &self.result)
    }

    pub fn from_pack(pi: &PackInstruction) -> Result<Self> {
        Ok(Self {
            result: pi.require("result_")?.trim().to_string(),
        })
    }
}

/// Server principal returned by the Kerberos and GSI auth requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerNameOut {
    pub name: String,
}

impl ServerNameOut {
    pub const KRB_NAME: &'static str = "krbAuthRequestOut_PI";
    pub const GSI_NAME: &'static str = "gsiAuthRequestOut_PI";

    pub fn to_krb_pack(&self) -> PackInstruction {
        PackInstruction::new(Self::KRB_NAME).with("serverName", &self.name)
    }

    pub fn to_gsi_pack(&self) -> PackInstruction {
        PackInstruction::new(Self::GSI_NAME).with("serverDN", &self.name)
    }

    /// Accepts either reply shape
    pub fn from_pack(pi: &PackInstruction) -> Result<Self> {
        let tag = if pi.name() == Self::GSI_NAME {
            "serverDN"
        } else {
            "serverName"
        };
        Ok(Self {
            name: pi.require(tag)?.trim().to_string(),
        })
    }
}

/// Reconnection request sent on the side channel (`ReconnMsg_PI`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnMsg {
    pub status: i32,
    pub cookie: i32,
    pub proc_state: i32,
    pub flag: i32,
}

impl ReconnMsg {
    pub const NAME: &'static str = "ReconnMsg_PI";

    pub fn new(cookie: i32) -> Self {
        Self {
            status: 0,
            cookie,
            proc_state: 0,
            flag: 0,
        }
    }

    pub fn to_pack(&self) -> PackInstruction {
        PackInstruction::new(Self::NAME)
            .with("status", self.status)
            .with("cookie", self.cookie)
            .with("procState", self.proc_state)
            .with("flag", self.flag)
    }

    pub fn from_pack(pi: &PackInstruction) -> Result<Self> {
        Ok(Self {
            status: pi.require_parsed("status")?,
            cookie: pi.require_parsed("cookie")?,
            proc_state: optional_int(pi, "procState")?,
            flag: optional_int(pi, "flag")?,
        })
    }
}

fn optional_int(pi: &PackInstruction, tag: &str) -> Result<i32> {
    match pi.get(tag) {
        Some(v) if !v.trim().is_empty() => pi.require_parsed(tag),
        _ => Ok(0),
    }
}
