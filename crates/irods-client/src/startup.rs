use crate::encryption::TransportKey;
use irods_core::ReleaseVersion;
use irods_protocol::messages::VersionPi;

/// What the server reported at startup, plus how the channel was negotiated
#[derive(Debug, Clone, Default)]
pub struct StartupResponseData {
    pub status: i32,
    pub api_version: String,
    pub release_version: String,
    pub reconnect_addr: String,
    pub reconnect_port: u16,
    pub cookie: i32,
    /// Channel was negotiated to SSL
    pub ssl: bool,
    /// Shared secret sent after the encryption header, when SSL
    pub transport_key: Option<TransportKey>,
}

impl StartupResponseData {
    pub fn from_version(version: &VersionPi, ssl: bool) -> Self {
        Self {
            status: version.status,
            api_version: version.api_version.clone(),
            release_version: version.rel_version.clone(),
            reconnect_addr: version.reconn_addr.clone(),
            reconnect_port: u16::try_from(version.reconn_port).unwrap_or(0),
            cookie: version.cookie,
            ssl,
            transport_key: None,
        }
    }

    /// Parsed release; unparseable strings read as 0.0.0
    pub fn release(&self) -> ReleaseVersion {
        self.release_version.parse().unwrap_or_default()
    }

    /// Server issued a cookie and a port to reconnect to
    pub fn can_reconnect(&self) -> bool {
        self.cookie != 0 && self.reconnect_port != 0
    }
}
