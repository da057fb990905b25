use crate::error::{Error, Result};
use crate::tls::TlsSettings;
use irods_protocol::NegotiationPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Parameters of the encrypted channel sent in the encryption header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionSettings {
    /// Cipher name, e.g. `AES-256-CBC`
    pub algorithm: String,

    /// Key size in bits
    pub key_size: u32,

    /// Salt size in bytes
    pub salt_size: u32,

    /// PBKDF2 iterations
    pub hash_rounds: u32,
}

impl Default for EncryptionSettings {
    fn default() -> Self {
        Self {
            algorithm: "AES-256-CBC".to_string(),
            key_size: 256,
            salt_size: 8,
            hash_rounds: 16,
        }
    }
}

impl EncryptionSettings {
    /// Key size in bytes
    pub fn key_bytes(&self) -> usize {
        (self.key_size / 8) as usize
    }
}

/// Connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Client SSL negotiation policy
    pub negotiation_policy: NegotiationPolicy,

    /// Encrypted channel parameters
    pub encryption: EncryptionSettings,

    /// TLS trust settings
    #[serde(default)]
    pub tls: TlsSettings,

    /// Ask the server for a reconnect cookie and keep the socket alive
    pub reconnect: bool,

    /// Interval between reconnections
    #[serde(with = "humantime_serde")]
    pub reconnect_interval: Duration,

    /// Timeout for establishing the TCP connection
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Timeout for each read; `None` waits indefinitely
    #[serde(default, with = "humantime_serde")]
    pub socket_timeout: Option<Duration>,

    /// Lifetime in hours requested for PAM temporary passwords (0 = server default)
    pub pam_time_to_live: i32,

    /// Largest payload accepted from the server
    pub max_message_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            negotiation_policy: NegotiationPolicy::DontCare,
            encryption: EncryptionSettings::default(),
            tls: TlsSettings::default(),
            reconnect: false,
            reconnect_interval: Duration::from_secs(600),
            connect_timeout: Duration::from_secs(30),
            socket_timeout: Some(Duration::from_secs(120)),
            pam_time_to_live: 0,
            max_message_size: irods_protocol::MAX_MESSAGE_SIZE,
        }
    }
}

impl ConnectionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_negotiation_policy(mut self, policy: NegotiationPolicy) -> Self {
        self.negotiation_policy = policy;
        self
    }

    pub fn with_encryption(mut self, encryption: EncryptionSettings) -> Self {
        self.encryption = encryption;
        self
    }

    pub fn with_tls(mut self, tls: TlsSettings) -> Self {
        self.tls = tls;
        self
    }

    /// Enable reconnection at the given interval
    pub fn with_reconnect(mut self, interval: Duration) -> Self {
        self.reconnect = true;
        self.reconnect_interval = interval;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_socket_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.socket_timeout = timeout;
        self
    }

    pub fn with_pam_time_to_live(mut self, hours: i32) -> Self {
        self.pam_time_to_live = hours;
        self
    }

    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Check internal consistency
    pub fn validate(&self) -> Result<()> {
        let enc = &self.encryption;
        if enc.algorithm.trim().is_empty() {
            return Err(Error::InvalidConfig("encryption algorithm is empty".into()));
        }
        if enc.key_size == 0 || enc.key_size % 8 != 0 {
            return Err(Error::InvalidConfig(format!(
                "key size must be a positive multiple of 8 bits, got {}",
                enc.key_size
            )));
        }
        if enc.salt_size == 0 {
            return Err(Error::InvalidConfig("salt size must be positive".into()));
        }
        if enc.hash_rounds == 0 {
            return Err(Error::InvalidConfig("hash rounds must be positive".into()));
        }
        if self.reconnect && self.reconnect_interval.is_zero() {
            return Err(Error::InvalidConfig(
                "reconnect interval must be positive".into(),
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(Error::InvalidConfig("connect timeout must be positive".into()));
        }
        if self.socket_timeout.is_some_and(|t| t.is_zero()) {
            return Err(Error::InvalidConfig("socket timeout must be positive".into()));
        }
        if self.pam_time_to_live < 0 {
            return Err(Error::InvalidConfig("PAM time to live is negative".into()));
        }
        if self.max_message_size == 0 {
            return Err(Error::InvalidConfig("max message size is zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ConnectionConfig::default();
        assert_eq!(config.negotiation_policy, NegotiationPolicy::DontCare);
        assert_eq!(config.encryption.algorithm, "AES-256-CBC");
        assert_eq!(config.encryption.key_size, 256);
        assert_eq!(config.encryption.key_bytes(), 32);
        assert_eq!(config.encryption.salt_size, 8);
        assert_eq!(config.encryption.hash_rounds, 16);
        assert!(!config.reconnect);
        assert_eq!(config.reconnect_interval, Duration::from_secs(600));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_pattern() {
        let config = ConnectionConfig::new()
            .with_negotiation_policy(NegotiationPolicy::Require)
            .with_reconnect(Duration::from_secs(30))
            .with_connect_timeout(Duration::from_secs(5))
            .with_socket_timeout(None)
            .with_pam_time_to_live(8)
            .with_max_message_size(1024);

        assert_eq!(config.negotiation_policy, NegotiationPolicy::Require);
        assert!(config.reconnect);
        assert_eq!(config.reconnect_interval, Duration::from_secs(30));
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert!(config.socket_timeout.is_none());
        assert_eq!(config.pam_time_to_live, 8);
        assert_eq!(config.max_message_size, 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = ConnectionConfig::new().with_encryption(EncryptionSettings {
            key_size: 100,
            ..Default::default()
        });
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let config = ConnectionConfig::new().with_encryption(EncryptionSettings {
            hash_rounds: 0,
            ..Default::default()
        });
        assert!(config.validate().is_err());

        let config = ConnectionConfig::new().with_reconnect(Duration::ZERO);
        assert!(config.validate().is_err());

        let config = ConnectionConfig::new().with_socket_timeout(Some(Duration::ZERO));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_serialization() {
        let config = ConnectionConfig::new()
            .with_negotiation_policy(NegotiationPolicy::Refuse)
            .with_reconnect(Duration::from_secs(90));
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"CS_NEG_REFUSE\""));
        assert!(json.contains("\"1m 30s\""));

        let back: ConnectionConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.negotiation_policy, NegotiationPolicy::Refuse);
        assert_eq!(back.reconnect_interval, Duration::from_secs(90));
        assert_eq!(back.socket_timeout, config.socket_timeout);
        assert_eq!(back.encryption, config.encryption);
    }
}
