//! Encrypted channel setup
//!
//! After an SSL negotiation the client upgrades the socket to TLS, sends a
//! header-only message announcing the cipher parameters (algorithm name in
//! `type`, key size in `msgLen`, salt size in `errorLen`, hash rounds in
//! `bsLen`), then a `SHARED_SECRET` message whose body is a key derived with
//! PBKDF2. The server uses that key for encrypted parallel transfers.

use crate::channel::Channel;
use crate::error::{Error, Result};
use bytes::Bytes;
use hmac::Hmac;
use irods_core::tls::TlsConnector;
use irods_core::EncryptionSettings;
use irods_protocol::{codec, Message, MessageType, MsgHeader};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretBox};
use sha2::Sha256;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const PASSPHRASE_LEN: usize = 32;

/// Key shared with the server over the encrypted channel
#[derive(Clone)]
pub struct TransportKey(Arc<SecretBox<Vec<u8>>>);

impl TransportKey {
    pub fn expose_secret(&self) -> &[u8] {
        self.0.expose_secret()
    }

    pub fn len(&self) -> usize {
        self.0.expose_secret().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for TransportKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransportKey([REDACTED; {}])", self.len())
    }
}

/// Header announcing the cipher parameters
pub fn encryption_header(settings: &EncryptionSettings) -> MsgHeader {
    MsgHeader {
        msg_type: MessageType::Other(settings.algorithm.clone()),
        msg_len: settings.key_size,
        error_len: settings.salt_size,
        bs_len: settings.hash_rounds,
        int_info: 0,
    }
}

/// Encode the encryption header in wire form
pub fn derive_header(
    algorithm: &str,
    key_size: u32,
    salt_size: u32,
    hash_rounds: u32,
) -> Result<Bytes> {
    let settings = EncryptionSettings {
        algorithm: algorithm.to_string(),
        key_size,
        salt_size,
        hash_rounds,
    };
    Ok(codec::encode_header(&encryption_header(&settings))?)
}

/// Read the parameters back from a wire-form encryption header
pub fn parse_header(bytes: &[u8]) -> Result<EncryptionSettings> {
    let header = codec::decode_header(bytes)?;
    Ok(settings_from_header(&header))
}

pub fn settings_from_header(header: &MsgHeader) -> EncryptionSettings {
    EncryptionSettings {
        algorithm: header.msg_type.as_str().to_string(),
        key_size: header.msg_len,
        salt_size: header.error_len,
        hash_rounds: header.bs_len,
    }
}

/// Derive a transport key of `key_size` bits from a random passphrase and
/// a random salt of `salt_size` bytes
pub fn derive_key(settings: &EncryptionSettings) -> Result<TransportKey> {
    let mut rng = rand::thread_rng();
    let mut passphrase = [0u8; PASSPHRASE_LEN];
    rng.fill_bytes(&mut passphrase);
    let mut salt = vec![0u8; settings.salt_size as usize];
    rng.fill_bytes(&mut salt);

    let mut key = vec![0u8; settings.key_bytes()];
    pbkdf2::pbkdf2::<Hmac<Sha256>>(&passphrase, &salt, settings.hash_rounds, &mut key)
        .map_err(|e| Error::Encryption(format!("key derivation failed: {}", e)))?;
    Ok(TransportKey(Arc::new(SecretBox::new(Box::new(key)))))
}

/// Upgrade `channel` to TLS and exchange the shared secret. Returns the
/// encrypted channel and the key sent to the server.
pub(crate) async fn wrap(
    channel: Channel,
    connector: &TlsConnector,
    host: &str,
    settings: &EncryptionSettings,
    handshake_timeout: Duration,
) -> Result<(Channel, TransportKey)> {
    let mut channel = channel
        .upgrade_tls(connector, host, handshake_timeout)
        .await?;

    debug!(
        algorithm = %settings.algorithm,
        key_size = settings.key_size,
        salt_size = settings.salt_size,
        hash_rounds = settings.hash_rounds,
        "Sending encryption header"
    );
    channel.send_header(&encryption_header(settings)).await?;

    let key = derive_key(settings)?;
    let secret = Message::new(
        MessageType::SharedSecret,
        Bytes::copy_from_slice(key.expose_secret()),
    );
    channel.send(&secret).await?;

    info!("Channel to {} is encrypted", channel.peer());
    Ok((channel, key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let bytes = derive_header("AES_256_CBC", 256, 8, 16).unwrap();
        let settings = parse_header(&bytes).unwrap();
        assert_eq!(settings.algorithm, "AES_256_CBC");
        assert_eq!(settings.key_size, 256);
        assert_eq!(settings.salt_size, 8);
        assert_eq!(settings.hash_rounds, 16);
    }

    #[test]
    fn test_header_field_order() {
        let bytes = derive_header("AES-256-CBC", 256, 8, 16).unwrap();
        let xml = std::str::from_utf8(&bytes[4..]).unwrap();
        let type_at = xml.find("<type>AES-256-CBC</type>").unwrap();
        let key_at = xml.find("<msgLen>256</msgLen>").unwrap();
        let salt_at = xml.find("<errorLen>8</errorLen>").unwrap();
        let rounds_at = xml.find("<bsLen>16</bsLen>").unwrap();
        assert!(type_at < key_at && key_at < salt_at && salt_at < rounds_at);
    }

    #[test]
    fn test_derive_key_size_and_randomness() {
        let settings = EncryptionSettings::default();
        let a = derive_key(&settings).unwrap();
        let b = derive_key(&settings).unwrap();
        assert_eq!(a.len(), 32);
        assert_ne!(a.expose_secret(), b.expose_secret());
        assert!(!format!("{:?}", a).contains(&format!("{:?}", a.expose_secret())));
    }

    #[test]
    fn test_parse_header_rejects_garbage() {
        assert!(parse_header(b"\0\0\0\x03abc").is_err());
    }
}
