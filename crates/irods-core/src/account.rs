//! Account identity and credentials

use crate::error::{Error, Result};
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// User name denoting the anonymous identity
pub const ANONYMOUS_USER: &str = "anonymous";

/// Authentication scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuthScheme {
    #[default]
    Standard,
    Pam,
    Kerberos,
    Gsi,
}

impl AuthScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthScheme::Standard => "standard",
            AuthScheme::Pam => "pam",
            AuthScheme::Kerberos => "kerberos",
            AuthScheme::Gsi => "gsi",
        }
    }
}

impl fmt::Display for AuthScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthScheme {
    type Err = Error;

    /// Case-insensitive; `native` is accepted for standard
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "standard" | "native" => Ok(AuthScheme::Standard),
            "pam" => Ok(AuthScheme::Pam),
            "kerberos" | "krb" => Ok(AuthScheme::Kerberos),
            "gsi" => Ok(AuthScheme::Gsi),
            _ => Err(Error::InvalidArgument(format!(
                "unknown authentication scheme '{}'",
                s
            ))),
        }
    }
}

/// Password that never appears in `Debug` or logs
#[derive(Clone)]
pub struct Password(SecretString);

impl Password {
    pub fn new(value: impl Into<String>) -> Self {
        Self(SecretString::from(value.into()))
    }

    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }

    pub fn is_empty(&self) -> bool {
        self.0.expose_secret().is_empty()
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl From<&str> for Password {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Password {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// One step of a token-based security handshake (Kerberos, GSI)
#[async_trait]
pub trait SecurityContext: Send {
    /// Consume the server's last token (`None` on the first call) and
    /// produce the next token to send, if any
    async fn step(&mut self, input: Option<&[u8]>) -> Result<Option<Vec<u8>>>;

    /// Whether the context is fully established
    fn is_established(&self) -> bool;
}

/// Credential obtained outside this library (a Kerberos ticket cache, a
/// GSI proxy certificate)
pub trait ExternalCredential: Send + Sync + fmt::Debug {
    /// Principal or distinguished name of the credential owner
    fn principal(&self) -> &str;

    /// Start a security context towards `server_name`
    fn init_context(&self, server_name: &str) -> Result<Box<dyn SecurityContext>>;
}

/// Proxy identity used when one user acts on behalf of another
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyIdentity {
    pub user_name: String,
    pub zone: String,
}

/// Who connects where, and how. Immutable once built; one account may back
/// any number of connections.
#[derive(Clone)]
pub struct Account {
    host: String,
    port: u16,
    zone: String,
    user_name: String,
    password: Password,
    auth_scheme: AuthScheme,
    proxy: Option<ProxyIdentity>,
    default_storage_resource: String,
    home_directory: String,
    credential: Option<Arc<dyn ExternalCredential>>,
}

impl Account {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        user_name: impl Into<String>,
        zone: impl Into<String>,
        password: impl Into<Password>,
    ) -> Self {
        let user_name = user_name.into();
        let zone = zone.into();
        let home_directory = if zone.is_empty() || user_name.is_empty() {
            String::new()
        } else {
            format!("/{}/home/{}", zone, user_name)
        };
        Self {
            host: host.into(),
            port,
            zone,
            user_name,
            password: password.into(),
            auth_scheme: AuthScheme::Standard,
            proxy: None,
            default_storage_resource: String::new(),
            home_directory,
            credential: None,
        }
    }

    /// Anonymous account for `zone`
    pub fn anonymous(host: impl Into<String>, port: u16, zone: impl Into<String>) -> Self {
        Self::new(host, port, ANONYMOUS_USER, zone, "")
    }

    pub fn with_auth_scheme(mut self, scheme: AuthScheme) -> Self {
        self.auth_scheme = scheme;
        self
    }

    pub fn with_proxy(mut self, user_name: impl Into<String>, zone: impl Into<String>) -> Self {
        self.proxy = Some(ProxyIdentity {
            user_name: user_name.into(),
            zone: zone.into(),
        });
        self
    }

    pub fn with_default_storage_resource(mut self, resource: impl Into<String>) -> Self {
        self.default_storage_resource = resource.into();
        self
    }

    pub fn with_home_directory(mut self, home: impl Into<String>) -> Self {
        self.home_directory = home.into();
        self
    }

    pub fn with_credential(mut self, credential: Arc<dyn ExternalCredential>) -> Self {
        self.credential = Some(credential);
        self
    }

    /// Copy of this account carrying another scheme and password. Used when
    /// one scheme completes its login through another.
    pub fn derive(&self, scheme: AuthScheme, password: impl Into<Password>) -> Self {
        let mut derived = self.clone();
        derived.auth_scheme = scheme;
        derived.password = password.into();
        derived
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn zone(&self) -> &str {
        &self.zone
    }

    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    pub fn password(&self) -> &Password {
        &self.password
    }

    pub fn auth_scheme(&self) -> AuthScheme {
        self.auth_scheme
    }

    pub fn proxy(&self) -> Option<&ProxyIdentity> {
        self.proxy.as_ref()
    }

    /// Proxy user name, falling back to the client user
    pub fn proxy_user_name(&self) -> &str {
        self.proxy
            .as_ref()
            .map(|p| p.user_name.as_str())
            .unwrap_or(&self.user_name)
    }

    /// Proxy zone, falling back to the client zone
    pub fn proxy_zone(&self) -> &str {
        self.proxy
            .as_ref()
            .map(|p| p.zone.as_str())
            .unwrap_or(&self.zone)
    }

    pub fn default_storage_resource(&self) -> &str {
        &self.default_storage_resource
    }

    pub fn home_directory(&self) -> &str {
        &self.home_directory
    }

    pub fn credential(&self) -> Option<&Arc<dyn ExternalCredential>> {
        self.credential.as_ref()
    }

    pub fn is_anonymous(&self) -> bool {
        self.user_name == ANONYMOUS_USER
    }

    /// `host:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Reject accounts that cannot identify a user
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::InvalidArgument("account host is empty".into()));
        }
        if self.user_name.trim().is_empty() {
            return Err(Error::InvalidArgument("account user name is empty".into()));
        }
        if self.zone.trim().is_empty() {
            return Err(Error::InvalidArgument("account zone is empty".into()));
        }
        Ok(())
    }
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("zone", &self.zone)
            .field("user_name", &self.user_name)
            .field("password", &self.password)
            .field("auth_scheme", &self.auth_scheme)
            .field("proxy", &self.proxy)
            .field("default_storage_resource", &self.default_storage_resource)
            .field("home_directory", &self.home_directory)
            .field("credential", &self.credential.as_ref().map(|c| c.principal()))
            .finish()
    }
}

impl fmt::Display for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}@{}:{}", self.user_name, self.zone, self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheme_parse() {
        assert_eq!("STANDARD".parse::<AuthScheme>().unwrap(), AuthScheme::Standard);
        assert_eq!("native".parse::<AuthScheme>().unwrap(), AuthScheme::Standard);
        assert_eq!("Pam".parse::<AuthScheme>().unwrap(), AuthScheme::Pam);
        assert_eq!("krb".parse::<AuthScheme>().unwrap(), AuthScheme::Kerberos);
        assert_eq!("gsi".parse::<AuthScheme>().unwrap(), AuthScheme::Gsi);
        assert!(matches!(
            "BOGUS".parse::<AuthScheme>(),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_account_defaults() {
        let account = Account::new("irods.local", 1247, "alice", "tempZone", "secret");
        assert_eq!(account.auth_scheme(), AuthScheme::Standard);
        assert_eq!(account.home_directory(), "/tempZone/home/alice");
        assert_eq!(account.proxy_user_name(), "alice");
        assert_eq!(account.proxy_zone(), "tempZone");
        assert_eq!(account.address(), "irods.local:1247");
        assert!(!account.is_anonymous());
        assert!(account.validate().is_ok());
    }

    #[test]
    fn test_proxy_identity() {
        let account = Account::new("h", 1247, "alice", "tempZone", "pw")
            .with_proxy("rods", "adminZone");
        assert_eq!(account.proxy_user_name(), "rods");
        assert_eq!(account.proxy_zone(), "adminZone");
        assert_eq!(account.user_name(), "alice");
    }

    #[test]
    fn test_anonymous() {
        let account = Account::anonymous("h", 1247, "tempZone");
        assert!(account.is_anonymous());
        assert!(account.password().is_empty());
    }

    #[test]
    fn test_derive_keeps_identity() {
        let pam = Account::new("h", 1247, "alice", "z", "pam-pw").with_auth_scheme(AuthScheme::Pam);
        let standard = pam.derive(AuthScheme::Standard, "temp");
        assert_eq!(standard.auth_scheme(), AuthScheme::Standard);
        assert_eq!(standard.password().expose_secret(), "temp");
        assert_eq!(standard.user_name(), "alice");
        assert_eq!(pam.auth_scheme(), AuthScheme::Pam);
        assert_eq!(pam.password().expose_secret(), "pam-pw");
    }

    #[test]
    fn test_validate_missing_fields() {
        assert!(Account::new("h", 1247, "", "z", "pw").validate().is_err());
        assert!(Account::new("h", 1247, "u", "", "pw").validate().is_err());
        assert!(Account::new("", 1247, "u", "z", "pw").validate().is_err());
    }

    #[test]
    fn test_debug_redacts_password() {
        let account = Account::new("h", 1247, "alice", "z", "hunter2");
        let debug = format!("{:?}", account);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("[REDACTED]"));
    }
}
