//! Connection lifecycle
//!
//! ```text
//! Disconnected -> Connecting -> Negotiating -> Authenticating -> Connected
//!                                                                  |  ^
//!                                                      Reconnecting+--+
//! Connected -> Disconnecting -> Disconnected   (graceful)
//! any state -> Disconnected                    (I/O failure, timeout)
//! ```
//!
//! All socket traffic of one connection goes through a single exchange
//! lock, so a request and its reply are never interleaved with another
//! request or with a socket swap by the reconnection task.

use crate::auth::{AuthResponse, AuthenticationDispatcher};
use crate::channel::Channel;
use crate::encryption;
use crate::error::{Error, Result};
use crate::negotiation::{build_startup_option, negotiate};
use crate::reconnect::{ReconnectStats, Reconnectable, ReconnectionManager};
use crate::startup::StartupResponseData;
use async_trait::async_trait;
use irods_core::tls::TlsConnector;
use irods_core::{Account, ConnectionConfig, ServerProperties, ServerPropertiesCache};
use irods_protocol::messages::{ReconnMsg, StartupPack, RECONNECT_FLAG, XML_PROTOCOL};
use irods_protocol::{Message, MessageType, NegotiationPolicy, API_VERSION, RELEASE_VERSION};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::{MutexGuard, OnceCell};
use tracing::{debug, info, warn};

/// Where a connection is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Negotiating,
    Authenticating,
    Connected,
    Reconnecting,
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Negotiating => "NEGOTIATING",
            ConnectionState::Authenticating => "AUTHENTICATING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Reconnecting => "RECONNECTING",
            ConnectionState::Disconnecting => "DISCONNECTING",
        };
        f.write_str(name)
    }
}

struct Inner {
    account: Account,
    config: Arc<ConnectionConfig>,
    state: parking_lot::Mutex<ConnectionState>,
    /// Exchange lock
    channel: tokio::sync::Mutex<Option<Channel>>,
    open: AtomicBool,
    encrypted: AtomicBool,
    startup: OnceLock<StartupResponseData>,
    challenge: OnceLock<String>,
    auth: OnceLock<AuthResponse>,
    reconnection: parking_lot::Mutex<Option<ReconnectionManager>>,
}

impl Inner {
    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.lock();
        if *state != next {
            debug!("{}: {} -> {}", self.account.address(), *state, next);
            *state = next;
        }
    }

    /// Move `from` -> `to`; false if the connection was elsewhere
    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        let mut state = self.state.lock();
        if *state != from {
            return false;
        }
        debug!("{}: {} -> {}", self.account.address(), from, to);
        *state = to;
        true
    }

    async fn stop_reconnection(&self) {
        let manager = self.reconnection.lock().take();
        if let Some(manager) = manager {
            let stats = manager.stop().await;
            debug!(
                attempts = stats.attempts,
                failures = stats.failures,
                "Stopped reconnection for {}",
                self.account.address()
            );
        }
    }

    /// Close `channel` and land in `Disconnected`. Secondary errors are
    /// only logged.
    async fn close(&self, channel: Option<Channel>, graceful: bool) {
        self.open.store(false, Ordering::SeqCst);
        if let Some(mut channel) = channel {
            if graceful {
                let bye = Message::new(MessageType::Disconnect, Vec::new());
                if let Err(e) = channel.send(&bye).await {
                    debug!("Failed to send disconnect to {}: {}", channel.peer(), e);
                }
            }
            if let Err(e) = channel.shutdown().await {
                debug!("Error closing socket to {}: {}", channel.peer(), e);
            }
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Pass `result` through; a transport failure first tears the
    /// connection down.
    async fn settle<T>(
        &self,
        mut guard: MutexGuard<'_, Option<Channel>>,
        result: Result<T>,
    ) -> Result<T> {
        if let Err(e) = &result {
            if e.is_transport() {
                warn!("Connection to {} lost: {}", self.account.address(), e);
                let channel = guard.take();
                drop(guard);
                self.stop_reconnection().await;
                self.close(channel, false).await;
            }
        }
        result
    }

    async fn open_reconnect_channel(&self, startup: &StartupResponseData) -> Result<Channel> {
        let host = if startup.reconnect_addr.is_empty() {
            self.account.host()
        } else {
            startup.reconnect_addr.as_str()
        };
        let mut channel = Channel::connect(
            host,
            startup.reconnect_port,
            self.config.connect_timeout,
            self.config.socket_timeout,
            self.config.max_message_size,
        )
        .await?;

        let request = ReconnMsg::new(startup.cookie);
        channel
            .send(&Message::from_pack(MessageType::Reconnect, &request.to_pack()))
            .await?;
        let reply = channel.receive().await?;
        if reply.msg_type() != &MessageType::Reconnect {
            return Err(Error::ConnectionError(format!(
                "expected {} from {}, got {}",
                MessageType::Reconnect,
                channel.peer(),
                reply.msg_type()
            )));
        }
        if reply.int_info() < 0 {
            return Err(Error::ServerError {
                code: reply.int_info(),
                message: reply.error_text().unwrap_or_default(),
            });
        }
        let ack = ReconnMsg::from_pack(&reply.body_pack()?)?;
        if ack.status < 0 {
            return Err(Error::ServerError {
                code: ack.status,
                message: "reconnect refused".into(),
            });
        }
        Ok(channel)
    }
}

#[async_trait]
impl Reconnectable for Inner {
    async fn reconnect_once(&self) -> Result<()> {
        let startup = self.startup.get().ok_or(Error::NotConnected)?;
        let mut guard = self.channel.lock().await;
        if guard.is_none()
            || !self.transition(ConnectionState::Connected, ConnectionState::Reconnecting)
        {
            return Err(Error::NotConnected);
        }

        let result = match self.open_reconnect_channel(startup).await {
            Ok(fresh) => {
                let peer = fresh.peer().to_string();
                if let Some(mut old) = guard.replace(fresh) {
                    if let Err(e) = old.shutdown().await {
                        debug!("Error closing replaced socket {}: {}", old.peer(), e);
                    }
                }
                debug!("Socket for {} now on {}", self.account.address(), peer);
                Ok(())
            }
            Err(e) => Err(e),
        };
        self.transition(ConnectionState::Reconnecting, ConnectionState::Connected);
        result
    }
}

/// An open (or once open) connection to an iRODS server.
///
/// Cheap to clone; clones share the socket and state.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    pub(crate) fn new(account: Account, config: Arc<ConnectionConfig>) -> Self {
        Self {
            inner: Arc::new(Inner {
                account,
                config,
                state: parking_lot::Mutex::new(ConnectionState::Disconnected),
                channel: tokio::sync::Mutex::new(None),
                open: AtomicBool::new(false),
                encrypted: AtomicBool::new(false),
                startup: OnceLock::new(),
                challenge: OnceLock::new(),
                auth: OnceLock::new(),
                reconnection: parking_lot::Mutex::new(None),
            }),
        }
    }

    pub fn account(&self) -> &Account {
        &self.inner.account
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    /// Logged in and usable
    pub fn is_connected(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Connected | ConnectionState::Reconnecting
        )
    }

    /// A socket is attached (true from the end of startup until close)
    pub fn is_channel_open(&self) -> bool {
        self.inner.open.load(Ordering::SeqCst)
    }

    pub fn is_encrypted(&self) -> bool {
        self.inner.encrypted.load(Ordering::SeqCst)
    }

    pub fn startup_response(&self) -> Option<&StartupResponseData> {
        self.inner.startup.get()
    }

    /// First challenge received during authentication
    pub fn cached_challenge(&self) -> Option<&str> {
        self.inner.challenge.get().map(String::as_str)
    }

    pub(crate) fn cache_challenge(&self, challenge: &str) {
        if self.inner.challenge.set(challenge.to_string()).is_err() {
            debug!("Challenge already cached for {}", self.inner.account.address());
        }
    }

    pub fn auth_response(&self) -> Option<&AuthResponse> {
        self.inner.auth.get()
    }

    pub fn authenticated_account(&self) -> Option<&Account> {
        self.auth_response().map(AuthResponse::authenticated_account)
    }

    /// Counters of the reconnection task, if one is running
    pub fn reconnect_stats(&self) -> Option<ReconnectStats> {
        self.inner.reconnection.lock().as_ref().map(|m| m.stats())
    }

    /// Send `message` and wait for the reply
    pub async fn request(&self, message: &Message) -> Result<Message> {
        let mut guard = self.inner.channel.lock().await;
        let result = match guard.as_mut() {
            Some(channel) => match channel.send(message).await {
                Ok(()) => channel.receive().await,
                Err(e) => Err(e),
            },
            None => return Err(Error::NotConnected),
        };
        self.inner.settle(guard, result).await
    }

    pub async fn send_packet(&self, message: &Message) -> Result<()> {
        let mut guard = self.inner.channel.lock().await;
        let result = match guard.as_mut() {
            Some(channel) => channel.send(message).await,
            None => return Err(Error::NotConnected),
        };
        self.inner.settle(guard, result).await
    }

    pub async fn receive_packet(&self) -> Result<Message> {
        let mut guard = self.inner.channel.lock().await;
        let result = match guard.as_mut() {
            Some(channel) => channel.receive().await,
            None => return Err(Error::NotConnected),
        };
        self.inner.settle(guard, result).await
    }

    /// Write one length-prefixed security token
    pub async fn write_token(&self, token: &[u8]) -> Result<()> {
        let mut guard = self.inner.channel.lock().await;
        let result = match guard.as_mut() {
            Some(channel) => channel.write_token(token).await,
            None => return Err(Error::NotConnected),
        };
        self.inner.settle(guard, result).await
    }

    pub async fn read_token(&self) -> Result<Vec<u8>> {
        let mut guard = self.inner.channel.lock().await;
        let result = match guard.as_mut() {
            Some(channel) => channel.read_token().await,
            None => return Err(Error::NotConnected),
        };
        self.inner.settle(guard, result).await
    }

    /// Graceful close: stop reconnection, send `RODS_DISCONNECT`, close the
    /// socket. Calling it again is a no-op.
    pub async fn disconnect(&self) {
        {
            let mut state = self.inner.state.lock();
            if matches!(
                *state,
                ConnectionState::Disconnected | ConnectionState::Disconnecting
            ) && !self.inner.open.load(Ordering::SeqCst)
            {
                return;
            }
            *state = ConnectionState::Disconnecting;
        }
        self.inner.stop_reconnection().await;
        let channel = self.inner.channel.lock().await.take();
        self.inner.close(channel, true).await;
        info!("Disconnected from {}", self.inner.account.address());
    }

    /// Close without talking to the server, for a socket known to be
    /// broken
    pub async fn disconnect_with_error(&self) {
        self.inner.stop_reconnection().await;
        let channel = self.inner.channel.lock().await.take();
        let had_channel = channel.is_some();
        self.inner.close(channel, false).await;
        if had_channel {
            warn!("Dropped connection to {}", self.inner.account.address());
        }
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.inner.set_state(state);
    }

    /// Attach the post-startup channel
    pub(crate) async fn install(&self, channel: Channel, startup: StartupResponseData) {
        self.inner
            .encrypted
            .store(channel.is_encrypted(), Ordering::SeqCst);
        *self.inner.channel.lock().await = Some(channel);
        self.inner.open.store(true, Ordering::SeqCst);
        if self.inner.startup.set(startup).is_err() {
            debug!("Startup response already recorded");
        }
    }

    fn complete(&self, response: AuthResponse) {
        if self.inner.auth.set(response).is_err() {
            debug!("Authentication already recorded");
        }
    }

    fn start_reconnection(&self) {
        let interval = self.inner.config.reconnect_interval;
        let manager = ReconnectionManager::start(Arc::downgrade(&self.inner), interval);
        *self.inner.reconnection.lock() = Some(manager);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("account", &self.inner.account.to_string())
            .field("state", &self.state())
            .field("encrypted", &self.is_encrypted())
            .finish()
    }
}

/// Creates authenticated connections. Not a pool: every call opens a new
/// socket.
pub struct ConnectionManager {
    config: Arc<ConnectionConfig>,
    properties: Arc<ServerPropertiesCache>,
    tls: OnceCell<TlsConnector>,
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            properties: Arc::new(ServerPropertiesCache::new()),
            tls: OnceCell::new(),
        })
    }

    /// Share a properties cache with other managers
    pub fn with_properties_cache(mut self, properties: Arc<ServerPropertiesCache>) -> Self {
        self.properties = properties;
        self
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn properties(&self) -> &Arc<ServerPropertiesCache> {
        &self.properties
    }

    /// Fresh, unopened connection for `account`
    pub fn connection_for(&self, account: &Account) -> Connection {
        Connection::new(account.clone(), self.config.clone())
    }

    /// Open, negotiate and authenticate `connection`. A connection is
    /// opened at most once; on failure it is left `Disconnected` with
    /// nothing open behind it.
    pub async fn connect(&self, connection: &Connection) -> Result<AuthResponse> {
        connection.account().validate()?;
        if connection.state() != ConnectionState::Disconnected
            || connection.startup_response().is_some()
        {
            return Err(Error::IllegalArgument(
                "connection has already been opened".into(),
            ));
        }
        match self.establish(connection).await {
            Ok(response) => Ok(response),
            Err(e) => {
                warn!(
                    "Connection to {} failed: {}",
                    connection.account().address(),
                    e
                );
                connection.disconnect_with_error().await;
                Err(e)
            }
        }
    }

    /// New authenticated connection for `account`
    pub async fn current_connection(&self, account: &Account) -> Result<(Connection, AuthResponse)> {
        let connection = self.connection_for(account);
        let response = self.connect(&connection).await?;
        Ok((connection, response))
    }

    async fn establish(&self, connection: &Connection) -> Result<AuthResponse> {
        let account = connection.account();
        let config = &self.config;
        let policy = config.negotiation_policy;

        connection.set_state(ConnectionState::Connecting);
        info!("Connecting to {} as {}", account.address(), account.user_name());
        let mut channel = Channel::connect(
            account.host(),
            account.port(),
            config.connect_timeout,
            config.socket_timeout,
            config.max_message_size,
        )
        .await?;

        let startup = StartupPack {
            irods_prot: XML_PROTOCOL,
            reconn_flag: if config.reconnect { RECONNECT_FLAG } else { 0 },
            connect_cnt: 0,
            proxy_user: account.proxy_user_name().to_string(),
            proxy_zone: account.proxy_zone().to_string(),
            client_user: account.user_name().to_string(),
            client_zone: account.zone().to_string(),
            rel_version: RELEASE_VERSION.to_string(),
            api_version: API_VERSION.to_string(),
            option: build_startup_option(policy),
        };
        channel
            .send(&Message::from_pack(MessageType::Connect, &startup.to_pack()))
            .await?;

        if policy != NegotiationPolicy::NoNegotiation {
            connection.set_state(ConnectionState::Negotiating);
        }
        let negotiated = negotiate(&mut channel, policy).await?;
        let ssl = negotiated.outcome.is_ssl();
        let mut startup_data = StartupResponseData::from_version(&negotiated.version, ssl);

        if ssl {
            let connector = self
                .tls
                .get_or_try_init(|| async { TlsConnector::new(&config.tls) })
                .await?;
            let (encrypted, key) = encryption::wrap(
                channel,
                connector,
                account.host(),
                &config.encryption,
                config.connect_timeout,
            )
            .await?;
            channel = encrypted;
            startup_data.transport_key = Some(key);
        }
        connection.install(channel, startup_data.clone()).await;

        connection.set_state(ConnectionState::Authenticating);
        let mechanism = AuthenticationDispatcher::mechanism_for_account(account);
        let response = mechanism.authenticate(connection, account).await?;
        if !response.is_successful() {
            return Err(Error::AuthenticationFailed(format!(
                "{} login for {}: {}",
                response.auth_scheme(),
                account,
                response.message()
            )));
        }
        connection.complete(response.clone());

        self.properties.put(
            account.host(),
            account.zone(),
            ServerProperties {
                icat_enabled: true,
                api_version: startup_data.api_version.clone(),
                release_version: startup_data.release(),
                zone: account.zone().to_string(),
            },
        );
        connection.set_state(ConnectionState::Connected);
        info!(
            encrypted = ssl,
            release = %startup_data.release_version,
            "Connected to {} as {}",
            account.address(),
            response.authenticated_account().user_name()
        );

        if config.reconnect {
            if ssl {
                debug!("Reconnection is not available on encrypted channels");
            } else if startup_data.can_reconnect() {
                connection.start_reconnection();
            } else {
                debug!("Server issued no reconnect cookie");
            }
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn account(port: u16) -> Account {
        Account::new("127.0.0.1", port, "rods", "tempZone", "rods")
    }

    #[tokio::test]
    async fn test_fresh_connection_is_disconnected() {
        let connection = Connection::new(account(1247), Arc::new(ConnectionConfig::default()));
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert!(!connection.is_connected());
        assert!(!connection.is_channel_open());
        assert!(connection.startup_response().is_none());
        assert!(connection.reconnect_stats().is_none());

        connection.disconnect().await;
        connection.disconnect().await;
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_io_without_channel_is_not_connected() {
        let connection = Connection::new(account(1247), Arc::new(ConnectionConfig::default()));
        let err = connection.receive_packet().await.unwrap_err();
        assert!(matches!(err, Error::NotConnected));
    }

    #[tokio::test]
    async fn test_invalid_account_fails_before_io() {
        let manager = ConnectionManager::new(ConnectionConfig::default()).unwrap();
        let account = Account::new("127.0.0.1", 1, "rods", "", "rods");
        let err = manager.current_connection(&account).await.unwrap_err();
        assert!(matches!(err, Error::IllegalArgument(_)));
    }

    #[tokio::test]
    async fn test_refused_connect_is_connection_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let manager = ConnectionManager::new(ConnectionConfig::default()).unwrap();
        let err = manager.current_connection(&account(port)).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionError(_)), "{}", err);
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(socket);
        });

        let config = ConnectionConfig::default()
            .with_socket_timeout(Some(Duration::from_millis(100)));
        let manager = ConnectionManager::new(config).unwrap();
        let err = manager.current_connection(&account(port)).await.unwrap_err();
        assert!(err.is_timeout(), "{}", err);
        server.abort();
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Disconnected.to_string(), "DISCONNECTED");
        assert_eq!(ConnectionState::Reconnecting.to_string(), "RECONNECTING");
    }
}
