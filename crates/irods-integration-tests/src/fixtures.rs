//! Test fixtures for integration tests
//!
//! [`TestServer`] is an in-process mock iRODS server. It speaks enough of
//! the protocol for connection tests:
//! - startup, SSL negotiation (or none) and the encrypted channel setup
//! - Standard, PAM (plugin and legacy), Kerberos and GSI logins
//! - cookie-based reconnection on a second port
//!
//! Everything the server sees is kept in a [`ServerRecord`] for assertions.

use crate::mocks::{CLIENT_TOKEN_PREFIX, SERVER_TOKEN};
use anyhow::{bail, ensure, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use irods_client::auth::challenge_response;
use irods_client::encryption::settings_from_header;
use irods_core::tls::{CertificateSource, TlsAcceptor, TlsSettings};
use irods_core::{Account, EncryptionSettings};
use irods_protocol::api::numbers::{
    AUTH_PLUG_REQ_AN, AUTH_REQUEST_AN, AUTH_RESPONSE_AN, GSI_AUTH_REQUEST_AN, KRB_AUTH_REQUEST_AN,
    PAM_AUTH_REQUEST_AN,
};
use irods_protocol::api::status::{
    CAT_INVALID_AUTHENTICATION, CAT_INVALID_USER, PAM_AUTH_ERROR, SYS_RECONN_OPR_MISMATCH,
    USER_AUTH_SCHEME_ERR,
};
use irods_protocol::messages::{
    AuthPluginRequestInp, AuthPluginRequestOut, AuthRequestOut, AuthResponseInp, CsNegPi,
    PamAuthRequestInp, PamAuthRequestOut, ReconnMsg, ServerNameOut, StartupPack, VersionPi,
};
use irods_protocol::negotiation::{NEGOTIATION_STATUS_SUCCESS, REQUEST_NEGOTIATION};
use irods_protocol::{
    codec, Message, MessageType, NegotiatedOutcome, NegotiationPolicy, MAX_MESSAGE_SIZE,
};
use parking_lot::Mutex;
use rand::RngCore;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Zone every test account lives in
pub const TEST_ZONE: &str = "tempZone";

/// Principal the server reports for Kerberos and GSI logins
pub const SERVER_PRINCIPAL: &str = "irods/localhost@EXAMPLE.ORG";

/// Mock-only API: replies with the request body unchanged
pub const ECHO_AN: i32 = 90_001;

/// Mock-only API: replies with a frame of [`OVERSIZED_REPLY_LEN`] error bytes
pub const OVERSIZED_REPLY_AN: i32 = 90_002;

pub const OVERSIZED_REPLY_LEN: usize = 4096;

// ============================================================================
// Configuration
// ============================================================================

/// Behaviour of a [`TestServer`]
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Policy offered in `CS_NEG_PI`; `None` answers with `Version_PI`
    /// straight away, like a server that does not negotiate
    pub policy: Option<NegotiationPolicy>,
    pub release_version: String,
    /// `user#zone` -> password
    pub users: HashMap<String, String>,
    /// PAM user -> PAM password
    pub pam_users: HashMap<String, String>,
    /// Kerberos / GSI principals allowed to log in
    pub principals: HashSet<String>,
    /// Reconnect cookie; enables the reconnect listener
    pub cookie: Option<i32>,
    /// Answer reconnect requests with an error
    pub refuse_reconnect: bool,
    /// After agreeing on SSL, never answer the TLS handshake
    pub stall_tls_handshake: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let mut users = HashMap::new();
        users.insert(format!("rods#{}", TEST_ZONE), "rods".to_string());
        users.insert(format!("anonymous#{}", TEST_ZONE), String::new());
        Self {
            policy: Some(NegotiationPolicy::DontCare),
            release_version: "rods4.3.0".to_string(),
            users,
            pam_users: HashMap::new(),
            principals: HashSet::new(),
            cookie: None,
            refuse_reconnect: false,
            stall_tls_handshake: false,
        }
    }
}

impl ServerConfig {
    pub fn with_policy(mut self, policy: NegotiationPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn without_negotiation(mut self) -> Self {
        self.policy = None;
        self
    }

    pub fn with_release(mut self, release: impl Into<String>) -> Self {
        self.release_version = release.into();
        self
    }

    pub fn with_user(mut self, user: &str, password: &str) -> Self {
        self.users
            .insert(format!("{}#{}", user, TEST_ZONE), password.to_string());
        self
    }

    pub fn with_pam_user(mut self, user: &str, pam_password: &str) -> Self {
        self.pam_users
            .insert(user.to_string(), pam_password.to_string());
        self
    }

    pub fn with_principal(mut self, principal: &str) -> Self {
        self.principals.insert(principal.to_string());
        self
    }

    pub fn with_reconnect(mut self, cookie: i32) -> Self {
        self.cookie = Some(cookie);
        self
    }

    pub fn refusing_reconnect(mut self) -> Self {
        self.refuse_reconnect = true;
        self
    }

    pub fn stalling_tls_handshake(mut self) -> Self {
        self.stall_tls_handshake = true;
        self
    }
}

// ============================================================================
// Record
// ============================================================================

/// What the server has seen so far
#[derive(Debug, Default)]
pub struct ServerRecord {
    connections: AtomicUsize,
    disconnects: AtomicUsize,
    reconnects: AtomicUsize,
    startups: Mutex<Vec<StartupPack>>,
    negotiation_replies: Mutex<Vec<CsNegPi>>,
    encryption: Mutex<Vec<EncryptionSettings>>,
    shared_secrets: Mutex<Vec<usize>>,
    logins: Mutex<Vec<String>>,
    api_calls: Mutex<Vec<i32>>,
}

impl ServerRecord {
    /// Sockets accepted on the main port
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// `RODS_DISCONNECT` messages received
    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    /// Accepted reconnections
    pub fn reconnects(&self) -> usize {
        self.reconnects.load(Ordering::SeqCst)
    }

    pub fn startups(&self) -> Vec<StartupPack> {
        self.startups.lock().clone()
    }

    /// `CS_NEG_PI` messages sent by clients
    pub fn negotiation_replies(&self) -> Vec<CsNegPi> {
        self.negotiation_replies.lock().clone()
    }

    /// Encryption headers received after SSL negotiation
    pub fn encryption_headers(&self) -> Vec<EncryptionSettings> {
        self.encryption.lock().clone()
    }

    /// Length of each shared secret received
    pub fn shared_secret_lengths(&self) -> Vec<usize> {
        self.shared_secrets.lock().clone()
    }

    /// Identities that logged in successfully
    pub fn logins(&self) -> Vec<String> {
        self.logins.lock().clone()
    }

    /// API numbers requested, in order
    pub fn api_calls(&self) -> Vec<i32> {
        self.api_calls.lock().clone()
    }
}

// ============================================================================
// TestServer
// ============================================================================

struct Shared {
    config: ServerConfig,
    acceptor: TlsAcceptor,
    record: Arc<ServerRecord>,
    reconnect_port: u16,
    /// `user#zone` -> temporary passwords issued through PAM
    temporary: Mutex<HashMap<String, HashSet<String>>>,
}

impl Shared {
    fn accepts(&self, challenge: &str, answer: &AuthResponseInp) -> bool {
        let mut candidates: Vec<String> =
            self.config.users.get(&answer.username).cloned().into_iter().collect();
        if let Some(issued) = self.temporary.lock().get(&answer.username) {
            candidates.extend(issued.iter().cloned());
        }
        candidates.iter().any(|password| {
            challenge_response(challenge, password)
                .map(|expected| expected == answer.response)
                .unwrap_or(false)
        })
    }

    fn issue_temporary(&self, user: &str, password: &str, zone: &str) -> Option<String> {
        if self.config.pam_users.get(user)? != password {
            return None;
        }
        let temporary = uuid::Uuid::new_v4().simple().to_string();
        self.temporary
            .lock()
            .entry(format!("{}#{}", user, zone))
            .or_default()
            .insert(temporary.clone());
        Some(temporary)
    }
}

#[derive(Debug, Clone, Copy)]
enum Role {
    Primary,
    Reconnect,
}

/// An in-process mock iRODS server for testing
pub struct TestServer {
    pub addr: SocketAddr,
    pub reconnect_addr: Option<SocketAddr>,
    cert_pem: String,
    record: Arc<ServerRecord>,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl TestServer {
    /// Start a server with the default configuration on a random port
    pub async fn start() -> Result<Self> {
        Self::start_with_config(ServerConfig::default()).await
    }

    pub async fn start_with_config(config: ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (acceptor, cert_pem) = TlsAcceptor::self_signed("localhost")?;

        let reconnect_listener = match config.cookie {
            Some(_) => Some(TcpListener::bind("127.0.0.1:0").await?),
            None => None,
        };
        let reconnect_addr = reconnect_listener
            .as_ref()
            .map(TcpListener::local_addr)
            .transpose()?;

        let record = Arc::new(ServerRecord::default());
        let shared = Arc::new(Shared {
            config,
            acceptor,
            record: record.clone(),
            reconnect_port: reconnect_addr.map(|a| a.port()).unwrap_or(0),
            temporary: Mutex::new(HashMap::new()),
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handles = vec![tokio::spawn(accept_loop(
            listener,
            shared.clone(),
            shutdown_rx.clone(),
            Role::Primary,
        ))];
        if let Some(listener) = reconnect_listener {
            handles.push(tokio::spawn(accept_loop(
                listener,
                shared,
                shutdown_rx,
                Role::Reconnect,
            )));
        }

        info!("Mock iRODS server listening on {}", addr);
        Ok(Self {
            addr,
            reconnect_addr,
            cert_pem,
            record,
            shutdown_tx,
            handles,
        })
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Account on this server in [`TEST_ZONE`]
    pub fn account(&self, user: &str, password: &str) -> Account {
        Account::new("127.0.0.1", self.port(), user, TEST_ZONE, password)
    }

    /// Client TLS settings trusting this server's certificate
    pub fn tls_settings(&self) -> TlsSettings {
        TlsSettings {
            root_ca: Some(CertificateSource::Pem {
                content: self.cert_pem.clone(),
            }),
            ..TlsSettings::default()
        }
        .with_server_name("localhost")
    }

    pub fn record(&self) -> &ServerRecord {
        &self.record
    }

    /// Shared record for spawned tasks
    pub fn record_handle(&self) -> Arc<ServerRecord> {
        self.record.clone()
    }

    /// Stop accepting connections
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        for handle in std::mem::take(&mut self.handles) {
            let _ = handle.await;
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
    role: Role,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                let (socket, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Mock server accept failed: {}", e);
                        break;
                    }
                };
                let shared = shared.clone();
                tokio::spawn(async move {
                    let result = match role {
                        Role::Primary => serve_connection(socket, &shared).await,
                        Role::Reconnect => serve_reconnect(socket, &shared).await,
                    };
                    if let Err(e) = result {
                        debug!("Mock session with {} ended: {:#}", peer, e);
                    }
                });
            }
        }
    }
}

// ============================================================================
// Sessions
// ============================================================================

struct Session {
    zone: String,
    challenge: Option<String>,
}

/// How long a stalled session holds its socket
const STALL: std::time::Duration = std::time::Duration::from_secs(30);

async fn serve_connection(mut socket: TcpStream, shared: &Shared) -> Result<()> {
    shared.record.connections.fetch_add(1, Ordering::SeqCst);

    let message = codec::read_message(&mut socket, MAX_MESSAGE_SIZE).await?;
    ensure!(
        message.msg_type() == &MessageType::Connect,
        "expected RODS_CONNECT, got {}",
        message.msg_type()
    );
    let startup = StartupPack::from_pack(&message.body_pack()?)?;
    shared.record.startups.lock().push(startup.clone());

    let mut ssl = false;
    if let (true, Some(policy)) = (
        startup.option.contains(REQUEST_NEGOTIATION),
        shared.config.policy,
    ) {
        let offer = CsNegPi::new(NEGOTIATION_STATUS_SUCCESS, policy.as_str());
        codec::write_message(
            &mut socket,
            &Message::from_pack(MessageType::Negotiation, &offer.to_pack()),
        )
        .await?;

        let reply = codec::read_message(&mut socket, MAX_MESSAGE_SIZE).await?;
        let answer = CsNegPi::from_pack(&reply.body_pack()?)?;
        shared.record.negotiation_replies.lock().push(answer.clone());
        if answer.status != NEGOTIATION_STATUS_SUCCESS {
            debug!("Client abandoned negotiation: {}", answer.result);
            return Ok(());
        }
        match NegotiatedOutcome::from_result_keyword(&answer.result) {
            Some(NegotiatedOutcome::UseSsl) => ssl = true,
            Some(NegotiatedOutcome::UseTcp) => {}
            _ => bail!("unusable negotiation result {}", answer.result),
        }
    }

    let version = VersionPi {
        status: 0,
        rel_version: shared.config.release_version.clone(),
        api_version: "d".to_string(),
        reconn_port: i32::from(shared.reconnect_port),
        reconn_addr: if shared.reconnect_port == 0 {
            String::new()
        } else {
            "127.0.0.1".to_string()
        },
        cookie: shared.config.cookie.unwrap_or(0),
    };
    codec::write_message(
        &mut socket,
        &Message::from_pack(MessageType::Version, &version.to_pack()),
    )
    .await?;

    let mut session = Session {
        zone: startup.proxy_zone.clone(),
        challenge: None,
    };
    if ssl && shared.config.stall_tls_handshake {
        debug!("Holding the ClientHello unanswered");
        tokio::time::sleep(STALL).await;
        return Ok(());
    }
    if ssl {
        let mut tls = shared.acceptor.accept(socket).await?;
        let header = codec::read_header(&mut tls).await?;
        shared
            .record
            .encryption
            .lock()
            .push(settings_from_header(&header));

        let secret = codec::read_message(&mut tls, MAX_MESSAGE_SIZE).await?;
        ensure!(
            secret.msg_type() == &MessageType::SharedSecret,
            "expected SHARED_SECRET, got {}",
            secret.msg_type()
        );
        shared.record.shared_secrets.lock().push(secret.body.len());
        serve_requests(&mut tls, shared, &mut session).await
    } else {
        serve_requests(&mut socket, shared, &mut session).await
    }
}

async fn serve_reconnect(mut socket: TcpStream, shared: &Shared) -> Result<()> {
    let message = codec::read_message(&mut socket, MAX_MESSAGE_SIZE).await?;
    ensure!(
        message.msg_type() == &MessageType::Reconnect,
        "expected RODS_RECONNECT, got {}",
        message.msg_type()
    );
    let request = ReconnMsg::from_pack(&message.body_pack()?)?;

    if shared.config.refuse_reconnect || shared.config.cookie != Some(request.cookie) {
        let refusal = ReconnMsg {
            status: SYS_RECONN_OPR_MISMATCH,
            ..ReconnMsg::new(request.cookie)
        };
        codec::write_message(
            &mut socket,
            &Message::from_pack(MessageType::Reconnect, &refusal.to_pack())
                .with_int_info(SYS_RECONN_OPR_MISMATCH),
        )
        .await?;
        return Ok(());
    }

    shared.record.reconnects.fetch_add(1, Ordering::SeqCst);
    codec::write_message(
        &mut socket,
        &Message::from_pack(MessageType::Reconnect, &ReconnMsg::new(request.cookie).to_pack()),
    )
    .await?;

    let mut session = Session {
        zone: TEST_ZONE.to_string(),
        challenge: None,
    };
    serve_requests(&mut socket, shared, &mut session).await
}

async fn serve_requests<S>(stream: &mut S, shared: &Shared, session: &mut Session) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let message = match codec::read_message(stream, MAX_MESSAGE_SIZE).await {
            Ok(message) => message,
            Err(e) if e.is_transport() => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        match message.msg_type() {
            MessageType::Disconnect => {
                shared.record.disconnects.fetch_add(1, Ordering::SeqCst);
                return Ok(());
            }
            MessageType::ApiRequest => {}
            other => bail!("unexpected {} during session", other),
        }

        let api = message.int_info();
        shared.record.api_calls.lock().push(api);
        let reply = match api {
            AUTH_REQUEST_AN => {
                let mut raw = [0u8; 64];
                rand::thread_rng().fill_bytes(&mut raw);
                let challenge = BASE64.encode(raw);
                session.challenge = Some(challenge.clone());
                Message::api_reply(0, Some(&AuthRequestOut { challenge }.to_pack()))
            }
            AUTH_RESPONSE_AN => {
                let answer = AuthResponseInp::from_pack(&message.body_pack()?)?;
                let accepted = session
                    .challenge
                    .as_deref()
                    .map(|challenge| shared.accepts(challenge, &answer))
                    .unwrap_or(false);
                if accepted {
                    shared.record.logins.lock().push(answer.username);
                    Message::api_reply(0, None)
                } else {
                    error_reply(CAT_INVALID_AUTHENTICATION, "invalid password")
                }
            }
            AUTH_PLUG_REQ_AN => {
                let request = AuthPluginRequestInp::from_pack(&message.body_pack()?)?;
                let user = request.context_value("a_user").unwrap_or_default();
                let password = request.context_value("a_pw").unwrap_or_default();
                match shared.issue_temporary(user, password, &session.zone) {
                    Some(result) => {
                        Message::api_reply(0, Some(&AuthPluginRequestOut { result }.to_pack()))
                    }
                    None => error_reply(PAM_AUTH_ERROR, "PAM authentication failed"),
                }
            }
            PAM_AUTH_REQUEST_AN => {
                let request = PamAuthRequestInp::from_pack(&message.body_pack()?)?;
                match shared.issue_temporary(&request.pam_user, &request.pam_password, &session.zone)
                {
                    Some(irods_pam_password) => Message::api_reply(
                        0,
                        Some(&PamAuthRequestOut { irods_pam_password }.to_pack()),
                    ),
                    None => error_reply(PAM_AUTH_ERROR, "PAM authentication failed"),
                }
            }
            KRB_AUTH_REQUEST_AN | GSI_AUTH_REQUEST_AN => {
                let name = ServerNameOut {
                    name: SERVER_PRINCIPAL.to_string(),
                };
                let pack = if api == KRB_AUTH_REQUEST_AN {
                    name.to_krb_pack()
                } else {
                    name.to_gsi_pack()
                };
                codec::write_message(stream, &Message::api_reply(0, Some(&pack))).await?;

                let token = codec::read_token(stream, MAX_MESSAGE_SIZE).await?;
                let principal = std::str::from_utf8(&token)
                    .ok()
                    .and_then(|t| t.strip_prefix(CLIENT_TOKEN_PREFIX))
                    .unwrap_or_default()
                    .to_string();
                codec::write_token(stream, SERVER_TOKEN).await?;

                if shared.config.principals.contains(&principal) {
                    shared.record.logins.lock().push(principal);
                    Message::api_reply(0, None)
                } else {
                    error_reply(CAT_INVALID_USER, "unknown principal")
                }
            }
            ECHO_AN => Message::new(MessageType::ApiReply, message.body.clone()).with_int_info(0),
            OVERSIZED_REPLY_AN => {
                Message::api_reply(0, None).with_error("x".repeat(OVERSIZED_REPLY_LEN))
            }
            _ => error_reply(USER_AUTH_SCHEME_ERR, "unsupported API"),
        };
        codec::write_message(stream, &reply).await?;
    }
}

fn error_reply(status: i32, text: &str) -> Message {
    Message::api_reply(status, None).with_error(text.to_string())
}
