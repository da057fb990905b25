//! Framed message channel over one socket

use crate::error::{Error, Result};
use crate::stream::ClientStream;
use irods_core::tls::TlsConnector;
use irods_protocol::{codec, Message, MsgHeader, ProtocolError};
use std::future::Future;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

/// One socket plus the framing and deadlines applied to it
pub(crate) struct Channel {
    stream: ClientStream,
    peer: String,
    read_timeout: Option<Duration>,
    max_message_size: usize,
}

impl Channel {
    /// Open a plaintext TCP channel within `connect_timeout`
    pub(crate) async fn connect(
        host: &str,
        port: u16,
        connect_timeout: Duration,
        read_timeout: Option<Duration>,
        max_message_size: usize,
    ) -> Result<Self> {
        let peer = format!("{}:{}", host, port);
        debug!("Opening socket to {}", peer);
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(peer.as_str()))
            .await
            .map_err(|_| {
                Error::Timeout(format!(
                    "connect to {} did not complete within {:?}",
                    peer, connect_timeout
                ))
            })?
            .map_err(|e| Error::ConnectionError(format!("{}: {}", peer, e)))?;
        stream.set_nodelay(true)?;

        Ok(Self {
            stream: ClientStream::Plaintext(stream),
            peer,
            read_timeout,
            max_message_size,
        })
    }

    pub(crate) fn peer(&self) -> &str {
        &self.peer
    }

    pub(crate) fn is_encrypted(&self) -> bool {
        self.stream.is_tls()
    }

    pub(crate) async fn send(&mut self, message: &Message) -> Result<()> {
        codec::write_message(&mut self.stream, message).await?;
        Ok(())
    }

    /// Send a header with no sections; its length fields carry parameters
    pub(crate) async fn send_header(&mut self, header: &MsgHeader) -> Result<()> {
        codec::write_header(&mut self.stream, header).await?;
        Ok(())
    }

    pub(crate) async fn receive(&mut self) -> Result<Message> {
        let max = self.max_message_size;
        let timeout = self.read_timeout;
        let peer = self.peer.clone();
        let message = with_deadline(timeout, &peer, codec::read_message(&mut self.stream, max))
            .await?
            .map_err(|e| framing(&peer, e))?;
        Ok(message)
    }

    pub(crate) async fn write_token(&mut self, token: &[u8]) -> Result<()> {
        codec::write_token(&mut self.stream, token).await?;
        Ok(())
    }

    pub(crate) async fn read_token(&mut self) -> Result<Vec<u8>> {
        let max = self.max_message_size;
        let timeout = self.read_timeout;
        let peer = self.peer.clone();
        let token = with_deadline(timeout, &peer, codec::read_token(&mut self.stream, max))
            .await?
            .map_err(|e| framing(&peer, e))?;
        Ok(token)
    }

    /// Run the TLS handshake over the existing socket, giving up after
    /// `deadline`
    pub(crate) async fn upgrade_tls(
        self,
        connector: &TlsConnector,
        host: &str,
        deadline: Duration,
    ) -> Result<Self> {
        let Channel {
            stream,
            peer,
            read_timeout,
            max_message_size,
        } = self;
        let tcp = match stream {
            ClientStream::Plaintext(tcp) => tcp,
            ClientStream::Tls(_) => {
                return Err(Error::Encryption(format!("{} is already encrypted", peer)))
            }
        };
        let tls = tokio::time::timeout(deadline, connector.connect(tcp, host))
            .await
            .map_err(|_| {
                Error::Timeout(format!(
                    "TLS handshake with {} did not complete within {:?}",
                    peer, deadline
                ))
            })??;
        debug!("TLS established with {}", peer);
        Ok(Self {
            stream: ClientStream::Tls(tls),
            peer,
            read_timeout,
            max_message_size,
        })
    }

    /// Close the socket. Errors are returned for logging only.
    pub(crate) async fn shutdown(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

/// A read that failed after the frame started leaves the socket mid-frame.
/// Transport errors keep their kind; everything else becomes `Framing`.
fn framing(peer: &str, e: ProtocolError) -> Error {
    if e.is_transport() {
        Error::Protocol(e)
    } else {
        Error::Framing {
            peer: peer.to_string(),
            source: e,
        }
    }
}

async fn with_deadline<F, T>(timeout: Option<Duration>, peer: &str, fut: F) -> Result<T>
where
    F: Future<Output = T>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| {
            Error::Timeout(format!("no data from {} within {:?}", peer, limit))
        }),
        None => Ok(fut.await),
    }
}
