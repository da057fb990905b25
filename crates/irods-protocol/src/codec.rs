//! Frame codec
//!
//! ```text
//! +-----------------+----------------------+------+-------+------------+
//! | header len (BE) | MsgHeader_PI (XML)   | body | error | bytestream |
//! |    4 bytes      | header len bytes     | msgLen | errorLen | bsLen  |
//! +-----------------+----------------------+------+-------+------------+
//! ```

use crate::error::{ProtocolError, Result};
use crate::header::{MessageType, MsgHeader, MAX_HEADER_SIZE};
use crate::packing::PackInstruction;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// A complete protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: MsgHeader,
    pub body: Bytes,
    pub error: Bytes,
    pub bytestream: Bytes,
}

impl Message {
    pub fn new(msg_type: MessageType, body: impl Into<Bytes>) -> Self {
        Self {
            header: MsgHeader::new(msg_type),
            body: body.into(),
            error: Bytes::new(),
            bytestream: Bytes::new(),
        }
    }

    /// Message whose body is a packing instruction
    pub fn from_pack(msg_type: MessageType, pi: &PackInstruction) -> Self {
        Self::new(msg_type, pi.to_bytes())
    }

    /// `RODS_API_REQ` for `api_number`, with an optional body
    pub fn api_request(api_number: i32, body: Option<&PackInstruction>) -> Self {
        let body = body.map(PackInstruction::to_bytes).unwrap_or_default();
        Self::new(MessageType::ApiRequest, body).with_int_info(api_number)
    }

    /// `RODS_API_REPLY` carrying `status` in `intInfo`
    pub fn api_reply(status: i32, body: Option<&PackInstruction>) -> Self {
        let body = body.map(PackInstruction::to_bytes).unwrap_or_default();
        Self::new(MessageType::ApiReply, body).with_int_info(status)
    }

    pub fn with_int_info(mut self, int_info: i32) -> Self {
        self.header.int_info = int_info;
        self
    }

    pub fn with_error(mut self, error: impl Into<Bytes>) -> Self {
        self.error = error.into();
        self
    }

    pub fn with_bytestream(mut self, bs: impl Into<Bytes>) -> Self {
        self.bytestream = bs.into();
        self
    }

    pub fn msg_type(&self) -> &MessageType {
        &self.header.msg_type
    }

    pub fn int_info(&self) -> i32 {
        self.header.int_info
    }

    /// Parse the body as a packing instruction
    pub fn body_pack(&self) -> Result<PackInstruction> {
        PackInstruction::parse(&self.body)
    }

    /// Error section as text, if the server sent one
    pub fn error_text(&self) -> Option<String> {
        if self.error.is_empty() {
            None
        } else {
            Some(
                String::from_utf8_lossy(&self.error)
                    .trim_matches(|c: char| c == '\0' || c.is_whitespace())
                    .to_string(),
            )
        }
    }

    /// Header with lengths matching the actual sections
    pub fn framed_header(&self) -> MsgHeader {
        MsgHeader {
            msg_len: self.body.len() as u32,
            error_len: self.error.len() as u32,
            bs_len: self.bytestream.len() as u32,
            ..self.header.clone()
        }
    }

    /// Encode to wire bytes including the length prefix
    pub fn encode(&self) -> Result<Bytes> {
        let header = encode_header(&self.framed_header())?;
        let mut buf = BytesMut::with_capacity(
            header.len() + self.body.len() + self.error.len() + self.bytestream.len(),
        );
        buf.put_slice(&header);
        buf.put_slice(&self.body);
        buf.put_slice(&self.error);
        buf.put_slice(&self.bytestream);
        Ok(buf.freeze())
    }
}

/// Encode a header exactly as given (length prefix plus XML). Used directly
/// for header-only messages whose length fields carry parameters.
pub fn encode_header(header: &MsgHeader) -> Result<Bytes> {
    let xml = header.encode()?;
    let mut buf = BytesMut::with_capacity(4 + xml.len());
    buf.put_u32(xml.len() as u32);
    buf.put_slice(&xml);
    Ok(buf.freeze())
}

/// Decode a length-prefixed header from a byte slice
pub fn decode_header(data: &[u8]) -> Result<MsgHeader> {
    if data.len() < 4 {
        return Err(ProtocolError::InvalidFormat("short header prefix".into()));
    }
    let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if len > MAX_HEADER_SIZE {
        return Err(ProtocolError::MessageTooLarge(len, MAX_HEADER_SIZE));
    }
    let body = data
        .get(4..4 + len)
        .ok_or_else(|| ProtocolError::InvalidFormat("truncated header".into()))?;
    MsgHeader::decode(body)
}

/// Write a complete message and flush
pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = message.encode()?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Write a header-only message and flush
pub async fn write_header<W>(writer: &mut W, header: &MsgHeader) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = encode_header(header)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one header. A clean EOF before the first byte is `ConnectionClosed`.
pub async fn read_header<R>(reader: &mut R) -> Result<MsgHeader>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await.map_err(eof_as_closed)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 {
        return Err(ProtocolError::InvalidFormat("zero-length header".into()));
    }
    if len > MAX_HEADER_SIZE {
        return Err(ProtocolError::MessageTooLarge(len, MAX_HEADER_SIZE));
    }

    let mut header_buf = vec![0u8; len];
    reader.read_exact(&mut header_buf).await.map_err(eof_as_closed)?;
    MsgHeader::decode(&header_buf)
}

/// Read one complete message, rejecting payloads over `max_size`
pub async fn read_message<R>(reader: &mut R, max_size: usize) -> Result<Message>
where
    R: AsyncRead + Unpin,
{
    let header = read_header(reader).await?;

    // Validate size before allocating
    let total = header.payload_len();
    if total > max_size {
        return Err(ProtocolError::MessageTooLarge(total, max_size));
    }

    let body = read_section(reader, header.msg_len as usize).await?;
    let error = read_section(reader, header.error_len as usize).await?;
    let bytestream = read_section(reader, header.bs_len as usize).await?;

    Ok(Message {
        header,
        body,
        error,
        bytestream,
    })
}

async fn read_section<R>(reader: &mut R, len: usize) -> Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    if len == 0 {
        return Ok(Bytes::new());
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await.map_err(eof_as_closed)?;
    Ok(Bytes::from(buf))
}

/// Write a raw security token (Kerberos / GSI exchange)
pub async fn write_token<W>(writer: &mut W, token: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_u32(token.len() as u32).await?;
    writer.write_all(token).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a raw security token written by [`write_token`]
pub async fn read_token<R>(reader: &mut R, max_size: usize) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32().await.map_err(eof_as_closed)? as usize;
    if len > max_size {
        return Err(ProtocolError::MessageTooLarge(len, max_size));
    }
    let mut token = vec![0u8; len];
    reader.read_exact(&mut token).await.map_err(eof_as_closed)?;
    Ok(token)
}

fn eof_as_closed(e: std::io::Error) -> ProtocolError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        ProtocolError::ConnectionClosed
    } else {
        ProtocolError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MAX_MESSAGE_SIZE;

    #[tokio::test]
    async fn test_write_then_read_message() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let pi = PackInstruction::new("authResponseInp_PI")
            .with("response", "abc")
            .with("username", "rods#tempZone");
        let msg = Message::api_request(704, Some(&pi)).with_bytestream(&b"xyz"[..]);

        write_message(&mut client, &msg).await.unwrap();
        let received = read_message(&mut server, MAX_MESSAGE_SIZE).await.unwrap();

        assert_eq!(received.msg_type(), &MessageType::ApiRequest);
        assert_eq!(received.int_info(), 704);
        assert_eq!(received.header.msg_len as usize, pi.to_bytes().len());
        assert_eq!(received.body_pack().unwrap(), pi);
        assert_eq!(&received.bytestream[..], b"xyz");
        assert!(received.error_text().is_none());
    }

    #[tokio::test]
    async fn test_read_rejects_oversized_payload() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let msg = Message::new(MessageType::ApiReply, vec![b'a'; 128]);
        write_message(&mut client, &msg).await.unwrap();

        let err = read_message(&mut server, 64).await.unwrap_err();
        assert!(matches!(err, ProtocolError::MessageTooLarge(128, 64)));
    }

    #[tokio::test]
    async fn test_eof_is_connection_closed() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        let err = read_message(&mut server, MAX_MESSAGE_SIZE).await.unwrap_err();
        assert!(matches!(err, ProtocolError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_header_only_message_keeps_length_fields() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let header = MsgHeader {
            msg_type: MessageType::Other("AES-256-CBC".into()),
            msg_len: 32,
            error_len: 8,
            bs_len: 16,
            int_info: 0,
        };
        write_header(&mut client, &header).await.unwrap();
        assert_eq!(read_header(&mut server).await.unwrap(), header);
    }

    #[tokio::test]
    async fn test_token_exchange() {
        let (mut client, mut server) = tokio::io::duplex(256);
        write_token(&mut client, b"token-1").await.unwrap();
        assert_eq!(read_token(&mut server, 1024).await.unwrap(), b"token-1");
    }

    #[test]
    fn test_decode_header_slice() {
        let header = MsgHeader::new(MessageType::Disconnect);
        let bytes = encode_header(&header).unwrap();
        assert_eq!(decode_header(&bytes).unwrap(), header);
        assert!(decode_header(&bytes[..6]).is_err());
        assert!(decode_header(&[0, 0]).is_err());
    }

    #[test]
    fn test_error_text_trims_padding() {
        let msg = Message::api_reply(-826000, None).with_error(&b"bad password\0\0"[..]);
        assert_eq!(msg.error_text().as_deref(), Some("bad password"));
    }
}
