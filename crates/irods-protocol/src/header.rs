//! Message header (`MsgHeader_PI`)

use crate::error::{ProtocolError, Result};
use crate::packing::PackInstruction;
use std::fmt;

/// Root tag of the message header
pub const MSG_HEADER_PI: &str = "MsgHeader_PI";

/// Maximum size of an encoded header; the server rejects longer headers
pub const MAX_HEADER_SIZE: usize = 1088;

/// Value of the header `type` field
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageType {
    Connect,
    Version,
    Negotiation,
    ApiRequest,
    ApiReply,
    Disconnect,
    Reconnect,
    SharedSecret,
    /// Any other type string. The encryption parameter header puts the
    /// algorithm name here.
    Other(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::Connect => "RODS_CONNECT",
            MessageType::Version => "RODS_VERSION",
            MessageType::Negotiation => "RODS_CS_NEG_T",
            MessageType::ApiRequest => "RODS_API_REQ",
            MessageType::ApiReply => "RODS_API_REPLY",
            MessageType::Disconnect => "RODS_DISCONNECT",
            MessageType::Reconnect => "RODS_RECONNECT",
            MessageType::SharedSecret => "SHARED_SECRET",
            MessageType::Other(s) => s.as_str(),
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "RODS_CONNECT" => MessageType::Connect,
            "RODS_VERSION" => MessageType::Version,
            "RODS_CS_NEG_T" => MessageType::Negotiation,
            "RODS_API_REQ" => MessageType::ApiRequest,
            "RODS_API_REPLY" => MessageType::ApiReply,
            "RODS_DISCONNECT" => MessageType::Disconnect,
            "RODS_RECONNECT" => MessageType::Reconnect,
            "SHARED_SECRET" => MessageType::SharedSecret,
            other => MessageType::Other(other.to_string()),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed header that precedes every message body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgHeader {
    pub msg_type: MessageType,
    pub msg_len: u32,
    pub error_len: u32,
    pub bs_len: u32,
    /// API number on requests, status on replies
    pub int_info: i32,
}

impl MsgHeader {
    pub fn new(msg_type: MessageType) -> Self {
        Self {
            msg_type,
            msg_len: 0,
            error_len: 0,
            bs_len: 0,
            int_info: 0,
        }
    }

    /// Total number of bytes that follow the header
    pub fn payload_len(&self) -> usize {
        self.msg_len as usize + self.error_len as usize + self.bs_len as usize
    }

    pub fn to_pack(&self) -> PackInstruction {
        PackInstruction::new(MSG_HEADER_PI)
            .with("type", self.msg_type.as_str())
            .with("msgLen", self.msg_len)
            .with("errorLen", self.error_len)
            .with("bsLen", self.bs_len)
            .with("intInfo", self.int_info)
    }

    /// Encode as packed XML (without the 4-byte length prefix)
    pub fn encode(&self) -> Result<Vec<u8>> {
        let bytes = self.to_pack().to_xml().into_bytes();
        if bytes.len() > MAX_HEADER_SIZE {
            return Err(ProtocolError::MessageTooLarge(bytes.len(), MAX_HEADER_SIZE));
        }
        Ok(bytes)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let pi = PackInstruction::parse(data)?.expect_name(MSG_HEADER_PI)?;
        Ok(Self {
            msg_type: MessageType::parse(pi.require("type")?.trim()),
            msg_len: pi.require_parsed("msgLen")?,
            error_len: pi.require_parsed("errorLen")?,
            bs_len: pi.require_parsed("bsLen")?,
            int_info: pi.require_parsed("intInfo")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_names() {
        for t in [
            MessageType::Connect,
            MessageType::Version,
            MessageType::Negotiation,
            MessageType::ApiRequest,
            MessageType::ApiReply,
            MessageType::Disconnect,
            MessageType::Reconnect,
            MessageType::SharedSecret,
        ] {
            assert_eq!(MessageType::parse(t.as_str()), t);
        }
        assert_eq!(
            MessageType::parse("AES-256-CBC"),
            MessageType::Other("AES-256-CBC".to_string())
        );
    }

    #[test]
    fn test_header_decode() {
        let xml = b"<MsgHeader_PI>\n<type>RODS_API_REPLY</type>\n<msgLen>12</msgLen>\n<errorLen>0</errorLen>\n<bsLen>3</bsLen>\n<intInfo>-826000</intInfo>\n</MsgHeader_PI>\n";
        let header = MsgHeader::decode(xml).unwrap();
        assert_eq!(header.msg_type, MessageType::ApiReply);
        assert_eq!(header.msg_len, 12);
        assert_eq!(header.bs_len, 3);
        assert_eq!(header.int_info, -826000);
        assert_eq!(header.payload_len(), 15);
    }

    #[test]
    fn test_header_rejects_other_root() {
        let xml = b"<Version_PI><status>0</status></Version_PI>";
        assert!(MsgHeader::decode(xml).is_err());
    }

    #[test]
    fn test_header_too_long() {
        let header = MsgHeader::new(MessageType::Other("x".repeat(MAX_HEADER_SIZE)));
        assert!(matches!(
            header.encode(),
            Err(ProtocolError::MessageTooLarge(_, MAX_HEADER_SIZE))
        ));
    }
}
