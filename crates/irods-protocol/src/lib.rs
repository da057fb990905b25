//! iRODS Wire Protocol
//!
//! Message framing and packing instructions shared by the connection client
//! and the test server. Every message is a 4-byte big-endian header length,
//! a `MsgHeader_PI` header, then the body, error and bytestream sections
//! whose lengths the header announces.
//!
//! # Example
//!
//! ```rust,ignore
//! use irods_protocol::{codec, Message, MessageType, PackInstruction};
//!
//! let pi = PackInstruction::new("CS_NEG_PI").with("status", 1);
//! codec::write_message(&mut stream, &Message::from_pack(MessageType::Negotiation, &pi)).await?;
//! let reply = codec::read_message(&mut stream, irods_protocol::MAX_MESSAGE_SIZE).await?;
//! ```

pub mod api;
pub mod codec;
mod error;
pub mod header;
pub mod messages;
pub mod negotiation;
pub mod packing;

pub use codec::Message;
pub use error::{ProtocolError, Result};
pub use header::{MessageType, MsgHeader};
pub use negotiation::{NegotiatedOutcome, NegotiationPolicy};
pub use packing::PackInstruction;

/// Release version announced by this client
pub const RELEASE_VERSION: &str = "rods4.3.0";

/// API version announced by this client
pub const API_VERSION: &str = "d";

/// Maximum message size (64 MiB)
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;
