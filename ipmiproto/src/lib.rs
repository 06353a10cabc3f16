//! Protocol-level support for the RMCP+ / IPMI v2.0 client: error plumbing,
//! logging, crypto primitives, the cipher suite registry and the wire codecs
//! for the session envelope and the RAKP handshake payloads.

/// RMCP version carried in every datagram header.
pub const RMCP_VERSION: u8 = 0x06;
/// RMCP sequence number for messages that must not be acknowledged.
pub const RMCP_SEQ_NO_ACK: u8 = 0xFF;
/// RMCP message class for IPMI traffic.
pub const CLASS_IPMI: u8 = 0x07;
/// RMCP message class for ASF traffic (presence ping/pong).
pub const CLASS_ASF: u8 = 0x06;
/// Authentication type marking a packet as RMCP+ format.
pub const AUTH_TYPE_RMCP_PLUS: u8 = 0x06;
/// Well known UDP port of the managed system.
pub const IPMI_PORT: u16 = 623;

pub mod cipher;
pub mod command;
pub mod crypto;
pub mod handshake;
pub mod logging;
pub mod shared;
pub mod wire;
