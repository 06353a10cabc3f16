//! Minimal IPMI command envelope. Full command encoding is the business of
//! an external codec; the envelope here carries just enough structure for
//! correlation (the request sequence leads both directions) and for the few
//! commands the session layer itself issues.

use crate::handshake::CHANNEL_CURRENT;
use crate::shared::{Decode, Encode, IpmiError, IpmiResult, SizedRead, SizedWrite, Violation};
use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

pub const NETFN_APP: u8 = 0x06;
/// Response direction sets the low netfn bit.
pub const NETFN_RESPONSE_BIT: u8 = 0x01;

pub const CMD_GET_CHANNEL_AUTH_CAPABILITIES: u8 = 0x38;
pub const CMD_CLOSE_SESSION: u8 = 0x3C;

pub const COMPLETION_OK: u8 = 0x00;
/// Completion code the managed system reports when the session the request
/// arrived on has already expired.
pub const COMPLETION_INVALID_SESSION: u8 = 0x87;

/// An encapsulated command request. The sequence is the correlation key:
/// the sessionless tag before a session exists, the session sequence number
/// afterwards. The managed system echoes it in the response.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CommandRequest {
    pub sequence: u32,
    pub netfn: u8,
    pub command: u8,
    pub data: Vec<u8>,
}

impl CommandRequest {
    /// Get Channel Authentication Capabilities, used both as the third
    /// handshake stage and as the in-session keep-alive no-op.
    pub fn auth_capabilities(sequence: u32, suite: u8, privilege: u8) -> CommandRequest {
        CommandRequest {
            sequence,
            netfn: NETFN_APP,
            command: CMD_GET_CHANNEL_AUTH_CAPABILITIES,
            data: vec![CHANNEL_CURRENT, suite, privilege],
        }
    }

    /// Close Session for the supplied managed system session ID.
    pub fn close_session(sequence: u32, managed_session_id: u32) -> CommandRequest {
        let mut data = Vec::with_capacity(4);
        data.write_u32::<LittleEndian>(managed_session_id)
            .expect("Error writing session id");

        CommandRequest {
            sequence,
            netfn: NETFN_APP,
            command: CMD_CLOSE_SESSION,
            data,
        }
    }
}

impl Encode for CommandRequest {
    fn encode<W: SizedWrite>(&self, stream: &mut W) -> IpmiResult<()> {
        stream.write_u32::<BigEndian>(self.sequence)?;
        stream.write_u8(self.netfn)?;
        stream.write_u8(self.command)?;
        stream.write_all(&self.data)?;
        Ok(())
    }
}

impl Decode for CommandRequest {
    fn decode<R: SizedRead>(stream: &mut R) -> IpmiResult<CommandRequest> {
        let sequence = stream
            .read_u32::<BigEndian>()
            .map_err(|_| IpmiError::ProtocolViolation(Violation::Truncated))?;
        let netfn = stream
            .read_u8()
            .map_err(|_| IpmiError::ProtocolViolation(Violation::Truncated))?;
        let command = stream
            .read_u8()
            .map_err(|_| IpmiError::ProtocolViolation(Violation::Truncated))?;

        let mut data = vec![0u8; stream.remaining_data()];
        stream
            .read_exact(&mut data)
            .map_err(|_| IpmiError::ProtocolViolation(Violation::Truncated))?;

        Ok(CommandRequest {
            sequence,
            netfn,
            command,
            data,
        })
    }
}

/// An encapsulated command response.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CommandResponse {
    pub sequence: u32,
    pub netfn: u8,
    pub command: u8,
    pub completion: u8,
    pub data: Vec<u8>,
}

impl CommandResponse {
    /// Builds the response for a request, echoing its correlation sequence.
    pub fn for_request(request: &CommandRequest, completion: u8, data: Vec<u8>) -> CommandResponse {
        CommandResponse {
            sequence: request.sequence,
            netfn: request.netfn | NETFN_RESPONSE_BIT,
            command: request.command,
            completion,
            data,
        }
    }

    #[inline]
    pub fn is_ok(&self) -> bool {
        self.completion == COMPLETION_OK
    }
}

impl Encode for CommandResponse {
    fn encode<W: SizedWrite>(&self, stream: &mut W) -> IpmiResult<()> {
        stream.write_u32::<BigEndian>(self.sequence)?;
        stream.write_u8(self.netfn)?;
        stream.write_u8(self.command)?;
        stream.write_u8(self.completion)?;
        stream.write_all(&self.data)?;
        Ok(())
    }
}

impl Decode for CommandResponse {
    fn decode<R: SizedRead>(stream: &mut R) -> IpmiResult<CommandResponse> {
        let sequence = stream
            .read_u32::<BigEndian>()
            .map_err(|_| IpmiError::ProtocolViolation(Violation::Truncated))?;
        let netfn = stream
            .read_u8()
            .map_err(|_| IpmiError::ProtocolViolation(Violation::Truncated))?;
        let command = stream
            .read_u8()
            .map_err(|_| IpmiError::ProtocolViolation(Violation::Truncated))?;
        let completion = stream
            .read_u8()
            .map_err(|_| IpmiError::ProtocolViolation(Violation::Truncated))?;

        let mut data = vec![0u8; stream.remaining_data()];
        stream
            .read_exact(&mut data)
            .map_err(|_| IpmiError::ProtocolViolation(Violation::Truncated))?;

        Ok(CommandResponse {
            sequence,
            netfn,
            command,
            completion,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::{decode_from_slice, encode_to_vec};

    #[test]
    fn test_request_roundtrip() {
        let request = CommandRequest::auth_capabilities(42, 3, 4);
        let bytes = encode_to_vec(&request).unwrap();
        let decoded: CommandRequest = decode_from_slice(&bytes).unwrap();

        assert_eq!(decoded, request);
        assert_eq!(decoded.command, CMD_GET_CHANNEL_AUTH_CAPABILITIES);
    }

    #[test]
    fn test_response_echoes_sequence() {
        let request = CommandRequest::close_session(7, 0xAABBCCDD);
        let response = CommandResponse::for_request(&request, COMPLETION_OK, Vec::new());

        assert_eq!(response.sequence, 7);
        assert_eq!(response.netfn, NETFN_APP | NETFN_RESPONSE_BIT);
        assert!(response.is_ok());

        let bytes = encode_to_vec(&response).unwrap();
        let decoded: CommandResponse = decode_from_slice(&bytes).unwrap();
        assert_eq!(decoded, response);
    }

    #[test]
    fn test_truncated_response_fails() {
        let result: IpmiResult<CommandResponse> = decode_from_slice(&[0, 1, 2]);
        assert_eq!(
            result.unwrap_err(),
            IpmiError::ProtocolViolation(Violation::Truncated)
        );
    }
}
