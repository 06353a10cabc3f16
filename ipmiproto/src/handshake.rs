//! Codecs for the RMCP+ handshake payloads: Get Channel Cipher Suites, Open
//! Session and RAKP 1 through 4. Requests are encoded by the console side,
//! responses decoded from the managed system; both directions are kept so
//! mock managed systems can speak the protocol in tests.

use crate::shared::{
    Decode, Encode, IpmiError, IpmiResult, SizedRead, SizedWrite, Violation,
};
use crate::wire::PayloadType;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

pub const RAKP_NONCE_SIZE: usize = 16;
pub const GUID_SIZE: usize = 16;
pub const MAX_USERNAME_SIZE: usize = 16;

/// Requestable channel for "the channel this request arrived on".
pub const CHANNEL_CURRENT: u8 = 0x0E;

/// RAKP and Open Session status codes.
pub mod status {
    pub const NO_ERROR: u8 = 0x00;
    pub const INSUFFICIENT_RESOURCES: u8 = 0x01;
    pub const INVALID_SESSION_ID: u8 = 0x02;
    pub const INVALID_PAYLOAD_TYPE: u8 = 0x03;
    pub const INVALID_AUTH_ALGORITHM: u8 = 0x04;
    pub const INVALID_INTEGRITY_ALGORITHM: u8 = 0x05;
    pub const INACTIVE_SESSION_ID: u8 = 0x08;
    pub const INVALID_ROLE: u8 = 0x09;
    pub const UNAUTHORIZED_ROLE: u8 = 0x0A;
    pub const INVALID_NAME_LENGTH: u8 = 0x0C;
    pub const UNAUTHORIZED_NAME: u8 = 0x0D;
    pub const UNAUTHORIZED_GUID: u8 = 0x0E;
    pub const INVALID_INTEGRITY_CHECK_VALUE: u8 = 0x0F;
    pub const INVALID_CONFIDENTIALITY_ALGORITHM: u8 = 0x10;
    pub const NO_CIPHER_SUITE_MATCH: u8 = 0x11;
    pub const ILLEGAL_PARAMETER: u8 = 0x12;
}

/// Requested maximum privilege level for the session.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PrivilegeLevel {
    Callback,
    User,
    Operator,
    Administrator,
}

impl PrivilegeLevel {
    #[inline]
    pub fn wire_id(self) -> u8 {
        match self {
            PrivilegeLevel::Callback => 0x01,
            PrivilegeLevel::User => 0x02,
            PrivilegeLevel::Operator => 0x03,
            PrivilegeLevel::Administrator => 0x04,
        }
    }

    pub fn from_wire(id: u8) -> IpmiResult<PrivilegeLevel> {
        match id {
            0x01 => Ok(PrivilegeLevel::Callback),
            0x02 => Ok(PrivilegeLevel::User),
            0x03 => Ok(PrivilegeLevel::Operator),
            0x04 => Ok(PrivilegeLevel::Administrator),
            _ => Err(IpmiError::ProtocolViolation(Violation::UnknownAlgorithm)),
        }
    }
}

#[inline]
fn read_nonce<R: Read>(stream: &mut R) -> IpmiResult<[u8; RAKP_NONCE_SIZE]> {
    let mut nonce = [0u8; RAKP_NONCE_SIZE];
    stream
        .read_exact(&mut nonce)
        .map_err(|_| IpmiError::ProtocolViolation(Violation::Truncated))?;
    Ok(nonce)
}

#[inline]
fn read_rest<R: SizedRead>(stream: &mut R) -> IpmiResult<Vec<u8>> {
    let mut rest = vec![0u8; stream.remaining_data()];
    stream
        .read_exact(&mut rest)
        .map_err(|_| IpmiError::ProtocolViolation(Violation::Truncated))?;
    Ok(rest)
}

#[inline]
fn truncated(_: std::io::Error) -> IpmiError {
    IpmiError::ProtocolViolation(Violation::Truncated)
}

/// Get Channel Cipher Suites request.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CipherSuitesRequest {
    pub tag: u8,
    pub channel: u8,
}

impl Encode for CipherSuitesRequest {
    fn encode<W: SizedWrite>(&self, stream: &mut W) -> IpmiResult<()> {
        stream.write_u8(self.tag)?;
        stream.write_u8(self.channel)?;
        Ok(())
    }
}

impl Decode for CipherSuitesRequest {
    fn decode<R: SizedRead>(stream: &mut R) -> IpmiResult<CipherSuitesRequest> {
        Ok(CipherSuitesRequest {
            tag: stream.read_u8().map_err(truncated)?,
            channel: stream.read_u8().map_err(truncated)?,
        })
    }
}

/// Get Channel Cipher Suites response: the suite IDs the channel supports.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CipherSuitesResponse {
    pub tag: u8,
    pub suites: Vec<u8>,
}

impl Encode for CipherSuitesResponse {
    fn encode<W: SizedWrite>(&self, stream: &mut W) -> IpmiResult<()> {
        stream.write_u8(self.tag)?;
        stream.write_u8(self.suites.len() as u8)?;
        stream.write_all(&self.suites)?;
        Ok(())
    }
}

impl Decode for CipherSuitesResponse {
    fn decode<R: SizedRead>(stream: &mut R) -> IpmiResult<CipherSuitesResponse> {
        let tag = stream.read_u8().map_err(truncated)?;
        let count = stream.read_u8().map_err(truncated)? as usize;

        if stream.remaining_data() < count {
            return Err(IpmiError::ProtocolViolation(Violation::Truncated));
        }

        let mut suites = vec![0u8; count];
        stream.read_exact(&mut suites).map_err(truncated)?;

        Ok(CipherSuitesResponse { tag, suites })
    }
}

/// Algorithm proposal record carried by Open Session messages.
fn write_algorithm_record<W: Write>(
    stream: &mut W,
    record_type: u8,
    algorithm: u8,
) -> IpmiResult<()> {
    stream.write_u8(record_type)?;
    stream.write_u16::<LittleEndian>(0)?;
    stream.write_u8(0x08)?;
    stream.write_u8(algorithm)?;
    stream.write_all(&[0u8; 3])?;
    Ok(())
}

fn read_algorithm_record<R: Read>(stream: &mut R, record_type: u8) -> IpmiResult<u8> {
    let mut record = [0u8; 8];
    stream.read_exact(&mut record).map_err(truncated)?;

    if record[0] != record_type || record[3] != 0x08 {
        return Err(IpmiError::ProtocolViolation(Violation::UnknownPayloadType));
    }

    Ok(record[4])
}

/// RMCP+ Open Session request: the console proposes a session ID and the
/// algorithm triple of its chosen cipher suite.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct OpenSessionRequest {
    pub tag: u8,
    pub privilege: u8,
    pub console_session_id: u32,
    pub authentication: u8,
    pub integrity: u8,
    pub confidentiality: u8,
}

impl Encode for OpenSessionRequest {
    fn encode<W: SizedWrite>(&self, stream: &mut W) -> IpmiResult<()> {
        stream.write_u8(self.tag)?;
        stream.write_u8(self.privilege)?;
        stream.write_u16::<LittleEndian>(0)?;
        stream.write_u32::<LittleEndian>(self.console_session_id)?;
        write_algorithm_record(stream, 0x00, self.authentication)?;
        write_algorithm_record(stream, 0x01, self.integrity)?;
        write_algorithm_record(stream, 0x02, self.confidentiality)?;
        Ok(())
    }
}

impl Decode for OpenSessionRequest {
    fn decode<R: SizedRead>(stream: &mut R) -> IpmiResult<OpenSessionRequest> {
        let tag = stream.read_u8().map_err(truncated)?;
        let privilege = stream.read_u8().map_err(truncated)?;
        stream.read_u16::<LittleEndian>().map_err(truncated)?;
        let console_session_id = stream.read_u32::<LittleEndian>().map_err(truncated)?;

        Ok(OpenSessionRequest {
            tag,
            privilege,
            console_session_id,
            authentication: read_algorithm_record(stream, 0x00)?,
            integrity: read_algorithm_record(stream, 0x01)?,
            confidentiality: read_algorithm_record(stream, 0x02)?,
        })
    }
}

/// RMCP+ Open Session response: echoes the console session ID and carries
/// the managed system's session ID and accepted algorithms.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct OpenSessionResponse {
    pub tag: u8,
    pub status: u8,
    pub privilege: u8,
    pub console_session_id: u32,
    pub managed_session_id: u32,
    pub authentication: u8,
    pub integrity: u8,
    pub confidentiality: u8,
}

impl Encode for OpenSessionResponse {
    fn encode<W: SizedWrite>(&self, stream: &mut W) -> IpmiResult<()> {
        stream.write_u8(self.tag)?;
        stream.write_u8(self.status)?;
        stream.write_u8(self.privilege)?;
        stream.write_u8(0)?;
        stream.write_u32::<LittleEndian>(self.console_session_id)?;

        // Error responses end after the console session ID.
        if self.status != status::NO_ERROR {
            return Ok(());
        }

        stream.write_u32::<LittleEndian>(self.managed_session_id)?;
        write_algorithm_record(stream, 0x00, self.authentication)?;
        write_algorithm_record(stream, 0x01, self.integrity)?;
        write_algorithm_record(stream, 0x02, self.confidentiality)?;
        Ok(())
    }
}

impl Decode for OpenSessionResponse {
    fn decode<R: SizedRead>(stream: &mut R) -> IpmiResult<OpenSessionResponse> {
        let tag = stream.read_u8().map_err(truncated)?;
        let status = stream.read_u8().map_err(truncated)?;
        let privilege = stream.read_u8().map_err(truncated)?;
        stream.read_u8().map_err(truncated)?;
        let console_session_id = stream.read_u32::<LittleEndian>().map_err(truncated)?;

        if status != status::NO_ERROR {
            return Ok(OpenSessionResponse {
                tag,
                status,
                privilege,
                console_session_id,
                managed_session_id: 0,
                authentication: 0,
                integrity: 0,
                confidentiality: 0,
            });
        }

        Ok(OpenSessionResponse {
            tag,
            status,
            privilege,
            console_session_id,
            managed_session_id: stream.read_u32::<LittleEndian>().map_err(truncated)?,
            authentication: read_algorithm_record(stream, 0x00)?,
            integrity: read_algorithm_record(stream, 0x01)?,
            confidentiality: read_algorithm_record(stream, 0x02)?,
        })
    }
}

/// RAKP message 1: console nonce and requested role.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Rakp1 {
    pub tag: u8,
    pub managed_session_id: u32,
    pub console_nonce: [u8; RAKP_NONCE_SIZE],
    pub privilege: u8,
    pub username: String,
}

impl Encode for Rakp1 {
    fn encode<W: SizedWrite>(&self, stream: &mut W) -> IpmiResult<()> {
        if self.username.len() > MAX_USERNAME_SIZE {
            return Err(IpmiError::ProtocolViolation(Violation::UsernameTooLong));
        }

        stream.write_u8(self.tag)?;
        stream.write_all(&[0u8; 3])?;
        stream.write_u32::<LittleEndian>(self.managed_session_id)?;
        stream.write_all(&self.console_nonce)?;
        stream.write_u8(self.privilege)?;
        stream.write_u16::<LittleEndian>(0)?;
        stream.write_u8(self.username.len() as u8)?;
        stream.write_all(self.username.as_bytes())?;
        Ok(())
    }
}

impl Decode for Rakp1 {
    fn decode<R: SizedRead>(stream: &mut R) -> IpmiResult<Rakp1> {
        let tag = stream.read_u8().map_err(truncated)?;
        let mut reserved = [0u8; 3];
        stream.read_exact(&mut reserved).map_err(truncated)?;
        let managed_session_id = stream.read_u32::<LittleEndian>().map_err(truncated)?;
        let console_nonce = read_nonce(stream)?;
        let privilege = stream.read_u8().map_err(truncated)?;
        stream.read_u16::<LittleEndian>().map_err(truncated)?;

        let name_len = stream.read_u8().map_err(truncated)? as usize;
        if name_len > MAX_USERNAME_SIZE {
            return Err(IpmiError::ProtocolViolation(Violation::UsernameTooLong));
        }

        let mut name = vec![0u8; name_len];
        stream.read_exact(&mut name).map_err(truncated)?;
        let username = String::from_utf8(name)
            .map_err(|_| IpmiError::ProtocolViolation(Violation::Truncated))?;

        Ok(Rakp1 {
            tag,
            managed_session_id,
            console_nonce,
            privilege,
            username,
        })
    }
}

/// RAKP message 2: managed system nonce, GUID and key exchange code.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Rakp2 {
    pub tag: u8,
    pub status: u8,
    pub console_session_id: u32,
    pub managed_nonce: [u8; RAKP_NONCE_SIZE],
    pub managed_guid: [u8; GUID_SIZE],
    pub auth_code: Vec<u8>,
}

impl Encode for Rakp2 {
    fn encode<W: SizedWrite>(&self, stream: &mut W) -> IpmiResult<()> {
        stream.write_u8(self.tag)?;
        stream.write_u8(self.status)?;
        stream.write_u16::<LittleEndian>(0)?;
        stream.write_u32::<LittleEndian>(self.console_session_id)?;
        stream.write_all(&self.managed_nonce)?;
        stream.write_all(&self.managed_guid)?;
        stream.write_all(&self.auth_code)?;
        Ok(())
    }
}

impl Decode for Rakp2 {
    fn decode<R: SizedRead>(stream: &mut R) -> IpmiResult<Rakp2> {
        let tag = stream.read_u8().map_err(truncated)?;
        let status = stream.read_u8().map_err(truncated)?;
        stream.read_u16::<LittleEndian>().map_err(truncated)?;
        let console_session_id = stream.read_u32::<LittleEndian>().map_err(truncated)?;
        let managed_nonce = read_nonce(stream)?;
        let managed_guid = read_nonce(stream)?;
        let auth_code = read_rest(stream)?;

        Ok(Rakp2 {
            tag,
            status,
            console_session_id,
            managed_nonce,
            managed_guid,
            auth_code,
        })
    }
}

/// RAKP message 3: console key exchange code.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Rakp3 {
    pub tag: u8,
    pub status: u8,
    pub managed_session_id: u32,
    pub auth_code: Vec<u8>,
}

impl Encode for Rakp3 {
    fn encode<W: SizedWrite>(&self, stream: &mut W) -> IpmiResult<()> {
        stream.write_u8(self.tag)?;
        stream.write_u8(self.status)?;
        stream.write_u16::<LittleEndian>(0)?;
        stream.write_u32::<LittleEndian>(self.managed_session_id)?;
        stream.write_all(&self.auth_code)?;
        Ok(())
    }
}

impl Decode for Rakp3 {
    fn decode<R: SizedRead>(stream: &mut R) -> IpmiResult<Rakp3> {
        Ok(Rakp3 {
            tag: stream.read_u8().map_err(truncated)?,
            status: stream.read_u8().map_err(truncated)?,
            managed_session_id: {
                stream.read_u16::<LittleEndian>().map_err(truncated)?;
                stream.read_u32::<LittleEndian>().map_err(truncated)?
            },
            auth_code: read_rest(stream)?,
        })
    }
}

/// RAKP message 4: session integrity check value keyed by the SIK.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Rakp4 {
    pub tag: u8,
    pub status: u8,
    pub console_session_id: u32,
    pub integrity_check: Vec<u8>,
}

impl Encode for Rakp4 {
    fn encode<W: SizedWrite>(&self, stream: &mut W) -> IpmiResult<()> {
        stream.write_u8(self.tag)?;
        stream.write_u8(self.status)?;
        stream.write_u16::<LittleEndian>(0)?;
        stream.write_u32::<LittleEndian>(self.console_session_id)?;
        stream.write_all(&self.integrity_check)?;
        Ok(())
    }
}

impl Decode for Rakp4 {
    fn decode<R: SizedRead>(stream: &mut R) -> IpmiResult<Rakp4> {
        Ok(Rakp4 {
            tag: stream.read_u8().map_err(truncated)?,
            status: stream.read_u8().map_err(truncated)?,
            console_session_id: {
                stream.read_u16::<LittleEndian>().map_err(truncated)?;
                stream.read_u32::<LittleEndian>().map_err(truncated)?
            },
            integrity_check: read_rest(stream)?,
        })
    }
}

/// An inbound handshake payload, decoded according to its payload type.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum HandshakePayload {
    CipherSuites(CipherSuitesResponse),
    OpenSession(OpenSessionResponse),
    Rakp2(Rakp2),
    Rakp4(Rakp4),
}

impl HandshakePayload {
    /// Decodes a sessionless response payload. Request-direction payload
    /// types are rejected; the console never receives them.
    pub fn read(payload_type: PayloadType, payload: &[u8]) -> IpmiResult<HandshakePayload> {
        let mut cursor = std::io::Cursor::new(payload);

        match payload_type {
            PayloadType::CipherSuites => Ok(HandshakePayload::CipherSuites(
                CipherSuitesResponse::decode(&mut cursor)?,
            )),
            PayloadType::OpenSession => Ok(HandshakePayload::OpenSession(
                OpenSessionResponse::decode(&mut cursor)?,
            )),
            PayloadType::Rakp2 => Ok(HandshakePayload::Rakp2(Rakp2::decode(&mut cursor)?)),
            PayloadType::Rakp4 => Ok(HandshakePayload::Rakp4(Rakp4::decode(&mut cursor)?)),
            _ => Err(IpmiError::ProtocolViolation(Violation::UnknownPayloadType)),
        }
    }

    /// Message tag used for sessionless correlation.
    pub fn tag(&self) -> u8 {
        match self {
            HandshakePayload::CipherSuites(response) => response.tag,
            HandshakePayload::OpenSession(response) => response.tag,
            HandshakePayload::Rakp2(response) => response.tag,
            HandshakePayload::Rakp4(response) => response.tag,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::{decode_from_slice, encode_to_vec};

    fn roundtrip<T: Encode + Decode + PartialEq + std::fmt::Debug>(item: T) {
        let bytes = encode_to_vec(&item).unwrap();
        let decoded: T = decode_from_slice(&bytes).unwrap();
        assert_eq!(decoded, item);
    }

    #[test]
    fn test_cipher_suites_roundtrip() {
        roundtrip(CipherSuitesRequest {
            tag: 5,
            channel: CHANNEL_CURRENT,
        });
        roundtrip(CipherSuitesResponse {
            tag: 5,
            suites: vec![0, 3, 17],
        });
    }

    #[test]
    fn test_open_session_roundtrip() {
        roundtrip(OpenSessionRequest {
            tag: 1,
            privilege: PrivilegeLevel::Administrator.wire_id(),
            console_session_id: 101,
            authentication: 0x01,
            integrity: 0x01,
            confidentiality: 0x01,
        });
        roundtrip(OpenSessionResponse {
            tag: 1,
            status: status::NO_ERROR,
            privilege: PrivilegeLevel::Administrator.wire_id(),
            console_session_id: 101,
            managed_session_id: 0xAABBCCDD,
            authentication: 0x01,
            integrity: 0x01,
            confidentiality: 0x01,
        });
    }

    #[test]
    fn test_open_session_error_response_is_short() {
        let response = OpenSessionResponse {
            tag: 1,
            status: status::NO_CIPHER_SUITE_MATCH,
            privilege: 0,
            console_session_id: 101,
            managed_session_id: 0,
            authentication: 0,
            integrity: 0,
            confidentiality: 0,
        };

        let bytes = encode_to_vec(&response).unwrap();
        assert_eq!(bytes.len(), 8);

        let decoded: OpenSessionResponse = decode_from_slice(&bytes).unwrap();
        assert_eq!(decoded.status, status::NO_CIPHER_SUITE_MATCH);
    }

    #[test]
    fn test_rakp_roundtrips() {
        roundtrip(Rakp1 {
            tag: 2,
            managed_session_id: 0xAABBCCDD,
            console_nonce: [7; RAKP_NONCE_SIZE],
            privilege: 4,
            username: "admin".to_string(),
        });
        roundtrip(Rakp2 {
            tag: 2,
            status: status::NO_ERROR,
            console_session_id: 101,
            managed_nonce: [9; RAKP_NONCE_SIZE],
            managed_guid: [3; GUID_SIZE],
            auth_code: vec![1; 20],
        });
        roundtrip(Rakp3 {
            tag: 3,
            status: status::NO_ERROR,
            managed_session_id: 0xAABBCCDD,
            auth_code: vec![2; 20],
        });
        roundtrip(Rakp4 {
            tag: 4,
            status: status::NO_ERROR,
            console_session_id: 101,
            integrity_check: vec![5; 20],
        });
    }

    #[test]
    fn test_rakp1_rejects_long_username() {
        let message = Rakp1 {
            tag: 2,
            managed_session_id: 1,
            console_nonce: [0; RAKP_NONCE_SIZE],
            privilege: 4,
            username: "a".repeat(MAX_USERNAME_SIZE + 1),
        };

        assert_eq!(
            encode_to_vec(&message).unwrap_err(),
            IpmiError::ProtocolViolation(Violation::UsernameTooLong)
        );
    }

    #[test]
    fn test_truncated_rakp2_fails() {
        let message = Rakp2 {
            tag: 2,
            status: status::NO_ERROR,
            console_session_id: 101,
            managed_nonce: [9; RAKP_NONCE_SIZE],
            managed_guid: [3; GUID_SIZE],
            auth_code: vec![1; 20],
        };

        let bytes = encode_to_vec(&message).unwrap();
        let result: IpmiResult<Rakp2> = decode_from_slice(&bytes[..20]);

        assert_eq!(
            result.unwrap_err(),
            IpmiError::ProtocolViolation(Violation::Truncated)
        );
    }

    #[test]
    fn test_dispatch_by_payload_type() {
        let response = CipherSuitesResponse {
            tag: 9,
            suites: vec![0, 3],
        };
        let bytes = encode_to_vec(&response).unwrap();

        let payload = HandshakePayload::read(PayloadType::CipherSuites, &bytes).unwrap();
        assert_eq!(payload.tag(), 9);

        match payload {
            HandshakePayload::CipherSuites(decoded) => assert_eq!(decoded, response),
            other => panic!("Unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_dispatch_rejects_request_types() {
        assert_eq!(
            HandshakePayload::read(PayloadType::Rakp1, &[0; 8]).unwrap_err(),
            IpmiError::ProtocolViolation(Violation::UnknownPayloadType)
        );
    }
}
