//! RMCP/ASF encapsulation and the RMCP+ session envelope: datagram builders
//! for outbound traffic and the classifier/unsealer for inbound traffic.
//!
//! Authenticated packets carry an integrity trailer (0xFF pad, pad length,
//! next-header byte, truncated AuthCode keyed by K1); encrypted payloads are
//! AES-CBC-128 under K2 with the IV prepended.

use crate::cipher::{CipherSuite, ConfidentialityAlgorithm, IntegrityAlgorithm, SessionKey};
use crate::crypto;
use crate::shared::{IpmiError, IpmiResult, Violation};
use crate::{AUTH_TYPE_RMCP_PLUS, CLASS_ASF, CLASS_IPMI, RMCP_SEQ_NO_ACK, RMCP_VERSION};
use byteorder::{BigEndian, ByteOrder, LittleEndian, WriteBytesExt};

pub const RMCP_HEADER_SIZE: usize = 4;
/// Offset of the payload field within an IPMI-class datagram.
pub const PAYLOAD_OFFSET: usize = 16;
/// Largest payload accepted in either direction.
pub const MAX_PAYLOAD_SIZE: usize = 512;

/// Next-header byte carried in the integrity trailer.
const NEXT_HEADER: u8 = 0x07;
/// IANA enterprise number used by ASF presence ping/pong.
const ASF_IANA: u32 = 4542;
const ASF_PRESENCE_PING: u8 = 0x80;
const ASF_PRESENCE_PONG: u8 = 0x40;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PayloadType {
    /// An encapsulated IPMI command message.
    Ipmi,
    CipherSuites,
    OpenSession,
    Rakp1,
    Rakp2,
    Rakp3,
    Rakp4,
}

impl PayloadType {
    #[inline]
    pub fn wire_id(self) -> u8 {
        match self {
            PayloadType::Ipmi => 0x00,
            PayloadType::CipherSuites => 0x10,
            PayloadType::OpenSession => 0x11,
            PayloadType::Rakp1 => 0x12,
            PayloadType::Rakp2 => 0x13,
            PayloadType::Rakp3 => 0x14,
            PayloadType::Rakp4 => 0x15,
        }
    }

    pub fn from_wire(id: u8) -> IpmiResult<PayloadType> {
        match id {
            0x00 => Ok(PayloadType::Ipmi),
            0x10 => Ok(PayloadType::CipherSuites),
            0x11 => Ok(PayloadType::OpenSession),
            0x12 => Ok(PayloadType::Rakp1),
            0x13 => Ok(PayloadType::Rakp2),
            0x14 => Ok(PayloadType::Rakp3),
            0x15 => Ok(PayloadType::Rakp4),
            _ => Err(IpmiError::ProtocolViolation(Violation::UnknownPayloadType)),
        }
    }
}

/// Parsed RMCP+ session wrapper.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct SessionHeader {
    pub payload_type: PayloadType,
    pub encrypted: bool,
    pub authenticated: bool,
    pub session_id: u32,
    pub session_seq: u32,
}

/// Keys and algorithms protecting one established session.
pub struct SessionProtection<'a> {
    pub suite: &'static CipherSuite,
    pub k1: &'a SessionKey,
    pub k2: &'a SessionKey,
}

impl<'a> SessionProtection<'a> {
    #[inline]
    fn confidentiality_key(&self) -> [u8; crypto::AES_KEY_SIZE] {
        let mut key = [0u8; crypto::AES_KEY_SIZE];
        key.copy_from_slice(&self.k2[..crypto::AES_KEY_SIZE]);
        key
    }

    #[inline]
    fn rc4_40_key(&self) -> [u8; crypto::RC4_40_KEY_SIZE] {
        let mut key = [0u8; crypto::RC4_40_KEY_SIZE];
        key.copy_from_slice(&self.k2[..crypto::RC4_40_KEY_SIZE]);
        key
    }
}

#[inline]
fn write_rmcp_header(datagram: &mut Vec<u8>, class: u8) {
    datagram.push(RMCP_VERSION);
    datagram.push(0x00);
    datagram.push(RMCP_SEQ_NO_ACK);
    datagram.push(class);
}

fn write_session_wrapper(
    datagram: &mut Vec<u8>,
    payload_type: PayloadType,
    encrypted: bool,
    authenticated: bool,
    session_id: u32,
    session_seq: u32,
    payload_len: usize,
) -> IpmiResult<()> {
    if payload_len > MAX_PAYLOAD_SIZE {
        return Err(IpmiError::ProtocolViolation(Violation::PayloadTooLarge));
    }

    let mut type_byte = payload_type.wire_id();
    if encrypted {
        type_byte |= 0x80;
    }
    if authenticated {
        type_byte |= 0x40;
    }

    datagram.push(AUTH_TYPE_RMCP_PLUS);
    datagram.push(type_byte);
    datagram
        .write_u32::<LittleEndian>(session_id)
        .expect("Error writing session id");
    datagram
        .write_u32::<LittleEndian>(session_seq)
        .expect("Error writing session sequence");
    datagram
        .write_u16::<LittleEndian>(payload_len as u16)
        .expect("Error writing payload length");

    Ok(())
}

/// Builds a sessionless packet: session ID and sequence zero, no integrity
/// or confidentiality envelope.
pub fn build_sessionless(payload_type: PayloadType, payload: &[u8]) -> IpmiResult<Vec<u8>> {
    let mut datagram = Vec::with_capacity(PAYLOAD_OFFSET + payload.len());

    write_rmcp_header(&mut datagram, CLASS_IPMI);
    write_session_wrapper(&mut datagram, payload_type, false, false, 0, 0, payload.len())?;
    datagram.extend_from_slice(payload);

    Ok(datagram)
}

/// Builds a protected in-session packet addressed to the managed system.
/// The envelope follows the session's cipher suite: payload encryption when
/// the suite carries a confidentiality algorithm, and the integrity trailer
/// when it carries an integrity algorithm.
pub fn build_in_session(
    protection: &SessionProtection,
    session_id: u32,
    session_seq: u32,
    payload: &[u8],
) -> IpmiResult<Vec<u8>> {
    let body = match protection.suite.confidentiality {
        ConfidentialityAlgorithm::None => payload.to_vec(),
        ConfidentialityAlgorithm::AesCbc128 => {
            let mut iv = [0u8; crypto::AES_IV_SIZE];
            crypto::random_bytes(&mut iv);

            let mut body = iv.to_vec();
            body.extend_from_slice(&crypto::aes_cbc_encrypt(
                &protection.confidentiality_key(),
                &iv,
                payload,
            ));
            body
        }
        ConfidentialityAlgorithm::XRc4_128 => {
            let mut body = payload.to_vec();
            crypto::rc4_128_apply(&protection.confidentiality_key(), &mut body);
            body
        }
        ConfidentialityAlgorithm::XRc4_40 => {
            let mut body = payload.to_vec();
            crypto::rc4_40_apply(&protection.rc4_40_key(), &mut body);
            body
        }
    };

    let encrypted = protection.suite.confidentiality != ConfidentialityAlgorithm::None;
    let authenticated = protection.suite.integrity != IntegrityAlgorithm::None;

    let mut datagram = Vec::with_capacity(PAYLOAD_OFFSET + body.len() + 32);
    write_rmcp_header(&mut datagram, CLASS_IPMI);
    write_session_wrapper(
        &mut datagram,
        PayloadType::Ipmi,
        encrypted,
        authenticated,
        session_id,
        session_seq,
        body.len(),
    )?;
    datagram.extend_from_slice(&body);

    if authenticated {
        // Integrity pad brings (payload + pad + 2) to a 4 byte boundary.
        let pad = (4 - (body.len() + 2) % 4) % 4;
        for _ in 0..pad {
            datagram.push(0xFF);
        }
        datagram.push(pad as u8);
        datagram.push(NEXT_HEADER);

        let code = protection
            .suite
            .integrity
            .apply(protection.k1, &datagram[RMCP_HEADER_SIZE..]);
        datagram.extend_from_slice(&code);
    }

    Ok(datagram)
}

/// Builds an ASF presence ping.
pub fn build_ping(tag: u8) -> Vec<u8> {
    let mut datagram = Vec::with_capacity(12);

    write_rmcp_header(&mut datagram, CLASS_ASF);
    datagram
        .write_u32::<BigEndian>(ASF_IANA)
        .expect("Error writing IANA number");
    datagram.push(ASF_PRESENCE_PING);
    datagram.push(tag);
    datagram.push(0x00);
    datagram.push(0x00);

    datagram
}

/// Builds an ASF presence pong. Only exercised by mock managed systems.
pub fn build_pong(tag: u8) -> Vec<u8> {
    let mut datagram = Vec::with_capacity(12);

    write_rmcp_header(&mut datagram, CLASS_ASF);
    datagram
        .write_u32::<BigEndian>(ASF_IANA)
        .expect("Error writing IANA number");
    datagram.push(ASF_PRESENCE_PONG);
    datagram.push(tag);
    datagram.push(0x00);
    datagram.push(0x00);

    datagram
}

/// A received in-session packet whose envelope has not been opened yet. The
/// wrapper fields are available for session matching and replay checks
/// before any cryptographic work is spent.
#[derive(Debug)]
pub struct SealedPacket<'a> {
    pub header: SessionHeader,
    datagram: &'a [u8],
    payload_len: usize,
}

impl<'a> SealedPacket<'a> {
    /// Verifies the integrity trailer and decrypts the payload.
    pub fn open(&self, protection: &SessionProtection) -> IpmiResult<Vec<u8>> {
        let body_end = PAYLOAD_OFFSET + self.payload_len;

        if self.header.authenticated {
            let mac_size = protection.suite.integrity.mac_size();
            let trailer_size = mac_size + 2;

            if self.datagram.len() < PAYLOAD_OFFSET + self.payload_len + trailer_size {
                return Err(IpmiError::ProtocolViolation(Violation::Truncated));
            }

            let mac_start = self.datagram.len() - mac_size;
            let code = protection
                .suite
                .integrity
                .apply(protection.k1, &self.datagram[RMCP_HEADER_SIZE..mac_start]);

            if code[..] != self.datagram[mac_start..] {
                return Err(IpmiError::IntegrityCheckFailed);
            }

            if self.datagram[mac_start - 1] != NEXT_HEADER {
                return Err(IpmiError::IntegrityCheckFailed);
            }

            let pad = self.datagram[mac_start - 2] as usize;
            if body_end + pad + 2 + mac_size != self.datagram.len() {
                return Err(IpmiError::ProtocolViolation(Violation::BadPadding));
            }
        }

        let body = &self.datagram[PAYLOAD_OFFSET..body_end];

        if !self.header.encrypted {
            return Ok(body.to_vec());
        }

        match protection.suite.confidentiality {
            ConfidentialityAlgorithm::None => {
                Err(IpmiError::ProtocolViolation(Violation::BadPadding))
            }
            ConfidentialityAlgorithm::AesCbc128 => {
                if body.len() < crypto::AES_IV_SIZE {
                    return Err(IpmiError::ProtocolViolation(Violation::Truncated));
                }

                let mut iv = [0u8; crypto::AES_IV_SIZE];
                iv.copy_from_slice(&body[..crypto::AES_IV_SIZE]);

                crypto::aes_cbc_decrypt(
                    &protection.confidentiality_key(),
                    &iv,
                    &body[crypto::AES_IV_SIZE..],
                )
            }
            ConfidentialityAlgorithm::XRc4_128 => {
                let mut plain = body.to_vec();
                crypto::rc4_128_apply(&protection.confidentiality_key(), &mut plain);
                Ok(plain)
            }
            ConfidentialityAlgorithm::XRc4_40 => {
                let mut plain = body.to_vec();
                crypto::rc4_40_apply(&protection.rc4_40_key(), &mut plain);
                Ok(plain)
            }
        }
    }
}

/// A received datagram, classified far enough to route it.
#[derive(Debug)]
pub enum Inbound<'a> {
    /// ASF presence pong.
    Pong { tag: u8 },
    /// Pre-session traffic: handshake payloads and sessionless commands.
    Sessionless {
        payload_type: PayloadType,
        payload: &'a [u8],
    },
    /// In-session traffic, still sealed in its envelope.
    Sealed(SealedPacket<'a>),
}

/// Classifies a received datagram. Validates the RMCP header and the session
/// wrapper but performs no cryptography; sealed packets expose their wrapper
/// so the session and replay checks can run first.
pub fn classify(datagram: &[u8]) -> IpmiResult<Inbound> {
    if datagram.len() < RMCP_HEADER_SIZE {
        return Err(IpmiError::ProtocolViolation(Violation::Truncated));
    }

    if datagram[0] != RMCP_VERSION {
        return Err(IpmiError::ProtocolViolation(Violation::VersionMismatch));
    }

    match datagram[3] {
        CLASS_ASF => classify_asf(datagram),
        CLASS_IPMI => classify_ipmi(datagram),
        _ => Err(IpmiError::ProtocolViolation(Violation::ClassMismatch)),
    }
}

fn classify_asf(datagram: &[u8]) -> IpmiResult<Inbound> {
    if datagram.len() < 10 {
        return Err(IpmiError::ProtocolViolation(Violation::Truncated));
    }

    match datagram[8] {
        ASF_PRESENCE_PONG => Ok(Inbound::Pong { tag: datagram[9] }),
        _ => Err(IpmiError::ProtocolViolation(Violation::UnknownPayloadType)),
    }
}

fn classify_ipmi(datagram: &[u8]) -> IpmiResult<Inbound> {
    if datagram.len() < PAYLOAD_OFFSET {
        return Err(IpmiError::ProtocolViolation(Violation::Truncated));
    }

    if datagram[4] != AUTH_TYPE_RMCP_PLUS {
        return Err(IpmiError::ProtocolViolation(Violation::AuthTypeMismatch));
    }

    let type_byte = datagram[5];
    let payload_type = PayloadType::from_wire(type_byte & 0x3F)?;
    let encrypted = type_byte & 0x80 != 0;
    let authenticated = type_byte & 0x40 != 0;

    let session_id = LittleEndian::read_u32(&datagram[6..10]);
    let session_seq = LittleEndian::read_u32(&datagram[10..14]);
    let payload_len = LittleEndian::read_u16(&datagram[14..16]) as usize;

    if payload_len == 0 {
        return Err(IpmiError::ProtocolViolation(Violation::EmptyPayload));
    }

    if payload_len > MAX_PAYLOAD_SIZE {
        return Err(IpmiError::ProtocolViolation(Violation::PayloadTooLarge));
    }

    if datagram.len() < PAYLOAD_OFFSET + payload_len {
        return Err(IpmiError::ProtocolViolation(Violation::Truncated));
    }

    if session_id == 0 {
        return Ok(Inbound::Sessionless {
            payload_type,
            payload: &datagram[PAYLOAD_OFFSET..PAYLOAD_OFFSET + payload_len],
        });
    }

    Ok(Inbound::Sealed(SealedPacket {
        header: SessionHeader {
            payload_type,
            encrypted,
            authenticated,
            session_id,
            session_seq,
        },
        datagram,
        payload_len,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn protection(suite_id: u8) -> (&'static CipherSuite, SessionKey, SessionKey) {
        let suite = CipherSuite::from_id(suite_id).unwrap();
        let sik = suite.derive_sik(b"password", None, &[0xBB; 16], &[0xAA; 16], 4, "admin");
        let k1 = suite.derive_k1(&sik);
        let k2 = suite.derive_k2(&sik);
        (suite, k1, k2)
    }

    #[test]
    fn test_sessionless_roundtrip() {
        let datagram = build_sessionless(PayloadType::Rakp1, &[1, 2, 3]).unwrap();

        match classify(&datagram).unwrap() {
            Inbound::Sessionless {
                payload_type,
                payload,
            } => {
                assert_eq!(payload_type, PayloadType::Rakp1);
                assert_eq!(payload, &[1, 2, 3]);
            }
            other => panic!("Unexpected classification {:?}", other),
        }
    }

    #[test]
    fn test_in_session_roundtrip_authenticated_encrypted() {
        let (suite, k1, k2) = protection(3);
        let protection = SessionProtection {
            suite,
            k1: &k1,
            k2: &k2,
        };

        let payload = b"get device id please".to_vec();
        let datagram = build_in_session(&protection, 0xAABBCCDD, 7, &payload).unwrap();

        let sealed = match classify(&datagram).unwrap() {
            Inbound::Sealed(sealed) => sealed,
            other => panic!("Unexpected classification {:?}", other),
        };

        assert_eq!(sealed.header.session_id, 0xAABBCCDD);
        assert_eq!(sealed.header.session_seq, 7);
        assert!(sealed.header.encrypted);
        assert!(sealed.header.authenticated);

        assert_eq!(sealed.open(&protection).unwrap(), payload);
    }

    #[test]
    fn test_in_session_roundtrip_integrity_only() {
        let (suite, k1, k2) = protection(2);
        let protection = SessionProtection {
            suite,
            k1: &k1,
            k2: &k2,
        };

        let datagram = build_in_session(&protection, 5, 1, &[9; 21]).unwrap();

        let sealed = match classify(&datagram).unwrap() {
            Inbound::Sealed(sealed) => sealed,
            other => panic!("Unexpected classification {:?}", other),
        };

        assert!(!sealed.header.encrypted);
        assert!(sealed.header.authenticated);
        assert_eq!(sealed.open(&protection).unwrap(), vec![9; 21]);
    }

    #[test]
    fn test_tampered_packet_fails_integrity() {
        let (suite, k1, k2) = protection(3);
        let protection = SessionProtection {
            suite,
            k1: &k1,
            k2: &k2,
        };

        let mut datagram = build_in_session(&protection, 5, 1, &[7; 10]).unwrap();
        datagram[PAYLOAD_OFFSET] ^= 0x01;

        let sealed = match classify(&datagram).unwrap() {
            Inbound::Sealed(sealed) => sealed,
            other => panic!("Unexpected classification {:?}", other),
        };

        assert_eq!(
            sealed.open(&protection).unwrap_err(),
            IpmiError::IntegrityCheckFailed
        );
    }

    #[test]
    fn test_wrong_key_fails_integrity() {
        let (suite, k1, k2) = protection(3);
        let datagram = build_in_session(
            &SessionProtection {
                suite,
                k1: &k1,
                k2: &k2,
            },
            5,
            1,
            &[7; 10],
        )
        .unwrap();

        let (_, other_k1, other_k2) = protection(2);
        let wrong = SessionProtection {
            suite,
            k1: &other_k1,
            k2: &other_k2,
        };

        let sealed = match classify(&datagram).unwrap() {
            Inbound::Sealed(sealed) => sealed,
            other => panic!("Unexpected classification {:?}", other),
        };

        assert_eq!(sealed.open(&wrong).unwrap_err(), IpmiError::IntegrityCheckFailed);
    }

    #[test]
    fn test_ping_pong() {
        let ping = build_ping(17);
        assert_eq!(ping[3], CLASS_ASF);

        match classify(&build_pong(17)).unwrap() {
            Inbound::Pong { tag } => assert_eq!(tag, 17),
            other => panic!("Unexpected classification {:?}", other),
        }
    }

    #[test]
    fn test_classify_rejects_bad_version() {
        let mut datagram = build_sessionless(PayloadType::Rakp1, &[1]).unwrap();
        datagram[0] = 0x05;

        assert_eq!(
            classify(&datagram).unwrap_err(),
            IpmiError::ProtocolViolation(Violation::VersionMismatch)
        );
    }

    #[test]
    fn test_classify_rejects_truncated_payload() {
        let mut datagram = build_sessionless(PayloadType::Rakp1, &[1, 2, 3, 4]).unwrap();
        datagram.truncate(datagram.len() - 2);

        assert_eq!(
            classify(&datagram).unwrap_err(),
            IpmiError::ProtocolViolation(Violation::Truncated)
        );
    }

    #[test]
    fn test_classify_rejects_empty_payload() {
        let mut datagram = build_sessionless(PayloadType::Rakp1, &[1]).unwrap();
        datagram[14] = 0;
        datagram[15] = 0;

        assert_eq!(
            classify(&datagram).unwrap_err(),
            IpmiError::ProtocolViolation(Violation::EmptyPayload)
        );
    }
}
