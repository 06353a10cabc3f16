//! Cipher suite registry: the standard IPMI suite IDs, their algorithm
//! triples, and the RAKP key derivations each suite performs.

use crate::crypto;
use crate::shared::{IpmiError, IpmiResult, Violation};
use byteorder::{LittleEndian, WriteBytesExt};
use std::fmt;
use std::ops::Deref;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Key expansion constant for K1.
const KEY_CONST_1: [u8; 20] = [0x01; 20];
/// Key expansion constant for K2.
const KEY_CONST_2: [u8; 20] = [0x02; 20];

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum AuthenticationAlgorithm {
    None,
    HmacSha1,
    HmacMd5,
    HmacSha256,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum IntegrityAlgorithm {
    None,
    HmacSha1_96,
    HmacMd5_128,
    Md5_128,
    HmacSha256_128,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConfidentialityAlgorithm {
    None,
    AesCbc128,
    XRc4_128,
    XRc4_40,
}

impl AuthenticationAlgorithm {
    #[inline]
    pub fn wire_id(self) -> u8 {
        match self {
            AuthenticationAlgorithm::None => 0x00,
            AuthenticationAlgorithm::HmacSha1 => 0x01,
            AuthenticationAlgorithm::HmacMd5 => 0x02,
            AuthenticationAlgorithm::HmacSha256 => 0x03,
        }
    }

    pub fn from_wire(id: u8) -> IpmiResult<AuthenticationAlgorithm> {
        match id {
            0x00 => Ok(AuthenticationAlgorithm::None),
            0x01 => Ok(AuthenticationAlgorithm::HmacSha1),
            0x02 => Ok(AuthenticationAlgorithm::HmacMd5),
            0x03 => Ok(AuthenticationAlgorithm::HmacSha256),
            _ => Err(IpmiError::ProtocolViolation(Violation::UnknownAlgorithm)),
        }
    }

    /// Output size of the authentication primitive in bytes.
    #[inline]
    pub fn output_size(self) -> usize {
        match self {
            AuthenticationAlgorithm::None => 0,
            AuthenticationAlgorithm::HmacSha1 => crypto::SHA1_OUTPUT_SIZE,
            AuthenticationAlgorithm::HmacMd5 => crypto::MD5_OUTPUT_SIZE,
            AuthenticationAlgorithm::HmacSha256 => crypto::SHA256_OUTPUT_SIZE,
        }
    }

    /// Applies the authentication primitive to the data under the key. The
    /// null algorithm produces an empty code.
    pub fn apply(self, key: &[u8], data: &[u8]) -> Vec<u8> {
        match self {
            AuthenticationAlgorithm::None => Vec::new(),
            AuthenticationAlgorithm::HmacSha1 => crypto::hmac_sha1(key, data),
            AuthenticationAlgorithm::HmacMd5 => crypto::hmac_md5(key, data),
            AuthenticationAlgorithm::HmacSha256 => crypto::hmac_sha256(key, data),
        }
    }
}

impl IntegrityAlgorithm {
    #[inline]
    pub fn wire_id(self) -> u8 {
        match self {
            IntegrityAlgorithm::None => 0x00,
            IntegrityAlgorithm::HmacSha1_96 => 0x01,
            IntegrityAlgorithm::HmacMd5_128 => 0x02,
            IntegrityAlgorithm::Md5_128 => 0x03,
            IntegrityAlgorithm::HmacSha256_128 => 0x04,
        }
    }

    pub fn from_wire(id: u8) -> IpmiResult<IntegrityAlgorithm> {
        match id {
            0x00 => Ok(IntegrityAlgorithm::None),
            0x01 => Ok(IntegrityAlgorithm::HmacSha1_96),
            0x02 => Ok(IntegrityAlgorithm::HmacMd5_128),
            0x03 => Ok(IntegrityAlgorithm::Md5_128),
            0x04 => Ok(IntegrityAlgorithm::HmacSha256_128),
            _ => Err(IpmiError::ProtocolViolation(Violation::UnknownAlgorithm)),
        }
    }

    /// Size of the truncated AuthCode carried on the wire.
    #[inline]
    pub fn mac_size(self) -> usize {
        match self {
            IntegrityAlgorithm::None => 0,
            IntegrityAlgorithm::HmacSha1_96 => 12,
            IntegrityAlgorithm::HmacMd5_128 => 16,
            IntegrityAlgorithm::Md5_128 => 16,
            IntegrityAlgorithm::HmacSha256_128 => 16,
        }
    }

    /// Computes the truncated AuthCode over the data under K1.
    pub fn apply(self, k1: &[u8], data: &[u8]) -> Vec<u8> {
        let mut code = match self {
            IntegrityAlgorithm::None => Vec::new(),
            IntegrityAlgorithm::HmacSha1_96 => crypto::hmac_sha1(k1, data),
            IntegrityAlgorithm::HmacMd5_128 => crypto::hmac_md5(k1, data),
            IntegrityAlgorithm::Md5_128 => crypto::md5_128(k1, data),
            IntegrityAlgorithm::HmacSha256_128 => crypto::hmac_sha256(k1, data),
        };

        code.truncate(self.mac_size());
        code
    }
}

impl ConfidentialityAlgorithm {
    #[inline]
    pub fn wire_id(self) -> u8 {
        match self {
            ConfidentialityAlgorithm::None => 0x00,
            ConfidentialityAlgorithm::AesCbc128 => 0x01,
            ConfidentialityAlgorithm::XRc4_128 => 0x02,
            ConfidentialityAlgorithm::XRc4_40 => 0x03,
        }
    }

    pub fn from_wire(id: u8) -> IpmiResult<ConfidentialityAlgorithm> {
        match id {
            0x00 => Ok(ConfidentialityAlgorithm::None),
            0x01 => Ok(ConfidentialityAlgorithm::AesCbc128),
            0x02 => Ok(ConfidentialityAlgorithm::XRc4_128),
            0x03 => Ok(ConfidentialityAlgorithm::XRc4_40),
            _ => Err(IpmiError::ProtocolViolation(Violation::UnknownAlgorithm)),
        }
    }
}

/// Session key material derived during RAKP. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey(Vec<u8>);

impl SessionKey {
    #[inline]
    pub fn new(bytes: Vec<u8>) -> SessionKey {
        SessionKey(bytes)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl Deref for SessionKey {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(formatter, "SessionKey({} bytes)", self.0.len())
    }
}

/// An immutable (authentication, integrity, confidentiality) triple plus the
/// key derivations it performs. Instances live in the static registry and are
/// handed out by reference.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct CipherSuite {
    pub id: u8,
    pub authentication: AuthenticationAlgorithm,
    pub integrity: IntegrityAlgorithm,
    pub confidentiality: ConfidentialityAlgorithm,
}

/// The standard cipher suites, in suite ID order.
static REGISTRY: [CipherSuite; 13] = [
    suite(0, AuthenticationAlgorithm::None, IntegrityAlgorithm::None, ConfidentialityAlgorithm::None),
    suite(1, AuthenticationAlgorithm::HmacSha1, IntegrityAlgorithm::None, ConfidentialityAlgorithm::None),
    suite(2, AuthenticationAlgorithm::HmacSha1, IntegrityAlgorithm::HmacSha1_96, ConfidentialityAlgorithm::None),
    suite(3, AuthenticationAlgorithm::HmacSha1, IntegrityAlgorithm::HmacSha1_96, ConfidentialityAlgorithm::AesCbc128),
    suite(6, AuthenticationAlgorithm::HmacMd5, IntegrityAlgorithm::None, ConfidentialityAlgorithm::None),
    suite(7, AuthenticationAlgorithm::HmacMd5, IntegrityAlgorithm::HmacMd5_128, ConfidentialityAlgorithm::None),
    suite(8, AuthenticationAlgorithm::HmacMd5, IntegrityAlgorithm::HmacMd5_128, ConfidentialityAlgorithm::AesCbc128),
    suite(11, AuthenticationAlgorithm::HmacMd5, IntegrityAlgorithm::Md5_128, ConfidentialityAlgorithm::None),
    suite(12, AuthenticationAlgorithm::HmacMd5, IntegrityAlgorithm::Md5_128, ConfidentialityAlgorithm::AesCbc128),
    suite(14, AuthenticationAlgorithm::HmacMd5, IntegrityAlgorithm::Md5_128, ConfidentialityAlgorithm::XRc4_40),
    suite(15, AuthenticationAlgorithm::HmacSha256, IntegrityAlgorithm::None, ConfidentialityAlgorithm::None),
    suite(16, AuthenticationAlgorithm::HmacSha256, IntegrityAlgorithm::HmacSha256_128, ConfidentialityAlgorithm::None),
    suite(17, AuthenticationAlgorithm::HmacSha256, IntegrityAlgorithm::HmacSha256_128, ConfidentialityAlgorithm::AesCbc128),
];

const fn suite(
    id: u8,
    authentication: AuthenticationAlgorithm,
    integrity: IntegrityAlgorithm,
    confidentiality: ConfidentialityAlgorithm,
) -> CipherSuite {
    CipherSuite {
        id,
        authentication,
        integrity,
        confidentiality,
    }
}

impl CipherSuite {
    /// All registered suites, in suite ID order.
    #[inline]
    pub fn all() -> &'static [CipherSuite] {
        &REGISTRY
    }

    /// Looks a suite up by its ID.
    pub fn from_id(id: u8) -> IpmiResult<&'static CipherSuite> {
        REGISTRY
            .iter()
            .find(|entry| entry.id == id)
            .ok_or(IpmiError::ProtocolViolation(Violation::UnknownSuite))
    }

    /// Derives the session integrity key from the RAKP nonces and the
    /// requested role. The BMC key takes precedence over the user password
    /// when present.
    pub fn derive_sik(
        &self,
        password: &[u8],
        bmc_key: Option<&[u8]>,
        rakp2_nonce: &[u8],
        rakp1_nonce: &[u8],
        privilege: u8,
        username: &str,
    ) -> SessionKey {
        let key = bmc_key.unwrap_or(password);

        let mut material = Vec::with_capacity(rakp2_nonce.len() + rakp1_nonce.len() + 1 + username.len());
        material.extend_from_slice(rakp2_nonce);
        material.extend_from_slice(rakp1_nonce);
        material.push(privilege);
        material.extend_from_slice(username.as_bytes());

        SessionKey::new(self.authentication.apply(key, &material))
    }

    /// K1, the integrity key.
    #[inline]
    pub fn derive_k1(&self, sik: &SessionKey) -> SessionKey {
        SessionKey::new(self.authentication.apply(sik, &KEY_CONST_1))
    }

    /// K2, the confidentiality key.
    #[inline]
    pub fn derive_k2(&self, sik: &SessionKey) -> SessionKey {
        SessionKey::new(self.authentication.apply(sik, &KEY_CONST_2))
    }

    /// The key exchange authentication code the managed system is expected
    /// to present in RAKP2.
    pub fn rakp2_auth_code(
        &self,
        password: &[u8],
        console_session_id: u32,
        managed_session_id: u32,
        rakp1_nonce: &[u8],
        rakp2_nonce: &[u8],
        guid: &[u8],
        privilege: u8,
        username: &str,
    ) -> Vec<u8> {
        let mut material = Vec::new();
        material
            .write_u32::<LittleEndian>(console_session_id)
            .expect("Error writing console session id");
        material
            .write_u32::<LittleEndian>(managed_session_id)
            .expect("Error writing managed session id");
        material.extend_from_slice(rakp1_nonce);
        material.extend_from_slice(rakp2_nonce);
        material.extend_from_slice(guid);
        material.push(privilege);
        material.push(username.len() as u8);
        material.extend_from_slice(username.as_bytes());

        self.authentication.apply(password, &material)
    }

    /// The key exchange authentication code the console presents in RAKP3.
    pub fn rakp3_auth_code(
        &self,
        password: &[u8],
        rakp2_nonce: &[u8],
        console_session_id: u32,
        privilege: u8,
        username: &str,
    ) -> Vec<u8> {
        let mut material = Vec::new();
        material.extend_from_slice(rakp2_nonce);
        material
            .write_u32::<LittleEndian>(console_session_id)
            .expect("Error writing console session id");
        material.push(privilege);
        material.push(username.len() as u8);
        material.extend_from_slice(username.as_bytes());

        self.authentication.apply(password, &material)
    }

    /// The integrity check value the managed system is expected to present
    /// in RAKP4, keyed by the session integrity key.
    pub fn rakp4_integrity_check(
        &self,
        sik: &SessionKey,
        rakp1_nonce: &[u8],
        managed_session_id: u32,
        guid: &[u8],
    ) -> Vec<u8> {
        let mut material = Vec::new();
        material.extend_from_slice(rakp1_nonce);
        material
            .write_u32::<LittleEndian>(managed_session_id)
            .expect("Error writing managed session id");
        material.extend_from_slice(guid);

        self.authentication.apply(sik, &material)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAKP1_NONCE: [u8; 16] = [0xAA; 16];
    const RAKP2_NONCE: [u8; 16] = [0xBB; 16];
    const GUID: [u8; 16] = [0xCC; 16];

    #[test]
    fn test_registry_ids() {
        let ids: Vec<u8> = CipherSuite::all().iter().map(|entry| entry.id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 6, 7, 8, 11, 12, 14, 15, 16, 17]);
    }

    #[test]
    fn test_suite_three_triple() {
        let suite = CipherSuite::from_id(3).unwrap();

        assert_eq!(suite.authentication, AuthenticationAlgorithm::HmacSha1);
        assert_eq!(suite.integrity, IntegrityAlgorithm::HmacSha1_96);
        assert_eq!(suite.confidentiality, ConfidentialityAlgorithm::AesCbc128);
    }

    #[test]
    fn test_unknown_suite() {
        assert_eq!(
            CipherSuite::from_id(4).unwrap_err(),
            IpmiError::ProtocolViolation(Violation::UnknownSuite)
        );
    }

    #[test]
    fn test_sik_is_deterministic() {
        let suite = CipherSuite::from_id(3).unwrap();

        let first = suite.derive_sik(b"password", None, &RAKP2_NONCE, &RAKP1_NONCE, 4, "admin");
        let second = suite.derive_sik(b"password", None, &RAKP2_NONCE, &RAKP1_NONCE, 4, "admin");

        assert_eq!(&*first, &*second);
        assert_eq!(first.len(), crypto::SHA1_OUTPUT_SIZE);
    }

    #[test]
    fn test_bmc_key_overrides_password() {
        let suite = CipherSuite::from_id(3).unwrap();

        let plain = suite.derive_sik(b"password", None, &RAKP2_NONCE, &RAKP1_NONCE, 4, "admin");
        let keyed = suite.derive_sik(b"password", Some(b"kg"), &RAKP2_NONCE, &RAKP1_NONCE, 4, "admin");

        assert_ne!(&*plain, &*keyed);
    }

    #[test]
    fn test_k1_k2_differ() {
        let suite = CipherSuite::from_id(3).unwrap();
        let sik = suite.derive_sik(b"password", None, &RAKP2_NONCE, &RAKP1_NONCE, 4, "admin");

        let k1 = suite.derive_k1(&sik);
        let k2 = suite.derive_k2(&sik);

        assert_eq!(k1.len(), crypto::SHA1_OUTPUT_SIZE);
        assert_ne!(&*k1, &*k2);
    }

    #[test]
    fn test_integrity_truncation() {
        let code = IntegrityAlgorithm::HmacSha1_96.apply(b"key", b"data");
        assert_eq!(code.len(), 12);

        let full = AuthenticationAlgorithm::HmacSha1.apply(b"key", b"data");
        assert_eq!(&full[..12], &code[..]);
    }

    #[test]
    fn test_null_suite_produces_empty_codes() {
        let suite = CipherSuite::from_id(0).unwrap();
        let sik = suite.derive_sik(b"password", None, &RAKP2_NONCE, &RAKP1_NONCE, 4, "admin");

        assert_eq!(sik.len(), 0);
        assert!(suite
            .rakp2_auth_code(b"password", 1, 2, &RAKP1_NONCE, &RAKP2_NONCE, &GUID, 4, "admin")
            .is_empty());
    }

    #[test]
    fn test_algorithm_wire_roundtrip() {
        for suite in CipherSuite::all() {
            let auth = AuthenticationAlgorithm::from_wire(suite.authentication.wire_id()).unwrap();
            let integ = IntegrityAlgorithm::from_wire(suite.integrity.wire_id()).unwrap();
            let conf = ConfidentialityAlgorithm::from_wire(suite.confidentiality.wire_id()).unwrap();

            assert_eq!(auth, suite.authentication);
            assert_eq!(integ, suite.integrity);
            assert_eq!(conf, suite.confidentiality);
        }
    }
}
