//! Thin wrappers over the cryptographic primitives consumed by the cipher
//! suite registry: the HMAC family used for authentication and integrity,
//! AES-CBC-128 and xRC4 for payload confidentiality, and a secure random
//! source for nonces and initialisation vectors.

use crate::shared::{IpmiError, IpmiResult, Violation};
use aes::cipher::block_padding::NoPadding;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::Aes128;
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use rand::RngCore;
use rc4::consts::{U16, U5};
use rc4::{KeyInit, Rc4, StreamCipher};
use sha1::Sha1;
use sha2::Sha256;

pub const SHA1_OUTPUT_SIZE: usize = 20;
pub const MD5_OUTPUT_SIZE: usize = 16;
pub const SHA256_OUTPUT_SIZE: usize = 32;

pub const AES_BLOCK_SIZE: usize = 16;
pub const AES_KEY_SIZE: usize = 16;
pub const AES_IV_SIZE: usize = 16;

pub const RC4_128_KEY_SIZE: usize = 16;
pub const RC4_40_KEY_SIZE: usize = 5;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

#[inline]
pub fn hmac_sha1(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = <Hmac<Sha1> as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

#[inline]
pub fn hmac_md5(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = <Hmac<Md5> as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

#[inline]
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Keyed MD5 digest used by the legacy MD5-128 integrity algorithm. The key
/// brackets the data on both sides.
#[inline]
pub fn md5_128(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut digest = Md5::new();
    digest.update(key);
    digest.update(data);
    digest.update(key);
    digest.finalize().to_vec()
}

/// Encrypts the plain text with AES-CBC-128 under the supplied key and IV.
///
/// The confidentiality pad is appended before encryption: pad bytes run
/// `01, 02, …, N` followed by the pad length byte `N`, sized so the padded
/// text is a whole number of blocks. The IV is not included in the output.
pub fn aes_cbc_encrypt(key: &[u8; AES_KEY_SIZE], iv: &[u8; AES_IV_SIZE], plain: &[u8]) -> Vec<u8> {
    let pad = (AES_BLOCK_SIZE - (plain.len() + 1) % AES_BLOCK_SIZE) % AES_BLOCK_SIZE;

    let mut buffer = Vec::with_capacity(plain.len() + pad + 1);
    buffer.extend_from_slice(plain);
    for count in 0..pad {
        buffer.push((count + 1) as u8);
    }
    buffer.push(pad as u8);

    let length = buffer.len();
    Aes128CbcEnc::new(key.into(), iv.into())
        .encrypt_padded_mut::<NoPadding>(&mut buffer, length)
        .expect("Padded buffer is block aligned");

    buffer
}

/// Decrypts an AES-CBC-128 cipher text and strips the confidentiality pad,
/// validating the `01, 02, …, N, N` trailer.
pub fn aes_cbc_decrypt(
    key: &[u8; AES_KEY_SIZE],
    iv: &[u8; AES_IV_SIZE],
    cipher: &[u8],
) -> IpmiResult<Vec<u8>> {
    if cipher.is_empty() || cipher.len() % AES_BLOCK_SIZE != 0 {
        return Err(IpmiError::ProtocolViolation(Violation::BadPadding));
    }

    let mut buffer = cipher.to_vec();
    Aes128CbcDec::new(key.into(), iv.into())
        .decrypt_padded_mut::<NoPadding>(&mut buffer)
        .map_err(|_| IpmiError::ProtocolViolation(Violation::BadPadding))?;

    let pad = buffer[buffer.len() - 1] as usize;
    if pad + 1 > buffer.len() {
        return Err(IpmiError::ProtocolViolation(Violation::BadPadding));
    }

    let data_len = buffer.len() - pad - 1;
    for count in 0..pad {
        if buffer[data_len + count] != (count + 1) as u8 {
            return Err(IpmiError::ProtocolViolation(Violation::BadPadding));
        }
    }

    buffer.truncate(data_len);
    Ok(buffer)
}

/// Applies the xRC4-128 keystream in place. Symmetric, so the same call
/// encrypts and decrypts.
#[inline]
pub fn rc4_128_apply(key: &[u8; RC4_128_KEY_SIZE], data: &mut [u8]) {
    let mut cipher = Rc4::<U16>::new(key.into());
    cipher.apply_keystream(data);
}

/// Applies the xRC4-40 keystream in place.
#[inline]
pub fn rc4_40_apply(key: &[u8; RC4_40_KEY_SIZE], data: &mut [u8]) {
    let mut cipher = Rc4::<U5>::new(key.into());
    cipher.apply_keystream(data);
}

/// Fills the provided buffer with cryptographically secure random bytes.
#[inline]
pub fn random_bytes(out: &mut [u8]) {
    rand::thread_rng().fill_bytes(out);
}
