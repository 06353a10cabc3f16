use std::io;
use std::net;

pub type IpmiResult<T> = Result<T, IpmiError>;

/// Errors surfaced to library callers. Retries inside the message handler
/// cover only `ResponseTimeout` and transient transport errors; everything
/// else propagates as-is.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum IpmiError {
    TransportClosed,
    ResponseTimeout,
    IllegalState,
    ProtocolViolation(Violation),
    /// RAKP status code reported by the managed system, or the local code
    /// assigned when a key exchange authentication code fails to verify.
    AuthenticationFailed(u8),
    IntegrityCheckFailed,
    SessionExpired,
    ConnectionClosed,
    ConfigurationMissing,
    Cancelled,
    AddrParse,
    Io(io::ErrorKind),
}

/// Fine grained reasons for a protocol violation.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Violation {
    Truncated,
    VersionMismatch,
    ClassMismatch,
    AuthTypeMismatch,
    UnknownPayloadType,
    UnknownSuite,
    UnknownAlgorithm,
    PayloadTooLarge,
    EmptyPayload,
    BadPadding,
    SessionMismatch,
    Replayed,
    TagMismatch,
    UnexpectedEvent,
    UsernameTooLong,
    AuthCodeMismatch,
    ErrorStatus,
    SessionExpired,
}

impl From<io::Error> for IpmiError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        IpmiError::Io(io_error.kind())
    }
}

impl From<net::AddrParseError> for IpmiError {
    #[inline]
    fn from(_: net::AddrParseError) -> Self {
        IpmiError::AddrParse
    }
}

pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for IpmiResult<T> {
    fn has_failed(&self) -> bool {
        self.is_err()
    }
}

/// Augmented `io::Write` that is aware of the amount of remaining free capacity in the destination.
pub trait SizedWrite: io::Write {
    /// Remaining free capacity in the destination.
    fn free_capacity(&self) -> usize;
}

/// Augmented `io::Read` that is aware of the amount of remaining data in the source.
pub trait SizedRead: io::Read {
    /// Remaining data in the source.
    fn remaining_data(&self) -> usize;
}

impl SizedWrite for io::Cursor<&mut [u8]> {
    #[inline]
    fn free_capacity(&self) -> usize {
        self.get_ref().len() - self.position() as usize
    }
}

impl SizedWrite for io::Cursor<Vec<u8>> {
    #[inline]
    fn free_capacity(&self) -> usize {
        usize::max_value()
    }
}

impl SizedRead for io::Cursor<&[u8]> {
    #[inline]
    fn remaining_data(&self) -> usize {
        self.get_ref().len() - self.position() as usize
    }
}

/// Trait for manually encoded wire structures. Implementors must validate the
/// remaining free capacity upfront and fail with `Violation::PayloadTooLarge`
/// rather than writing a partial structure.
pub trait Encode {
    fn encode<W: SizedWrite>(&self, stream: &mut W) -> IpmiResult<()>;
}

/// Trait for manually decoded wire structures.
///
/// Should fail with `Violation::Truncated` when the source ends early.
pub trait Decode: Sized {
    fn decode<R: SizedRead>(stream: &mut R) -> IpmiResult<Self>;
}

/// Encode a structure into a fresh byte vector.
#[inline]
pub fn encode_to_vec<E: Encode>(item: &E) -> IpmiResult<Vec<u8>> {
    let mut cursor = io::Cursor::new(Vec::new());
    item.encode(&mut cursor)?;
    Ok(cursor.into_inner())
}

/// Decode a structure from a byte slice, ignoring any trailing data.
#[inline]
pub fn decode_from_slice<D: Decode>(data: &[u8]) -> IpmiResult<D> {
    let mut cursor = io::Cursor::new(data);
    D::decode(&mut cursor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_folds_to_kind() {
        let err: IpmiError = io::Error::from(io::ErrorKind::ConnectionRefused).into();
        assert_eq!(err, IpmiError::Io(io::ErrorKind::ConnectionRefused));
    }

    #[test]
    fn test_has_failed() {
        let ok: IpmiResult<()> = Ok(());
        let err: IpmiResult<()> = Err(IpmiError::ResponseTimeout);
        assert!(!ok.has_failed());
        assert!(err.has_failed());
    }
}
