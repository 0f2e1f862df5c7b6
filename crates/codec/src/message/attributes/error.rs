use bytes::{BufMut, BytesMut};
use num_enum::TryFromPrimitive;

use crate::Error;

/// The following error codes, along with their recommended reason
/// phrases, are defined:
///
/// 300  Try Alternate: The client should contact an alternate server for
///      this request.
///
/// 400  Bad Request: The request was malformed.  The client SHOULD NOT
///      retry the request without modification from the previous
///      attempt.
///
/// 401  Unauthenticated: The request did not contain the correct
///      credentials to proceed.  The client should retry the request
///      with proper credentials.
///
/// 420  Unknown Attribute: The server received a STUN packet containing
///      a comprehension-required attribute that it did not understand.
///      The server MUST put this unknown attribute in the UNKNOWN-
///      ATTRIBUTE attribute of its error response.
///
/// 438  Stale Nonce: The NONCE used by the client was no longer valid.
///      The client should retry, using the NONCE provided in the
///      response.
///
/// 500  Server Error: The server has suffered a temporary error.  The
///      client should try again.
///
/// The class of the error code (the hundreds digit) is encoded in the
/// upper byte of the discriminant, the remainder in the lower byte, which
/// is exactly the on-wire layout of the last two bytes of the ERROR-CODE
/// attribute.
#[repr(u16)]
#[derive(TryFromPrimitive, PartialEq, Eq, Copy, Clone, Debug)]
pub enum ErrorKind {
    TryAlternate = 0x0300,
    BadRequest = 0x0400,
    Unauthorized = 0x0401,
    Forbidden = 0x0403,
    RequestTimedout = 0x0408,
    UnknownAttribute = 0x0414,
    AllocationMismatch = 0x0425,
    StaleNonce = 0x0426,
    AddressFamilyNotSupported = 0x0428,
    WrongCredentials = 0x0429,
    UnsupportedTransportAddress = 0x042A,
    PeerAddressFamilyMismatch = 0x042B,
    AllocationQuotaReached = 0x0456,
    ServerError = 0x0500,
    InsufficientCapacity = 0x0508,
}

impl ErrorKind {
    /// the decimal error code, e.g. 438 for stale nonce.
    ///
    /// # Test
    ///
    /// ```
    /// use peerlink_codec::message::attributes::ErrorKind;
    ///
    /// assert_eq!(ErrorKind::Unauthorized.code(), 401);
    /// assert_eq!(ErrorKind::StaleNonce.code(), 438);
    /// assert_eq!(ErrorKind::UnknownAttribute.code(), 420);
    /// ```
    pub fn code(self) -> u16 {
        let value = self as u16;
        (value >> 8) * 100 + (value & 0xFF)
    }
}

/// [RFC3629]: https://datatracker.ietf.org/doc/html/rfc3629
///
/// The ERROR-CODE attribute is used in error response messages.  It
/// contains a numeric error code value in the range of 300 to 699 plus a
/// textual reason phrase encoded in UTF-8 [RFC3629].
///
/// ```text
/// 0                   1                   2                   3
/// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |           Reserved, should be 0         |Class|     Number    |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |      Reason Phrase (variable)                                ..
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Clone, Debug)]
pub struct ErrorAttr<'a> {
    pub code: u16,
    pub message: &'a str,
}

impl ErrorAttr<'_> {
    /// create error from error type.
    pub fn from(kind: ErrorKind) -> Self {
        Self {
            code: kind as u16,
            message: kind.into(),
        }
    }

    pub fn kind(&self) -> Option<ErrorKind> {
        ErrorKind::try_from(self.code).ok()
    }

    /// encode the error type as bytes.
    ///
    /// # Test
    ///
    /// ```
    /// use peerlink_codec::message::attributes::{ErrorAttr, ErrorKind};
    /// use bytes::BytesMut;
    ///
    /// let buffer = [
    ///     0x00u8, 0x00, 0x03, 0x00, 0x54, 0x72, 0x79, 0x20, 0x41, 0x6c, 0x74,
    ///     0x65, 0x72, 0x6e, 0x61, 0x74, 0x65,
    /// ];
    ///
    /// let mut buf = BytesMut::with_capacity(1280);
    /// ErrorAttr::from(ErrorKind::TryAlternate).encode(&mut buf);
    /// assert_eq!(&buf[..], &buffer);
    /// ```
    pub fn encode(self, buf: &mut BytesMut) {
        buf.put_u16(0x0000);
        buf.put_u16(self.code);
        buf.put(self.message.as_bytes());
    }
}

impl<'a> TryFrom<&'a [u8]> for ErrorAttr<'a> {
    type Error = Error;

    /// # Test
    ///
    /// ```
    /// use peerlink_codec::message::attributes::{ErrorAttr, ErrorKind};
    /// use std::convert::TryFrom;
    ///
    /// let buffer = [
    ///     0x00u8, 0x00, 0x03, 0x00, 0x54, 0x72, 0x79, 0x20, 0x41, 0x6c, 0x74,
    ///     0x65, 0x72, 0x6e, 0x61, 0x74, 0x65,
    /// ];
    ///
    /// let error = ErrorAttr::try_from(&buffer[..]).unwrap();
    /// assert_eq!(error.code, ErrorKind::TryAlternate as u16);
    /// assert_eq!(error.message, "Try Alternate");
    /// ```
    fn try_from(packet: &'a [u8]) -> Result<Self, Error> {
        if packet.len() < 4 {
            return Err(Error::InvalidInput);
        }

        if u16::from_be_bytes(packet[..2].try_into()?) != 0x0000 {
            return Err(Error::InvalidInput);
        }

        Ok(Self {
            code: u16::from_be_bytes(packet[2..4].try_into()?),
            message: std::str::from_utf8(&packet[4..])?,
        })
    }
}

impl From<ErrorKind> for &'static str {
    #[rustfmt::skip]
    fn from(val: ErrorKind) -> Self {
        match val {
            ErrorKind::TryAlternate => "Try Alternate",
            ErrorKind::BadRequest => "Bad Request",
            ErrorKind::Unauthorized => "Unauthorized",
            ErrorKind::Forbidden => "Forbidden",
            ErrorKind::RequestTimedout => "Request Timed out",
            ErrorKind::UnknownAttribute => "Unknown Attribute",
            ErrorKind::AllocationMismatch => "Allocation Mismatch",
            ErrorKind::StaleNonce => "Stale Nonce",
            ErrorKind::AddressFamilyNotSupported => "Address Family not Supported",
            ErrorKind::WrongCredentials => "Wrong Credentials",
            ErrorKind::UnsupportedTransportAddress => "Unsupported Transport Address",
            ErrorKind::PeerAddressFamilyMismatch => "Peer Address Family Mismatch",
            ErrorKind::AllocationQuotaReached => "Allocation Quota Reached",
            ErrorKind::ServerError => "Server Error",
            ErrorKind::InsufficientCapacity => "Insufficient Capacity",
        }
    }
}

impl Eq for ErrorAttr<'_> {}
impl PartialEq for ErrorAttr<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.code == other.code
    }
}
