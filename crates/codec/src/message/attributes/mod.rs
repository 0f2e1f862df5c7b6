pub mod address;
pub mod error;

use bytes::{BufMut, BytesMut};
use num_enum::TryFromPrimitive;

use std::net::SocketAddr;

pub use self::{
    address::Addr,
    error::{ErrorAttr, ErrorKind},
};

use crate::Error;

/// STUN Attribute Registry
///
/// Attribute types in the range 0x0000 - 0x7FFF are considered
/// comprehension-required; attribute types in the range 0x8000 - 0xFFFF
/// are considered comprehension-optional.  A STUN agent handles unknown
/// comprehension-required and comprehension-optional attributes
/// differently.
///
/// The types 0x8050 - 0x8055 carry the reliable-channel extension and are
/// deliberately comprehension-optional so that a plain STUN agent ignores
/// them.
#[repr(u16)]
#[derive(TryFromPrimitive)]
#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy)]
pub enum AttributeType {
    MappedAddress = 0x0001,
    UserName = 0x0006,
    MessageIntegrity = 0x0008,
    ErrorCode = 0x0009,
    UnknownAttributes = 0x000A,
    ChannelNumber = 0x000C,
    Lifetime = 0x000D,
    XorPeerAddress = 0x0012,
    Data = 0x0013,
    Realm = 0x0014,
    Nonce = 0x0015,
    XorRelayedAddress = 0x0016,
    EvenPort = 0x0018,
    RequestedTransport = 0x0019,
    DontFragment = 0x001A,
    XorMappedAddress = 0x0020,
    ReservationToken = 0x0022,
    Priority = 0x0024,
    UseCandidate = 0x0025,
    Software = 0x8022,
    AlternateServer = 0x8023,
    Fingerprint = 0x8028,
    IceControlled = 0x8029,
    IceControlling = 0x802A,
    ResponseOrigin = 0x802B,
    NextSequenceNumber = 0x8050,
    Gsnr = 0x8051,
    Gsnfr = 0x8052,
    AckVector = 0x8053,
    CongestionControl = 0x8054,
    ReliabilityFlags = 0x8055,
}

/// Whether an unknown attribute of this raw type would have to be
/// reported through a 420 error response.
pub fn is_comprehension_required(kind: u16) -> bool {
    kind < 0x8000
}

/// stun/turn message attribute.
///
/// The same implementation serializes the attribute value into an
/// encoder buffer and deserializes the raw value range of a received
/// message; the transaction token is passed through for the XOR address
/// family.
pub trait Attribute<'a> {
    const TYPE: AttributeType;
    type Item;

    /// write the current attribute to the buffer.
    fn serialize(value: Self::Item, buf: &mut BytesMut, token: &[u8]);

    /// convert buffer to current attribute.
    fn deserialize(buf: &'a [u8], token: &'a [u8]) -> Result<Self::Item, Error>;
}

/// The USERNAME attribute is used for message integrity.  It identifies
/// the username and password combination used in the message-integrity
/// check.
///
/// The value of USERNAME is a variable-length value containing the
/// authentication username.  It MUST contain a UTF-8-encoded [RFC3629]
/// sequence of fewer than 509 bytes and MUST have been processed using
/// the OpaqueString profile [RFC8265].
pub struct UserName;
impl<'a> Attribute<'a> for UserName {
    const TYPE: AttributeType = AttributeType::UserName;
    type Item = &'a str;

    fn serialize(value: Self::Item, buf: &mut BytesMut, _: &[u8]) {
        buf.put(value.as_bytes());
    }

    fn deserialize(buf: &'a [u8], _: &'a [u8]) -> Result<Self::Item, Error> {
        Ok(std::str::from_utf8(buf)?)
    }
}

/// The DATA attribute is present in all Send and Data indications.  The
/// value portion of this attribute is variable length and consists of
/// the application data (that is, the data that would immediately follow
/// the UDP header if the data was been sent directly between the client
/// and the peer).  If the length of this attribute is not a multiple of
/// 4, then padding must be added after this attribute.
pub struct Data;
impl<'a> Attribute<'a> for Data {
    const TYPE: AttributeType = AttributeType::Data;
    type Item = &'a [u8];

    fn serialize(value: Self::Item, buf: &mut BytesMut, _: &[u8]) {
        buf.put(value);
    }

    fn deserialize(buf: &'a [u8], _: &'a [u8]) -> Result<Self::Item, Error> {
        Ok(buf)
    }
}

/// The REALM attribute may be present in requests and responses.  It
/// contains text that meets the grammar for "realm-value" as described
/// in [RFC3261] but without the double quotes and their surrounding
/// whitespace.
///
/// Presence of the REALM attribute in a request indicates that long-term
/// credentials are being used for authentication.  Presence in certain
/// error responses indicates that the server wishes the client to use a
/// long-term credential in that realm for authentication.
pub struct Realm;
impl<'a> Attribute<'a> for Realm {
    const TYPE: AttributeType = AttributeType::Realm;
    type Item = &'a str;

    fn serialize(value: Self::Item, buf: &mut BytesMut, _: &[u8]) {
        buf.put(value.as_bytes());
    }

    fn deserialize(buf: &'a [u8], _: &'a [u8]) -> Result<Self::Item, Error> {
        Ok(std::str::from_utf8(buf)?)
    }
}

/// The NONCE attribute may be present in requests and responses.  It
/// contains a sequence of qdtext or quoted-pair, which are defined in
/// [RFC3261].  The NONCE attribute MUST be fewer than 128 characters.
pub struct Nonce;
impl<'a> Attribute<'a> for Nonce {
    const TYPE: AttributeType = AttributeType::Nonce;
    type Item = &'a str;

    fn serialize(value: Self::Item, buf: &mut BytesMut, _: &[u8]) {
        buf.put(value.as_bytes());
    }

    fn deserialize(buf: &'a [u8], _: &'a [u8]) -> Result<Self::Item, Error> {
        Ok(std::str::from_utf8(buf)?)
    }
}

/// The SOFTWARE attribute contains a textual description of the software
/// being used by the agent sending the message.  The attribute has no
/// impact on operation of the protocol and serves only as a tool for
/// diagnostic and debugging purposes.
pub struct Software;
impl<'a> Attribute<'a> for Software {
    const TYPE: AttributeType = AttributeType::Software;
    type Item = &'a str;

    fn serialize(value: Self::Item, buf: &mut BytesMut, _: &[u8]) {
        buf.put(value.as_bytes());
    }

    fn deserialize(buf: &'a [u8], _: &'a [u8]) -> Result<Self::Item, Error> {
        Ok(std::str::from_utf8(buf)?)
    }
}

/// The MESSAGE-INTEGRITY attribute contains an HMAC-SHA1 [RFC2104] of
/// the STUN message.  Since it uses the SHA-1 hash, the HMAC will be 20
/// bytes.
///
/// The text used as input to HMAC is the STUN message, up to and
/// including the attribute preceding the MESSAGE-INTEGRITY attribute.
/// The Length field of the STUN message header is adjusted to point to
/// the end of the MESSAGE-INTEGRITY attribute.
pub struct MessageIntegrity;
impl<'a> Attribute<'a> for MessageIntegrity {
    const TYPE: AttributeType = AttributeType::MessageIntegrity;
    type Item = &'a [u8];

    fn serialize(value: Self::Item, buf: &mut BytesMut, _: &[u8]) {
        buf.put(value);
    }

    fn deserialize(buf: &'a [u8], _: &'a [u8]) -> Result<Self::Item, Error> {
        Ok(buf)
    }
}

/// The ERROR-CODE attribute, see [`ErrorAttr`].
pub struct ErrorCode;
impl<'a> Attribute<'a> for ErrorCode {
    const TYPE: AttributeType = AttributeType::ErrorCode;
    type Item = ErrorAttr<'a>;

    fn serialize(value: Self::Item, buf: &mut BytesMut, _: &[u8]) {
        value.encode(buf);
    }

    fn deserialize(buf: &'a [u8], _: &'a [u8]) -> Result<Self::Item, Error> {
        ErrorAttr::try_from(buf)
    }
}

/// The UNKNOWN-ATTRIBUTES attribute is present only in an error response
/// when the response code in the ERROR-CODE attribute is 420.  It
/// contains a list of 16-bit values, each of which represents an
/// attribute type that was not understood by the server.
pub struct UnknownAttributes;
impl<'a> Attribute<'a> for UnknownAttributes {
    const TYPE: AttributeType = AttributeType::UnknownAttributes;
    type Item = Vec<u16>;

    fn serialize(value: Self::Item, buf: &mut BytesMut, _: &[u8]) {
        for kind in value {
            buf.put_u16(kind);
        }
    }

    fn deserialize(buf: &'a [u8], _: &'a [u8]) -> Result<Self::Item, Error> {
        if buf.len() % 2 != 0 {
            return Err(Error::InvalidInput);
        }

        Ok(buf
            .chunks_exact(2)
            .map(|it| u16::from_be_bytes([it[0], it[1]]))
            .collect())
    }
}

/// The address a server observed the request arrive from.
pub struct MappedAddress;
impl<'a> Attribute<'a> for MappedAddress {
    const TYPE: AttributeType = AttributeType::MappedAddress;
    type Item = SocketAddr;

    fn serialize(value: Self::Item, buf: &mut BytesMut, token: &[u8]) {
        Addr::encode(&value, token, buf, false)
    }

    fn deserialize(buf: &'a [u8], token: &'a [u8]) -> Result<Self::Item, Error> {
        Addr::decode(buf, token, false)
    }
}

/// Identical to MAPPED-ADDRESS, except the transport address is
/// obfuscated through the XOR function.
pub struct XorMappedAddress;
impl<'a> Attribute<'a> for XorMappedAddress {
    const TYPE: AttributeType = AttributeType::XorMappedAddress;
    type Item = SocketAddr;

    fn serialize(value: Self::Item, buf: &mut BytesMut, token: &[u8]) {
        Addr::encode(&value, token, buf, true)
    }

    fn deserialize(buf: &'a [u8], token: &'a [u8]) -> Result<Self::Item, Error> {
        Addr::decode(buf, token, true)
    }
}

/// The XOR-PEER-ADDRESS specifies the address and port of the peer as
/// seen from the TURN server.  (For example, the peer's server-reflexive
/// transport address if the peer is behind a NAT.)
pub struct XorPeerAddress;
impl<'a> Attribute<'a> for XorPeerAddress {
    const TYPE: AttributeType = AttributeType::XorPeerAddress;
    type Item = SocketAddr;

    fn serialize(value: Self::Item, buf: &mut BytesMut, token: &[u8]) {
        Addr::encode(&value, token, buf, true)
    }

    fn deserialize(buf: &'a [u8], token: &'a [u8]) -> Result<Self::Item, Error> {
        Addr::decode(buf, token, true)
    }
}

/// The XOR-RELAYED-ADDRESS is present in Allocate responses.  It
/// specifies the address and port that the server allocated to the
/// client.
pub struct XorRelayedAddress;
impl<'a> Attribute<'a> for XorRelayedAddress {
    const TYPE: AttributeType = AttributeType::XorRelayedAddress;
    type Item = SocketAddr;

    fn serialize(value: Self::Item, buf: &mut BytesMut, token: &[u8]) {
        Addr::encode(&value, token, buf, true)
    }

    fn deserialize(buf: &'a [u8], token: &'a [u8]) -> Result<Self::Item, Error> {
        Addr::decode(buf, token, true)
    }
}

/// The alternate server a client should try when it receives a 300.
pub struct AlternateServer;
impl<'a> Attribute<'a> for AlternateServer {
    const TYPE: AttributeType = AttributeType::AlternateServer;
    type Item = SocketAddr;

    fn serialize(value: Self::Item, buf: &mut BytesMut, token: &[u8]) {
        Addr::encode(&value, token, buf, false)
    }

    fn deserialize(buf: &'a [u8], token: &'a [u8]) -> Result<Self::Item, Error> {
        Addr::decode(buf, token, false)
    }
}

/// The source address the response was sent from, for diagnostics.
pub struct ResponseOrigin;
impl<'a> Attribute<'a> for ResponseOrigin {
    const TYPE: AttributeType = AttributeType::ResponseOrigin;
    type Item = SocketAddr;

    fn serialize(value: Self::Item, buf: &mut BytesMut, token: &[u8]) {
        Addr::encode(&value, token, buf, false)
    }

    fn deserialize(buf: &'a [u8], token: &'a [u8]) -> Result<Self::Item, Error> {
        Addr::decode(buf, token, false)
    }
}

/// The CHANNEL-NUMBER attribute contains the number of the channel.  The
/// value portion of this attribute is 4 bytes long and consists of a
/// 16-bit unsigned integer, followed by a two-octet RFFU (Reserved For
/// Future Use) field, which MUST be set to 0 on transmission and MUST be
/// ignored on reception.
pub struct ChannelNumber;
impl<'a> Attribute<'a> for ChannelNumber {
    const TYPE: AttributeType = AttributeType::ChannelNumber;
    type Item = u16;

    fn serialize(value: Self::Item, buf: &mut BytesMut, _: &[u8]) {
        buf.put_u16(value);
        buf.put_u16(0);
    }

    fn deserialize(buf: &'a [u8], _: &'a [u8]) -> Result<Self::Item, Error> {
        if buf.len() < 2 {
            return Err(Error::InvalidInput);
        }

        Ok(u16::from_be_bytes([buf[0], buf[1]]))
    }
}

/// The LIFETIME attribute represents the duration for which the server
/// will maintain an allocation in the absence of a refresh.  The value
/// portion of this attribute is 4 bytes long and consists of a 32-bit
/// unsigned integral value representing the number of seconds remaining
/// until expiration.
pub struct Lifetime;
impl<'a> Attribute<'a> for Lifetime {
    const TYPE: AttributeType = AttributeType::Lifetime;
    type Item = u32;

    fn serialize(value: Self::Item, buf: &mut BytesMut, _: &[u8]) {
        buf.put_u32(value);
    }

    fn deserialize(buf: &'a [u8], _: &'a [u8]) -> Result<Self::Item, Error> {
        Ok(u32::from_be_bytes(buf.try_into()?))
    }
}

/// Transport protocol requested for an allocation, IANA protocol
/// numbers.
#[repr(u8)]
#[derive(TryFromPrimitive)]
#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy)]
pub enum Transport {
    Tcp = 0x06,
    Udp = 0x11,
}

/// The REQUESTED-TRANSPORT attribute is used by the client to request a
/// specific transport protocol for the allocated transport address.  The
/// 4-byte value contains the protocol number followed by three RFFU
/// bytes.
pub struct RequestedTransport;
impl<'a> Attribute<'a> for RequestedTransport {
    const TYPE: AttributeType = AttributeType::RequestedTransport;
    type Item = Transport;

    fn serialize(value: Self::Item, buf: &mut BytesMut, _: &[u8]) {
        buf.put_u8(value as u8);
        buf.put(&[0u8; 3][..]);
    }

    fn deserialize(buf: &'a [u8], _: &'a [u8]) -> Result<Self::Item, Error> {
        if buf.is_empty() {
            return Err(Error::InvalidInput);
        }

        Transport::try_from(buf[0]).map_err(|_| Error::InvalidInput)
    }
}

/// The EVEN-PORT attribute allows the client to request that the port in
/// the relayed transport address be even, and (optionally) that the
/// server reserve the next-higher port number.
pub struct EvenPort;
impl<'a> Attribute<'a> for EvenPort {
    const TYPE: AttributeType = AttributeType::EvenPort;
    type Item = bool;

    fn serialize(value: Self::Item, buf: &mut BytesMut, _: &[u8]) {
        buf.put_u8(if value { 0x80 } else { 0 });
    }

    fn deserialize(buf: &'a [u8], _: &'a [u8]) -> Result<Self::Item, Error> {
        if buf.is_empty() {
            return Err(Error::InvalidInput);
        }

        Ok(buf[0] & 0x80 != 0)
    }
}

/// When present, DONT-FRAGMENT asks the server to set the DF bit on
/// packets relayed to the peer.  It has no value part.
pub struct DontFragment;
impl<'a> Attribute<'a> for DontFragment {
    const TYPE: AttributeType = AttributeType::DontFragment;
    type Item = ();

    fn serialize(_: Self::Item, _: &mut BytesMut, _: &[u8]) {}

    fn deserialize(_: &'a [u8], _: &'a [u8]) -> Result<Self::Item, Error> {
        Ok(())
    }
}

/// An 8-byte token that uniquely identifies a port reservation held by
/// the server.
pub struct ReservationToken;
impl<'a> Attribute<'a> for ReservationToken {
    const TYPE: AttributeType = AttributeType::ReservationToken;
    type Item = &'a [u8];

    fn serialize(value: Self::Item, buf: &mut BytesMut, _: &[u8]) {
        buf.put(value);
    }

    fn deserialize(buf: &'a [u8], _: &'a [u8]) -> Result<Self::Item, Error> {
        if buf.len() != 8 {
            return Err(Error::InvalidInput);
        }

        Ok(buf)
    }
}

/// The PRIORITY attribute indicates the priority that is to be
/// associated with a peer reflexive candidate, should one be discovered
/// by this check.
pub struct Priority;
impl<'a> Attribute<'a> for Priority {
    const TYPE: AttributeType = AttributeType::Priority;
    type Item = u32;

    fn serialize(value: Self::Item, buf: &mut BytesMut, _: &[u8]) {
        buf.put_u32(value);
    }

    fn deserialize(buf: &'a [u8], _: &'a [u8]) -> Result<Self::Item, Error> {
        Ok(u32::from_be_bytes(buf.try_into()?))
    }
}

/// The controlling agent includes USE-CANDIDATE to nominate a candidate
/// pair.  It has no value part.
pub struct UseCandidate;
impl<'a> Attribute<'a> for UseCandidate {
    const TYPE: AttributeType = AttributeType::UseCandidate;
    type Item = ();

    fn serialize(_: Self::Item, _: &mut BytesMut, _: &[u8]) {}

    fn deserialize(_: &'a [u8], _: &'a [u8]) -> Result<Self::Item, Error> {
        Ok(())
    }
}

/// Tie-breaker value of an agent in the controlled role.
pub struct IceControlled;
impl<'a> Attribute<'a> for IceControlled {
    const TYPE: AttributeType = AttributeType::IceControlled;
    type Item = u64;

    fn serialize(value: Self::Item, buf: &mut BytesMut, _: &[u8]) {
        buf.put_u64(value);
    }

    fn deserialize(buf: &'a [u8], _: &'a [u8]) -> Result<Self::Item, Error> {
        Ok(u64::from_be_bytes(buf.try_into()?))
    }
}

/// Tie-breaker value of an agent in the controlling role.
pub struct IceControlling;
impl<'a> Attribute<'a> for IceControlling {
    const TYPE: AttributeType = AttributeType::IceControlling;
    type Item = u64;

    fn serialize(value: Self::Item, buf: &mut BytesMut, _: &[u8]) {
        buf.put_u64(value);
    }

    fn deserialize(buf: &'a [u8], _: &'a [u8]) -> Result<Self::Item, Error> {
        Ok(u64::from_be_bytes(buf.try_into()?))
    }
}

/// CRC-32 of the message up to this attribute, XOR'ed with 0x5354554E.
/// When present it MUST be the last attribute of the message.
pub struct Fingerprint;
impl<'a> Attribute<'a> for Fingerprint {
    const TYPE: AttributeType = AttributeType::Fingerprint;
    type Item = u32;

    fn serialize(value: Self::Item, buf: &mut BytesMut, _: &[u8]) {
        buf.put_u32(value);
    }

    fn deserialize(buf: &'a [u8], _: &'a [u8]) -> Result<Self::Item, Error> {
        Ok(u32::from_be_bytes(buf.try_into()?))
    }
}

/// The sequence number the sender will assign to its next data packet on
/// the channel, 24 significant bits.
pub struct NextSequenceNumber;
impl<'a> Attribute<'a> for NextSequenceNumber {
    const TYPE: AttributeType = AttributeType::NextSequenceNumber;
    type Item = u32;

    fn serialize(value: Self::Item, buf: &mut BytesMut, _: &[u8]) {
        buf.put_u32(value & 0x00FF_FFFF);
    }

    fn deserialize(buf: &'a [u8], _: &'a [u8]) -> Result<Self::Item, Error> {
        Ok(u32::from_be_bytes(buf.try_into()?) & 0x00FF_FFFF)
    }
}

/// Greatest sequence number received on the channel.
pub struct Gsnr;
impl<'a> Attribute<'a> for Gsnr {
    const TYPE: AttributeType = AttributeType::Gsnr;
    type Item = u32;

    fn serialize(value: Self::Item, buf: &mut BytesMut, _: &[u8]) {
        buf.put_u32(value & 0x00FF_FFFF);
    }

    fn deserialize(buf: &'a [u8], _: &'a [u8]) -> Result<Self::Item, Error> {
        Ok(u32::from_be_bytes(buf.try_into()?) & 0x00FF_FFFF)
    }
}

/// Greatest sequence number fully received: every packet at or below it
/// has been delivered.
pub struct Gsnfr;
impl<'a> Attribute<'a> for Gsnfr {
    const TYPE: AttributeType = AttributeType::Gsnfr;
    type Item = u32;

    fn serialize(value: Self::Item, buf: &mut BytesMut, _: &[u8]) {
        buf.put_u32(value & 0x00FF_FFFF);
    }

    fn deserialize(buf: &'a [u8], _: &'a [u8]) -> Result<Self::Item, Error> {
        Ok(u32::from_be_bytes(buf.try_into()?) & 0x00FF_FFFF)
    }
}

/// Bitmap of received packets relative to GSNR: bit N set means packet
/// (GSNR - N) was received.
pub struct AckVector;
impl<'a> Attribute<'a> for AckVector {
    const TYPE: AttributeType = AttributeType::AckVector;
    type Item = u64;

    fn serialize(value: Self::Item, buf: &mut BytesMut, _: &[u8]) {
        buf.put_u64(value);
    }

    fn deserialize(buf: &'a [u8], _: &'a [u8]) -> Result<Self::Item, Error> {
        Ok(u64::from_be_bytes(buf.try_into()?))
    }
}

/// Ordered list of congestion control profiles the sender supports, most
/// preferred first.
pub struct CongestionControl;
impl<'a> Attribute<'a> for CongestionControl {
    const TYPE: AttributeType = AttributeType::CongestionControl;
    type Item = Vec<u16>;

    fn serialize(value: Self::Item, buf: &mut BytesMut, _: &[u8]) {
        for profile in value {
            buf.put_u16(profile);
        }
    }

    fn deserialize(buf: &'a [u8], _: &'a [u8]) -> Result<Self::Item, Error> {
        if buf.len() % 2 != 0 {
            return Err(Error::InvalidInput);
        }

        Ok(buf
            .chunks_exact(2)
            .map(|it| u16::from_be_bytes([it[0], it[1]]))
            .collect())
    }
}

/// Channel capability and control bits, see [`reliability_flags`].
pub struct ReliabilityFlags;
impl<'a> Attribute<'a> for ReliabilityFlags {
    const TYPE: AttributeType = AttributeType::ReliabilityFlags;
    type Item = u8;

    fn serialize(value: Self::Item, buf: &mut BytesMut, _: &[u8]) {
        buf.put_u8(value);
    }

    fn deserialize(buf: &'a [u8], _: &'a [u8]) -> Result<Self::Item, Error> {
        if buf.is_empty() {
            return Err(Error::InvalidInput);
        }

        Ok(buf[0])
    }
}

/// Bit assignments of the RELIABILITY-FLAGS attribute and of the flags
/// byte of the compact data frame.
pub mod reliability_flags {
    /// the packet consumes a sequence number but MUST NOT be delivered.
    pub const KEEP_ALIVE: u8 = 0x01;
    /// the sender has finished writing; shutdown handshake.
    pub const FIN: u8 = 0x02;
    /// the sequence field is not meaningful, acknowledgement only.
    pub const ACK_ONLY: u8 = 0x04;
    /// the sender is able to use the compact data frame.
    pub const COMPACT_FRAMING: u8 = 0x80;
}
