pub mod attributes;
pub mod methods;

use bytes::{BufMut, BytesMut};

use crate::{
    Attributes, Error,
    crypto::{Password, fingerprint, hmac_sha1},
    message::{
        attributes::{Attribute, AttributeType, is_comprehension_required},
        methods::Method,
    },
};

/// The magic cookie every RFC 5389 message carries in bytes 4..8.
pub const MAGIC_COOKIE: u32 = 0x2112A442;

/// Which RFC generation the remote side speaks.  RFC 3489 servers emit
/// and expect MAPPED-ADDRESS where everything later uses the XOR form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RfcVariant {
    Rfc3489,
    #[default]
    Rfc5389,
}

pub struct MessageEncoder<'a> {
    token: &'a [u8],
    bytes: &'a mut BytesMut,
}

impl<'a> MessageEncoder<'a> {
    /// create a message encoder writing into the given buffer.
    pub fn new(method: Method, token: &'a [u8; 12], bytes: &'a mut BytesMut) -> Self {
        bytes.clear();
        bytes.put_u16(method.into());
        bytes.put_u16(0);
        bytes.put_u32(MAGIC_COOKIE);
        bytes.put(token.as_slice());

        Self { bytes, token }
    }

    /// rely on old message to create new message.
    ///
    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use peerlink_codec::message::methods::*;
    /// use peerlink_codec::message::*;
    /// use peerlink_codec::*;
    ///
    /// let buffer = [
    ///     0x00u8, 0x01, 0x00, 0x00, 0x21, 0x12, 0xa4, 0x42, 0x72, 0x6d, 0x49,
    ///     0x42, 0x72, 0x52, 0x64, 0x48, 0x57, 0x62, 0x4b, 0x2b,
    /// ];
    ///
    /// let mut attributes = Attributes::default();
    /// let mut buf = BytesMut::new();
    /// let old = Message::decode(&buffer[..], &mut attributes).unwrap();
    /// MessageEncoder::extend(BINDING_REQUEST, &old, &mut buf);
    ///
    /// assert_eq!(&buf[..], &buffer[..]);
    /// ```
    pub fn extend(method: Method, reader: &Message<'a>, bytes: &'a mut BytesMut) -> Self {
        let token = reader.token();

        bytes.clear();
        bytes.put_u16(method.into());
        bytes.put_u16(0);
        bytes.put_u32(MAGIC_COOKIE);
        bytes.put(token);
        Self { bytes, token }
    }

    /// append attribute to message attribute list.
    ///
    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use peerlink_codec::message::attributes::*;
    /// use peerlink_codec::message::methods::*;
    /// use peerlink_codec::message::*;
    /// use peerlink_codec::*;
    ///
    /// let buffer = [
    ///     0x00u8, 0x01, 0x00, 0x00, 0x21, 0x12, 0xa4, 0x42, 0x72, 0x6d, 0x49,
    ///     0x42, 0x72, 0x52, 0x64, 0x48, 0x57, 0x62, 0x4b, 0x2b,
    /// ];
    ///
    /// let new_buf = [
    ///     0x00u8, 0x01, 0x00, 0x00, 0x21, 0x12, 0xa4, 0x42, 0x72, 0x6d, 0x49,
    ///     0x42, 0x72, 0x52, 0x64, 0x48, 0x57, 0x62, 0x4b, 0x2b, 0x00, 0x06, 0x00,
    ///     0x05, 0x70, 0x61, 0x6e, 0x64, 0x61, 0x00, 0x00, 0x00,
    /// ];
    ///
    /// let mut buf = BytesMut::new();
    /// let mut attributes = Attributes::default();
    /// let old = Message::decode(&buffer[..], &mut attributes).unwrap();
    /// let mut message = MessageEncoder::extend(BINDING_REQUEST, &old, &mut buf);
    ///
    /// message.append::<UserName>("panda");
    ///
    /// assert_eq!(&new_buf[..], &buf[..]);
    /// ```
    pub fn append<'c, T: Attribute<'c>>(&'c mut self, value: T::Item) {
        self.bytes.put_u16(T::TYPE as u16);

        // record the current position, and then advance the internal
        // cursor 2 bytes, here is to reserve the position.
        let os = self.bytes.len();
        self.bytes.put_u16(0);
        T::serialize(value, self.bytes, self.token);

        // compute write index, back to source index write size.
        let size = self.bytes.len() - os - 2;
        let size_buf = (size as u16).to_be_bytes();
        self.bytes[os] = size_buf[0];
        self.bytes[os + 1] = size_buf[1];

        // if you need to padding, padding in the zero bytes.
        let psize = alignment_32(size);
        if psize > 0 {
            self.bytes.put(&[0u8; 4][0..psize]);
        }
    }

    /// finalize the message into the buffer.
    ///
    /// With a password the MESSAGE-INTEGRITY and FINGERPRINT attributes
    /// are appended, in that order, FINGERPRINT last.
    ///
    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use peerlink_codec::crypto::*;
    /// use peerlink_codec::message::methods::*;
    /// use peerlink_codec::message::*;
    /// use peerlink_codec::*;
    ///
    /// let buffer = [
    ///     0x00u8, 0x01, 0x00, 0x00, 0x21, 0x12, 0xa4, 0x42, 0x72, 0x6d, 0x49,
    ///     0x42, 0x72, 0x52, 0x64, 0x48, 0x57, 0x62, 0x4b, 0x2b,
    /// ];
    ///
    /// let result = [
    ///     0, 1, 0, 32, 33, 18, 164, 66, 114, 109, 73, 66, 114, 82, 100, 72, 87,
    ///     98, 75, 43, 0, 8, 0, 20, 69, 14, 110, 68, 82, 30, 232, 222, 44, 240,
    ///     250, 182, 156, 92, 25, 23, 152, 198, 217, 222, 128, 40, 0, 4, 74, 165,
    ///     171, 86,
    /// ];
    ///
    /// let mut attributes = Attributes::default();
    /// let mut buf = BytesMut::with_capacity(1280);
    /// let old = Message::decode(&buffer[..], &mut attributes).unwrap();
    /// let mut message = MessageEncoder::extend(BINDING_REQUEST, &old, &mut buf);
    ///
    /// let password = Password::long_term("panda", "raspberry", "panda");
    /// message.flush(Some(&password)).unwrap();
    ///
    /// assert_eq!(&buf[..], &result);
    /// ```
    pub fn flush(&mut self, password: Option<&Password>) -> Result<(), Error> {
        // write attribute list size.
        self.set_len(self.bytes.len() - 20);

        // if need message integrity?
        if let Some(it) = password {
            self.checksum(it)?;
        }

        Ok(())
    }

    // append MessageIntegrity and Fingerprint attributes.
    //
    // During the integrity computation the header length covers the
    // MESSAGE-INTEGRITY attribute but nothing after it; the final length
    // also covers the trailing FINGERPRINT.
    fn checksum(&mut self, password: &Password) -> Result<(), Error> {
        let len = self.bytes.len();

        // compute new size, new size include the MessageIntegrity
        // attribute size.
        self.set_len(len - 20 + 24);

        {
            let hmac = hmac_sha1(password.key(), &[&self.bytes[..]])?;
            self.bytes.put_u16(AttributeType::MessageIntegrity as u16);
            self.bytes.put_u16(20);
            self.bytes.put(hmac.as_slice());
        }

        // compute new size, new size include the Fingerprint attribute
        // size.
        self.set_len(len - 20 + 24 + 8);

        let crc = fingerprint(self.bytes);
        self.bytes.put_u16(AttributeType::Fingerprint as u16);
        self.bytes.put_u16(4);
        self.bytes.put_u32(crc);

        Ok(())
    }

    // set stun message header size.
    fn set_len(&mut self, len: usize) {
        self.bytes[2..4].copy_from_slice((len as u16).to_be_bytes().as_slice());
    }
}

pub struct Message<'a> {
    /// message method.
    method: Method,
    /// message source bytes.
    bytes: &'a [u8],
    /// offset of the MESSAGE-INTEGRITY attribute, or the end of the
    /// attribute list when there is none.
    integrity_offset: u16,
    // message attribute list.
    attributes: &'a Attributes,
}

impl<'a> Message<'a> {
    /// message method.
    #[inline]
    pub fn method(&self) -> Method {
        self.method
    }

    /// message transaction id.
    #[inline]
    pub fn token(&self) -> &'a [u8] {
        &self.bytes[8..20]
    }

    /// get attribute from message attribute list.
    pub fn get<T: Attribute<'a>>(&self) -> Option<T::Item> {
        let range = self.attributes.get(T::TYPE)?;
        T::deserialize(&self.bytes[range], self.token()).ok()
    }

    /// Gets all the values of an attribute from a list.
    ///
    /// A stun message can carry multiple attributes with the same type,
    /// CreatePermission requests batch peers this way.
    pub fn get_all<T: Attribute<'a>>(&self) -> impl Iterator<Item = T::Item> {
        self.attributes
            .get_all(T::TYPE)
            .map(|it| T::deserialize(&self.bytes[it.clone()], self.token()))
            .filter_map(|it| it.ok())
    }

    /// comprehension-required attribute types this parser did not
    /// understand; a non-empty list warrants a 420 error response.
    pub fn unknown_required_attributes(&self) -> &[u16] {
        &self.attributes.unknown
    }

    /// check the MESSAGE-INTEGRITY attribute against a password.
    ///
    /// The HMAC input is the message up to the MESSAGE-INTEGRITY
    /// attribute with the header length patched to end just past it.
    ///
    /// # Test
    ///
    /// ```
    /// use peerlink_codec::crypto::*;
    /// use peerlink_codec::message::*;
    /// use peerlink_codec::*;
    ///
    /// let buffer = [
    ///     0x00u8, 0x03, 0x00, 0x50, 0x21, 0x12, 0xa4, 0x42, 0x64, 0x4f, 0x5a,
    ///     0x78, 0x6a, 0x56, 0x33, 0x62, 0x4b, 0x52, 0x33, 0x31, 0x00, 0x19, 0x00,
    ///     0x04, 0x11, 0x00, 0x00, 0x00, 0x00, 0x06, 0x00, 0x05, 0x70, 0x61, 0x6e,
    ///     0x64, 0x61, 0x00, 0x00, 0x00, 0x00, 0x14, 0x00, 0x09, 0x72, 0x61, 0x73,
    ///     0x70, 0x62, 0x65, 0x72, 0x72, 0x79, 0x00, 0x00, 0x00, 0x00, 0x15, 0x00,
    ///     0x10, 0x31, 0x63, 0x31, 0x33, 0x64, 0x32, 0x62, 0x32, 0x34, 0x35, 0x62,
    ///     0x33, 0x61, 0x37, 0x33, 0x34, 0x00, 0x08, 0x00, 0x14, 0xd6, 0x78, 0x26,
    ///     0x99, 0x0e, 0x15, 0x56, 0x15, 0xe5, 0xf4, 0x24, 0x74, 0xe2, 0x3c, 0x26,
    ///     0xc5, 0xb1, 0x03, 0xb2, 0x6d,
    /// ];
    ///
    /// let mut attributes = Attributes::default();
    /// let message = Message::decode(&buffer[..], &mut attributes).unwrap();
    ///
    /// let password = Password::long_term("panda", "raspberry", "panda");
    /// assert!(message.checksum(&password).is_ok());
    ///
    /// let wrong = Password::long_term("panda", "raspberry", "pandas");
    /// assert!(message.checksum(&wrong).is_err());
    /// ```
    pub fn checksum(&self, password: &Password) -> Result<(), Error> {
        if self.bytes.is_empty() || self.integrity_offset < 20 {
            return Err(Error::InvalidInput);
        }

        // unwrap MessageIntegrity attribute, an error occurs if not
        // found.
        let integrity = self
            .get::<attributes::MessageIntegrity>()
            .ok_or(Error::NotFoundIntegrity)?;

        // patched header covers the attributes up to and including the
        // 24-byte MESSAGE-INTEGRITY item.
        let size_buf = (self.integrity_offset + 4).to_be_bytes();
        let body = [
            &self.bytes[0..2],
            &size_buf,
            &self.bytes[4..self.integrity_offset as usize],
        ];

        if integrity != hmac_sha1(password.key(), &body)?.as_slice() {
            return Err(Error::IntegrityFailed);
        }

        Ok(())
    }

    /// # Test
    ///
    /// ```
    /// use peerlink_codec::message::attributes::*;
    /// use peerlink_codec::message::methods::*;
    /// use peerlink_codec::message::*;
    /// use peerlink_codec::*;
    ///
    /// let buffer: [u8; 20] = [
    ///     0x00, 0x01, 0x00, 0x00, 0x21, 0x12, 0xa4, 0x42, 0x72, 0x6d, 0x49, 0x42,
    ///     0x72, 0x52, 0x64, 0x48, 0x57, 0x62, 0x4b, 0x2b,
    /// ];
    ///
    /// let mut attributes = Attributes::default();
    /// let message = Message::decode(&buffer[..], &mut attributes).unwrap();
    ///
    /// assert_eq!(message.method(), BINDING_REQUEST);
    /// assert!(message.get::<UserName>().is_none());
    /// ```
    pub fn decode(bytes: &'a [u8], attributes: &'a mut Attributes) -> Result<Self, Error> {
        let len = bytes.len();

        // There must be at least a complete header.
        if len < 20 {
            return Err(Error::InvalidInput);
        }

        let method = Method::try_from(u16::from_be_bytes(bytes[..2].try_into()?))?;

        // First check whether the message length is valid, before any
        // attribute is looked at.  The length field does not include the
        // header.
        {
            let size = u16::from_be_bytes(bytes[2..4].try_into()?) as usize + 20;
            if len < size {
                return Err(Error::InvalidInput);
            }
        }

        // Check whether the magic number is the same.
        if bytes[4..8] != MAGIC_COOKIE.to_be_bytes() {
            return Err(Error::NotFoundMagicNumber);
        }

        let mut find_integrity = false;
        let mut integrity_offset = 0;
        let mut fingerprint_offset = None;
        let mut offset = 20;

        loop {
            // if the buf length is not long enough to continue, jump out
            // of the loop.
            if len - offset < 4 {
                break;
            }

            // get attribute type
            let key = u16::from_be_bytes([bytes[offset], bytes[offset + 1]]);

            // whether the MessageIntegrity attribute has been found, if
            // found, record the current offset position.
            if !find_integrity {
                integrity_offset = offset as u16;
            }

            // get attribute size
            let size = u16::from_be_bytes([bytes[offset + 2], bytes[offset + 3]]) as usize;

            // check if the attribute length has overflowed.
            let value_offset = offset + 4;
            if len - value_offset < size {
                break;
            }

            // body range.
            let range = value_offset..(value_offset + size);

            // if there are padding bytes, skip padding size.
            offset = value_offset + size + alignment_32(size);

            let kind = match AttributeType::try_from(key) {
                Ok(kind) => {
                    // check whether the current attribute is
                    // MessageIntegrity, if it is, mark this attribute
                    // has been found.
                    if kind == AttributeType::MessageIntegrity {
                        find_integrity = true;
                    }

                    if kind == AttributeType::Fingerprint && size == 4 {
                        fingerprint_offset = Some(range.start - 4);
                    }

                    kind
                }
                Err(_) => {
                    // skip the attributes that are not supported, but an
                    // unknown comprehension-required attribute must be
                    // reported upward.
                    if is_comprehension_required(key) {
                        attributes.unknown.push(key);
                    }

                    continue;
                }
            };

            // insert attribute to attributes list.
            attributes.append(kind, range);
        }

        if !find_integrity {
            integrity_offset = offset as u16;
        }

        // FINGERPRINT covers everything before it, computed with the
        // length field as transmitted; a mismatch discards the message.
        if let Some(os) = fingerprint_offset {
            let expect = u32::from_be_bytes(bytes[os + 4..os + 8].try_into()?);
            if fingerprint(&bytes[..os]) != expect {
                return Err(Error::FingerprintFailed);
            }
        }

        Ok(Self {
            integrity_offset,
            attributes,
            method,
            bytes,
        })
    }

    /// the full size of the message starting at the head of the buffer,
    /// for stream reassembly.
    ///
    /// # Test
    ///
    /// ```
    /// use peerlink_codec::message::*;
    ///
    /// let buffer: [u8; 20] = [
    ///     0x00, 0x01, 0x00, 0x00, 0x21, 0x12, 0xa4, 0x42, 0x72, 0x6d, 0x49, 0x42,
    ///     0x72, 0x52, 0x64, 0x48, 0x57, 0x62, 0x4b, 0x2b,
    /// ];
    ///
    /// assert_eq!(Message::message_size(&buffer[..]).unwrap(), 20);
    /// ```
    pub fn message_size(buffer: &[u8]) -> Result<usize, Error> {
        if buffer.len() < 20 || buffer[0] >> 6 != 0 {
            return Err(Error::InvalidInput);
        }

        Ok(u16::from_be_bytes(buffer[2..4].try_into()?) as usize + 20)
    }
}

/// compute padding size.
///
/// RFC5766 stipulates that the attribute content is a multiple of 4.
///
/// # Test
///
/// ```
/// use peerlink_codec::message::alignment_32;
///
/// assert_eq!(alignment_32(4), 0);
/// assert_eq!(alignment_32(0), 0);
/// assert_eq!(alignment_32(5), 3);
/// ```
#[inline(always)]
pub fn alignment_32(size: usize) -> usize {
    let range = size % 4;
    if size == 0 || range == 0 {
        return 0;
    }

    4 - range
}
