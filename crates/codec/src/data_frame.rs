use bytes::{BufMut, BytesMut};

use crate::Error;

/// size of the fixed frame header.
pub const HEADER_SIZE: usize = 24;

/// The compact reliable-channel data frame.
///
/// Negotiated at channel open as the fast path for sequenced data; the
/// STUN ChannelTransfer indication carries the same fields as attributes.
/// The leading four bytes deliberately mirror the ChannelData layout so
/// the first byte of every frame stays inside 0x40 - 0x7F and existing
/// demultiplexers keep working.
///
/// ```text
/// 0                   1                   2                   3
/// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |         Channel Number        |            Length             |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |     Flags     |                Sequence Number                |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |    Reserved   |                     GSNR                      |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |    Reserved   |                     GSNFR                     |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                                                               |
/// |                       ACK Vector (64 bit)                     |
/// |                                                               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                       Application Data                        |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// Length counts the application data only.  The flags byte shares the
/// bit assignments of the RELIABILITY-FLAGS attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame<'a> {
    pub channel: u16,
    pub flags: u8,
    pub sequence: u32,
    pub gsnr: u32,
    pub gsnfr: u32,
    pub ack_vector: u64,
    pub payload: &'a [u8],
}

impl<'a> DataFrame<'a> {
    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use peerlink_codec::data_frame::DataFrame;
    ///
    /// let frame = DataFrame {
    ///     channel: 0x4000,
    ///     flags: 0x02,
    ///     sequence: 5,
    ///     gsnr: 7,
    ///     gsnfr: 4,
    ///     ack_vector: 0b1101,
    ///     payload: &[1, 2, 3],
    /// };
    ///
    /// let expected = [
    ///     0x40u8, 0x00, 0x00, 0x03, 0x02, 0x00, 0x00, 0x05, 0x00, 0x00, 0x00,
    ///     0x07, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    ///     0x00, 0x0d, 0x01, 0x02, 0x03,
    /// ];
    ///
    /// let mut bytes = BytesMut::with_capacity(1500);
    /// frame.clone().encode(&mut bytes);
    /// assert_eq!(&bytes[..], &expected);
    ///
    /// assert_eq!(DataFrame::decode(&bytes[..]).unwrap(), frame);
    /// ```
    pub fn encode(self, bytes: &mut BytesMut) {
        bytes.clear();
        bytes.put_u16(self.channel);
        bytes.put_u16(self.payload.len() as u16);
        bytes.put_u32((self.flags as u32) << 24 | (self.sequence & 0x00FF_FFFF));
        bytes.put_u32(self.gsnr & 0x00FF_FFFF);
        bytes.put_u32(self.gsnfr & 0x00FF_FFFF);
        bytes.put_u64(self.ack_vector);
        bytes.extend_from_slice(self.payload);
    }

    pub fn decode(bytes: &'a [u8]) -> Result<Self, Error> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::InvalidInput);
        }

        let channel = u16::from_be_bytes(bytes[..2].try_into()?);
        if !(0x4000..0x8000).contains(&channel) {
            return Err(Error::InvalidInput);
        }

        let size = u16::from_be_bytes(bytes[2..4].try_into()?) as usize;
        if size > bytes.len() - HEADER_SIZE {
            return Err(Error::InvalidInput);
        }

        let seq = u32::from_be_bytes(bytes[4..8].try_into()?);

        Ok(Self {
            channel,
            flags: (seq >> 24) as u8,
            sequence: seq & 0x00FF_FFFF,
            gsnr: u32::from_be_bytes(bytes[8..12].try_into()?) & 0x00FF_FFFF,
            gsnfr: u32::from_be_bytes(bytes[12..16].try_into()?) & 0x00FF_FFFF,
            ack_vector: u64::from_be_bytes(bytes[16..24].try_into()?),
            payload: &bytes[HEADER_SIZE..HEADER_SIZE + size],
        })
    }
}
