use anyhow::Result;
use bytes::BytesMut;

use peerlink_codec::{
    Attributes, DecodeResult, Decoder, Error,
    channel_data::ChannelData,
    crypto::Password,
    data_frame::DataFrame,
    message::{
        Message, MessageEncoder,
        attributes::{
            ChannelNumber, Data, ErrorAttr, ErrorCode, ErrorKind, Lifetime, Nonce, Realm,
            RequestedTransport, Transport, UserName, XorMappedAddress, XorPeerAddress,
            XorRelayedAddress,
        },
        methods::{ALLOCATE_ERROR, ALLOCATE_REQUEST, ALLOCATE_RESPONSE},
    },
};

const TOKEN: [u8; 12] = [
    0x64, 0x4f, 0x5a, 0x78, 0x6a, 0x56, 0x33, 0x62, 0x4b, 0x52, 0x33, 0x31,
];

#[test]
fn allocate_request_round_trip() -> Result<()> {
    let password = Password::long_term("panda", "raspberry", "panda");

    let mut buf = BytesMut::with_capacity(1280);
    let mut encoder = MessageEncoder::new(ALLOCATE_REQUEST, &TOKEN, &mut buf);
    encoder.append::<RequestedTransport>(Transport::Udp);
    encoder.append::<UserName>("panda");
    encoder.append::<Realm>("raspberry");
    encoder.append::<Nonce>("1c13d2b245b3a734");
    encoder.flush(Some(&password))?;

    let mut attributes = Attributes::default();
    let message = Message::decode(&buf[..], &mut attributes)?;

    assert_eq!(message.method(), ALLOCATE_REQUEST);
    assert_eq!(message.token(), &TOKEN);
    assert_eq!(message.get::<UserName>(), Some("panda"));
    assert_eq!(message.get::<Realm>(), Some("raspberry"));
    assert_eq!(message.get::<Nonce>(), Some("1c13d2b245b3a734"));
    assert_eq!(message.get::<RequestedTransport>(), Some(Transport::Udp));
    assert!(message.unknown_required_attributes().is_empty());

    // the verifier accepts iff the password matches the encoder's.
    assert!(message.checksum(&password).is_ok());
    assert!(
        message
            .checksum(&Password::long_term("panda", "raspberry", "wrong"))
            .is_err()
    );

    Ok(())
}

#[test]
fn allocate_response_addresses() -> Result<()> {
    let relayed = "203.0.113.5:49152".parse()?;
    let mapped = "203.0.113.7:48000".parse()?;

    let mut buf = BytesMut::with_capacity(1280);
    let mut encoder = MessageEncoder::new(ALLOCATE_RESPONSE, &TOKEN, &mut buf);
    encoder.append::<XorRelayedAddress>(relayed);
    encoder.append::<XorMappedAddress>(mapped);
    encoder.append::<Lifetime>(600);
    encoder.flush(None)?;

    let mut attributes = Attributes::default();
    let message = Message::decode(&buf[..], &mut attributes)?;

    assert_eq!(message.get::<XorRelayedAddress>(), Some(relayed));
    assert_eq!(message.get::<XorMappedAddress>(), Some(mapped));
    assert_eq!(message.get::<Lifetime>(), Some(600));

    Ok(())
}

#[test]
fn error_response_round_trip() -> Result<()> {
    let mut buf = BytesMut::with_capacity(1280);
    let mut encoder = MessageEncoder::new(ALLOCATE_ERROR, &TOKEN, &mut buf);
    encoder.append::<ErrorCode>(ErrorAttr::from(ErrorKind::StaleNonce));
    encoder.append::<Nonce>("fresh");
    encoder.flush(None)?;

    let mut attributes = Attributes::default();
    let message = Message::decode(&buf[..], &mut attributes)?;

    assert!(message.method().is_error());
    let error = message.get::<ErrorCode>().unwrap();
    assert_eq!(error.kind(), Some(ErrorKind::StaleNonce));
    assert_eq!(error.kind().unwrap().code(), 438);
    assert_eq!(message.get::<Nonce>(), Some("fresh"));

    Ok(())
}

#[test]
fn create_permission_batches_peers() -> Result<()> {
    let peers: Vec<std::net::SocketAddr> = vec![
        "192.0.2.10:7000".parse()?,
        "192.0.2.11:7001".parse()?,
        "[2001:db8::3]:7002".parse()?,
    ];

    let mut buf = BytesMut::with_capacity(1280);
    let mut encoder = MessageEncoder::new(
        peerlink_codec::message::methods::CREATE_PERMISSION_REQUEST,
        &TOKEN,
        &mut buf,
    );
    for peer in &peers {
        encoder.append::<XorPeerAddress>(*peer);
    }
    encoder.flush(None)?;

    let mut attributes = Attributes::default();
    let message = Message::decode(&buf[..], &mut attributes)?;

    let decoded: Vec<_> = message.get_all::<XorPeerAddress>().collect();
    assert_eq!(decoded, peers);

    Ok(())
}

#[test]
fn oversized_length_is_rejected_before_attributes() {
    // header claims 512 bytes of attributes that are not there.
    let mut bytes = vec![0x00, 0x01, 0x02, 0x00, 0x21, 0x12, 0xa4, 0x42];
    bytes.extend_from_slice(&TOKEN);

    let mut attributes = Attributes::default();
    assert!(matches!(
        Message::decode(&bytes, &mut attributes),
        Err(Error::InvalidInput)
    ));
}

#[test]
fn unknown_comprehension_required_attribute_is_reported() -> Result<()> {
    let mut bytes = vec![0x00u8, 0x01, 0x00, 0x08, 0x21, 0x12, 0xa4, 0x42];
    bytes.extend_from_slice(&TOKEN);
    // type 0x7788 is unassigned and comprehension-required.
    bytes.extend_from_slice(&[0x77, 0x88, 0x00, 0x04, 1, 2, 3, 4]);

    let mut attributes = Attributes::default();
    let message = Message::decode(&bytes, &mut attributes)?;
    assert_eq!(message.unknown_required_attributes(), &[0x7788]);

    Ok(())
}

#[test]
fn classify_channel_data() -> Result<()> {
    let mut bytes = BytesMut::with_capacity(1500);
    ChannelData {
        number: 0x4004,
        bytes: b"hello",
    }
    .encode(&mut bytes);

    let mut decoder = Decoder::default();
    match decoder.decode(&bytes[..])? {
        DecodeResult::ChannelData(data) => {
            assert_eq!(data.number(), 0x4004);
            assert_eq!(data.as_bytes(), b"hello");
        }
        DecodeResult::Message(_) => panic!("classified as message"),
    }

    Ok(())
}

#[test]
fn channel_number_attribute() -> Result<()> {
    let mut buf = BytesMut::with_capacity(1280);
    let mut encoder = MessageEncoder::new(
        peerlink_codec::message::methods::CHANNEL_BIND_REQUEST,
        &TOKEN,
        &mut buf,
    );
    encoder.append::<ChannelNumber>(0x4000);
    encoder.append::<XorPeerAddress>("192.0.2.10:7000".parse()?);
    encoder.flush(None)?;

    let mut attributes = Attributes::default();
    let message = Message::decode(&buf[..], &mut attributes)?;
    assert_eq!(message.get::<ChannelNumber>(), Some(0x4000));

    Ok(())
}

#[test]
fn data_frame_zero_length_payload() -> Result<()> {
    let frame = DataFrame {
        channel: 0x7fff,
        flags: 0x01,
        sequence: 0x00ff_ffff,
        gsnr: 0,
        gsnfr: 0x00ff_ffff,
        ack_vector: u64::MAX,
        payload: &[],
    };

    let mut bytes = BytesMut::with_capacity(64);
    frame.clone().encode(&mut bytes);
    assert_eq!(bytes.len(), peerlink_codec::data_frame::HEADER_SIZE);
    assert_eq!(DataFrame::decode(&bytes[..])?, frame);

    Ok(())
}

#[test]
fn send_indication_wraps_data() -> Result<()> {
    let peer: std::net::SocketAddr = "192.0.2.10:7000".parse()?;

    let mut buf = BytesMut::with_capacity(1280);
    let mut encoder = MessageEncoder::new(
        peerlink_codec::message::methods::SEND_INDICATION,
        &TOKEN,
        &mut buf,
    );
    encoder.append::<XorPeerAddress>(peer);
    encoder.append::<Data>(b"payload");
    encoder.flush(None)?;

    let mut attributes = Attributes::default();
    let message = Message::decode(&buf[..], &mut attributes)?;
    assert_eq!(message.get::<XorPeerAddress>(), Some(peer));
    assert_eq!(message.get::<Data>(), Some(&b"payload"[..]));

    Ok(())
}
