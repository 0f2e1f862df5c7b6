use bytes::BytesMut;
use criterion::{Criterion, criterion_group, criterion_main};

use peerlink_codec::{
    Attributes, Decoder,
    channel_data::ChannelData,
    message::{Message, MessageEncoder, attributes::UserName, methods::BINDING_REQUEST},
};

const TOKEN: [u8; 12] = [
    0x71, 0x66, 0x46, 0x31, 0x2b, 0x59, 0x79, 0x65, 0x56, 0x69, 0x32, 0x72,
];

fn criterion_benchmark(c: &mut Criterion) {
    let mut encoded = BytesMut::with_capacity(1280);
    let mut encoder = MessageEncoder::new(BINDING_REQUEST, &TOKEN, &mut encoded);
    encoder.append::<UserName>("UCt9:V/+/");
    encoder.flush(None).unwrap();
    let message = encoded.freeze();

    let mut channel_bytes = BytesMut::with_capacity(1500);
    ChannelData {
        number: 0x4000,
        bytes: &[0u8; 1200],
    }
    .encode(&mut channel_bytes);
    let channel = channel_bytes.freeze();

    c.bench_function("decode_message", |b| {
        let mut attributes = Attributes::default();
        b.iter(|| {
            attributes.clear();
            Message::decode(&message, &mut attributes).unwrap();
        })
    });

    c.bench_function("decode_channel_data", |b| {
        let mut decoder = Decoder::default();
        b.iter(|| {
            decoder.decode(&channel).unwrap();
        })
    });

    c.bench_function("encode_message", |b| {
        let mut buf = BytesMut::with_capacity(1280);
        b.iter(|| {
            let mut encoder = MessageEncoder::new(BINDING_REQUEST, &TOKEN, &mut buf);
            encoder.append::<UserName>("UCt9:V/+/");
            encoder.flush(None).unwrap();
        })
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
