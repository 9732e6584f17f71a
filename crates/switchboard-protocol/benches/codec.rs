//! Codec benchmarks for switchboard-protocol.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use switchboard_protocol::{codec, envelope, Frame, RelayEnvelope};

fn bench_encode_send(c: &mut Criterion) {
    let frame = Frame::send(7, 9, "x".repeat(64));

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Bytes(64));
    group.bench_function("send_64B", |b| b.iter(|| codec::encode(black_box(&frame))));
    group.finish();
}

fn bench_decode_deliver(c: &mut Criterion) {
    let frame = Frame::deliver(7, "x".repeat(64));
    let encoded = codec::encode(&frame).unwrap();

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("deliver_64B", |b| {
        b.iter(|| codec::decode(black_box(&encoded)))
    });
    group.finish();
}

fn bench_envelope_roundtrip(c: &mut Criterion) {
    let env = RelayEnvelope {
        from: 7,
        to: 9,
        text: "x".repeat(256),
    };

    c.bench_function("envelope_roundtrip_256B", |b| {
        b.iter(|| {
            let encoded = envelope::encode(black_box(&env)).unwrap();
            envelope::decode(black_box(&encoded)).unwrap()
        })
    });
}

criterion_group!(
    benches,
    bench_encode_send,
    bench_decode_deliver,
    bench_envelope_roundtrip
);
criterion_main!(benches);
