//! Codec benchmarks for relay-protocol.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use relay_protocol::{frames, Encoder, Header, JsonEncoder, MsgPackEncoder};

const CORRELATION_ID: &str = "9b2f4c1d8e7a6b5c4d3e2f1a0b9c8d7e";

fn bench_encode_small(c: &mut Criterion) {
    let header = Header::new(CORRELATION_ID, "test");
    let payload = vec![0u8; 64];
    let mut encoder = MsgPackEncoder::new();

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Bytes(64));
    group.bench_function("small_64B", |b| {
        b.iter(|| frames::write_frame(&mut encoder, black_box(&header), |e| e.write_data(&payload)))
    });
    group.finish();
}

fn bench_decode_small(c: &mut Criterion) {
    let mut encoder = MsgPackEncoder::new();
    let frame = frames::write_frame(&mut encoder, &Header::new(CORRELATION_ID, "test"), |e| {
        e.write_data(&vec![0u8; 64])
    })
    .unwrap();

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(frame.len() as u64));
    group.bench_function("small_64B", |b| {
        b.iter(|| {
            frames::read_header(&mut encoder, black_box(frame.clone())).unwrap();
            let mut payload: Vec<u8> = Vec::new();
            encoder.read_data(&mut payload).unwrap();
            payload
        })
    });
    group.finish();
}

fn bench_roundtrip(c: &mut Criterion) {
    let header = Header::new(CORRELATION_ID, "test:channel:room");
    let payload = vec![0u8; 256];

    let mut group = c.benchmark_group("roundtrip_256B");
    group.bench_function("msgpack", |b| {
        let mut encoder = MsgPackEncoder::new();
        b.iter(|| {
            let frame = frames::write_frame(&mut encoder, black_box(&header), |e| e.write_data(&payload))
                .unwrap();
            frames::read_header(&mut encoder, frame).unwrap()
        })
    });
    group.bench_function("json", |b| {
        let mut encoder = JsonEncoder::new();
        b.iter(|| {
            let frame = frames::write_frame(&mut encoder, black_box(&header), |e| e.write_data(&payload))
                .unwrap();
            frames::read_header(&mut encoder, frame).unwrap()
        })
    });
    group.finish();
}

fn bench_spliced_fanout(c: &mut Criterion) {
    let mut encoder = MsgPackEncoder::new();
    let payload = encoder.encode(&vec![0u8; 256]).unwrap();
    let header = Header::new(CORRELATION_ID, "room:message");

    c.bench_function("spliced_256B", |b| {
        b.iter(|| frames::write_frame(&mut encoder, black_box(&header), |e| e.write_encoded(&payload)))
    });
}

criterion_group!(
    benches,
    bench_encode_small,
    bench_decode_small,
    bench_roundtrip,
    bench_spliced_fanout
);
criterion_main!(benches);
