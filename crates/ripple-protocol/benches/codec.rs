//! Codec benchmarks for ripple-protocol.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use ripple_protocol::{Envelope, EnvelopeCodec, WireFormat};
use serde_json::json;

fn sample() -> Envelope {
    Envelope::new("room:lobby", "shout", json!({"body": "x".repeat(64)}))
        .with_ref("42")
        .with_join_ref("3")
}

fn bench_encode(c: &mut Criterion) {
    let envelope = sample();

    let mut group = c.benchmark_group("encode");
    for (name, format) in [
        ("json", WireFormat::Json),
        ("json_array", WireFormat::JsonArray),
        ("msgpack", WireFormat::MsgPack),
    ] {
        let codec = EnvelopeCodec::new(format);
        group.throughput(Throughput::Bytes(codec.encode(&envelope).unwrap().len() as u64));
        group.bench_function(name, |b| b.iter(|| codec.encode(black_box(&envelope))));
    }
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let envelope = sample();

    let mut group = c.benchmark_group("decode");
    for (name, format) in [
        ("json", WireFormat::Json),
        ("json_array", WireFormat::JsonArray),
        ("msgpack", WireFormat::MsgPack),
    ] {
        let codec = EnvelopeCodec::new(format);
        let encoded = codec.encode(&envelope).unwrap();
        group.throughput(Throughput::Bytes(encoded.len() as u64));
        group.bench_function(name, |b| b.iter(|| codec.decode(black_box(&encoded))));
    }
    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
