//! Protocol encoding/decoding benchmarks.

use bytes::{Bytes, BytesMut};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rippledb_protocol::frame::Frame;
use rippledb_protocol::{Dml, Message, Request, Row};
use rmpv::Value;

fn create_test_tuple(payload_size: usize) -> Vec<Value> {
    vec![
        Value::from(42u64),
        Value::from("bench-user"),
        Value::from("x".repeat(payload_size)),
        Value::from(1234.5f64),
    ]
}

fn create_test_row(payload_size: usize) -> Row {
    Row::new(
        1,
        12345678,
        Dml::Replace {
            space_id: 512,
            tuple: create_test_tuple(payload_size),
        },
    )
}

fn bench_frame_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_encode");

    for size in [100, 1000, 10000] {
        let payload = Bytes::from("x".repeat(size));
        let frame = Frame::new(payload.clone());

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &frame, |b, frame| {
            b.iter(|| black_box(frame.encode().unwrap()));
        });
    }

    group.finish();
}

fn bench_frame_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_decode");

    for size in [100, 1000, 10000] {
        let payload = Bytes::from("x".repeat(size));
        let frame = Frame::new(payload);
        let encoded = frame.encode().unwrap();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &encoded, |b, encoded| {
            b.iter(|| {
                let mut buf = encoded.clone();
                black_box(Frame::decode(&mut buf).unwrap())
            });
        });
    }

    group.finish();
}

/// Decoding a stream of small frames delivered in one buffer.
fn bench_frame_decode_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_decode_batch");

    let ping = Request::Ping.to_message(1).encode().unwrap();
    for count in [10, 100, 1000] {
        let mut buf = BytesMut::new();
        for _ in 0..count {
            buf.extend_from_slice(&Frame::new(ping.clone()).encode().unwrap());
        }

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &buf, |b, buf| {
            b.iter(|| {
                let mut buf = buf.clone();
                let mut frames = 0;
                while let Some(frame) = Frame::decode(&mut buf).unwrap() {
                    black_box(frame);
                    frames += 1;
                }
                frames
            });
        });
    }

    group.finish();
}

fn bench_message_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("message_encode");

    for size in [100, 1000, 10000] {
        let request = Request::Dml(Dml::Insert {
            space_id: 512,
            tuple: create_test_tuple(size),
        })
        .to_message(7);

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(size), &request, |b, request| {
            b.iter(|| black_box(request.encode().unwrap()));
        });
    }

    group.finish();
}

fn bench_message_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("message_decode");

    for size in [100, 1000, 10000] {
        let encoded = Request::Dml(Dml::Insert {
            space_id: 512,
            tuple: create_test_tuple(size),
        })
        .to_message(7)
        .encode()
        .unwrap();

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(size), &encoded, |b, encoded| {
            b.iter(|| {
                let msg = Message::decode(encoded).unwrap();
                black_box(Request::from_message(&msg).unwrap())
            });
        });
    }

    group.finish();
}

fn bench_row_roundtrip(c: &mut Criterion) {
    let mut group = c.benchmark_group("row_message");

    for size in [100, 1000] {
        let row = create_test_row(size);

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("encode", size), &row, |b, row| {
            b.iter(|| black_box(row.to_message(3).encode().unwrap()));
        });

        let encoded = row.to_message(3).encode().unwrap();
        group.bench_with_input(BenchmarkId::new("decode", size), &encoded, |b, encoded| {
            b.iter(|| {
                let msg = Message::decode(encoded).unwrap();
                black_box(Row::from_message(&msg).unwrap())
            });
        });
    }

    group.finish();
}

fn bench_crc32c(c: &mut Criterion) {
    let mut group = c.benchmark_group("crc32c");

    for size in [100, 1000, 10000, 100000] {
        let data = vec![0x42u8; size];

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &data, |b, data| {
            b.iter(|| black_box(crc32c::crc32c(data)));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_frame_encode,
    bench_frame_decode,
    bench_frame_decode_batch,
    bench_message_encode,
    bench_message_decode,
    bench_row_roundtrip,
    bench_crc32c,
);

criterion_main!(benches);
