//! Frame benchmarks - encoding/decoding performance.
//!
//! These benchmarks measure frame encoding and decoding throughput
//! at various payload sizes.

use std::hint::black_box;

use bytes::{Bytes, BytesMut};
use cirrus::{Frame, FrameCodec};
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};

const SIZES: [usize; 5] = [64, 256, 1024, 4096, 16_384];

fn data_frame(size: usize) -> Frame {
    Frame::Data {
        stream_id: 1,
        payload: Bytes::from(vec![0xABu8; size]),
        end_stream: false,
    }
}

/// Benchmark DATA frame encoding at various sizes.
fn bench_frame_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_encode");
    let codec = FrameCodec::new();

    for size in SIZES {
        let frame = data_frame(size);
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::from_parameter(size), &frame, |b, frame| {
            let mut buf = BytesMut::with_capacity(size + 16);
            b.iter(|| {
                buf.clear();
                codec.encode_frame(black_box(frame), &mut buf).unwrap();
                black_box(&buf);
            });
        });
    }

    group.finish();
}

/// Benchmark DATA frame decoding at various sizes.
fn bench_frame_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_decode");
    let codec = FrameCodec::new();

    for size in SIZES {
        let mut encoded = BytesMut::new();
        codec.encode_frame(&data_frame(size), &mut encoded).unwrap();

        group.throughput(Throughput::Bytes(encoded.len() as u64));

        group.bench_with_input(BenchmarkId::from_parameter(size), &encoded, |b, encoded| {
            b.iter(|| {
                let mut buf = encoded.clone();
                let frame = codec.decode_frame(black_box(&mut buf)).unwrap().unwrap();
                black_box(frame);
            });
        });
    }

    group.finish();
}

/// Benchmark decoding a read buffer holding many small frames.
fn bench_frame_decode_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_decode_batch");
    let codec = FrameCodec::new();

    for count in [10, 100, 1000] {
        let mut encoded = BytesMut::new();
        for stream_id in 0..count {
            let frame = Frame::WindowUpdate {
                stream_id: stream_id * 2 + 1,
                increment: 1024,
            };
            codec.encode_frame(&frame, &mut encoded).unwrap();
        }

        group.throughput(Throughput::Elements(u64::from(count)));

        group.bench_with_input(BenchmarkId::from_parameter(count), &encoded, |b, encoded| {
            b.iter(|| {
                let mut buf = encoded.clone();
                let mut decoded = 0;
                while let Some(frame) = codec.decode_frame(&mut buf).unwrap() {
                    black_box(frame);
                    decoded += 1;
                }
                assert_eq!(decoded, count);
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_frame_encode,
    bench_frame_decode,
    bench_frame_decode_batch
);
criterion_main!(benches);
