// wiremux wire-codec benchmarks using criterion.
//
// Measures:
//   - Varint encode / decode throughput
//   - Frame encode / decode throughput at a handful of payload sizes

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::time::Duration;

use tokio::runtime::Runtime;
use wiremux::frame;
use wiremux::varint::{decode, encode, encoded};

fn bench_varint_encode(c: &mut Criterion) {
    let values: &[u64] = &[0, 127, 128, 16383, 16384, u32::MAX as u64, u64::MAX];

    let mut group = c.benchmark_group("varint_encode");
    for &value in values {
        group.bench_with_input(BenchmarkId::from_parameter(value), &value, |b, &v| {
            b.iter(|| {
                let mut out = Vec::with_capacity(10);
                encode(black_box(v), &mut out);
                black_box(out);
            });
        });
    }
    group.finish();
}

fn bench_varint_decode(c: &mut Criterion) {
    let values: &[u64] = &[0, 127, 128, 16383, 16384, u32::MAX as u64, u64::MAX];

    let mut group = c.benchmark_group("varint_decode");
    for &value in values {
        let bytes = encoded(value);
        group.bench_with_input(BenchmarkId::from_parameter(value), &bytes, |b, data| {
            b.iter(|| {
                black_box(decode(black_box(data)).unwrap());
            });
        });
    }
    group.finish();
}

fn bench_frame_roundtrip(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let sizes: &[usize] = &[64, 1024, 8192, 65536];

    let mut group = c.benchmark_group("frame_write_read");
    for &size in sizes {
        let payload = vec![0xABu8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{size}B")),
            &payload,
            |b, payload| {
                b.to_async(&rt).iter(|| async {
                    let header = frame::data_header(1, true);
                    let mut buf = Vec::with_capacity(payload.len() + 16);
                    frame::write_frame(&mut buf, header, payload).await.unwrap();
                    let mut cursor = std::io::Cursor::new(buf);
                    black_box(frame::read_frame(&mut cursor).await.unwrap());
                });
            },
        );
    }
    group.finish();
}

criterion_group! {
    name = wiremux_benches;
    config = Criterion::default()
        .sample_size(100)
        .measurement_time(Duration::from_secs(5));
    targets =
        bench_varint_encode,
        bench_varint_decode,
        bench_frame_roundtrip,
}

criterion_main!(wiremux_benches);
