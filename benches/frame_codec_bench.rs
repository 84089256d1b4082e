//! Throughput benchmarks for the camera worker frame codec.
//!
//! Run benchmarks with:
//! ```sh
//! cargo bench --bench frame_codec_bench
//! ```

use bytes::{Bytes, BytesMut};
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use sensorhub_protocol::{NodeLineCodec, NodeMessage, WorkerFrame, WorkerFrameCodec};
use std::hint::black_box;
use tokio_util::codec::{Decoder, Encoder};

fn encoded_frame(payload_len: usize) -> BytesMut {
    let frame = WorkerFrame::new(
        "USB\\VID_046D&PID_085C\\0001",
        "image/jpeg",
        Bytes::from(vec![0xA5; payload_len]),
    );
    let mut buf = BytesMut::new();
    WorkerFrameCodec::new()
        .encode(frame, &mut buf)
        .expect("frame encodes");
    buf
}

fn bench_decode_frames(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_frame");

    for size in [16 * 1024, 256 * 1024, 2 * 1024 * 1024] {
        let wire = encoded_frame(size);
        group.throughput(Throughput::Bytes(wire.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &wire, |b, wire| {
            b.iter(|| {
                let mut codec = WorkerFrameCodec::new();
                let mut buf = wire.clone();
                black_box(codec.decode(&mut buf).expect("decodes"));
            });
        });
    }

    group.finish();
}

fn bench_decode_node_lines(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_node_line");
    group.throughput(Throughput::Elements(1));

    let line = b"{\"t\":\"all\",\"ph\":6.42,\"ec\":1.31,\"temp\":21.8,\"status\":[\"ok\"],\"mode\":\"real\",\"ts\":123456}\n";

    group.bench_function("all_report", |b| {
        b.iter(|| {
            let mut codec = NodeLineCodec::new();
            let mut buf = BytesMut::from(&line[..]);
            black_box(codec.decode(&mut buf).expect("decodes"));
        });
    });

    group.bench_function("encode_get_all", |b| {
        b.iter(|| {
            let mut codec = NodeLineCodec::new();
            let mut buf = BytesMut::new();
            codec
                .encode(black_box(NodeMessage::GetAll), &mut buf)
                .expect("encodes");
            black_box(buf);
        });
    });

    group.finish();
}

criterion_group!(benches, bench_decode_frames, bench_decode_node_lines);
criterion_main!(benches);
