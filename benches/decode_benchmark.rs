// Decode throughput benchmarks
use bson::doc;
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use flate2::{Compression, write::ZlibEncoder};
use mongowire::framer::StreamDecoder;
use mongowire::protocol::{OP_COMPRESSED, OP_MSG, decode_message};
use mongowire::sink::{NullSink, RecordingSink};
use std::io::Write;
use std::time::Duration;

fn frame(op_code: i32, body: &[u8]) -> Vec<u8> {
    let mut out = ((16 + body.len()) as i32).to_le_bytes().to_vec();
    out.extend_from_slice(&1i32.to_le_bytes());
    out.extend_from_slice(&0i32.to_le_bytes());
    out.extend_from_slice(&op_code.to_le_bytes());
    out.extend_from_slice(body);
    out
}

fn insert_body(doc_count: usize) -> Vec<u8> {
    let docs: Vec<bson::Document> = (0..doc_count)
        .map(|i| {
            doc! {
                "_id": bson::oid::ObjectId::new(),
                "index": i as i64,
                "name": format!("user-{i}"),
                "tags": ["a", "b", "c"],
                "address": {"city": "Lisbon", "zip": "1000-001", "geo": [38.7, -9.1]},
            }
        })
        .collect();
    let mut body = 0u32.to_le_bytes().to_vec();
    body.push(0);
    body.extend(bson::to_vec(&doc! {"insert": "users", "$db": "bench"}).unwrap());
    let mut seq = b"documents\0".to_vec();
    for d in &docs {
        seq.extend(bson::to_vec(d).unwrap());
    }
    body.push(1);
    body.extend_from_slice(&((seq.len() + 4) as i32).to_le_bytes());
    body.extend(seq);
    body
}

fn bench_op_msg(c: &mut Criterion) {
    let mut group = c.benchmark_group("op_msg_insert");
    group.measurement_time(Duration::from_secs(5));

    for &doc_count in &[1usize, 100, 1000] {
        let bytes = frame(OP_MSG, &insert_body(doc_count));
        group.throughput(Throughput::Bytes(bytes.len() as u64));
        group.bench_with_input(BenchmarkId::new("null_sink", doc_count), &bytes, |b, bytes| {
            b.iter(|| black_box(decode_message(bytes, 0, &mut NullSink).unwrap()));
        });
        group.bench_with_input(BenchmarkId::new("recording_sink", doc_count), &bytes, |b, bytes| {
            b.iter(|| {
                let mut sink = RecordingSink::new();
                black_box(decode_message(bytes, 0, &mut sink).unwrap());
                black_box(sink.fields.len())
            });
        });
    }

    group.finish();
}

fn bench_compressed(c: &mut Criterion) {
    let mut group = c.benchmark_group("op_compressed");
    group.measurement_time(Duration::from_secs(5));

    let inner = insert_body(100);
    let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
    enc.write_all(&inner).unwrap();
    let zlib = enc.finish().unwrap();
    let snappy = snap::raw::Encoder::new().compress_vec(&inner).unwrap();

    for (name, id, payload) in [("zlib", 2u8, zlib), ("snappy", 1u8, snappy)] {
        let mut body = OP_MSG.to_le_bytes().to_vec();
        body.extend_from_slice(&(inner.len() as i32).to_le_bytes());
        body.push(id);
        body.extend(payload);
        let bytes = frame(OP_COMPRESSED, &body);
        group.bench_function(name, |b| {
            b.iter(|| black_box(decode_message(&bytes, 0, &mut NullSink).unwrap()));
        });
    }

    group.finish();
}

fn bench_stream(c: &mut Criterion) {
    let mut group = c.benchmark_group("stream_framing");

    let one = frame(OP_MSG, &insert_body(10));
    let stream: Vec<u8> = std::iter::repeat(one).take(200).flatten().collect();
    group.throughput(Throughput::Bytes(stream.len() as u64));

    for &chunk in &[512usize, 16 * 1024] {
        group.bench_with_input(BenchmarkId::new("chunk", chunk), &chunk, |b, &chunk| {
            b.iter(|| {
                let mut dec = StreamDecoder::default();
                let mut n = 0;
                for part in stream.chunks(chunk) {
                    dec.push(part);
                    n += dec.drain(&mut NullSink).len();
                }
                black_box(n)
            });
        });
    }

    group.finish();
}

criterion_group!(decode_benches, bench_op_msg, bench_compressed, bench_stream);
criterion_main!(decode_benches);
