//! Parser benchmarks

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use nats_core::{proto, Buffer, Parser};

fn small_messages(count: usize) -> Vec<u8> {
    let mut buf = Buffer::new();
    for i in 0..count {
        buf.append(format!("MSG bench.subject.{} 1 16\r\n", i % 8).as_bytes());
        buf.append(b"0123456789abcdef\r\n");
    }
    buf.take()
}

fn parse_small_benchmark(c: &mut Criterion) {
    let stream = small_messages(1000);

    c.bench_function("parse_1000_small_msgs", |b| {
        b.iter(|| {
            let mut parser = Parser::new();
            black_box(parser.feed(&stream).unwrap())
        })
    });
}

fn parse_fragmented_benchmark(c: &mut Criterion) {
    let stream = small_messages(1000);

    c.bench_function("parse_1000_small_msgs_in_64b_reads", |b| {
        b.iter(|| {
            let mut parser = Parser::new();
            let mut events = Vec::with_capacity(1000);
            for chunk in stream.chunks(64) {
                parser.feed_into(chunk, &mut events).unwrap();
            }
            black_box(events)
        })
    });
}

fn parse_large_benchmark(c: &mut Criterion) {
    let payload = vec![b'x'; 64 * 1024];
    let mut buf = Buffer::new();
    buf.append(format!("MSG bench.large 1 {}\r\n", payload.len()).as_bytes());
    buf.append(&payload);
    buf.append(b"\r\n");
    let stream = buf.take();

    c.bench_function("parse_64k_payload_in_4k_reads", |b| {
        b.iter(|| {
            let mut parser = Parser::new();
            let mut events = Vec::new();
            for chunk in stream.chunks(4096) {
                parser.feed_into(chunk, &mut events).unwrap();
            }
            black_box(events)
        })
    });
}

fn encode_pub_benchmark(c: &mut Criterion) {
    let payload = vec![b'x'; 128];

    c.bench_function("encode_pub_128b", |b| {
        let mut buf = Buffer::with_capacity(32 * 1024);
        b.iter(|| {
            proto::write_pub(&mut buf, "bench.subject", Some("_INBOX.reply"), &payload);
            buf.reset();
        })
    });
}

criterion_group!(
    benches,
    parse_small_benchmark,
    parse_fragmented_benchmark,
    parse_large_benchmark,
    encode_pub_benchmark
);
criterion_main!(benches);
