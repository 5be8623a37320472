// Benchmark for pin resolution and reply stream decoding
// Run with: cargo bench

use criterion::{Criterion, criterion_group, criterion_main};
use std::hint::black_box;
use tessel_io::address::to_pin_index;
use tessel_io::hardware::protocol::{ReplyParser, reply};

fn bench_pin_resolution(c: &mut Criterion) {
    let names: Vec<String> = ["a", "b"]
        .iter()
        .flat_map(|port| (0..8).flat_map(move |i| [format!("{}{}", port, i), format!("{}_{}", port, i)]))
        .chain((0..20).map(|i| i.to_string()))
        .collect();
    c.bench_function("resolve 52 pin spellings", |b| {
        b.iter(|| {
            let resolved = names
                .iter()
                .filter(|name| to_pin_index(black_box(name.as_str())).is_some())
                .count();
            assert_eq!(resolved, names.len());
        });
    });
}

fn bench_reply_parser(c: &mut Criterion) {
    // 1000 analog replies interleaved with pin-change notifications
    let mut stream = Vec::new();
    for i in 0..1000u16 {
        stream.extend_from_slice(&[reply::DATA, (i & 0xff) as u8, (i >> 8) as u8]);
        if i % 10 == 0 {
            stream.push(reply::ASYNC_PIN_CHANGE_N | 0x0a);
        }
    }
    c.bench_function("decode 1000 analog replies", |b| {
        b.iter(|| {
            let mut parser = ReplyParser::new();
            let mut count = 0;
            for &byte in &stream {
                if let Ok(Some(_)) = parser.feed(black_box(byte), Some(2)) {
                    count += 1;
                }
            }
            assert_eq!(count, 1100);
        });
    });
}

criterion_group!(benches, bench_pin_resolution, bench_reply_parser);
criterion_main!(benches);
