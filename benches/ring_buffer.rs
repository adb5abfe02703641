//! Criterion benchmarks for ring buffer hot paths.
//!
//! The block ring sits between the grab loop and every consumer, so its
//! per-frame cost bounds the sustainable frame rate. Key metrics:
//!
//! - Fill-and-advance throughput for common frame sizes
//! - FIFO drain latency
//! - Positional access overhead
//!
//! Run with: cargo bench --bench ring_buffer

use camdaq::data::RingBuffer;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

/// Benchmark filling and publishing blocks of various frame sizes.
///
/// Sizes correspond to typical sensor readouts: 256x256 through 2048x2048
/// at 16 bits per pixel.
fn ring_buffer_produce_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_buffer_produce");

    let sizes = vec![
        ("256x256x16", 256 * 256 * 2),
        ("512x512x16", 512 * 512 * 2),
        ("1024x1024x16", 1024 * 1024 * 2),
        ("2048x2048x16", 2048 * 2048 * 2),
    ];

    for (name, size) in sizes {
        let rb = RingBuffer::new(size, 16).unwrap();
        let frame = vec![0xAAu8; size];

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("produce", name), &size, |b, _| {
            b.iter(|| {
                rb.write_ptr().copy_from_slice(black_box(&frame));
                rb.write_advance();
            });
        });
    }

    group.finish();
}

/// Benchmark the FIFO drain path used after a recording.
fn ring_buffer_drain(c: &mut Criterion) {
    let size = 512 * 512 * 2;
    let rb = RingBuffer::new(size, 64).unwrap();

    c.bench_function("ring_buffer_drain", |b| {
        b.iter(|| {
            // Keep one block in flight so every iteration reads.
            rb.write_ptr().fill(0xBB);
            rb.write_advance();
            let block = rb.read_ptr();
            black_box(block);
        });
    });
}

/// Benchmark positional access into the retention window.
fn ring_buffer_positional_access(c: &mut Criterion) {
    let size = 512 * 512 * 2;
    let rb = RingBuffer::new(size, 64).unwrap();
    for _ in 0..64 {
        rb.write_ptr().fill(0xCC);
        rb.write_advance();
    }

    c.bench_function("ring_buffer_get_ptr", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let block = rb.get_ptr(black_box(i % 64));
            i += 1;
            black_box(block);
        });
    });

    c.bench_function("ring_buffer_num_blocks", |b| {
        b.iter(|| {
            black_box(rb.num_blocks());
        });
    });
}

criterion_group!(
    benches,
    ring_buffer_produce_throughput,
    ring_buffer_drain,
    ring_buffer_positional_access
);
criterion_main!(benches);
