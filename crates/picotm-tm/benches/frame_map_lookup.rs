use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use picotm_tm::FrameMap;

fn bench_sequential_fill(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_map_sequential_fill");
    for block_count in [64usize, 1024, 16384] {
        group.throughput(Throughput::Elements(block_count as u64));
        group.bench_with_input(
            BenchmarkId::new("get_or_insert", block_count),
            &block_count,
            |b, &block_count| {
                b.iter(|| {
                    let map = FrameMap::new();
                    for block in 0..block_count {
                        let frame = map.get_or_insert(block << picotm_tm::BLOCK_BITS);
                        black_box(frame.block_index());
                    }
                });
            },
        );
    }
    group.finish();
}

fn bench_repeated_lookup(c: &mut Criterion) {
    let map = FrameMap::new();
    let addr = 0x1000usize;
    map.get_or_insert(addr);

    let mut group = c.benchmark_group("frame_map_repeated_lookup");
    group.throughput(Throughput::Elements(1));
    group.bench_function("warm_hit", |b| {
        b.iter(|| black_box(map.get_or_insert(addr)));
    });
    group.finish();
}

criterion_group!(benches, bench_sequential_fill, bench_repeated_lookup);
criterion_main!(benches);
