use criterion::{black_box, criterion_group, criterion_main, Criterion};
use nbd_bitset::Bitset;

fn bench_run_count(c: &mut Criterion) {
    let mut bs = Bitset::alloc(1 << 30, 4096);
    bs.set_range(0, 1 << 29);

    c.bench_function("run_count full run", |b| {
        b.iter(|| black_box(bs.run_count(0, 8 << 20)))
    });
}

criterion_group!(benches, bench_run_count);
criterion_main!(benches);
