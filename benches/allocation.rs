use blockfiles::{
    BitmapAllocator, BlockFileHeader, BlockFiles, BlockFilesConfig, FileType, HeaderLayout,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

const LAYOUT: HeaderLayout = HeaderLayout::new(65_024);

fn allocator(max_entries: i32) -> BitmapAllocator<Vec<u8>> {
    let bytes = BlockFileHeader::new(LAYOUT, 1, 256).to_bytes(LAYOUT);
    let mut alloc = BitmapAllocator::new(bytes, LAYOUT).unwrap();
    alloc.extend(max_entries).unwrap();
    alloc
}

/// Benchmark filling a file with runs of one size
fn bench_create_runs(c: &mut Criterion) {
    let mut group = c.benchmark_group("create_runs");

    for size in [1usize, 2, 3, 4] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                let mut alloc = allocator(16_384);
                while alloc.can_allocate(size) {
                    black_box(alloc.create_run(size).unwrap());
                }
            });
        });
    }

    group.finish();
}

/// Benchmark allocate/free churn on a half-full file
fn bench_churn(c: &mut Criterion) {
    c.bench_function("churn_mixed_sizes", |b| {
        let mut rng = StdRng::seed_from_u64(7);
        let mut alloc = allocator(16_384);
        let mut live = Vec::new();
        while alloc.empty_blocks() > 8_192 {
            let size = rng.gen_range(1..=4);
            live.push((alloc.create_run(size).unwrap(), size));
        }

        b.iter(|| {
            let i = rng.gen_range(0..live.len());
            let (index, size) = live.swap_remove(i);
            alloc.delete_run(index, size).unwrap();

            let size = rng.gen_range(1..=4);
            live.push((alloc.create_run(size).unwrap(), size));
        });
    });
}

/// Benchmark rebuilding the counters of a full-size map
fn bench_fix_counters(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(11);
    let mut alloc = allocator(65_024);
    for _ in 0..8_000 {
        let size = rng.gen_range(1..=4);
        alloc.create_run(size).unwrap();
    }

    c.bench_function("fix_allocation_counters", |b| {
        b.iter(|| {
            alloc.fix_allocation_counters();
            black_box(alloc.empty(3));
        });
    });
}

/// Benchmark allocation through the file set, including growth
fn bench_file_set(c: &mut Criterion) {
    c.bench_function("file_set_allocate_free", |b| {
        let dir = TempDir::new().unwrap();
        let mut files = BlockFiles::open_dir(dir.path(), BlockFilesConfig::default()).unwrap();
        files.init(true).unwrap();

        b.iter(|| {
            let addr = files.allocate(FileType::Block1K, 2).unwrap();
            files.free(black_box(addr), false).unwrap();
        });
    });
}

criterion_group!(
    benches,
    bench_create_runs,
    bench_churn,
    bench_fix_counters,
    bench_file_set
);
criterion_main!(benches);
