use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use qhub_storage::{Compression, Storage};
use std::hint::black_box;
use std::time::Duration;
use tempfile::TempDir;

// ============================================================================
// Benchmark: Path Resolution & Security Validation
// ============================================================================

fn bench_path_resolution(c: &mut Criterion) {
    let mut group = c.benchmark_group("path_resolution");

    let temp = TempDir::new().unwrap();
    let storage = Storage::builder().root(temp.path()).create(true).open().unwrap();
    storage.create_dir("default/https+++example.com").unwrap();

    group.bench_function("existing_dir", |b| {
        b.iter(|| {
            black_box(storage.resolve("default/https+++example.com").unwrap());
        });
    });

    group.bench_function("missing_nested", |b| {
        b.iter(|| {
            black_box(storage.resolve("temporary/https+++a.com/idb/x").unwrap());
        });
    });

    group.finish();
}

// ============================================================================
// Benchmark: Compression
// ============================================================================

fn bench_compression(c: &mut Criterion) {
    let mut group = c.benchmark_group("compression");

    for (name, size) in [("1KB", 1024), ("100KB", 100 * 1024)] {
        let data: Vec<u8> = (0..size).map(|i| u8::try_from(i % 256).unwrap()).collect();
        group.throughput(Throughput::Bytes(u64::try_from(size).unwrap_or(u64::MAX)));

        group.bench_with_input(BenchmarkId::new("compress", name), &data, |b, data| {
            b.iter(|| black_box(lz4_flex::compress_prepend_size(data)));
        });
    }

    group.finish();
}

// ============================================================================
// Benchmark: Directory Accounting
// ============================================================================

fn bench_directory_accounting(c: &mut Criterion) {
    let mut group = c.benchmark_group("directory_accounting");
    group.measurement_time(Duration::from_secs(5));

    let temp = TempDir::new().unwrap();
    let storage = Storage::builder().root(temp.path()).open().unwrap();
    for origin in 0..32 {
        for file in 0..8 {
            storage.write(format!("default/o{origin}/idb/f{file}"), &[7u8; 512]).unwrap();
        }
    }

    group.bench_function("dir_size_256_files", |b| {
        b.iter(|| black_box(storage.dir_size("default").unwrap()));
    });

    group.bench_function("list_dirs_32", |b| {
        b.iter(|| black_box(storage.list_dirs("default").unwrap()));
    });

    group.finish();
}

// ============================================================================
// Benchmark: Atomic Writes
// ============================================================================

fn bench_atomic_writes(c: &mut Criterion) {
    let mut group = c.benchmark_group("atomic_writes");
    group.sample_size(20);

    let temp = TempDir::new().unwrap();
    let storage =
        Storage::builder().root(temp.path()).compression(Compression::Lz4).open().unwrap();
    let payload = vec![42u8; 4096];

    group.bench_function("overwrite_4KB", |b| {
        b.iter(|| storage.write("cache/usage.bin", black_box(&payload)).unwrap());
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_path_resolution,
    bench_compression,
    bench_directory_accounting,
    bench_atomic_writes
);
criterion_main!(benches);
