use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::ffi::OsStr;
use veilfs::crypto::{ContentEnc, FileHeader, MasterKey, NameTransform, PLAIN_BLOCK_SIZE};

/// Benchmark block encryption and decryption for a few run lengths.
fn bench_blocks(c: &mut Criterion) {
    let content = ContentEnc::new(&MasterKey::generate());
    let id = FileHeader::random().id;

    let mut group = c.benchmark_group("content_blocks");
    for blocks in [1usize, 16, 256] {
        let plain = vec![42u8; blocks * PLAIN_BLOCK_SIZE];
        let cipher = content.encrypt_blocks(&plain, 0, &id).unwrap();
        group.throughput(Throughput::Bytes(plain.len() as u64));

        group.bench_with_input(BenchmarkId::new("encrypt", blocks), &plain, |b, plain| {
            b.iter(|| black_box(content.encrypt_blocks(plain, 0, &id).unwrap()));
        });
        group.bench_with_input(BenchmarkId::new("decrypt", blocks), &cipher, |b, cipher| {
            b.iter(|| black_box(content.decrypt_blocks(cipher, 0, &id).unwrap()));
        });
    }
    group.finish();
}

/// Benchmark name encryption and decryption.
fn bench_names(c: &mut Criterion) {
    let names = NameTransform::new(&MasterKey::generate()).unwrap();
    let iv = [7u8; 16];
    let plain = OsStr::new("a-reasonably-long-file-name.tar.gz");
    let cipher = names.encrypt_name(plain, &iv).unwrap();

    c.bench_function("encrypt_name", |b| {
        b.iter(|| black_box(names.encrypt_name(plain, &iv).unwrap()))
    });
    c.bench_function("decrypt_name", |b| {
        b.iter(|| black_box(names.decrypt_name(&cipher, &iv).unwrap()))
    });
}

criterion_group!(benches, bench_blocks, bench_names);
criterion_main!(benches);
