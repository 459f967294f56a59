use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use veil_crypto::XtsCodec;

fn bench_xts(c: &mut Criterion) {
    let key: Vec<u8> = (0..64).map(|i| i as u8).collect();
    let codec = XtsCodec::new(&key).expect("codec");
    let mut data = vec![0xA5_u8; 1024 * 1024];

    let mut group = c.benchmark_group("xts");
    group.throughput(Throughput::Bytes(data.len() as u64));
    group.bench_function("decrypt_sectors_1mib", |b| {
        b.iter(|| codec.decrypt_sectors(0, &mut data).expect("decrypt"));
    });
    group.bench_function("encrypt_sectors_1mib", |b| {
        b.iter(|| codec.encrypt_sectors(0, &mut data).expect("encrypt"));
    });
    group.finish();
}

criterion_group!(benches, bench_xts);
criterion_main!(benches);
