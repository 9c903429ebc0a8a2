//! Benchmarks for packet framing, the page cache and file streams

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::{Rng, SeedableRng};
use std::io::{Read, Write};
use std::sync::Arc;
use wirefs::core::allocator::BitmapPlacement;
use wirefs::core::header::{FsLayout, PointerWidth};
use wirefs::core::page::{decode_packet, encode_packet};
use wirefs::sim::{SimBus, SimDevice};
use wirefs::{CacheRegistry, Device, DeviceAddress, MemoryCache, PageId, WireFile, WireFsConfig};

const ADDR: DeviceAddress = DeviceAddress(0x2D00_0000_0000_0C01);

fn random_bytes(len: usize) -> Vec<u8> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(0x5EED);
    (0..len).map(|_| rng.gen()).collect()
}

fn benchmark_packet(c: &mut Criterion) {
    let mut group = c.benchmark_group("packet");
    let data = random_bytes(29);

    group.bench_function("encode", |b| {
        b.iter(|| encode_packet(black_box(&data), black_box(7)));
    });

    let packet = encode_packet(&data, 7);
    group.bench_function("decode", |b| {
        b.iter(|| decode_packet(black_box(&packet), black_box(7)).map(|d| d.len()));
    });

    group.finish();
}

fn benchmark_cache_sync(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_write_sync");

    for pages in [16usize, 64, 256].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(pages), pages, |b, &pages| {
            let devices: Vec<Box<dyn Device>> =
                vec![Box::new(SimDevice::rewritable(ADDR, pages, 32))];
            let mut cache = MemoryCache::new(devices, WireFsConfig::default()).unwrap();
            let data = random_bytes(28);
            b.iter(|| {
                for page in 0..pages {
                    cache.write_page_packet(PageId::from_index(page), &data).unwrap();
                }
                cache.sync().unwrap();
            });
        });
    }

    group.finish();
}

fn benchmark_write_once_redirect(c: &mut Criterion) {
    c.bench_function("write_once_redirect", |b| {
        b.iter(|| {
            let device = SimDevice::write_once(ADDR, 64, 32);
            let devices: Vec<Box<dyn Device>> = vec![Box::new(device)];
            let mut cache = MemoryCache::new(devices, WireFsConfig::default()).unwrap();
            cache.set_layout(Some(FsLayout {
                width: PointerWidth::One,
                multi_device: false,
                bitmap: BitmapPlacement::Engine,
            }));
            cache.load_bitmap().unwrap();
            let page = cache.allocate_page().unwrap();
            for pattern in [0x0Fu8, 0xF0, 0x3C] {
                cache.write_page_packet(page, &[pattern; 8]).unwrap();
                cache.sync().unwrap();
            }
            black_box(cache.stats().redirects)
        });
    });
}

fn benchmark_file_stream(c: &mut Criterion) {
    let mut group = c.benchmark_group("file_stream");

    for size in [256usize, 2048].iter() {
        let bus = Arc::new(SimBus::new(vec![SimDevice::rewritable(ADDR, 256, 32)]));
        let registry = CacheRegistry::new(bus, WireFsConfig::default());
        let root = WireFile::new(registry, &[ADDR], "/").unwrap();
        root.format().unwrap();
        let file = root.child("BENCH.0").unwrap();
        let data = random_bytes(*size);

        group.bench_with_input(BenchmarkId::new("write", size), &data, |b, data| {
            b.iter(|| {
                let mut writer = file.writer(false).unwrap();
                writer.write_all(data).unwrap();
                writer.close().unwrap();
            });
        });

        group.bench_with_input(BenchmarkId::new("read", size), &data, |b, data| {
            b.iter(|| {
                let mut back = Vec::with_capacity(data.len());
                file.reader().unwrap().read_to_end(&mut back).unwrap();
                black_box(back.len())
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    benchmark_packet,
    benchmark_cache_sync,
    benchmark_write_once_redirect,
    benchmark_file_stream
);
criterion_main!(benches);
