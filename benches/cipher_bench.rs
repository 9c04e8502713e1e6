//! Performance benchmarks for the cipher suite and address codec

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use kage::config::CipherMethod;
use kage::protocol::Address;
use kage::shadowsocks::cipher::{new_salt, Cipher};

fn seal_open_benchmark(c: &mut Criterion) {
    let payload = vec![0xABu8; 16 * 1024];

    let mut group = c.benchmark_group("cipher");
    group.throughput(Throughput::Bytes(payload.len() as u64));

    for method in [
        CipherMethod::Aes128Gcm,
        CipherMethod::Aes256Gcm,
        CipherMethod::Chacha20Poly1305,
    ] {
        let key = new_salt(method.key_len());
        let salt = new_salt(method.key_len());
        let enc = Cipher::new(&key, &salt, method).unwrap();
        let dec = Cipher::new(&key, &salt, method).unwrap();

        group.bench_function(format!("seal_open_{}", method), |b| {
            b.iter(|| {
                let sealed = enc.seal(black_box(&payload)).unwrap();
                let opened = dec.open(&sealed).unwrap();
                black_box(opened);
            })
        });
    }

    group.finish();
}

fn address_codec_benchmark(c: &mut Criterion) {
    let addr = Address::Domain("cdn.example.com".to_string(), 443);
    let encoded = addr.to_bytes();

    let mut group = c.benchmark_group("address_codec");

    group.bench_function("encode_domain", |b| {
        b.iter(|| black_box(addr.to_bytes()))
    });

    group.bench_function("decode_domain", |b| {
        b.iter(|| black_box(Address::decode(&encoded).unwrap()))
    });

    group.finish();
}

criterion_group!(benches, seal_open_benchmark, address_codec_benchmark);
criterion_main!(benches);
