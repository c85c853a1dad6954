//! Cipher benchmarks.
//!
//! Packet seal/open throughput per suite at the largest chunk size, plus
//! the key derivations run once per connection.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use sockscipher::crypto::{kdf, CipherSuite, Decrypter, Encrypter, NonceScheme, MAX_CHUNK_SIZE};

const BENCH_SUITES: [CipherSuite; 5] = [
    CipherSuite::Aes128Gcm,
    CipherSuite::Aes256Gcm,
    CipherSuite::ChaCha20Poly1305,
    CipherSuite::XChaCha20Poly1305,
    CipherSuite::ChaCha20Ietf,
];

fn keyed(suite: CipherSuite) -> (Encrypter, Decrypter) {
    let key = vec![0x42u8; suite.key_size()];
    let fixed = vec![0x24u8; suite.fixed_nonce_size()];

    let mut encrypter = Encrypter::new(suite);
    let mut decrypter = Decrypter::new(suite);
    encrypter.set_key(&key).unwrap();
    decrypter.set_key(&key).unwrap();
    match suite.nonce_scheme() {
        NonceScheme::Prefix => {
            encrypter.set_nonce_prefix(&fixed).unwrap();
            decrypter.set_nonce_prefix(&fixed).unwrap();
        }
        NonceScheme::Iv => {
            encrypter.set_iv(&fixed).unwrap();
            decrypter.set_iv(&fixed).unwrap();
        }
    }

    (encrypter, decrypter)
}

fn bench_seal(c: &mut Criterion) {
    let plaintext = vec![0u8; MAX_CHUNK_SIZE];

    let mut group = c.benchmark_group("seal");
    group.throughput(Throughput::Bytes(MAX_CHUNK_SIZE as u64));

    for suite in BENCH_SUITES {
        let (mut encrypter, _) = keyed(suite);
        let mut out = vec![0u8; encrypter.ciphertext_size(plaintext.len())];
        let mut packet_number = 0u64;

        group.bench_with_input(BenchmarkId::from_parameter(suite), &plaintext, |b, pt| {
            b.iter(|| {
                let n = encrypter
                    .encrypt_packet_into(packet_number, b"", black_box(pt), &mut out)
                    .unwrap();
                packet_number += 1;
                black_box(n)
            })
        });
    }

    group.finish();
}

fn bench_open(c: &mut Criterion) {
    let plaintext = vec![0u8; MAX_CHUNK_SIZE];

    let mut group = c.benchmark_group("open");
    group.throughput(Throughput::Bytes(MAX_CHUNK_SIZE as u64));

    for suite in BENCH_SUITES {
        let (mut encrypter, mut decrypter) = keyed(suite);
        let ciphertext = encrypter.encrypt_packet(7, b"", &plaintext).unwrap();
        let mut out = vec![0u8; plaintext.len()];

        group.bench_with_input(BenchmarkId::from_parameter(suite), &ciphertext, |b, ct| {
            b.iter(|| {
                black_box(
                    decrypter
                        .decrypt_packet_into(7, b"", black_box(ct), &mut out)
                        .unwrap(),
                )
            })
        });
    }

    group.finish();
}

fn bench_key_derivation(c: &mut Criterion) {
    let master = kdf::password_to_key("benchmark password", 32);
    let salt = [0x11u8; 32];

    c.bench_function("password_to_key", |b| {
        b.iter(|| black_box(kdf::password_to_key(black_box("benchmark password"), 32)))
    });

    c.bench_function("session_subkey", |b| {
        b.iter(|| black_box(kdf::session_subkey(&master, black_box(&salt)).unwrap()))
    });
}

criterion_group!(benches, bench_seal, bench_open, bench_key_derivation);
criterion_main!(benches);
