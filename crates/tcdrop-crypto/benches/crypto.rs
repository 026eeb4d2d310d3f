use tcdrop_crypto::aead::{open, seal};
use tcdrop_crypto::{generate_file_key, Direction, StreamingGcm, TAG_SIZE};

fn make_data(size: usize) -> Vec<u8> {
    (0..size)
        .map(|i| (i.wrapping_mul(7) ^ (i >> 3)) as u8)
        .collect()
}

#[divan::bench(args = [1024, 65536, 1048576])]
fn bench_seal(bencher: divan::Bencher, size: usize) {
    let file_key = generate_file_key();
    let iv = [0xABu8; 16];
    let data = make_data(size);
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| {
            seal(
                divan::black_box(file_key.as_bytes()),
                &iv,
                b"",
                divan::black_box(&data),
            )
            .unwrap()
        });
}

#[divan::bench(args = [1024, 65536, 1048576])]
fn bench_open(bencher: divan::Bencher, size: usize) {
    let file_key = generate_file_key();
    let iv = [0xABu8; 16];
    let data = make_data(size);
    let sealed = seal(file_key.as_bytes(), &iv, b"", &data).unwrap();
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| {
            open(
                divan::black_box(file_key.as_bytes()),
                &iv,
                b"",
                divan::black_box(&sealed),
            )
            .unwrap()
        });
}

/// Same payload pushed in transport-sized pieces
#[divan::bench(args = [1000, 65536])]
fn bench_streaming_pushes(bencher: divan::Bencher, push: usize) {
    let file_key = generate_file_key();
    let data = make_data(1048576);
    bencher
        .counter(divan::counter::BytesCount::new(data.len()))
        .bench(|| {
            let mut gcm = StreamingGcm::new(
                file_key.as_bytes(),
                &[0u8; 16],
                b"",
                TAG_SIZE,
                Direction::Encrypt,
            )
            .unwrap();
            for chunk in data.chunks(push) {
                divan::black_box(gcm.update(chunk).unwrap());
            }
            gcm.finalize(&[]).unwrap()
        });
}

fn main() {
    divan::main();
}
