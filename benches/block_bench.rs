use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::io::Cursor;
use uuid::Uuid;
use vximage::block::{decode_block, encode_block, BlockKind};
use vximage::codec::ImageWriter;
use vximage::crypto::CryptoSession;
use vximage::header::Header;
use vximage::layout::{CompressionParams, FileLayout};
use vximage::types::{
    BackupType, CompressionLevel, CompressionMethod, EncryptionStrength, KeyDerivation,
};

fn test_block(len: usize) -> Vec<u8> {
    (0..len as u32).map(|i| ((i * 31) % 251) as u8).collect()
}

fn bench_encode(c: &mut Criterion) {
    let data = test_block(1024 * 1024);

    c.bench_function("encode_1mb_medium", |b| {
        b.iter(|| {
            encode_block(BlockKind::Data, 0, black_box(&data), CompressionLevel::Medium, None)
                .unwrap()
        })
    });
    c.bench_function("encode_1mb_high", |b| {
        b.iter(|| {
            encode_block(BlockKind::Data, 0, black_box(&data), CompressionLevel::High, None)
                .unwrap()
        })
    });

    let kdf = KeyDerivation::PasswordBased { iterations: 1, salt: b"bench".to_vec() };
    let session = CryptoSession::create(EncryptionStrength::High, "bench", &kdf).unwrap();
    c.bench_function("encode_1mb_medium_aes256", |b| {
        b.iter(|| {
            encode_block(
                BlockKind::Data,
                0,
                black_box(&data),
                CompressionLevel::Medium,
                Some(&session),
            )
            .unwrap()
        })
    });
}

fn bench_decode(c: &mut Criterion) {
    let data = test_block(1024 * 1024);
    let (header, payload) =
        encode_block(BlockKind::Data, 0, &data, CompressionLevel::Medium, None).unwrap();

    c.bench_function("decode_1mb_medium", |b| {
        b.iter(|| decode_block(black_box(&header), black_box(&payload), None).unwrap())
    });
}

fn bench_write_container(c: &mut Criterion) {
    let blocks: Vec<Vec<u8>> = (0..16).map(|_| test_block(64 * 1024)).collect();
    let mut layout = FileLayout::new(Vec::new());
    layout.compression =
        CompressionParams { method: CompressionMethod::Zstd, level: CompressionLevel::Medium };

    c.bench_function("write_container_16x64k", |b| {
        b.iter(|| {
            let header = Header::new(Uuid::new_v4(), BackupType::Full, None, 0);
            let mut writer =
                ImageWriter::create(Cursor::new(Vec::new()), header, &layout, None).unwrap();
            for (i, block) in blocks.iter().enumerate() {
                writer.write_data_block(i as u32, black_box(block)).unwrap();
            }
            writer.finalize().unwrap();
        })
    });
}

criterion_group!(benches, bench_encode, bench_decode, bench_write_container);
criterion_main!(benches);
