use criterion::{black_box, criterion_group, criterion_main, Criterion};
use emaildb_core::{decode_block, encode_block, Block, BlockType};

fn bench_block_codec(c: &mut Criterion) {
    let small = Block::new(BlockType::EmailBatch, 42, 1_700_000_000, vec![0xAB; 256]);
    let large = Block::new(BlockType::EmailBatch, 42, 1_700_000_000, vec![0xAB; 1024 * 1024]);

    let small_encoded = encode_block(&small);
    let large_encoded = encode_block(&large);

    c.bench_function("encode_block_256b", |b| b.iter(|| encode_block(black_box(&small))));
    c.bench_function("encode_block_1mb", |b| b.iter(|| encode_block(black_box(&large))));
    c.bench_function("decode_block_256b", |b| b.iter(|| decode_block(black_box(&small_encoded)).unwrap()));
    c.bench_function("decode_block_1mb", |b| b.iter(|| decode_block(black_box(&large_encoded)).unwrap()));
}

criterion_group!(benches, bench_block_codec);
criterion_main!(benches);
