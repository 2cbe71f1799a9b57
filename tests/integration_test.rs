use emaildb_core::email::parse_message;
use emaildb_core::email_store::{CompoundId, EmailIndexes, EmailStore};
use emaildb_core::index::BTreeMapIndex;
use emaildb_core::{compact, scan, Block, BlockFile, BlockType};
use std::io::{Seek, SeekFrom, Write};
use tempfile::tempdir;

fn open(dir: &tempfile::TempDir, name: &str) -> (BlockFile, Vec<emaildb_core::ScanWarning>) {
    BlockFile::open(dir.path().join(name), true).unwrap()
}

/// S1 — Overwrite returns latest.
#[test]
fn s1_overwrite_returns_latest() {
    let dir = tempdir().unwrap();
    let (mut bf, _) = open(&dir, "s1.edb");

    bf.append(&Block::new(BlockType::EmailBatch, 1001, 1, vec![0x01, 0x02, 0x03]))
        .unwrap();
    bf.append(&Block::new(BlockType::EmailBatch, 1001, 2, vec![0x04, 0x05, 0x06, 0x07]))
        .unwrap();
    bf.append(&Block::new(
        BlockType::EmailBatch,
        1001,
        3,
        vec![0x08, 0x09, 0x0A, 0x0B, 0x0C],
    ))
    .unwrap();

    let block = bf.read_by_id(1001).unwrap();
    assert_eq!(block.payload, vec![0x08, 0x09, 0x0A, 0x0B, 0x0C]);
    assert_eq!(bf.index.live_block_count(), 1);
}

/// S2 — Write/read of distinct ids.
#[test]
fn s2_distinct_ids_round_trip() {
    let dir = tempdir().unwrap();
    let (mut bf, _) = open(&dir, "s2.edb");

    for i in 0u32..10 {
        let block = Block::new(BlockType::EmailBatch, 1000 + i as i64, 1, i.to_le_bytes().to_vec());
        bf.append(&block).unwrap();
    }
    for i in 0u32..10 {
        let block = bf.read_by_id(1000 + i as i64).unwrap();
        assert_eq!(block.payload, i.to_le_bytes().to_vec());
    }

    let data = std::fs::read(bf.path()).unwrap();
    let report = scan(&data, 0);
    assert_eq!(report.locations.len(), 10);
}

/// S3 — Truncation recovery.
#[test]
fn s3_truncation_recovery() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("s3.edb");
    let mut payloads = Vec::new();
    {
        let (mut bf, _) = BlockFile::open(&path, true).unwrap();
        for i in 0i64..100 {
            let payload = vec![(i % 251) as u8; 37];
            bf.append(&Block::new(BlockType::EmailBatch, i, 1, payload.clone()))
                .unwrap();
            payloads.push(payload);
        }
    }

    let full_size = std::fs::metadata(&path).unwrap().len();
    let f = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
    f.set_len(full_size / 2).unwrap();
    drop(f);

    let (bf, _warnings) = BlockFile::open(&path, false).unwrap();
    let recovered = bf.index.live_block_count();
    assert!(recovered <= 100);
    for i in 0i64..100 {
        if let Ok(block) = bf.read_by_id(i) {
            assert_eq!(block.payload, payloads[i as usize]);
        }
    }
}

/// S4 — Corrupted magic.
#[test]
fn s4_corrupted_magic_drops_block() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("s4.edb");
    {
        let (mut bf, _) = BlockFile::open(&path, true).unwrap();
        bf.append(&Block::new(BlockType::EmailBatch, 2001, 1, vec![0xAA]))
            .unwrap();
    }
    {
        let mut f = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        f.seek(SeekFrom::Start(0)).unwrap();
        f.write_all(&[0xFF, 0xFF, 0xFF, 0xFF]).unwrap();
    }

    let (bf, _warnings) = BlockFile::open(&path, false).unwrap();
    assert_eq!(bf.index.live_block_count(), 0);
    assert!(bf.read_by_id(2001).is_err());
}

/// S5 — Compaction reclaims space.
#[test]
fn s5_compaction_reclaims_space() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("s5.edb");
    {
        let (mut bf, _) = BlockFile::open(&path, true).unwrap();
        for id in 0i64..10 {
            for v in 0u8..20 {
                bf.append(&Block::new(BlockType::EmailBatch, id, v as i64, vec![v; 100]))
                    .unwrap();
            }
        }
    }

    let s1 = std::fs::metadata(&path).unwrap().len();
    let stats = compact(&path).unwrap();
    let s2 = stats.size_after;

    assert!((s2 as f64) <= 0.20 * (s1 as f64));
    assert_eq!(stats.live_blocks, 10);

    let (bf, _) = BlockFile::open(&path, false).unwrap();
    assert_eq!(bf.index.live_block_count(), 10);
    for id in 0i64..10 {
        let block = bf.read_by_id(id).unwrap();
        assert_eq!(block.payload, vec![19u8; 100]);
    }
}

/// S6 — Batched email dedup.
#[test]
fn s6_batched_email_dedup() {
    let dir = tempdir().unwrap();
    let (mut bf, _) = open(&dir, "s6.edb");

    let envelope = BTreeMapIndex::new();
    let content = BTreeMapIndex::new();
    let message_id = BTreeMapIndex::new();
    let indexes = EmailIndexes {
        envelope: &envelope,
        content: &content,
        message_id: &message_id,
    };
    // Small target so each store() flushes immediately and returns a
    // fully-resolved compound id, matching the scenario's literal
    // expectations.
    let mut store = EmailStore::with_target_size(&mut bf, indexes, 1);

    let headers = "Message-Id: <dup@example.com>\r\nFrom: a@example.com\r\nTo: b@example.com\r\n\
                   Date: Mon, 1 Jan 2024 00:00:00 +0000\r\nSubject: hi\r\n\r\n";

    let body1 = "x".repeat(1024);
    let body2 = "y".repeat(1024);
    let raw1 = format!("{headers}{body1}").into_bytes();
    let raw2 = format!("{headers}{body2}").into_bytes();

    let m1 = parse_message(&raw1).unwrap();
    let m2 = parse_message(&raw2).unwrap();

    let id1 = store.store(&m1, &raw1).unwrap();
    assert_eq!(id1, CompoundId { block_id: 1, local_id: 0 });

    let id2 = store.store(&m2, &raw2).unwrap();
    assert_ne!(id2, id1);

    let id1_repeat = store.store(&m1, &raw1).unwrap();
    assert_eq!(id1_repeat, id1);
}
