//! Append-only block file: whole-file exclusive lock, single sequential
//! writer, independent-handle readers, offset-0-only in-place overwrite.
//!
//! One process, one writer: `append`/`overwrite_at` take `&mut self` so
//! the borrow checker enforces the single-writer invariant at compile
//! time. Readers open their own file handle and never touch the writer's
//! cursor.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use thiserror::Error;
use tracing::{info, warn};

use crate::block::{decode_block, encode_block, Block, BlockCodecError, HEADER_BLOCK_ID};
use crate::block_index::{BlockIndex, BlockLocation};
use crate::scanner::{self, ScanWarning};

#[derive(Error, Debug)]
pub enum BlockFileError {
    #[error("file is locked by another process")]
    FileLocked,
    #[error("overwrite_at is only permitted at offset 0")]
    IllegalOverwrite,
    #[error("block is corrupt: {0}")]
    CorruptBlock(#[from] BlockCodecError),
    #[error("no block with id {0} in the index")]
    BlockNotFound(i64),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// An open, append-only block file with its live index built at open
/// time by a forward scan.
pub struct BlockFile {
    path: PathBuf,
    writer: File,
    lock_held: File,
    pub index: BlockIndex,
}

impl BlockFile {
    /// Open (or create) `path`. Checks for a stale `.bak` sibling first
    /// (a crash between the compactor's two renames) and rolls it back
    /// automatically. Acquires a whole-file exclusive advisory lock,
    /// then runs a forward scan to rebuild the `BlockIndex`. A damaged
    /// tail never prevents opening — it yields a degraded index plus a
    /// non-empty warnings list.
    pub fn open(path: impl AsRef<Path>, create_if_missing: bool) -> Result<(Self, Vec<ScanWarning>), BlockFileError> {
        let path = path.as_ref().to_path_buf();
        let bak_path = path.with_extension("bak");
        if bak_path.exists() {
            warn!(path = %path.display(), "found .bak sibling at open, rolling back incomplete compaction");
            if path.exists() {
                fs::remove_file(&path)?;
            }
            fs::rename(&bak_path, &path)?;
        }

        let mut open_opts = OpenOptions::new();
        open_opts.read(true).write(true);
        if create_if_missing {
            open_opts.create(true);
        }
        let writer = open_opts.open(&path)?;

        writer.try_lock_exclusive().map_err(|_| BlockFileError::FileLocked)?;
        let lock_held = writer.try_clone()?;

        let mut reader = writer.try_clone()?;
        reader.seek(SeekFrom::Start(0))?;
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;

        let (index, warnings) = scanner::rebuild_index(&data);
        info!(
            path = %path.display(),
            recovered_blocks = index.live_block_count(),
            warnings = warnings.len(),
            "opened block file"
        );

        Ok((
            Self {
                path,
                writer,
                lock_held,
                index,
            },
            warnings,
        ))
    }

    /// Append a fully framed block to the end of the file. Publishes the
    /// index entry only after the payload and footer are entirely on
    /// disk, so a reader can never observe a partial write. On short
    /// I/O, rolls the file length back to its pre-append size.
    pub fn append(&mut self, block: &Block) -> Result<BlockLocation, BlockFileError> {
        let pre_len = self.writer.seek(SeekFrom::End(0))?;
        let framed = encode_block(block);

        match self.writer.write_all(&framed) {
            Ok(()) => {}
            Err(e) => {
                self.writer.set_len(pre_len)?;
                return Err(BlockFileError::Io(e));
            }
        }
        self.writer.sync_all()?;

        let location = BlockLocation {
            position: pre_len,
            length: framed.len() as u64,
            block_id: block.block_id,
        };
        self.index.record(location);
        Ok(location)
    }

    /// Overwrite the header block at offset 0 in place. Any other offset
    /// is rejected with `IllegalOverwrite`; metadata updates elsewhere
    /// must be modeled as a new append followed by a header rewrite that
    /// repoints to the new location (invariant 4).
    pub fn overwrite_at(&mut self, block: &Block, offset: u64) -> Result<BlockLocation, BlockFileError> {
        if offset != 0 {
            return Err(BlockFileError::IllegalOverwrite);
        }
        let framed = encode_block(block);
        self.writer.seek(SeekFrom::Start(0))?;
        self.writer.write_all(&framed)?;
        self.writer.sync_all()?;

        let location = BlockLocation {
            position: 0,
            length: framed.len() as u64,
            block_id: block.block_id,
        };
        self.index.record(location);
        Ok(location)
    }

    /// Convenience wrapper around `overwrite_at` for the header-at-0
    /// record, to keep call sites self-documenting.
    pub fn rewrite_header(&mut self, block: &Block) -> Result<BlockLocation, BlockFileError> {
        debug_assert_eq!(block.block_id, HEADER_BLOCK_ID);
        self.overwrite_at(block, 0)
    }

    /// Validate and parse the block at `location`. Performs the three
    /// read-time validations (header magic, payload length equality,
    /// payload CRC) via `decode_block`; any failure is `CorruptBlock` and
    /// does not affect reads of other locations.
    pub fn read(&self, location: &BlockLocation) -> Result<Block, BlockFileError> {
        let mut reader = self.writer.try_clone()?;
        reader.seek(SeekFrom::Start(location.position))?;
        let mut buf = vec![0u8; location.length as usize];
        reader.read_exact(&mut buf)?;
        let (block, _) = decode_block(&buf)?;
        Ok(block)
    }

    /// Read a block by id, resolving its location through the index
    /// first.
    pub fn read_by_id(&self, block_id: i64) -> Result<Block, BlockFileError> {
        let location = self
            .index
            .lookup(block_id)
            .map_err(|_| BlockFileError::BlockNotFound(block_id))?;
        self.read(&location)
    }

    /// Forward scan of the current on-disk bytes, independent of the
    /// in-memory index (used to verify invariant 4, "scan equivalence").
    pub fn scan(&self) -> Result<scanner::ScanReport, BlockFileError> {
        let mut reader = self.writer.try_clone()?;
        reader.seek(SeekFrom::Start(0))?;
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        Ok(scanner::scan(&data, 0))
    }

    /// Current file length in bytes.
    pub fn file_size(&self) -> Result<u64, BlockFileError> {
        Ok(self.writer.metadata()?.len())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open an independent reader handle positioned at its own cursor,
    /// for callers that want to read concurrently with the writer.
    pub fn open_reader(&self) -> Result<File, BlockFileError> {
        Ok(File::open(&self.path)?)
    }
}

impl Drop for BlockFile {
    fn drop(&mut self) {
        let _ = self.lock_held.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockType;
    use tempfile::tempdir;

    #[test]
    fn append_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.edb");
        let (mut bf, warnings) = BlockFile::open(&path, true).unwrap();
        assert!(warnings.is_empty());

        let block = Block::new(BlockType::EmailBatch, 1001, 1, vec![0x01, 0x02, 0x03]);
        let loc = bf.append(&block).unwrap();
        let read_back = bf.read(&loc).unwrap();
        assert_eq!(read_back.payload, block.payload);
    }

    #[test]
    fn overwrite_at_nonzero_offset_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.edb");
        let (mut bf, _) = BlockFile::open(&path, true).unwrap();
        let block = Block::new(BlockType::Metadata, 0, 1, vec![0x00]);
        bf.append(&block).unwrap();
        let result = bf.overwrite_at(&block, 64);
        assert!(matches!(result, Err(BlockFileError::IllegalOverwrite)));
    }

    #[test]
    fn latest_write_wins_on_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.edb");
        {
            let (mut bf, _) = BlockFile::open(&path, true).unwrap();
            bf.append(&Block::new(BlockType::EmailBatch, 1001, 1, vec![1, 2, 3])).unwrap();
            bf.append(&Block::new(BlockType::EmailBatch, 1001, 2, vec![4, 5, 6, 7])).unwrap();
            bf.append(&Block::new(
                BlockType::EmailBatch,
                1001,
                3,
                vec![8, 9, 10, 11, 12],
            ))
            .unwrap();
        }
        let (bf, _) = BlockFile::open(&path, false).unwrap();
        assert_eq!(bf.index.live_block_count(), 1);
        let block = bf.read_by_id(1001).unwrap();
        assert_eq!(block.payload, vec![8, 9, 10, 11, 12]);
    }

    #[test]
    fn corrupted_magic_drops_block_from_index_on_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.edb");
        {
            let (mut bf, _) = BlockFile::open(&path, true).unwrap();
            bf.append(&Block::new(BlockType::EmailBatch, 2001, 1, vec![0xAA])).unwrap();
        }
        {
            let mut f = OpenOptions::new().write(true).open(&path).unwrap();
            f.seek(SeekFrom::Start(0)).unwrap();
            f.write_all(&[0xFF, 0xFF, 0xFF, 0xFF]).unwrap();
        }
        let (bf, _warnings) = BlockFile::open(&path, false).unwrap();
        assert_eq!(bf.index.live_block_count(), 0);
        assert!(bf.read_by_id(2001).is_err());
    }
}
