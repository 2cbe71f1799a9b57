//! Coordinates deduplication, batching, and flush against a `BlockFile`
//! and three external collaborator indexes. `EmailStore` borrows both
//! rather than owning either — no cyclic ownership between the storage
//! manager and its file stream.

use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

use crate::batch::{BatchBuilder, BatchParseError, BatchToc};
use crate::block::{Block, BlockType};
use crate::block_file::{BlockFile, BlockFileError};
use crate::block_index::BlockIndexError;
use crate::email::Message;
use crate::index::ExternalIndex;
use crate::sizer;

/// Compound identifier `"<BlockId>:<LocalId>"`, stable once the enclosing
/// batch block has been flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompoundId {
    pub block_id: i64,
    pub local_id: u32,
}

impl std::fmt::Display for CompoundId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.block_id, self.local_id)
    }
}

impl CompoundId {
    /// Strict parse: ASCII decimal only, exactly two components, no
    /// leading zeros, no whitespace, no extra `:`-separated parts.
    pub fn parse(s: &str) -> Result<Self, EmailStoreError> {
        let mut parts = s.split(':');
        let block_part = parts.next().ok_or(EmailStoreError::MalformedCompoundId)?;
        let local_part = parts.next().ok_or(EmailStoreError::MalformedCompoundId)?;
        if parts.next().is_some() {
            return Err(EmailStoreError::MalformedCompoundId);
        }
        let block_id = parse_strict_i64(block_part)?;
        let local_id = parse_strict_u32(local_part)?;
        Ok(Self { block_id, local_id })
    }
}

fn parse_strict_i64(s: &str) -> Result<i64, EmailStoreError> {
    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(EmailStoreError::MalformedCompoundId);
    }
    if digits.len() > 1 && digits.starts_with('0') {
        return Err(EmailStoreError::MalformedCompoundId);
    }
    let value: i64 = digits.parse().map_err(|_| EmailStoreError::MalformedCompoundId)?;
    Ok(if negative { -value } else { value })
}

fn parse_strict_u32(s: &str) -> Result<u32, EmailStoreError> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(EmailStoreError::MalformedCompoundId);
    }
    if s.len() > 1 && s.starts_with('0') {
        return Err(EmailStoreError::MalformedCompoundId);
    }
    s.parse().map_err(|_| EmailStoreError::MalformedCompoundId)
}

#[derive(Error, Debug)]
pub enum EmailStoreError {
    #[error("malformed compound id")]
    MalformedCompoundId,
    #[error("email not found")]
    EmailNotFound,
    #[error("compound id's block has not been flushed yet")]
    PendingCompoundIdUnresolved,
    #[error("block file error: {0}")]
    BlockFile(#[from] BlockFileError),
    #[error("batch payload error: {0}")]
    Batch(#[from] BatchParseError),
}

impl From<BlockIndexError> for EmailStoreError {
    fn from(_: BlockIndexError) -> Self {
        EmailStoreError::EmailNotFound
    }
}

/// Three named collaborator indexes, supplied by the caller (§6): an
/// opaque ordered string->string map per hash kind. The core never
/// assumes a particular backing implementation.
pub struct EmailIndexes<'a> {
    pub envelope: &'a dyn ExternalIndex,
    pub content: &'a dyn ExternalIndex,
    pub message_id: &'a dyn ExternalIndex,
}

/// Coordinates one open batch against one block file and its external
/// indexes. `BlockId`s for `EmailBatch` blocks are assigned by a simple
/// monotonic counter the moment a new batch is opened (the first `add`
/// after the builder was last empty) — this is what lets `store` return
/// a fully resolved `CompoundId` synchronously even before the batch
/// physically reaches disk, since a `BlockId` is caller-chosen identity,
/// not a position. `get` honors that contract on the read side: it checks
/// the still-open batch (`builder.pending()`) before the on-disk index,
/// so a `CompoundId` is resolvable the instant `store` returns it, flushed
/// or not.
pub struct EmailStore<'a> {
    block_file: &'a mut BlockFile,
    indexes: EmailIndexes<'a>,
    builder: BatchBuilder,
    pending_message_ids: Vec<String>,
    current_batch_block_id: Option<i64>,
    next_block_id: i64,
    /// True when the builder's target size was pinned explicitly via
    /// `with_target_size` rather than derived from `AdaptiveSizer`. Pinned
    /// targets are never silently overwritten by `store`'s reconciliation
    /// check (see `with_target_size`'s doc comment).
    pinned_target: bool,
}

impl<'a> EmailStore<'a> {
    /// Open a store against `block_file`, picking up the next free
    /// `BlockId` from the file's current index (one past the largest id
    /// seen, or `1` for a fresh file — `0` is reserved for the header).
    pub fn open(block_file: &'a mut BlockFile, indexes: EmailIndexes<'a>) -> Result<Self, EmailStoreError> {
        let next_block_id = block_file
            .index
            .snapshot()
            .iter()
            .map(|loc| loc.block_id)
            .max()
            .map(|m| m + 1)
            .unwrap_or(1)
            .max(1);
        let target = sizer::target_batch_size(block_file.file_size()?);
        Ok(Self {
            block_file,
            indexes,
            builder: BatchBuilder::new(target),
            pending_message_ids: Vec::new(),
            current_batch_block_id: None,
            next_block_id,
            pinned_target: false,
        })
    }

    /// Same as [`Self::open`] but with an explicit initial target size,
    /// bypassing `AdaptiveSizer` — useful for deterministic tests that
    /// want to force a flush after a small number of entries. Unlike
    /// `open`, the target is pinned: `store` never reconciles it against
    /// `AdaptiveSizer`'s recommendation for the file's current size.
    pub fn with_target_size(
        block_file: &'a mut BlockFile,
        indexes: EmailIndexes<'a>,
        target_size: u64,
    ) -> Self {
        let next_block_id = block_file
            .index
            .snapshot()
            .iter()
            .map(|loc| loc.block_id)
            .max()
            .map(|m| m + 1)
            .unwrap_or(1)
            .max(1);
        Self {
            block_file,
            indexes,
            builder: BatchBuilder::new(target_size),
            pending_message_ids: Vec::new(),
            current_batch_block_id: None,
            next_block_id,
            pinned_target: true,
        }
    }

    /// Store a parsed message's envelope and raw bytes. Deduplicates
    /// against the envelope-hash index (and against the currently open,
    /// not-yet-flushed batch) before appending.
    pub fn store(&mut self, message: &Message, data: &[u8]) -> Result<CompoundId, EmailStoreError> {
        let envelope_hash = crate::batch::envelope_hash(&message.fields, data);
        let envelope_key = hex::encode(envelope_hash);

        if let Some(existing) = self.indexes.envelope.get(&envelope_key) {
            return CompoundId::parse(&existing);
        }
        if let Some(local_id) = self
            .builder
            .pending()
            .iter()
            .find(|e| e.envelope_hash == envelope_hash)
            .map(|e| e.local_id)
        {
            let block_id = self
                .current_batch_block_id
                .expect("pending entries imply an open batch");
            return Ok(CompoundId { block_id, local_id });
        }

        if !self.pinned_target {
            let current_target = sizer::target_batch_size(self.block_file.file_size()?);
            if current_target != self.builder.target_size() {
                self.flush()?;
                self.builder.set_target_size(current_target);
            }
        }

        if self.builder.is_empty() {
            self.current_batch_block_id = Some(self.next_block_id);
            self.next_block_id += 1;
        }
        let block_id = self.current_batch_block_id.expect("just assigned above");

        let entry = self.builder.add(&message.fields, data.to_vec());
        let local_id = entry.local_id;
        self.pending_message_ids.push(message.fields.message_id.clone());

        let compound = CompoundId { block_id, local_id };

        if self.builder.should_flush() {
            self.flush()?;
        }

        Ok(compound)
    }

    /// Serialize and append the current batch (no-op if empty), then
    /// publish compound ids to all three external indexes.
    pub fn flush(&mut self) -> Result<(), EmailStoreError> {
        if self.builder.is_empty() {
            return Ok(());
        }
        let block_id = self
            .current_batch_block_id
            .expect("non-empty builder implies an assigned block id");

        let payload = self.builder.serialize();
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let block = Block::new(BlockType::EmailBatch, block_id, timestamp, payload);
        self.block_file.append(&block)?;

        for (entry, message_id) in self.builder.pending().iter().zip(self.pending_message_ids.iter()) {
            let compound = CompoundId {
                block_id,
                local_id: entry.local_id,
            }
            .to_string();
            self.indexes.envelope.put(&hex::encode(entry.envelope_hash), &compound);
            self.indexes.content.put(&hex::encode(entry.content_hash), &compound);
            self.indexes.message_id.put(message_id, &compound);
        }

        tracing::debug!(
            block_id,
            entries = self.builder.len(),
            bytes = self.builder.accumulated_bytes(),
            "flushed email batch"
        );

        self.builder.clear();
        self.pending_message_ids.clear();
        self.current_batch_block_id = None;
        Ok(())
    }

    /// Resolve a compound id to its raw email bytes.
    ///
    /// A `CompoundId` returned by `store` is observable immediately, even
    /// if its enclosing batch has not yet been flushed to the `BlockFile` —
    /// so a still-open batch's entries are resolved straight out of
    /// `builder.pending()` before falling back to the on-disk index. This
    /// is what makes the eagerly-assigned `BlockId` safe to hand back
    /// synchronously (spec.md §4.8 step 5) without ever constructing a
    /// `PendingCompoundIdUnresolved`.
    pub fn get(&self, compound: CompoundId) -> Result<Vec<u8>, EmailStoreError> {
        if self.current_batch_block_id == Some(compound.block_id) {
            if let Some(entry) = self
                .builder
                .pending()
                .iter()
                .find(|e| e.local_id == compound.local_id)
            {
                return Ok(entry.data.clone());
            }
        }

        let location = self.block_file.index.lookup(compound.block_id)?;
        let block = self.block_file.read(&location)?;
        let toc = BatchToc::parse(&block.payload)?;
        toc.slice(compound.local_id)
            .map(|s| s.to_vec())
            .map_err(|_| EmailStoreError::EmailNotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::email::parse_message;
    use crate::index::BTreeMapIndex;
    use tempfile::tempdir;

    fn message(message_id: &str, body: &str) -> (Message, Vec<u8>) {
        let raw = format!(
            "Message-Id: {message_id}\r\nFrom: a@example.com\r\nTo: b@example.com\r\n\
             Date: Mon, 1 Jan 2024 00:00:00 +0000\r\nSubject: s\r\n\r\n{body}"
        )
        .into_bytes();
        let msg = parse_message(&raw).unwrap();
        (msg, raw)
    }

    #[test]
    fn dedup_returns_same_compound_id_on_repeat() {
        let dir = tempdir().unwrap();
        let (mut bf, _) = BlockFile::open(dir.path().join("s.edb"), true).unwrap();
        let envelope = BTreeMapIndex::new();
        let content = BTreeMapIndex::new();
        let message_id = BTreeMapIndex::new();
        let indexes = EmailIndexes {
            envelope: &envelope,
            content: &content,
            message_id: &message_id,
        };
        let mut store = EmailStore::with_target_size(&mut bf, indexes, 1);

        let (m1, d1) = message("<same@example.com>", "body one, one kibibyte of text ".repeat(32).as_str());
        let (m2, d2) = message("<same@example.com>", "body two, a different one kibibyte ".repeat(32).as_str());

        let id1 = store.store(&m1, &d1).unwrap();
        let id2 = store.store(&m2, &d2).unwrap();
        assert_ne!(id1, id2);

        let id1_repeat = store.store(&m1, &d1).unwrap();
        assert_eq!(id1, id1_repeat);
    }

    #[test]
    fn store_then_get_round_trips_bytes() {
        let dir = tempdir().unwrap();
        let (mut bf, _) = BlockFile::open(dir.path().join("s.edb"), true).unwrap();
        let envelope = BTreeMapIndex::new();
        let content = BTreeMapIndex::new();
        let message_id = BTreeMapIndex::new();
        let indexes = EmailIndexes {
            envelope: &envelope,
            content: &content,
            message_id: &message_id,
        };
        let mut store = EmailStore::with_target_size(&mut bf, indexes, 1);

        let (m1, d1) = message("<m1@example.com>", "hello world");
        let id = store.store(&m1, &d1).unwrap();
        let got = store.get(id).unwrap();
        assert_eq!(got, d1);
    }

    #[test]
    fn pinned_target_survives_reconciliation_on_first_store() {
        let dir = tempdir().unwrap();
        let (mut bf, _) = BlockFile::open(dir.path().join("s.edb"), true).unwrap();
        let envelope = BTreeMapIndex::new();
        let content = BTreeMapIndex::new();
        let message_id = BTreeMapIndex::new();
        let indexes = EmailIndexes {
            envelope: &envelope,
            content: &content,
            message_id: &message_id,
        };
        // target_batch_size(0) is 50 MiB, far above the pinned target of 1
        // byte; the pin must survive store()'s reconciliation check so the
        // very first entry still forces an immediate flush.
        let mut store = EmailStore::with_target_size(&mut bf, indexes, 1);
        let (m1, d1) = message("<pin@example.com>", "hello world");
        let id = store.store(&m1, &d1).unwrap();
        let got = store.get(id).unwrap();
        assert_eq!(got, d1);
    }

    #[test]
    fn get_resolves_unflushed_entry_from_pending_batch() {
        let dir = tempdir().unwrap();
        let (mut bf, _) = BlockFile::open(dir.path().join("s.edb"), true).unwrap();
        let envelope = BTreeMapIndex::new();
        let content = BTreeMapIndex::new();
        let message_id = BTreeMapIndex::new();
        let indexes = EmailIndexes {
            envelope: &envelope,
            content: &content,
            message_id: &message_id,
        };
        // A target far larger than the single entry stored below, so the
        // batch never reaches should_flush() and nothing is appended to
        // the BlockFile — get() must still resolve it out of the builder.
        let mut store = EmailStore::with_target_size(&mut bf, indexes, 1_000_000);
        let (m1, d1) = message("<unflushed@example.com>", "small body");
        let id = store.store(&m1, &d1).unwrap();
        assert!(bf_is_absent(&store, id.block_id));
        let got = store.get(id).unwrap();
        assert_eq!(got, d1);
    }

    fn bf_is_absent(store: &EmailStore<'_>, block_id: i64) -> bool {
        !store.block_file.index.contains(block_id)
    }

    #[test]
    fn get_unknown_compound_id_fails() {
        let dir = tempdir().unwrap();
        let (bf, _) = BlockFile::open(dir.path().join("s.edb"), true).unwrap();
        let envelope = BTreeMapIndex::new();
        let content = BTreeMapIndex::new();
        let message_id = BTreeMapIndex::new();
        let indexes = EmailIndexes {
            envelope: &envelope,
            content: &content,
            message_id: &message_id,
        };
        let mut bf = bf;
        let store = EmailStore::with_target_size(&mut bf, indexes, 1);
        let err = store.get(CompoundId { block_id: 999, local_id: 0 });
        assert!(matches!(err, Err(EmailStoreError::EmailNotFound)));
    }

    #[test]
    fn compound_id_parse_is_strict() {
        assert_eq!(
            CompoundId::parse("10:0").unwrap(),
            CompoundId { block_id: 10, local_id: 0 }
        );
        assert!(CompoundId::parse("010:0").is_err());
        assert!(CompoundId::parse("10:00").is_err());
        assert!(CompoundId::parse("10:0:1").is_err());
        assert!(CompoundId::parse("10").is_err());
        assert!(CompoundId::parse(" 10:0").is_err());
        assert!(CompoundId::parse("10:-1").is_err());
        assert_eq!(
            CompoundId::parse("-10:0").unwrap(),
            CompoundId { block_id: -10, local_id: 0 }
        );
    }

    #[test]
    fn compound_id_display_round_trips_parse() {
        let id = CompoundId { block_id: 42, local_id: 7 };
        assert_eq!(CompoundId::parse(&id.to_string()).unwrap(), id);
    }
}
