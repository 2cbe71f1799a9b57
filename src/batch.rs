//! Packs multiple email payloads into one `EmailBatch` block payload: a
//! dense TOC followed by the concatenated raw bytes, in insertion order.
//!
//! `LocalId` is always `pending.len()` at the moment of `add` — dense
//! `0..N-1` by construction, never reassigned, never reused after
//! `clear()`.

use byteorder::{LittleEndian, WriteBytesExt};
use sha2::{Digest, Sha256};

use crate::email::EnvelopeFields;

/// SHA-256 digest, 32 bytes.
pub type Hash32 = [u8; 32];

/// One accumulated email, prior to serialization.
#[derive(Debug, Clone)]
pub struct Entry {
    pub local_id: u32,
    pub envelope_hash: Hash32,
    pub content_hash: Hash32,
    pub data: Vec<u8>,
}

/// Computes `envelope_hash = SHA-256(message_id | from | to | date_iso8601
/// | subject | cc | in_reply_to | first_reference | byte_len(raw))`.
///
/// The trailing `byte_len` term is load-bearing: two envelopes that are
/// otherwise byte-identical but carry different bodies differ in `raw`
/// length and therefore produce different envelope hashes, which is what
/// prevents a same-headers-different-body pair from colliding.
pub fn envelope_hash(fields: &EnvelopeFields, raw: &[u8]) -> Hash32 {
    let mut hasher = Sha256::new();
    hasher.update(fields.message_id.as_bytes());
    hasher.update(fields.from.as_bytes());
    hasher.update(fields.to.as_bytes());
    hasher.update(fields.date_iso8601.as_bytes());
    hasher.update(fields.subject.as_bytes());
    hasher.update(fields.cc.as_bytes());
    hasher.update(fields.in_reply_to.as_bytes());
    hasher.update(fields.first_reference.as_bytes());
    hasher.update(&(raw.len() as u64).to_le_bytes());
    hasher.finalize().into()
}

pub fn content_hash(raw: &[u8]) -> Hash32 {
    Sha256::digest(raw).into()
}

/// Accumulates pending email entries for one `EmailBatch` block.
pub struct BatchBuilder {
    target_size: u64,
    pending: Vec<Entry>,
    accumulated_bytes: u64,
}

impl BatchBuilder {
    pub fn new(target_size: u64) -> Self {
        Self {
            target_size,
            pending: Vec::new(),
            accumulated_bytes: 0,
        }
    }

    pub fn target_size(&self) -> u64 {
        self.target_size
    }

    pub fn set_target_size(&mut self, target_size: u64) {
        self.target_size = target_size;
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn accumulated_bytes(&self) -> u64 {
        self.accumulated_bytes
    }

    /// Append one email, returning the `Entry` it was assigned (local id
    /// is dense and equal to the number of entries already pending).
    pub fn add(&mut self, fields: &EnvelopeFields, data: Vec<u8>) -> &Entry {
        let local_id = self.pending.len() as u32;
        let envelope_hash = envelope_hash(fields, &data);
        let content_hash = content_hash(&data);
        self.accumulated_bytes += data.len() as u64;
        self.pending.push(Entry {
            local_id,
            envelope_hash,
            content_hash,
            data,
        });
        self.pending.last().expect("just pushed")
    }

    /// True once the accumulated raw byte count reaches the current target.
    pub fn should_flush(&self) -> bool {
        self.accumulated_bytes >= self.target_size
    }

    /// Serialize the TOC + concatenated payload in insertion order:
    /// `u32 count`, then `count` TOC entries of `{u32 data_len, 32B
    /// envelope_hash, 32B content_hash}`, then the payload bytes
    /// back-to-back.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.pending.len() * (4 + 32 + 32) + self.accumulated_bytes as usize);
        out.write_u32::<LittleEndian>(self.pending.len() as u32)
            .expect("vec write");
        for entry in &self.pending {
            out.write_u32::<LittleEndian>(entry.data.len() as u32)
                .expect("vec write");
            out.extend_from_slice(&entry.envelope_hash);
            out.extend_from_slice(&entry.content_hash);
        }
        for entry in &self.pending {
            out.extend_from_slice(&entry.data);
        }
        out
    }

    /// Empties the builder and resets the byte accumulator.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.accumulated_bytes = 0;
    }

    pub fn pending(&self) -> &[Entry] {
        &self.pending
    }
}

/// A parsed view over an already-serialized `EmailBatch` payload, used by
/// `EmailStore::get` to slice out a single `LocalId` without copying the
/// whole batch.
pub struct BatchToc<'a> {
    payload: &'a [u8],
    toc: Vec<TocEntry>,
}

#[derive(Debug, Clone, Copy)]
struct TocEntry {
    data_len: u32,
    envelope_hash: Hash32,
    content_hash: Hash32,
}

#[derive(Debug, thiserror::Error)]
pub enum BatchParseError {
    #[error("batch payload truncated")]
    Truncated,
    #[error("local id {0} out of range for batch with {1} entries")]
    LocalIdOutOfRange(u32, u32),
}

impl<'a> BatchToc<'a> {
    pub fn parse(payload: &'a [u8]) -> Result<Self, BatchParseError> {
        if payload.len() < 4 {
            return Err(BatchParseError::Truncated);
        }
        let count = u32::from_le_bytes(payload[0..4].try_into().unwrap());
        let mut pos = 4usize;
        let mut toc = Vec::with_capacity(count as usize);
        for _ in 0..count {
            if payload.len() < pos + 4 + 32 + 32 {
                return Err(BatchParseError::Truncated);
            }
            let data_len = u32::from_le_bytes(payload[pos..pos + 4].try_into().unwrap());
            pos += 4;
            let mut envelope_hash = [0u8; 32];
            envelope_hash.copy_from_slice(&payload[pos..pos + 32]);
            pos += 32;
            let mut content_hash = [0u8; 32];
            content_hash.copy_from_slice(&payload[pos..pos + 32]);
            pos += 32;
            toc.push(TocEntry {
                data_len,
                envelope_hash,
                content_hash,
            });
        }
        Ok(Self {
            payload: &payload[pos..],
            toc,
        })
    }

    pub fn count(&self) -> u32 {
        self.toc.len() as u32
    }

    /// Byte slice for `local_id`, resolving through the TOC's dense
    /// offsets (each entry's data follows the previous one in order).
    pub fn slice(&self, local_id: u32) -> Result<&'a [u8], BatchParseError> {
        if local_id as usize >= self.toc.len() {
            return Err(BatchParseError::LocalIdOutOfRange(local_id, self.toc.len() as u32));
        }
        let mut offset = 0usize;
        for entry in &self.toc[..local_id as usize] {
            offset += entry.data_len as usize;
        }
        let entry = self.toc[local_id as usize];
        let end = offset + entry.data_len as usize;
        if self.payload.len() < end {
            return Err(BatchParseError::Truncated);
        }
        Ok(&self.payload[offset..end])
    }

    pub fn envelope_hash(&self, local_id: u32) -> Option<Hash32> {
        self.toc.get(local_id as usize).map(|e| e.envelope_hash)
    }

    pub fn content_hash(&self, local_id: u32) -> Option<Hash32> {
        self.toc.get(local_id as usize).map(|e| e.content_hash)
    }
}
