//! Shared block packing and indexing.
//!
//! A shared block body is a plain concatenation of entries, each
//! `id (8 bytes, BE) | length (4 bytes, BE) | compressed payload`.

use crate::Geometry;
use crate::error::{ErrorKind, Result};
use crate::payload::inflate;
use exn::ResultExt;
use std::collections::BTreeMap;
use std::ops::Range;

const ENTRY_HEADER: usize = 12;

/// Accumulates small compressed payloads into shared block bodies.
///
/// A body never grows beyond [`Geometry::chunk_size`]; an entry that would
/// overflow it closes the current body instead of being split.
#[derive(Debug)]
pub struct SharedPacker {
    buffer: Vec<u8>,
    capacity: usize,
    entries: usize,
}

impl SharedPacker {
    pub fn new(geometry: Geometry) -> Self {
        Self { buffer: Vec::new(), capacity: geometry.chunk_size(), entries: 0 }
    }

    /// Append an entry for file `id`. Returns the previous body if it had to
    /// be closed to make room; the new entry then starts the next body.
    pub fn push(&mut self, id: u64, payload: &[u8]) -> Result<Option<Vec<u8>>> {
        let length = u32::try_from(payload.len()).or_raise(|| ErrorKind::Encoder)?;
        if ENTRY_HEADER + payload.len() > self.capacity {
            exn::bail!(ErrorKind::Encoder);
        }
        let closed = match self.buffer.len() + ENTRY_HEADER + payload.len() > self.capacity {
            true => self.take(),
            false => None,
        };
        self.buffer.extend_from_slice(&id.to_be_bytes());
        self.buffer.extend_from_slice(&length.to_be_bytes());
        self.buffer.extend_from_slice(payload);
        self.entries += 1;
        Ok(closed)
    }

    /// Hand out the current body, if it holds any entries.
    pub fn take(&mut self) -> Option<Vec<u8>> {
        self.entries = 0;
        match self.buffer.is_empty() {
            true => None,
            false => Some(std::mem::take(&mut self.buffer)),
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Number of entries in the current body.
    pub fn entries(&self) -> usize {
        self.entries
    }
}

/// Byte-offset index of a decoded shared block body, for extracting one
/// file without walking the whole body again.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SharedIndex {
    entries: BTreeMap<u64, Range<usize>>,
}

impl SharedIndex {
    /// Scan a body sequentially, recording where each entry's payload lives.
    /// A later entry with a repeated id replaces the earlier one.
    pub fn parse(body: &[u8]) -> Result<Self> {
        let mut entries = BTreeMap::new();
        let mut offset = 0;
        while offset < body.len() {
            let Some(header) = body.get(offset..offset + ENTRY_HEADER) else {
                exn::bail!(ErrorKind::Corrupt(format!("truncated shared entry header at offset {offset}")));
            };
            let (id, length) = header.split_at(8);
            let id = u64::from_be_bytes(<[u8; 8]>::try_from(id).or_raise(|| ErrorKind::Corrupt("entry id".into()))?);
            let length = u32::from_be_bytes(
                <[u8; 4]>::try_from(length).or_raise(|| ErrorKind::Corrupt("entry length".into()))?,
            ) as usize;
            let start = offset + ENTRY_HEADER;
            if start + length > body.len() {
                exn::bail!(ErrorKind::Corrupt(format!("shared entry {id} overruns the block")));
            }
            entries.insert(id, start..start + length);
            offset = start + length;
        }
        Ok(Self { entries })
    }

    pub fn get(&self, id: u64) -> Option<Range<usize>> {
        self.entries.get(&id).cloned()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.entries.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Decompress the contents of file `id` out of `body`.
    pub fn extract(&self, body: &[u8], id: u64) -> Result<Option<Vec<u8>>> {
        let Some(range) = self.get(id) else {
            return Ok(None);
        };
        let payload = body
            .get(range)
            .ok_or_else(|| exn::Exn::from(ErrorKind::Corrupt(format!("shared entry {id} outside the body"))))?;
        Ok(Some(inflate(payload)?))
    }
}
