//! Streaming payload compression.

use crate::Geometry;
use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use flate2::Compression;
use flate2::write::{DeflateDecoder, DeflateEncoder};
use std::io::Write;
use tracing::instrument;

/// Compressed output of one source stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// The whole compressed stream fits within the small-file limit and
    /// should be packed into a shared block.
    Shared(Vec<u8>),
    /// Remaining chunks for dedicated blocks, each at most
    /// [`Geometry::chunk_size`] bytes.
    Chunks(Vec<Vec<u8>>),
}

/// Compresses a source stream incrementally, handing out full-size chunks as
/// soon as they are available so that large sources never sit in memory.
///
/// # Examples
///
/// ```
/// use cumulus_codec::{Geometry, Payload, PayloadEncoder};
///
/// let mut encoder = PayloadEncoder::new(Geometry::new(8192, 1024).unwrap(), true);
/// assert!(encoder.write(b"tiny").unwrap().is_empty());
/// assert_eq!(encoder.consumed(), 4);
/// assert!(matches!(encoder.finish().unwrap(), Payload::Shared(_)));
/// ```
pub struct PayloadEncoder {
    compressor: DeflateEncoder<Vec<u8>>,
    chunk_size: usize,
    small_file_limit: usize,
    shareable: bool,
    consumed: u64,
}

impl PayloadEncoder {
    pub fn new(geometry: Geometry, shareable: bool) -> Self {
        Self {
            compressor: DeflateEncoder::new(Vec::new(), Compression::default()),
            chunk_size: geometry.chunk_size(),
            small_file_limit: geometry.small_file_limit(),
            shareable,
            consumed: 0,
        }
    }

    /// Feed more source bytes. Returns every full chunk now ready.
    pub fn write(&mut self, data: &[u8]) -> Result<Vec<Vec<u8>>> {
        self.compressor.write_all(data).or_raise(|| ErrorKind::Encoder)?;
        self.consumed += data.len() as u64;
        let staged = self.compressor.get_mut();
        if staged.len() > self.small_file_limit {
            self.shareable = false;
        }
        let mut chunks = Vec::new();
        while staged.len() >= self.chunk_size {
            chunks.push(staged.drain(..self.chunk_size).collect());
        }
        Ok(chunks)
    }

    /// Source bytes fed so far.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Flush the compressor and hand out whatever remains.
    pub fn finish(self) -> Result<Payload> {
        let shareable = self.shareable;
        let small_file_limit = self.small_file_limit;
        let chunk_size = self.chunk_size;
        let staged = self.compressor.finish().or_raise(|| ErrorKind::Encoder)?;
        if shareable && staged.len() <= small_file_limit {
            return Ok(Payload::Shared(staged));
        }
        Ok(Payload::Chunks(staged.chunks(chunk_size).map(<[u8]>::to_vec).collect()))
    }
}

/// Decompress a complete deflate stream.
#[instrument(skip(input), fields(input_size = input.len(), output_size))]
pub fn inflate(input: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = DeflateDecoder::new(Vec::new());
    decoder.write_all(input).or_raise(|| ErrorKind::Corrupt("deflate stream".into()))?;
    let output = decoder.finish().or_raise(|| ErrorKind::Corrupt("deflate stream".into()))?;
    tracing::Span::current().record("output_size", output.len());
    Ok(output)
}
