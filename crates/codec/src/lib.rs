//! Block codec for encrypted, deduplicated backups.
//!
//! Every payload that leaves the machine goes through the same pipeline:
//!
//! - **Compression** with a streaming deflate compressor ([`PayloadEncoder`]),
//!   chunked so no chunk exceeds the block size minus [`FRAME_OVERHEAD`].
//! - **Framing** as `random(4) | length(4, BE) | payload | HMAC-SHA1(20) | random(4)`,
//!   padded with random bytes to the small-file limit and then to a multiple
//!   of [`ALIGNMENT`].
//! - **Encryption** with AES-CBC under the first key/IV pair, a one-byte
//!   rotation (last byte moved to the front), then AES-CBC under the second
//!   pair ([`BlockCodec::seal`]).
//!
//! Small payloads are not given a block of their own: a [`SharedPacker`]
//! concatenates them into a shared block body addressed by file id, and a
//! [`SharedIndex`] locates each entry again.

mod codec;
pub mod error;
mod keys;
mod payload;
mod shared;

pub use crate::codec::BlockCodec;
pub use crate::keys::Keys;
pub use crate::payload::{Payload, PayloadEncoder, inflate};
pub use crate::shared::{SharedIndex, SharedPacker};
use crate::error::{ErrorKind, Result};

/// Bytes added around every payload by the frame (random prefix, length,
/// HMAC tag and random suffix).
pub const FRAME_OVERHEAD: usize = 32;
/// Every sealed block is a multiple of this many bytes.
pub const ALIGNMENT: usize = 4096;

/// Block size and small-file limit, validated together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    block_size: usize,
    small_file_limit: usize,
}

impl Geometry {
    /// # Errors
    ///
    /// Fails unless `block_size` is a non-zero multiple of [`ALIGNMENT`] and
    /// `small_file_limit` is below half of it.
    pub fn new(block_size: usize, small_file_limit: usize) -> Result<Self> {
        if block_size == 0 || block_size % ALIGNMENT != 0 {
            exn::bail!(ErrorKind::InvalidGeometry(format!("block size {block_size} is not a multiple of {ALIGNMENT}")));
        }
        if small_file_limit >= block_size / 2 {
            exn::bail!(ErrorKind::InvalidGeometry(format!(
                "small file limit {small_file_limit} must be below half the block size {block_size}"
            )));
        }
        Ok(Self { block_size, small_file_limit })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn small_file_limit(&self) -> usize {
        self.small_file_limit
    }

    /// Largest payload a single frame carries.
    pub fn chunk_size(&self) -> usize {
        self.block_size - FRAME_OVERHEAD
    }
}
