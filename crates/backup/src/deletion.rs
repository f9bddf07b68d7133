//! Tracking block numbers freed during a run.
//!
//! The log is a flat file of 8-byte big-endian block numbers. It is uploaded
//! as block 1 of the incremental and read back when that incremental is
//! merged into the base.

use crate::error::{ErrorKind, Result, io};
use exn::ResultExt;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

const ENTRY: usize = 8;

/// Append-only log of freed block numbers.
///
/// Numbers recorded while a backup root is processed stay pending until that
/// root's catalog transaction commits, and are dropped if it rolls back.
#[derive(Debug)]
pub struct DeletionLog {
    path: PathBuf,
    pending: Vec<u64>,
    committed: usize,
}

impl DeletionLog {
    /// Start a fresh, empty log at `path`.
    pub async fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        tokio::fs::write(&path, b"").await.or_raise(io(path.display()))?;
        Ok(Self { path, pending: Vec::new(), committed: 0 })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&mut self, block_number: u64) {
        debug!(block_number, "Block freed");
        self.pending.push(block_number);
    }

    /// Append pending numbers to the file.
    ///
    /// On failure the numbers stay pending for the next commit, and anything
    /// a failed attempt wrote past the committed entries is overwritten.
    pub async fn commit(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .await
            .or_raise(io(self.path.display()))?;
        let end = (self.committed * ENTRY) as u64;
        file.set_len(end).await.or_raise(io(self.path.display()))?;
        file.seek(SeekFrom::Start(end)).await.or_raise(io(self.path.display()))?;
        file.write_all(&encode(&self.pending)).await.or_raise(io(self.path.display()))?;
        file.flush().await.or_raise(io(self.path.display()))?;
        self.committed += self.pending.len();
        self.pending.clear();
        Ok(())
    }

    /// Forget pending numbers.
    pub fn discard(&mut self) {
        self.pending.clear();
    }

    /// Number of entries written to the file so far.
    pub fn committed(&self) -> usize {
        self.committed
    }
}

pub fn encode(blocks: &[u64]) -> Vec<u8> {
    blocks.iter().flat_map(|block| block.to_be_bytes()).collect()
}

/// Decode a log. A trailing partial entry means the log is damaged.
pub fn parse(data: &[u8]) -> Result<Vec<u64>> {
    if data.len() % ENTRY != 0 {
        exn::bail!(ErrorKind::Corrupt(format!("deletion log length {} is not a multiple of {ENTRY}", data.len())));
    }
    Ok(data
        .chunks_exact(ENTRY)
        .map(|chunk| {
            let mut bytes = [0u8; ENTRY];
            bytes.copy_from_slice(chunk);
            u64::from_be_bytes(bytes)
        })
        .collect())
}
