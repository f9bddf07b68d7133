//! Remote block naming.
//!
//! Every part of a block is stored as its own object named
//! `{block_number}_{part_number}.dat` inside an incremental folder.

use cumulus_storage::{Handle, Listing};
use std::collections::BTreeMap;

/// Block holding the catalog snapshot.
pub const CATALOG_BLOCK: u64 = 0;
/// Block holding the deletion log.
pub const DELETION_LOG_BLOCK: u64 = 1;
/// Block numbers below this are reserved for per-incremental metadata.
pub const RESERVED_BLOCKS: u64 = cumulus_catalog::FIRST_DATA_BLOCK;

/// Part handles of one block, in part order.
pub type Parts = BTreeMap<u64, Handle>;
/// Blocks of one incremental, in block order.
pub type BlockList = BTreeMap<u64, Parts>;

pub fn block_name(block_number: u64, part_number: u64) -> String {
    format!("{block_number}_{part_number}.dat")
}

pub fn parse_block_name(name: &str) -> Option<(u64, u64)> {
    let (block, part) = name.strip_suffix(".dat")?.split_once('_')?;
    let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    if !digits(block) || !digits(part) {
        return None;
    }
    Some((block.parse().ok()?, part.parse().ok()?))
}

/// First block number that neither the catalog nor any remote snapshot
/// has used yet.
pub fn first_free(catalog_next: u64, remote_highest: Option<u64>) -> u64 {
    remote_highest.map_or(0, |block| block + 1).max(catalog_next).max(RESERVED_BLOCKS)
}

/// Collect the blocks in a folder listing, ignoring anything else.
pub fn block_list(listing: &Listing) -> BlockList {
    let mut blocks = BlockList::new();
    for entry in &listing.files {
        if let Some((block, part)) = parse_block_name(&entry.name) {
            blocks.entry(block).or_default().insert(part, entry.handle.clone());
        }
    }
    blocks
}
