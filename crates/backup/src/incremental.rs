//! Remote snapshot layout.
//!
//! Under the configured remote folder live the base (`0`), the numbered
//! incrementals `1..N`, the [`Summary`] document, and transiently a `TEMP`
//! folder for the run in progress and a `MERGE` folder used while folding
//! the oldest incremental into the base.

use crate::blocks::{self, BlockList, DELETION_LOG_BLOCK, Parts};
use crate::deletion;
use crate::error::{ErrorKind, Result};
use cumulus_codec::BlockCodec;
use cumulus_storage::{Backoff, Handle, Listing, ServiceHandle};
use exn::ResultExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, instrument, warn};

pub const SUMMARY: &str = "summary.json";
pub const TEMP: &str = "TEMP";
pub const MERGE: &str = "MERGE";

/// The persisted run summary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    /// Creation time of each incremental, indexed like the folders.
    #[serde(default)]
    pub incremental_times: Vec<i64>,
    #[serde(default)]
    pub last_backup_id: u64,
}

/// A finalised snapshot folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Incremental {
    pub handle: Handle,
    /// Unix timestamp of the run that produced it.
    pub time: i64,
}

pub struct Lifecycle {
    service: ServiceHandle,
    backoff: Backoff,
    home: Handle,
    incrementals: BTreeMap<usize, Incremental>,
    last_backup_id: u64,
}

impl Lifecycle {
    /// Open the remote folder for a backup run, creating it if needed.
    /// A `TEMP` folder left behind by an interrupted run is deleted.
    #[instrument(skip(service, backoff), fields(backend = service.name()))]
    pub async fn open(service: ServiceHandle, remote_path: &str, backoff: Backoff) -> Result<Self> {
        let mut home = service.root().await.or_raise(|| ErrorKind::Storage)?;
        for segment in segments(remote_path) {
            home = backoff
                .run("create folder", || service.create_folder(&home, segment))
                .await
                .or_raise(|| ErrorKind::Storage)?;
        }
        let listing = service.list(&home).await.or_raise(|| ErrorKind::Storage)?;
        if let Some(temp) = listing.folder(TEMP) {
            warn!("Deleting staging folder left by an interrupted run");
            backoff.run("delete folder", || service.delete(&temp.handle)).await.or_raise(|| ErrorKind::Storage)?;
        }
        Self::load(service, backoff, home, &listing).await
    }

    /// Open the remote folder without changing anything.
    pub async fn inspect(service: ServiceHandle, remote_path: &str) -> Result<Self> {
        let mut home = service.root().await.or_raise(|| ErrorKind::Storage)?;
        for segment in segments(remote_path) {
            home = service
                .find_folder(&home, segment)
                .await
                .or_raise(|| ErrorKind::Storage)?
                .ok_or_else(|| exn::Exn::from(ErrorKind::Corrupt(format!("remote folder '{remote_path}' not found"))))?;
        }
        let listing = service.list(&home).await.or_raise(|| ErrorKind::Storage)?;
        Self::load(service, Backoff::default(), home, &listing).await
    }

    async fn load(service: ServiceHandle, backoff: Backoff, home: Handle, listing: &Listing) -> Result<Self> {
        let summary = match listing.file(SUMMARY) {
            Some(entry) => {
                let data = service.download(&entry.handle).await.or_raise(|| ErrorKind::Storage)?;
                serde_json::from_slice(&data).unwrap_or_else(|err| {
                    warn!("Ignoring unreadable {SUMMARY}: {err}");
                    Summary::default()
                })
            },
            None => Summary::default(),
        };
        let mut incrementals = BTreeMap::new();
        for folder in &listing.folders {
            let Some(index) = parse_index(&folder.name) else {
                continue;
            };
            match summary.incremental_times.get(index) {
                Some(&time) => {
                    incrementals.insert(index, Incremental { handle: folder.handle.clone(), time });
                },
                None => warn!(index, "Ignoring incremental without a recorded time"),
            }
        }
        if summary.incremental_times.len() > incrementals.len() {
            debug!(dropped = summary.incremental_times.len() - incrementals.len(), "Dropping times without a folder");
        }
        info!(incrementals = incrementals.len(), last_backup_id = summary.last_backup_id, "Remote snapshots loaded");
        Ok(Self { service, backoff, home, incrementals, last_backup_id: summary.last_backup_id })
    }

    pub fn incrementals(&self) -> &BTreeMap<usize, Incremental> {
        &self.incrementals
    }

    pub fn count(&self) -> usize {
        self.incrementals.len()
    }

    pub fn last_backup_id(&self) -> u64 {
        self.last_backup_id
    }

    /// Time of the most recent finished run.
    pub fn last_run(&self) -> Option<i64> {
        self.incrementals.last_key_value().map(|(_, incremental)| incremental.time)
    }

    pub fn summary(&self) -> Summary {
        Summary {
            incremental_times: self.incrementals.values().map(|incremental| incremental.time).collect(),
            last_backup_id: self.last_backup_id,
        }
    }

    /// Snapshots must be numbered `0..count` without gaps.
    pub fn ensure_contiguous(&self) -> Result<()> {
        match self.incrementals.keys().copied().eq(0..self.count()) {
            true => Ok(()),
            false => {
                let found: Vec<_> = self.incrementals.keys().map(ToString::to_string).collect();
                exn::bail!(ErrorKind::Corrupt(format!("incrementals are not contiguous: [{}]", found.join(", "))))
            },
        }
    }

    /// Create the staging folder for a new run.
    pub async fn start(&self) -> Result<Handle> {
        self.ensure_contiguous()?;
        let (service, home) = (&self.service, &self.home);
        self.backoff.run("create folder", || service.create_folder(home, TEMP)).await.or_raise(|| ErrorKind::Storage)
    }

    /// Turn the staging folder into the newest incremental.
    #[instrument(skip(self, temp))]
    pub async fn finish(&mut self, temp: &Handle, next_id: u64) -> Result<()> {
        let index = self.count();
        let name = index.to_string();
        let service = &self.service;
        let handle =
            self.backoff.run("rename folder", || service.rename(temp, &name)).await.or_raise(|| ErrorKind::Storage)?;
        self.incrementals.insert(index, Incremental { handle, time: crate::now() });
        self.last_backup_id = next_id;
        self.save_summary().await?;
        info!(index, "Incremental finalised");
        Ok(())
    }

    pub async fn save_summary(&self) -> Result<()> {
        let data = serde_json::to_vec(&self.summary()).or_raise(|| ErrorKind::Corrupt(format!("encoding {SUMMARY}")))?;
        let (service, home) = (&self.service, &self.home);
        self.backoff
            .run("upload summary", || service.upload(home, SUMMARY, &data))
            .await
            .or_raise(|| ErrorKind::Storage)?;
        Ok(())
    }

    pub async fn block_list(&self, index: usize) -> Result<BlockList> {
        let incremental = self.get(index)?;
        let listing = self.service.list(&incremental.handle).await.or_raise(|| ErrorKind::Storage)?;
        Ok(blocks::block_list(&listing))
    }

    /// Download every part of a block, in part order.
    pub async fn download(&self, parts: &Parts) -> Result<Vec<Vec<u8>>> {
        let mut data = Vec::with_capacity(parts.len());
        for handle in parts.values() {
            data.push(self.service.download(handle).await.or_raise(|| ErrorKind::Storage)?);
        }
        Ok(data)
    }

    /// Highest block number stored in any snapshot. Parts uploaded for a
    /// root that was later rolled back are counted too.
    pub async fn highest_block(&self) -> Result<Option<u64>> {
        let mut highest = None;
        for &index in self.incrementals.keys() {
            let last = self.block_list(index).await?.last_key_value().map(|(&block, _)| block);
            highest = highest.max(last);
        }
        Ok(highest)
    }

    /// The newest snapshot holding `block_number`, with its parts.
    pub async fn find_latest(&self, block_number: u64) -> Result<Option<(usize, Parts)>> {
        for &index in self.incrementals.keys().rev() {
            if let Some(parts) = self.block_list(index).await?.remove(&block_number) {
                return Ok(Some((index, parts)));
            }
        }
        Ok(None)
    }

    /// Fold incremental 1 into the base.
    ///
    /// Base blocks listed in incremental 1's deletion log are discarded, as
    /// are base copies of any block number incremental 1 holds again.
    /// Everything else in incremental 1 moves into the base, and later
    /// incrementals shift down by one.
    #[instrument(skip(self, codec), fields(incrementals = self.count()))]
    pub async fn merge_down(&mut self, codec: &BlockCodec) -> Result<()> {
        if self.count() < 2 {
            exn::bail!(ErrorKind::NotEnoughIncrementals(self.count()));
        }
        self.ensure_contiguous()?;
        let base_blocks = self.block_list(0).await?;
        let oldest_blocks = self.block_list(1).await?;
        let freed = match oldest_blocks.get(&DELETION_LOG_BLOCK) {
            Some(parts) => {
                let data = codec.decode_parts(&self.download(parts).await?).or_raise(|| ErrorKind::Codec)?;
                deletion::parse(&data)?
            },
            None => {
                warn!("Incremental 1 has no deletion log");
                Vec::new()
            },
        };
        let mut discard: BTreeSet<u64> = freed.into_iter().filter(|block| base_blocks.contains_key(block)).collect();
        discard.extend(oldest_blocks.keys().filter(|block| base_blocks.contains_key(block)));

        let (service, backoff) = (&self.service, self.backoff);
        let base = self.get(0)?.handle.clone();
        let oldest = self.get(1)?.handle.clone();
        let merge =
            backoff.run("create folder", || service.create_folder(&self.home, MERGE)).await.or_raise(|| ErrorKind::Storage)?;
        for block in &discard {
            for handle in base_blocks[block].values() {
                backoff.run("move block", || service.move_into(handle, &merge)).await.or_raise(|| ErrorKind::Storage)?;
            }
        }
        for handle in oldest_blocks.values().flat_map(Parts::values) {
            backoff.run("move block", || service.move_into(handle, &base)).await.or_raise(|| ErrorKind::Storage)?;
        }
        backoff.run("delete folder", || service.delete(&oldest)).await.or_raise(|| ErrorKind::Storage)?;

        // The base now holds the state of incremental 1 and takes its time.
        let mut shifted = BTreeMap::new();
        let base_time = self.get(1)?.time;
        shifted.insert(0, Incremental { handle: base, time: base_time });
        for (&index, incremental) in self.incrementals.range(2..) {
            let name = (index - 1).to_string();
            let handle = backoff
                .run("rename folder", || service.rename(&incremental.handle, &name))
                .await
                .or_raise(|| ErrorKind::Storage)?;
            shifted.insert(index - 1, Incremental { handle, time: incremental.time });
        }
        self.incrementals = shifted;
        self.save_summary().await?;
        backoff.run("delete folder", || service.delete(&merge)).await.or_raise(|| ErrorKind::Storage)?;
        info!(discarded = discard.len(), remaining = self.count(), "Merged oldest incremental into base");
        Ok(())
    }

    fn get(&self, index: usize) -> Result<&Incremental> {
        self.incrementals
            .get(&index)
            .ok_or_else(|| exn::Exn::from(ErrorKind::Corrupt(format!("incremental {index} is missing"))))
    }
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|segment| !segment.is_empty())
}

fn parse_index(name: &str) -> Option<usize> {
    match !name.is_empty() && name.bytes().all(|b| b.is_ascii_digit()) {
        true => name.parse().ok(),
        false => None,
    }
}
