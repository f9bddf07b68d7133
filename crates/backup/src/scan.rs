//! Reading live filesystem state.

use crate::error::{Result, io};
use exn::ResultExt;
use std::collections::{BTreeMap, HashMap};
use std::fs::Metadata;
use std::path::Path;
use tracing::warn;

const S_IFMT: u32 = 0o170_000;
const S_IFDIR: u32 = 0o040_000;
const S_IFREG: u32 = 0o100_000;

/// One entry of a live directory listing, as compared against the catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveEntry {
    pub name: String,
    /// Empty unless the entry is a symlink.
    pub symlink_target: String,
    pub attributes: u32,
    pub owner: String,
    pub group: String,
    pub logical_size: u64,
    pub last_modified: i64,
    pub created: i64,
}

impl LiveEntry {
    pub fn is_symlink(&self) -> bool {
        !self.symlink_target.is_empty()
    }

    pub fn is_dir(&self) -> bool {
        !self.is_symlink() && self.attributes & S_IFMT == S_IFDIR
    }

    /// Only regular files have content worth uploading.
    pub fn is_file(&self) -> bool {
        !self.is_symlink() && self.attributes & S_IFMT == S_IFREG
    }
}

/// Resolves numeric owners to names, remembering every lookup.
#[derive(Debug, Default)]
pub struct Owners {
    users: HashMap<u32, String>,
    groups: HashMap<u32, String>,
}

impl Owners {
    pub fn user(&mut self, uid: u32) -> String {
        self.users.entry(uid).or_insert_with(|| lookup_user(uid)).clone()
    }

    pub fn group(&mut self, gid: u32) -> String {
        self.groups.entry(gid).or_insert_with(|| lookup_group(gid)).clone()
    }

    /// Build a [`LiveEntry`] from `lstat` metadata.
    pub fn entry(&mut self, name: String, metadata: &Metadata, symlink_target: String) -> LiveEntry {
        let stat = Stat::from(metadata);
        LiveEntry {
            name,
            symlink_target,
            attributes: stat.mode,
            owner: self.user(stat.uid),
            group: self.group(stat.gid),
            logical_size: metadata.len(),
            last_modified: stat.mtime,
            created: stat.ctime,
        }
    }
}

struct Stat {
    mode: u32,
    uid: u32,
    gid: u32,
    mtime: i64,
    ctime: i64,
}

#[cfg(unix)]
impl From<&Metadata> for Stat {
    fn from(metadata: &Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        Self { mode: metadata.mode(), uid: metadata.uid(), gid: metadata.gid(), mtime: metadata.mtime(), ctime: metadata.ctime() }
    }
}

#[cfg(not(unix))]
impl From<&Metadata> for Stat {
    fn from(metadata: &Metadata) -> Self {
        let seconds = |time: std::io::Result<std::time::SystemTime>| {
            time.ok()
                .and_then(|time| time.duration_since(std::time::UNIX_EPOCH).ok())
                .map_or(0, |elapsed| elapsed.as_secs() as i64)
        };
        let mode = match metadata.is_dir() {
            true => S_IFDIR | 0o755,
            false => S_IFREG | 0o644,
        };
        Self { mode, uid: 0, gid: 0, mtime: seconds(metadata.modified()), ctime: seconds(metadata.created()) }
    }
}

#[cfg(unix)]
fn lookup_user(uid: u32) -> String {
    use nix::unistd::{Uid, User};
    match User::from_uid(Uid::from_raw(uid)) {
        Ok(Some(user)) => user.name,
        _ => uid.to_string(),
    }
}

#[cfg(unix)]
fn lookup_group(gid: u32) -> String {
    use nix::unistd::{Gid, Group};
    match Group::from_gid(Gid::from_raw(gid)) {
        Ok(Some(group)) => group.name,
        _ => gid.to_string(),
    }
}

#[cfg(not(unix))]
fn lookup_user(uid: u32) -> String {
    uid.to_string()
}

#[cfg(not(unix))]
fn lookup_group(gid: u32) -> String {
    gid.to_string()
}

/// List a directory without following symlinks.
///
/// A directory that cannot be opened reads as empty, and entries that
/// cannot be stat'ed or whose names are not valid UTF-8 are skipped; each
/// case is logged.
pub async fn list_dir(path: &Path, owners: &mut Owners) -> BTreeMap<String, LiveEntry> {
    let mut entries = BTreeMap::new();
    let mut reader = match tokio::fs::read_dir(path).await {
        Ok(reader) => reader,
        Err(err) => {
            warn!(path = %path.display(), "Unable to read directory: {err}");
            return entries;
        },
    };
    loop {
        let entry = match reader.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(err) => {
                warn!(path = %path.display(), "Directory listing interrupted: {err}");
                break;
            },
        };
        let Ok(name) = entry.file_name().into_string() else {
            warn!(path = %entry.path().display(), "Skipping entry with a non UTF-8 name");
            continue;
        };
        match stat(&entry.path(), owners).await {
            Ok(live) => {
                entries.insert(name.clone(), LiveEntry { name, ..live });
            },
            Err(err) => warn!(path = %entry.path().display(), "Skipping entry: {err}"),
        }
    }
    entries
}

/// `lstat` a single path. The returned entry's name is the final path
/// component, or empty for the filesystem root.
pub async fn stat(path: &Path, owners: &mut Owners) -> Result<LiveEntry> {
    let metadata = tokio::fs::symlink_metadata(path).await.or_raise(io(path.display()))?;
    let symlink_target = match metadata.file_type().is_symlink() {
        true => tokio::fs::read_link(path).await.or_raise(io(path.display()))?.to_string_lossy().into_owned(),
        false => String::new(),
    };
    let name = path.file_name().map(|name| name.to_string_lossy().into_owned()).unwrap_or_default();
    Ok(owners.entry(name, &metadata, symlink_target))
}
