//! Comparing a live directory listing against its catalog records.

use crate::scan::LiveEntry;
use cumulus_catalog::FileRecord;
use std::collections::BTreeMap;

/// Values of the stored record that differ from the live entry. A field is
/// `Some` only when it changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Originals {
    pub symlink_target: Option<String>,
    pub attributes: Option<u32>,
    pub owner: Option<String>,
    pub group: Option<String>,
    pub logical_size: Option<u64>,
    pub last_modified: Option<i64>,
}

impl Originals {
    fn compare(stored: &FileRecord, live: &LiveEntry) -> Self {
        fn changed<T: PartialEq + Clone>(stored: &T, live: &T) -> Option<T> {
            (stored != live).then(|| stored.clone())
        }
        Self {
            symlink_target: changed(&stored.symlink_target, &live.symlink_target),
            attributes: changed(&stored.attributes, &live.attributes),
            owner: changed(&stored.owner, &live.owner),
            group: changed(&stored.group, &live.group),
            logical_size: changed(&stored.logical_size, &live.logical_size),
            last_modified: changed(&stored.last_modified, &live.last_modified),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Size or modification time changed, so the content must be uploaded again.
    pub fn content_changed(&self) -> bool {
        self.logical_size.is_some() || self.last_modified.is_some()
    }
}

/// A stored record whose live metadata differs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Changed {
    pub stored: FileRecord,
    pub live: LiveEntry,
    pub originals: Originals,
}

impl Changed {
    /// The stored content no longer applies, either because size or
    /// modification time moved or because the entry changed type.
    pub fn drops_content(&self) -> bool {
        const S_IFMT: u32 = 0o170_000;
        self.originals.content_changed() || self.stored.attributes & S_IFMT != self.live.attributes & S_IFMT
    }

    /// The record as it should be persisted.
    ///
    /// A content change drops the block reference so the file is uploaded
    /// again. `last_data_change` becomes `now` when only the size changed,
    /// and the new modification time otherwise.
    pub fn updated(&self, now: i64) -> FileRecord {
        let content_changed = self.drops_content();
        let size_only = self.originals.logical_size.is_some() && self.originals.last_modified.is_none();
        FileRecord {
            block_number: if content_changed { 0 } else { self.stored.block_number },
            shared: if content_changed { false } else { self.stored.shared },
            symlink_target: self.live.symlink_target.clone(),
            attributes: self.live.attributes,
            owner: self.live.owner.clone(),
            group: self.live.group.clone(),
            logical_size: self.live.logical_size,
            last_modified: self.live.last_modified,
            created: self.live.created,
            last_data_change: if size_only { now } else { self.live.last_modified },
            ..self.stored.clone()
        }
    }
}

/// One unit of work drained from a [`Diff`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Remove(FileRecord),
    Traverse(FileRecord),
    Add(LiveEntry),
    Update(Box<Changed>),
}

/// Pending operations for one directory, keyed by entry name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diff {
    pub remove: BTreeMap<String, FileRecord>,
    pub traverse: BTreeMap<String, FileRecord>,
    pub add: BTreeMap<String, LiveEntry>,
    pub update: BTreeMap<String, Changed>,
}

impl Diff {
    /// Classify every name in either listing.
    pub fn compute(stored: BTreeMap<String, FileRecord>, mut live: BTreeMap<String, LiveEntry>) -> Self {
        let mut diff = Self::default();
        for (name, record) in stored {
            let Some(entry) = live.remove(&name) else {
                diff.remove.insert(name, record);
                continue;
            };
            let originals = Originals::compare(&record, &entry);
            if !originals.is_empty() {
                diff.update.insert(name, Changed { stored: record, live: entry, originals });
            } else if entry.is_dir() {
                diff.traverse.insert(name, record);
            }
        }
        diff.add = live;
        diff
    }

    /// Everything below a directory that no longer exists.
    pub fn removals(stored: BTreeMap<String, FileRecord>) -> Self {
        Self { remove: stored, ..Self::default() }
    }

    /// Everything inside a directory that was not backed up before.
    pub fn additions(live: BTreeMap<String, LiveEntry>) -> Self {
        Self { add: live, ..Self::default() }
    }

    /// Drop every entry whose name fails `keep`.
    pub fn retain(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.remove.retain(|name, _| keep(name));
        self.traverse.retain(|name, _| keep(name));
        self.add.retain(|name, _| keep(name));
        self.update.retain(|name, _| keep(name));
    }

    pub fn is_empty(&self) -> bool {
        self.remove.is_empty() && self.traverse.is_empty() && self.add.is_empty() && self.update.is_empty()
    }

    /// Take the next operation: removals first, then traversals, additions
    /// and updates, each in name order.
    pub fn next_op(&mut self) -> Option<Op> {
        if let Some((_, record)) = self.remove.pop_first() {
            return Some(Op::Remove(record));
        }
        if let Some((_, record)) = self.traverse.pop_first() {
            return Some(Op::Traverse(record));
        }
        if let Some((_, entry)) = self.add.pop_first() {
            return Some(Op::Add(entry));
        }
        self.update.pop_first().map(|(_, changed)| Op::Update(Box::new(changed)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIR: u32 = 0o040_755;
    const FILE: u32 = 0o100_644;

    fn record(id: u64, name: &str, attributes: u32, size: u64, mtime: i64) -> FileRecord {
        FileRecord {
            id,
            name: name.to_string(),
            attributes,
            owner: "alice".to_string(),
            group: "staff".to_string(),
            logical_size: size,
            last_modified: mtime,
            ..Default::default()
        }
    }

    fn live(record: &FileRecord) -> LiveEntry {
        LiveEntry {
            name: record.name.clone(),
            symlink_target: record.symlink_target.clone(),
            attributes: record.attributes,
            owner: record.owner.clone(),
            group: record.group.clone(),
            logical_size: record.logical_size,
            last_modified: record.last_modified,
            created: record.created,
        }
    }

    fn stored(records: &[FileRecord]) -> BTreeMap<String, FileRecord> {
        records.iter().map(|r| (r.name.clone(), r.clone())).collect()
    }

    fn listing(records: &[FileRecord]) -> BTreeMap<String, LiveEntry> {
        records.iter().map(|r| (r.name.clone(), live(r))).collect()
    }

    #[test]
    fn test_identical_listings_only_traverse_directories() {
        let records = [
            record(1, "docs", DIR, 4096, 1),
            record(2, "notes.txt", FILE, 10, 5),
            record(3, "src", DIR, 4096, 2),
            FileRecord { symlink_target: "docs".to_string(), ..record(4, "link", 0o120_777, 4, 3) },
        ];
        let diff = Diff::compute(stored(&records), listing(&records));
        assert!(diff.add.is_empty() && diff.remove.is_empty() && diff.update.is_empty());
        assert_eq!(diff.traverse.keys().collect::<Vec<_>>(), vec!["docs", "src"]);
    }

    #[test]
    fn test_size_change_records_original_size_only() {
        let before = record(7, "b", FILE, 10, 5);
        let after = record(7, "b", FILE, 12, 5);
        let diff = Diff::compute(stored(&[before]), listing(&[after]));
        let changed = &diff.update["b"];
        assert_eq!(changed.originals.logical_size, Some(10));
        assert_eq!(changed.originals.last_modified, None);
        assert!(diff.traverse.is_empty());
    }

    #[test]
    fn test_add_and_remove() {
        let diff = Diff::compute(stored(&[record(1, "old", FILE, 1, 1)]), listing(&[record(0, "new", FILE, 1, 1)]));
        assert_eq!(diff.remove.keys().collect::<Vec<_>>(), vec!["old"]);
        assert_eq!(diff.add.keys().collect::<Vec<_>>(), vec!["new"]);
    }

    #[test]
    fn test_updated_record() {
        let stored = FileRecord { block_number: 12, shared: true, real_size: 10, ..record(7, "b", FILE, 10, 5) };
        let changed = |live: LiveEntry| Changed {
            originals: Originals::compare(&stored, &live),
            stored: stored.clone(),
            live,
        };

        // Size only: content is re-uploaded, and the change is dated now.
        let updated = changed(LiveEntry { logical_size: 12, ..live(&stored) }).updated(1000);
        assert_eq!((updated.block_number, updated.shared, updated.last_data_change), (0, false, 1000));
        assert_eq!((updated.id, updated.real_size), (7, 10));

        // Modification time: dated by the new mtime.
        let updated = changed(LiveEntry { last_modified: 9, ..live(&stored) }).updated(1000);
        assert_eq!((updated.block_number, updated.last_data_change), (0, 9));

        // Type change with identical size and mtime still drops the content.
        let replaced = changed(LiveEntry { attributes: DIR, ..live(&stored) });
        assert!(replaced.drops_content());
        assert_eq!(replaced.updated(1000).block_number, 0);

        // Ownership only: the block reference is kept.
        let updated = changed(LiveEntry { owner: "bob".to_string(), ..live(&stored) }).updated(1000);
        assert_eq!((updated.block_number, updated.shared, updated.owner.as_str()), (12, true, "bob"));
    }

    #[test]
    fn test_drain_order() {
        let dir = record(1, "a-dir", DIR, 4096, 1);
        let mut diff = Diff::compute(
            stored(&[dir.clone(), record(2, "z-gone", FILE, 1, 1), record(3, "m-changed", FILE, 1, 1)]),
            listing(&[dir, record(0, "b-new", FILE, 1, 1), record(3, "m-changed", FILE, 2, 1)]),
        );
        let order: Vec<_> = std::iter::from_fn(|| diff.next_op())
            .map(|op| match op {
                Op::Remove(r) => format!("remove {}", r.name),
                Op::Traverse(r) => format!("traverse {}", r.name),
                Op::Add(e) => format!("add {}", e.name),
                Op::Update(c) => format!("update {}", c.stored.name),
            })
            .collect();
        assert_eq!(order, vec!["remove z-gone", "traverse a-dir", "add b-new", "update m-changed"]);
        assert!(diff.is_empty());
    }

    #[test]
    fn test_retain() {
        let records = [record(1, "keep", DIR, 1, 1), record(2, "skip", DIR, 1, 1)];
        let mut diff = Diff::compute(stored(&records), listing(&records));
        diff.retain(|name| name != "skip");
        assert_eq!(diff.traverse.keys().collect::<Vec<_>>(), vec!["keep"]);
    }
}
