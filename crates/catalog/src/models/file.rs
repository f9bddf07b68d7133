use crate::error::{Error, ErrorKind};
use exn::ResultExt;

const S_IFMT: u32 = 0o170_000;
const S_IFDIR: u32 = 0o040_000;

/// Catalog entry for one filesystem object ever seen by a backup.
///
/// `block_number` 0 means no remote payload is expected: directories,
/// symlinks, empty files and content still waiting for upload. When `shared`
/// is set, the payload lives inside a shared block, addressed by `id`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileRecord {
    /// Assigned by the catalog on insert; never reused.
    pub id: u64,
    /// 0 for the top of the tree.
    pub parent_id: u64,
    pub block_number: u64,
    pub shared: bool,
    pub name: String,
    /// Empty unless this is a symlink.
    pub symlink_target: String,
    /// Unix mode bits, file type included.
    pub attributes: u32,
    pub owner: String,
    pub group: String,
    /// Size as reported by the filesystem, used for change detection.
    pub logical_size: u64,
    /// Bytes actually read and uploaded.
    pub real_size: u64,
    pub last_modified: i64,
    pub created: i64,
    pub last_data_change: i64,
}

impl FileRecord {
    pub fn is_symlink(&self) -> bool {
        !self.symlink_target.is_empty()
    }

    pub fn is_dir(&self) -> bool {
        !self.is_symlink() && self.attributes & S_IFMT == S_IFDIR
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct FileRow {
    pub(crate) id: i64,
    pub(crate) parent_id: i64,
    pub(crate) block_number: i64,
    pub(crate) shared: bool,
    pub(crate) name: String,
    pub(crate) symlink_target: String,
    pub(crate) attributes: i64,
    pub(crate) owner: String,
    pub(crate) group: String,
    pub(crate) logical_size: i64,
    pub(crate) real_size: i64,
    pub(crate) last_modified: i64,
    pub(crate) created: i64,
    pub(crate) last_data_change: i64,
}
impl TryFrom<&FileRecord> for FileRow {
    type Error = Error;
    fn try_from(record: &FileRecord) -> Result<Self, Self::Error> {
        Ok(Self {
            id: i64::try_from(record.id).or_raise(|| ErrorKind::InvalidData("id"))?,
            parent_id: i64::try_from(record.parent_id).or_raise(|| ErrorKind::InvalidData("parent id"))?,
            block_number: i64::try_from(record.block_number).or_raise(|| ErrorKind::InvalidData("block number"))?,
            shared: record.shared,
            name: record.name.clone(),
            symlink_target: record.symlink_target.clone(),
            attributes: i64::from(record.attributes),
            owner: record.owner.clone(),
            group: record.group.clone(),
            logical_size: i64::try_from(record.logical_size).or_raise(|| ErrorKind::InvalidData("logical size"))?,
            real_size: i64::try_from(record.real_size).or_raise(|| ErrorKind::InvalidData("real size"))?,
            last_modified: record.last_modified,
            created: record.created,
            last_data_change: record.last_data_change,
        })
    }
}
impl TryFrom<FileRow> for FileRecord {
    type Error = Error;
    fn try_from(row: FileRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: u64::try_from(row.id).or_raise(|| ErrorKind::InvalidData("id"))?,
            parent_id: u64::try_from(row.parent_id).or_raise(|| ErrorKind::InvalidData("parent id"))?,
            block_number: u64::try_from(row.block_number).or_raise(|| ErrorKind::InvalidData("block number"))?,
            shared: row.shared,
            name: row.name,
            symlink_target: row.symlink_target,
            attributes: u32::try_from(row.attributes).or_raise(|| ErrorKind::InvalidData("attributes"))?,
            owner: row.owner,
            group: row.group,
            logical_size: u64::try_from(row.logical_size).or_raise(|| ErrorKind::InvalidData("logical size"))?,
            real_size: u64::try_from(row.real_size).or_raise(|| ErrorKind::InvalidData("real size"))?,
            last_modified: row.last_modified,
            created: row.created,
            last_data_change: row.last_data_change,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0o040_755, "", true)]
    #[case(0o100_644, "", false)]
    #[case(0o120_777, "/etc/hosts", false)]
    #[case(0o040_755, "/tmp", false)]
    fn test_is_dir(#[case] attributes: u32, #[case] symlink_target: &str, #[case] expected: bool) {
        let record = FileRecord { attributes, symlink_target: symlink_target.to_string(), ..Default::default() };
        assert_eq!(record.is_dir(), expected);
    }

    #[test]
    fn test_row_round_trip() {
        let record = FileRecord {
            id: 12,
            parent_id: 3,
            block_number: 10,
            shared: true,
            name: "notes.txt".to_string(),
            attributes: 0o100_600,
            owner: "alice".to_string(),
            group: "staff".to_string(),
            logical_size: 5,
            real_size: 5,
            last_modified: 1_700_000_000,
            created: 1_700_000_000,
            last_data_change: 1_700_000_000,
            ..Default::default()
        };
        let row = FileRow::try_from(&record).unwrap();
        assert_eq!(row.attributes, 0o100_600);
        assert_eq!(FileRecord::try_from(row).unwrap(), record);
    }

    #[test]
    fn test_row_rejects_negative_sizes() {
        let record = FileRecord { name: "x".to_string(), ..Default::default() };
        let mut row = FileRow::try_from(&record).unwrap();
        row.real_size = -1;
        let err = FileRecord::try_from(row).unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidData("real size")));
    }
}
