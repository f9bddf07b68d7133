use crate::error::{ErrorKind, Result};
use cumulus_codec::{ALIGNMENT, Geometry, Keys};
use exn::ResultExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub(crate) const DEFAULT_BLOCK_SIZE: usize = 10 * 1024 * 1024;
pub(crate) const DEFAULT_SMALL_FILE_LIMIT: usize = 1024 * 1024;
const DEFAULT_NUM_INCREMENTALS: usize = 30;
const MIN_BLOCK_SIZE: usize = 2 * ALIGNMENT;

/// Remote object store binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    /// Registry key of the storage backend.
    pub backend: String,
    /// Backend-specific settings, e.g. `root` for `local`.
    pub options: BTreeMap<String, String>,
    /// Remote folder holding the incrementals.
    pub remote_path: String,
}
impl Default for ServiceConfig {
    fn default() -> Self {
        Self { backend: "local".to_string(), options: BTreeMap::new(), remote_path: "cumulus".to_string() }
    }
}

/// Hex-encoded key material.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EncryptionKey {
    pub key1: String,
    pub iv1: String,
    pub key2: String,
    pub iv2: String,
    pub sign: String,
}
impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKey").finish_non_exhaustive()
    }
}

/// An e-mail notification target. Only parsed and validated; nothing is sent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Notification {
    pub recipients: Vec<String>,
    pub from: String,
    pub subject: String,
    /// Only transcript lines containing this text are included.
    pub filter: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub service: ServiceConfig,
    /// Local working directory for the catalog, deletion log and lock file.
    pub state_dir: PathBuf,
    pub block_size: usize,
    pub small_file_limit: usize,
    /// Incrementals kept on top of the base before merging down.
    pub num_incrementals: usize,
    /// Bytes uploaded per run. 0 means unlimited.
    pub upload_data_limit: u64,
    /// Seconds after a successful run during which new runs are skipped. 0 disables.
    pub backup_retry_range: u64,
    pub encryption_key: EncryptionKey,
    pub backup_paths: Vec<PathBuf>,
    pub backup_exclusions: Vec<PathBuf>,
    pub prebackup_commands: Vec<String>,
    pub notifications: Vec<Notification>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service: ServiceConfig::default(),
            state_dir: crate::project_dirs().map(|dirs| dirs.data_dir().to_path_buf()).unwrap_or_default(),
            block_size: DEFAULT_BLOCK_SIZE,
            small_file_limit: DEFAULT_SMALL_FILE_LIMIT,
            num_incrementals: DEFAULT_NUM_INCREMENTALS,
            upload_data_limit: 0,
            backup_retry_range: 0,
            encryption_key: EncryptionKey::default(),
            backup_paths: Vec::new(),
            backup_exclusions: Vec::new(),
            prebackup_commands: Vec::new(),
            notifications: Vec::new(),
        }
    }
}

fn invalid(message: impl Into<String>) -> ErrorKind {
    ErrorKind::Invalid(message.into())
}

fn require_absolute(field: &str, paths: &[PathBuf]) -> Result<()> {
    match paths.iter().find(|path| !path.is_absolute()) {
        Some(path) => exn::bail!(invalid(format!("{field} entry {} is not absolute", path.display()))),
        None => Ok(()),
    }
}

impl Config {
    pub fn geometry(&self) -> Result<Geometry> {
        if self.block_size < MIN_BLOCK_SIZE {
            exn::bail!(invalid(format!("block_size must be at least {MIN_BLOCK_SIZE}")));
        }
        Geometry::new(self.block_size, self.small_file_limit).or_raise(|| invalid("block_size/small_file_limit"))
    }

    pub fn keys(&self) -> Result<Keys> {
        let key = &self.encryption_key;
        Keys::from_hex(&key.key1, &key.iv1, &key.key2, &key.iv2, &key.sign).or_raise(|| invalid("encryption_key"))
    }

    /// Path of a file inside the state directory.
    pub fn state_file(&self, name: &str) -> PathBuf {
        self.state_dir.join(name)
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Check everything that can be checked without touching the remote.
    pub fn validate(&self) -> Result<()> {
        self.geometry()?;
        self.keys()?;
        if self.service.backend.is_empty() {
            exn::bail!(invalid("service.backend must be set"));
        }
        if self.service.remote_path.is_empty() || self.service.remote_path.contains('/') {
            exn::bail!(invalid("service.remote_path must be a single folder name"));
        }
        if self.state_dir.as_os_str().is_empty() {
            exn::bail!(invalid("state_dir must be set"));
        }
        if self.num_incrementals == 0 {
            exn::bail!(invalid("num_incrementals must be at least 1"));
        }
        if self.backup_paths.is_empty() {
            exn::bail!(invalid("backup_paths must name at least one path"));
        }
        require_absolute("backup_paths", &self.backup_paths)?;
        require_absolute("backup_exclusions", &self.backup_exclusions)?;
        if let Some(command) = self.prebackup_commands.iter().find(|command| command.trim().is_empty()) {
            exn::bail!(invalid(format!("prebackup_commands contains an empty command {command:?}")));
        }
        for notification in &self.notifications {
            if notification.recipients.is_empty() {
                exn::bail!(invalid("notification without recipients"));
            }
            for address in notification.recipients.iter().chain(std::iter::once(&notification.from)) {
                if !address.contains('@') {
                    exn::bail!(invalid(format!("notification address {address:?} is not an e-mail address")));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn valid() -> Config {
        let keys = "ab".repeat(32);
        let ivs = "cd".repeat(16);
        Config {
            state_dir: PathBuf::from("/var/lib/cumulus"),
            encryption_key: EncryptionKey {
                key1: keys.clone(),
                iv1: ivs.clone(),
                key2: keys,
                iv2: ivs,
                sign: "0102".to_string(),
            },
            backup_paths: vec![PathBuf::from("/home")],
            ..Config::default()
        }
    }

    #[test]
    fn test_valid_config() {
        let config = valid();
        config.validate().unwrap();
        assert_eq!(config.geometry().unwrap().block_size(), DEFAULT_BLOCK_SIZE);
        assert_eq!(config.state_file("files.db"), PathBuf::from("/var/lib/cumulus/files.db"));
    }

    #[rstest]
    #[case::block_size_unaligned(|c: &mut Config| c.block_size = 10_000)]
    #[case::block_size_too_small(|c: &mut Config| { c.block_size = 4096; c.small_file_limit = 1024; })]
    #[case::limit_too_large(|c: &mut Config| c.small_file_limit = c.block_size / 2)]
    #[case::short_key(|c: &mut Config| c.encryption_key.key1 = "abcd".to_string())]
    #[case::empty_sign(|c: &mut Config| c.encryption_key.sign.clear())]
    #[case::relative_path(|c: &mut Config| c.backup_paths.push(PathBuf::from("home")))]
    #[case::relative_exclusion(|c: &mut Config| c.backup_exclusions.push(PathBuf::from("tmp")))]
    #[case::no_paths(|c: &mut Config| c.backup_paths.clear())]
    #[case::no_state_dir(|c: &mut Config| c.state_dir = PathBuf::new())]
    #[case::nested_remote_path(|c: &mut Config| c.service.remote_path = "a/b".to_string())]
    #[case::zero_retention(|c: &mut Config| c.num_incrementals = 0)]
    #[case::blank_command(|c: &mut Config| c.prebackup_commands.push("  ".to_string()))]
    #[case::bad_recipient(|c: &mut Config| c.notifications.push(Notification {
        recipients: vec!["nobody".to_string()],
        from: "backup@example.com".to_string(),
        ..Default::default()
    }))]
    fn test_invalid_config(#[case] mutate: fn(&mut Config)) {
        let mut config = valid();
        mutate(&mut config);
        let err = config.validate().unwrap_err();
        assert!(matches!(&*err, ErrorKind::Invalid(_)));
    }

    #[test]
    fn test_key_material_is_not_printed() {
        let debug = format!("{:?}", valid());
        assert!(!debug.contains(&"ab".repeat(32)));
    }
}
