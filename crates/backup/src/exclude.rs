use std::path::{Path, PathBuf};
use tracing::debug;

/// Absolute paths left out of every backup, together with everything below
/// them.
#[derive(Debug, Clone, Default)]
pub struct Exclusions {
    paths: Vec<PathBuf>,
}

impl Exclusions {
    /// Resolve configured exclusions to canonical paths. Paths that do not
    /// exist cannot match anything and are dropped.
    pub fn resolve<P: AsRef<Path>>(paths: impl IntoIterator<Item = P>) -> Self {
        let mut exclusions = Self::default();
        for path in paths {
            let path = path.as_ref();
            match std::fs::canonicalize(path) {
                Ok(resolved) => exclusions.insert(resolved),
                Err(err) => debug!(path = %path.display(), "Ignoring unresolvable exclusion: {err}"),
            }
        }
        exclusions
    }

    /// Add an already absolute path.
    pub fn insert(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        if !self.paths.contains(&path) {
            self.paths.push(path);
        }
    }

    /// Whether `path` is excluded or lies below an excluded path.
    pub fn is_excluded(&self, path: &Path) -> bool {
        self.paths.iter().any(|excluded| path.starts_with(excluded))
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("/home/alice/.cache", true)]
    #[case("/home/alice/.cache/thumbnails/1.png", true)]
    #[case("/home/alice/.cached", false)]
    #[case("/home/alice", false)]
    #[case("/var/lib/cumulus/files.db", true)]
    fn test_is_excluded(#[case] path: &str, #[case] expected: bool) {
        let mut exclusions = Exclusions::default();
        exclusions.insert("/home/alice/.cache");
        exclusions.insert("/var/lib/cumulus");
        assert_eq!(exclusions.is_excluded(Path::new(path)), expected);
    }

    #[test]
    fn test_resolve_drops_missing_paths() {
        let dir = tempfile::tempdir().unwrap();
        let exclusions = Exclusions::resolve([dir.path().to_path_buf(), dir.path().join("missing")]);
        assert_eq!(exclusions.len(), 1);
        assert!(exclusions.is_excluded(&dir.path().canonicalize().unwrap().join("anything")));
    }
}
