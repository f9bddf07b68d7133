use derive_more::Display;

/// Opaque reference to a folder or object held by a storage service.
///
/// Handles are only meaningful to the service that issued them. A handle may
/// change when its object is renamed or moved; the operations that do so
/// return the new handle.
#[derive(Debug, Clone, Display, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(String);
impl From<String> for Handle {
    fn from(id: String) -> Self {
        Self(id)
    }
}
impl From<&str> for Handle {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl Handle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A named child of a folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub name: String,
    pub handle: Handle,
    /// Stored size in bytes. Always zero for folders.
    pub size: u64,
}

/// Direct children of one folder, split by kind and sorted by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Listing {
    pub folders: Vec<Entry>,
    pub files: Vec<Entry>,
}

impl Listing {
    pub fn folder(&self, name: &str) -> Option<&Entry> {
        self.folders.iter().find(|entry| entry.name == name)
    }

    pub fn file(&self, name: &str) -> Option<&Entry> {
        self.files.iter().find(|entry| entry.name == name)
    }

    pub(crate) fn sort(&mut self) {
        self.folders.sort_by(|a, b| a.name.cmp(&b.name));
        self.files.sort_by(|a, b| a.name.cmp(&b.name));
    }
}
