//! In-memory storage service for testing.

use crate::error::{ErrorKind, Result};
use crate::models::{Entry, Handle, Listing};
use crate::path::validate_name;
use crate::{ServiceHandle, StorageService};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::RwLock;

const ROOT: u64 = 0;

struct Node {
    parent: u64,
    name: String,
    /// `None` for folders.
    data: Option<Vec<u8>>,
}

#[derive(Default)]
struct Tree {
    next_id: u64,
    nodes: HashMap<u64, Node>,
}
impl Tree {
    fn children(&self, parent: u64) -> impl Iterator<Item = (u64, &Node)> {
        self.nodes.iter().filter(move |(_, node)| node.parent == parent).map(|(id, node)| (*id, node))
    }

    fn child_named(&self, parent: u64, name: &str) -> Option<(u64, &Node)> {
        self.children(parent).find(|(_, node)| node.name == name)
    }

    fn is_folder(&self, id: u64) -> bool {
        id == ROOT || self.nodes.get(&id).is_some_and(|node| node.data.is_none())
    }

    fn insert(&mut self, parent: u64, name: &str, data: Option<Vec<u8>>) -> u64 {
        self.next_id += 1;
        self.nodes.insert(self.next_id, Node { parent, name: name.to_string(), data });
        self.next_id
    }

    fn path(&self, mut id: u64) -> String {
        let mut parts = Vec::new();
        while let Some(node) = self.nodes.get(&id) {
            parts.push(node.name.as_str());
            id = node.parent;
        }
        parts.reverse();
        parts.join("/")
    }
}

/// In-memory storage service for testing.
///
/// Folders and objects live in a map behind a [`RwLock`], addressed by
/// numeric handles that survive renames and moves. Uploads can be made to
/// fail on demand to exercise retry behaviour, and every successful upload is
/// counted.
///
/// # Examples
///
/// ```
/// use cumulus_storage::{StorageService, backend::MockService};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let service = MockService::default();
/// let root = service.root().await?;
/// let folder = service.create_folder(&root, "backups").await?;
/// service.upload(&folder, "summary.json", b"{}").await?;
/// assert_eq!(service.paths().await, vec!["backups/summary.json"]);
/// assert_eq!(service.uploads(), 1);
/// # Ok(())
/// # }
/// ```
pub struct MockService {
    name: String,
    tree: RwLock<Tree>,
    failing: AtomicBool,
    failing_prefix: RwLock<Option<String>>,
    uploads: AtomicUsize,
    attempts: AtomicUsize,
}

impl MockService {
    /// Change the name of the mock service.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Registry constructor. Options are ignored.
    pub fn from_options(_options: &BTreeMap<String, String>) -> Result<ServiceHandle> {
        Ok(Arc::new(Self::default()))
    }

    /// Make every subsequent upload fail with a retryable network error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Make uploads of objects whose name starts with `prefix` fail with a
    /// retryable network error. `None` clears it.
    pub async fn fail_uploads_named(&self, prefix: Option<&str>) {
        *self.failing_prefix.write().await = prefix.map(String::from);
    }

    /// Number of uploads that succeeded.
    pub fn uploads(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    /// Number of upload calls, successful or not.
    pub fn upload_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Slash-joined paths of every stored object, sorted.
    pub async fn paths(&self) -> Vec<String> {
        let tree = self.tree.read().await;
        let mut paths: Vec<_> =
            tree.nodes.iter().filter(|(_, node)| node.data.is_some()).map(|(id, _)| tree.path(*id)).collect();
        paths.sort();
        paths
    }

    fn id(handle: &Handle) -> Result<u64> {
        handle.as_str().parse().map_err(|_| exn::Exn::from(ErrorKind::NotFound(handle.to_string())))
    }

    fn existing(tree: &Tree, handle: &Handle) -> Result<u64> {
        let id = Self::id(handle)?;
        if id != ROOT && !tree.nodes.contains_key(&id) {
            exn::bail!(ErrorKind::NotFound(handle.to_string()));
        }
        Ok(id)
    }

    fn folder(tree: &Tree, handle: &Handle) -> Result<u64> {
        let id = Self::existing(tree, handle)?;
        if !tree.is_folder(id) {
            exn::bail!(ErrorKind::NotFound(handle.to_string()));
        }
        Ok(id)
    }
}

impl Default for MockService {
    fn default() -> Self {
        Self {
            name: "mock".to_string(),
            tree: RwLock::new(Tree::default()),
            failing: AtomicBool::new(false),
            failing_prefix: RwLock::new(None),
            uploads: AtomicUsize::new(0),
            attempts: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl StorageService for MockService {
    fn name(&self) -> &str {
        &self.name
    }

    async fn root(&self) -> Result<Handle> {
        Ok(Handle::new(ROOT.to_string()))
    }

    async fn create_folder(&self, parent: &Handle, name: &str) -> Result<Handle> {
        let name = validate_name(name)?;
        let mut tree = self.tree.write().await;
        let parent = Self::folder(&tree, parent)?;
        if let Some((id, node)) = tree.child_named(parent, name) {
            return match node.data {
                None => Ok(Handle::new(id.to_string())),
                Some(_) => exn::bail!(ErrorKind::AlreadyExists(name.to_string())),
            };
        }
        Ok(Handle::new(tree.insert(parent, name, None).to_string()))
    }

    async fn list(&self, folder: &Handle) -> Result<Listing> {
        let tree = self.tree.read().await;
        let folder = Self::folder(&tree, folder)?;
        let mut listing = Listing::default();
        for (id, node) in tree.children(folder) {
            let entry = Entry {
                name: node.name.clone(),
                handle: Handle::new(id.to_string()),
                size: node.data.as_ref().map_or(0, |data| data.len() as u64),
            };
            match node.data {
                None => listing.folders.push(entry),
                Some(_) => listing.files.push(entry),
            }
        }
        listing.sort();
        Ok(listing)
    }

    async fn delete(&self, object: &Handle) -> Result<()> {
        let mut tree = self.tree.write().await;
        let id = Self::existing(&tree, object)?;
        if id == ROOT {
            exn::bail!(ErrorKind::InvalidName(object.to_string()));
        }
        let mut pending = vec![id];
        while let Some(id) = pending.pop() {
            pending.extend(tree.children(id).map(|(child, _)| child).collect::<Vec<_>>());
            tree.nodes.remove(&id);
        }
        Ok(())
    }

    async fn rename(&self, object: &Handle, name: &str) -> Result<Handle> {
        let name = validate_name(name)?;
        let mut tree = self.tree.write().await;
        let id = Self::existing(&tree, object)?;
        let Some(parent) = tree.nodes.get(&id).map(|node| node.parent) else {
            exn::bail!(ErrorKind::InvalidName(object.to_string()));
        };
        if tree.child_named(parent, name).is_some() {
            exn::bail!(ErrorKind::AlreadyExists(name.to_string()));
        }
        if let Some(node) = tree.nodes.get_mut(&id) {
            node.name = name.to_string();
        }
        Ok(object.clone())
    }

    async fn move_into(&self, object: &Handle, folder: &Handle) -> Result<Handle> {
        let mut tree = self.tree.write().await;
        let id = Self::existing(&tree, object)?;
        let folder = Self::folder(&tree, folder)?;
        let Some(name) = tree.nodes.get(&id).map(|node| node.name.clone()) else {
            exn::bail!(ErrorKind::InvalidName(object.to_string()));
        };
        if tree.child_named(folder, &name).is_some() {
            exn::bail!(ErrorKind::AlreadyExists(name));
        }
        if let Some(node) = tree.nodes.get_mut(&id) {
            node.parent = folder;
        }
        Ok(object.clone())
    }

    async fn upload(&self, folder: &Handle, name: &str, data: &[u8]) -> Result<Handle> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let prefixed = self.failing_prefix.read().await.as_deref().is_some_and(|prefix| name.starts_with(prefix));
        if prefixed || self.failing.load(Ordering::SeqCst) {
            exn::bail!(ErrorKind::Network(format!("simulated failure uploading {name}")));
        }
        let name = validate_name(name)?;
        let mut tree = self.tree.write().await;
        let folder = Self::folder(&tree, folder)?;
        let existing = tree.child_named(folder, name).map(|(id, node)| (id, node.data.is_none()));
        let id = match existing {
            Some((_, true)) => exn::bail!(ErrorKind::AlreadyExists(name.to_string())),
            Some((id, false)) => {
                if let Some(node) = tree.nodes.get_mut(&id) {
                    node.data = Some(data.to_vec());
                }
                id
            },
            None => tree.insert(folder, name, Some(data.to_vec())),
        };
        self.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(Handle::new(id.to_string()))
    }

    async fn download(&self, object: &Handle) -> Result<Vec<u8>> {
        let tree = self.tree.read().await;
        let id = Self::existing(&tree, object)?;
        tree.nodes
            .get(&id)
            .and_then(|node| node.data.clone())
            .ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(object.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handles_survive_rename_and_move() {
        let service = MockService::default();
        let root = service.root().await.unwrap();
        let temp = service.create_folder(&root, "TEMP").await.unwrap();
        let block = service.upload(&temp, "10_0.dat", b"payload").await.unwrap();
        let renamed = service.rename(&temp, "0").await.unwrap();
        assert_eq!(renamed, temp);
        let merge = service.create_folder(&root, "MERGE").await.unwrap();
        service.move_into(&block, &merge).await.unwrap();
        assert_eq!(service.paths().await, vec!["MERGE/10_0.dat"]);
        assert_eq!(service.download(&block).await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_failing_uploads_are_counted() {
        let service = MockService::default();
        let root = service.root().await.unwrap();
        service.set_failing(true);
        let err = service.upload(&root, "a", b"a").await.unwrap_err();
        assert!(err.is_retryable());
        service.set_failing(false);
        service.upload(&root, "a", b"a").await.unwrap();
        assert_eq!(service.upload_attempts(), 2);
        assert_eq!(service.uploads(), 1);
    }

    #[tokio::test]
    async fn test_uploads_fail_by_name_prefix() {
        let service = MockService::default();
        let root = service.root().await.unwrap();
        service.fail_uploads_named(Some("14_")).await;
        service.upload(&root, "13_0.dat", b"a").await.unwrap();
        assert!(service.upload(&root, "14_0.dat", b"b").await.unwrap_err().is_retryable());
        service.fail_uploads_named(None).await;
        service.upload(&root, "14_0.dat", b"b").await.unwrap();
        assert_eq!(service.paths().await, vec!["13_0.dat", "14_0.dat"]);
    }

    #[tokio::test]
    async fn test_delete_removes_descendants() {
        let service = MockService::default();
        let root = service.root().await.unwrap();
        let folder = service.create_folder(&root, "1").await.unwrap();
        let nested = service.create_folder(&folder, "nested").await.unwrap();
        service.upload(&nested, "x", b"x").await.unwrap();
        service.delete(&folder).await.unwrap();
        assert!(service.paths().await.is_empty());
        assert!(service.list(&nested).await.is_err());
    }

    #[tokio::test]
    async fn test_name_conflicts() {
        let service = MockService::default();
        let root = service.root().await.unwrap();
        let one = service.create_folder(&root, "1").await.unwrap();
        service.create_folder(&root, "2").await.unwrap();
        assert!(service.rename(&one, "2").await.is_err());
        service.upload(&root, "file", b"").await.unwrap();
        assert!(service.create_folder(&root, "file").await.is_err());
    }
}
