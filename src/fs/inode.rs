//! Inode bookkeeping
//!
//! Maps the inode numbers handed to the kernel back to a location in the
//! source tree. A node only remembers its parent and its name; the relative
//! path is derived on demand by walking parent links up to the root.

use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

/// Inode number of the mount root
pub const ROOT_INO: u64 = fuser::FUSE_ROOT_ID;

/// Deepest parent chain we are willing to walk
const MAX_DEPTH: usize = 4096;

#[derive(Debug)]
struct Node {
    /// `(parent, name)`, or `None` once the last known name was unlinked
    location: Option<(u64, OsString)>,
    /// Kernel lookup count
    lookups: u64,
}

#[derive(Default)]
struct Tables {
    nodes: HashMap<u64, Node>,
    children: HashMap<(u64, OsString), u64>,
}

impl Tables {
    fn detach(&mut self, ino: u64) {
        if let Some(node) = self.nodes.get_mut(&ino) {
            if let Some(loc) = node.location.take() {
                if self.children.get(&loc) == Some(&ino) {
                    self.children.remove(&loc);
                }
            }
        }
    }

    fn attach(&mut self, ino: u64, parent: u64, name: &OsStr) {
        let key = (parent, name.to_os_string());
        if let Some(old) = self.children.insert(key.clone(), ino) {
            if old != ino {
                if let Some(node) = self.nodes.get_mut(&old) {
                    node.location = None;
                }
            }
        }
        if let Some(node) = self.nodes.get_mut(&ino) {
            node.location = Some(key);
        }
    }
}

/// Inode table shared by every request
pub struct InodeTable {
    tables: RwLock<Tables>,
}

impl InodeTable {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
        }
    }

    /// Relative path of `ino`; `None` when unknown or no longer linked
    pub fn path(&self, ino: u64) -> Option<PathBuf> {
        if ino == ROOT_INO {
            return Some(PathBuf::new());
        }

        let tables = self.tables.read();
        let mut names: Vec<&OsStr> = Vec::new();
        let mut cur = ino;
        while cur != ROOT_INO {
            if names.len() >= MAX_DEPTH {
                return None;
            }
            let (parent, name) = tables.nodes.get(&cur)?.location.as_ref()?;
            names.push(name);
            cur = *parent;
        }

        Some(names.iter().rev().collect())
    }

    /// Known to the kernel but no longer reachable by any name we saw
    pub fn is_unlinked(&self, ino: u64) -> bool {
        self.tables
            .read()
            .nodes
            .get(&ino)
            .map(|n| n.location.is_none())
            .unwrap_or(false)
    }

    /// Parent directory of `ino`; the root is its own parent
    pub fn parent_of(&self, ino: u64) -> Option<u64> {
        if ino == ROOT_INO {
            return Some(ROOT_INO);
        }
        let tables = self.tables.read();
        tables.nodes.get(&ino)?.location.as_ref().map(|(p, _)| *p)
    }

    /// Relative path of `ino`, or `InodeNotFound`
    pub fn resolve(&self, ino: u64) -> Result<PathBuf> {
        self.path(ino).ok_or(Error::InodeNotFound(ino))
    }

    /// Relative path of `name` inside directory `parent`
    pub fn child_path(&self, parent: u64, name: &OsStr) -> Result<PathBuf> {
        Ok(self.resolve(parent)?.join(name))
    }

    /// Record a successful lookup of `name` in `parent` resolving to `ino`
    pub fn remember(&self, ino: u64, parent: u64, name: &OsStr) {
        if ino == ROOT_INO {
            return;
        }
        let mut tables = self.tables.write();
        let node = tables.nodes.entry(ino).or_insert(Node {
            location: None,
            lookups: 0,
        });
        node.lookups += 1;
        tables.detach(ino);
        tables.attach(ino, parent, name);
    }

    /// Drop `nlookup` references; the node is discarded at zero
    pub fn forget(&self, ino: u64, nlookup: u64) {
        if ino == ROOT_INO {
            return;
        }
        let mut tables = self.tables.write();
        let gone = match tables.nodes.get_mut(&ino) {
            Some(node) => {
                node.lookups = node.lookups.saturating_sub(nlookup);
                node.lookups == 0
            }
            None => false,
        };
        if gone {
            tables.detach(ino);
            tables.nodes.remove(&ino);
        }
    }

    /// Follow a rename; with `exchange` both entries swap places
    pub fn rename(&self, parent: u64, name: &OsStr, new_parent: u64, new_name: &OsStr, exchange: bool) {
        let mut tables = self.tables.write();
        let src = tables.children.get(&(parent, name.to_os_string())).copied();
        let dst = tables
            .children
            .get(&(new_parent, new_name.to_os_string()))
            .copied();

        if let Some(src) = src {
            tables.detach(src);
        }
        if let Some(dst) = dst {
            tables.detach(dst);
            if exchange {
                tables.attach(dst, parent, name);
            }
        }
        if let Some(src) = src {
            tables.attach(src, new_parent, new_name);
        }
    }

    /// Forget the location of an entry that was removed
    pub fn unlinked(&self, parent: u64, name: &OsStr) {
        let mut tables = self.tables.write();
        if let Some(ino) = tables.children.get(&(parent, name.to_os_string())).copied() {
            tables.detach(ino);
        }
    }

    /// Number of tracked nodes, root excluded
    pub fn len(&self) -> usize {
        self.tables.read().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Still referenced by the kernel
    pub fn contains(&self, ino: u64) -> bool {
        ino == ROOT_INO || self.tables.read().nodes.contains_key(&ino)
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct Aliases {
    /// backing inode -> exposed inode
    exposed: HashMap<u64, u64>,
    /// exposed inode -> backing inode currently holding its content
    backing: HashMap<u64, u64>,
}

impl Aliases {
    fn unmap(&mut self, exposed: u64) -> Option<u64> {
        let backing = self.backing.remove(&exposed)?;
        if self.exposed.get(&backing) == Some(&exposed) {
            self.exposed.remove(&backing);
        }
        Some(backing)
    }

    fn map(&mut self, exposed: u64, backing: u64) {
        if exposed != backing {
            self.backing.insert(exposed, backing);
            self.exposed.insert(backing, exposed);
        }
    }
}

/// Exposed inode numbers for backing inodes.
///
/// A backing inode normally keeps its own number. Write-back renames a new
/// inode over the path; the new inode then inherits the number the kernel
/// already knows. A backing number that is still exposed for other content
/// gets a synthetic number instead.
pub struct InoMap {
    aliases: RwLock<Aliases>,
    next_synthetic: AtomicU64,
}

impl InoMap {
    pub fn new() -> Self {
        InoMap {
            aliases: RwLock::new(Aliases::default()),
            next_synthetic: AtomicU64::new(u64::MAX - 1),
        }
    }

    /// Number to hand to the kernel for `backing`
    pub fn exposed(&self, backing: u64) -> u64 {
        {
            let aliases = self.aliases.read();
            if let Some(&exposed) = aliases.exposed.get(&backing) {
                return exposed;
            }
            if !aliases.backing.contains_key(&backing) {
                return backing;
            }
        }

        let mut aliases = self.aliases.write();
        if let Some(&exposed) = aliases.exposed.get(&backing) {
            return exposed;
        }
        if !aliases.backing.contains_key(&backing) {
            return backing;
        }
        let synthetic = self.next_synthetic.fetch_sub(1, Ordering::SeqCst);
        aliases.map(synthetic, backing);
        synthetic
    }

    /// Content exposed as `exposed` now lives in `backing`.
    ///
    /// Returns the previous backing inode for [`InoMap::restore`].
    pub fn supersede(&self, exposed: u64, backing: u64) -> Option<u64> {
        let mut aliases = self.aliases.write();
        let previous = aliases.unmap(exposed);
        aliases.map(exposed, backing);
        previous
    }

    /// Undo a [`InoMap::supersede`] whose rename did not happen
    pub fn restore(&self, exposed: u64, previous: Option<u64>) {
        let mut aliases = self.aliases.write();
        aliases.unmap(exposed);
        if let Some(backing) = previous {
            aliases.map(exposed, backing);
        }
    }

    /// The kernel no longer knows `exposed`
    pub fn retire(&self, exposed: u64) {
        self.aliases.write().unmap(exposed);
    }

    pub fn len(&self) -> usize {
        self.aliases.read().backing.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InoMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_paths_follow_parents() {
        let inodes = InodeTable::new();
        inodes.remember(10, ROOT_INO, OsStr::new("certs"));
        inodes.remember(11, 10, OsStr::new("www.example.com.crt"));

        assert_eq!(inodes.path(ROOT_INO).unwrap(), PathBuf::new());
        assert_eq!(inodes.path(10).unwrap(), Path::new("certs"));
        assert_eq!(inodes.path(11).unwrap(), Path::new("certs/www.example.com.crt"));
        assert_eq!(
            inodes.child_path(10, OsStr::new("x.key")).unwrap(),
            Path::new("certs/x.key")
        );
        assert!(inodes.path(12).is_none());
        assert_eq!(inodes.parent_of(11), Some(10));
        assert_eq!(inodes.parent_of(ROOT_INO), Some(ROOT_INO));
        assert!(matches!(inodes.resolve(12), Err(Error::InodeNotFound(12))));
    }

    #[test]
    fn test_forget_counts_lookups() {
        let inodes = InodeTable::new();
        inodes.remember(10, ROOT_INO, OsStr::new("a"));
        inodes.remember(10, ROOT_INO, OsStr::new("a"));

        inodes.forget(10, 1);
        assert!(inodes.path(10).is_some());
        inodes.forget(10, 1);
        assert!(inodes.path(10).is_none());
        assert!(inodes.is_empty());

        // root is never forgotten
        inodes.forget(ROOT_INO, 100);
        assert!(inodes.path(ROOT_INO).is_some());
    }

    #[test]
    fn test_rename_moves_subtree() {
        let inodes = InodeTable::new();
        inodes.remember(10, ROOT_INO, OsStr::new("dir"));
        inodes.remember(11, 10, OsStr::new("file"));
        inodes.remember(20, ROOT_INO, OsStr::new("other"));

        inodes.rename(ROOT_INO, OsStr::new("dir"), 20, OsStr::new("moved"), false);
        assert_eq!(inodes.path(11).unwrap(), Path::new("other/moved/file"));
    }

    #[test]
    fn test_rename_over_existing_unlinks_target() {
        let inodes = InodeTable::new();
        inodes.remember(10, ROOT_INO, OsStr::new("a"));
        inodes.remember(11, ROOT_INO, OsStr::new("b"));

        inodes.rename(ROOT_INO, OsStr::new("a"), ROOT_INO, OsStr::new("b"), false);
        assert_eq!(inodes.path(10).unwrap(), Path::new("b"));
        assert!(inodes.path(11).is_none());
    }

    #[test]
    fn test_rename_exchange() {
        let inodes = InodeTable::new();
        inodes.remember(10, ROOT_INO, OsStr::new("a"));
        inodes.remember(11, ROOT_INO, OsStr::new("b"));

        inodes.rename(ROOT_INO, OsStr::new("a"), ROOT_INO, OsStr::new("b"), true);
        assert_eq!(inodes.path(10).unwrap(), Path::new("b"));
        assert_eq!(inodes.path(11).unwrap(), Path::new("a"));
    }

    #[test]
    fn test_superseded_backing_keeps_exposed_number() {
        let inos = InoMap::new();
        assert_eq!(inos.exposed(100), 100);

        // 100 was replaced by 200, then by 300
        assert_eq!(inos.supersede(100, 200), None);
        assert_eq!(inos.exposed(200), 100);
        assert_eq!(inos.supersede(100, 300), Some(200));
        assert_eq!(inos.exposed(300), 100);
        assert_eq!(inos.exposed(200), 200);
        assert_eq!(inos.len(), 1);

        // the freed number 100 reused for unrelated content
        let other = inos.exposed(100);
        assert_ne!(other, 100);
        assert_eq!(inos.exposed(100), other);

        inos.retire(100);
        assert_eq!(inos.exposed(300), 300);
    }

    #[test]
    fn test_restore_after_failed_rename() {
        let inos = InoMap::new();
        let previous = inos.supersede(100, 200);
        inos.restore(100, previous);
        assert!(inos.is_empty());
        assert_eq!(inos.exposed(200), 200);

        inos.supersede(100, 200);
        let previous = inos.supersede(100, 300);
        inos.restore(100, previous);
        assert_eq!(inos.exposed(200), 100);
        assert_eq!(inos.exposed(300), 300);
    }

    #[test]
    fn test_unlinked_and_relinked() {
        let inodes = InodeTable::new();
        inodes.remember(10, ROOT_INO, OsStr::new("a"));
        assert!(!inodes.is_unlinked(10));
        inodes.unlinked(ROOT_INO, OsStr::new("a"));
        assert!(inodes.path(10).is_none());
        assert!(inodes.is_unlinked(10));
        assert!(!inodes.is_unlinked(99));

        // a hard link found through another name brings it back
        inodes.remember(10, ROOT_INO, OsStr::new("b"));
        assert_eq!(inodes.path(10).unwrap(), Path::new("b"));
    }
}
