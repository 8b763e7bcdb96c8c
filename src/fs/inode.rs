//! Inode numbering for the FUSE bridge
//!
//! The kernel addresses entries by inode number while the overlay works on
//! logical paths. This table hands out a number per logical path and keeps it
//! only while the kernel holds lookup references to it. It stores nothing
//! about the backing trees, so resolution still happens fresh on every call.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

/// Inode number of the mount root
pub const ROOT_INO: u64 = 1;

struct InodeEntry {
    path: PathBuf,
    /// Outstanding kernel lookup references
    lookups: u64,
}

struct Tables {
    next_ino: u64,
    /// ino -> entry
    entries: HashMap<u64, InodeEntry>,
    /// logical path -> ino
    inos: HashMap<PathBuf, u64>,
}

/// Maps inode numbers to logical paths and back
pub struct InodeTable {
    tables: RwLock<Tables>,
}

impl InodeTable {
    pub fn new() -> Self {
        let root = PathBuf::from("/");
        let mut tables = Tables {
            next_ino: ROOT_INO + 1,
            entries: HashMap::new(),
            inos: HashMap::new(),
        };
        tables.entries.insert(
            ROOT_INO,
            InodeEntry {
                path: root.clone(),
                lookups: 1,
            },
        );
        tables.inos.insert(root, ROOT_INO);

        Self {
            tables: RwLock::new(tables),
        }
    }

    /// Logical path of an inode
    pub fn path(&self, ino: u64) -> Option<PathBuf> {
        self.tables.read().entries.get(&ino).map(|e| e.path.clone())
    }

    /// Logical path of `name` inside directory `parent`
    pub fn child_path(&self, parent: u64, name: &OsStr) -> Option<PathBuf> {
        self.path(parent).map(|dir| dir.join(name))
    }

    /// Inode already assigned to a path, without taking a reference
    pub fn ino_of(&self, path: &Path) -> Option<u64> {
        self.tables.read().inos.get(path).copied()
    }

    /// Inode for a path the kernel is about to learn, taking one reference.
    ///
    /// Allocates a number on first sight.
    pub fn lookup(&self, path: &Path) -> u64 {
        let mut tables = self.tables.write();

        if let Some(ino) = tables.inos.get(path).copied() {
            if let Some(entry) = tables.entries.get_mut(&ino) {
                entry.lookups += 1;
            }
            return ino;
        }

        let ino = tables.next_ino;
        tables.next_ino += 1;
        tables.inos.insert(path.to_path_buf(), ino);
        tables.entries.insert(
            ino,
            InodeEntry {
                path: path.to_path_buf(),
                lookups: 1,
            },
        );
        ino
    }

    /// Drop `nlookup` references; the inode goes away at zero. The root stays.
    pub fn forget(&self, ino: u64, nlookup: u64) {
        if ino == ROOT_INO {
            return;
        }

        let mut tables = self.tables.write();
        let remaining = match tables.entries.get_mut(&ino) {
            Some(entry) => {
                entry.lookups = entry.lookups.saturating_sub(nlookup);
                entry.lookups
            }
            None => return,
        };

        if remaining == 0 {
            if let Some(entry) = tables.entries.remove(&ino) {
                tables.inos.remove(&entry.path);
            }
        }
    }

    /// Number of live inodes, root included
    pub fn len(&self) -> usize {
        self.tables.read().entries.len()
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}
