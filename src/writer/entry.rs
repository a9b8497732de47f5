//! The in-memory entry graph built by the scanner.
//!
//! Entries live in an arena and refer to each other by `u32` index, so
//! parent links are plain data rather than back-pointers; the root's
//! parent is itself.

use std::path::PathBuf;

pub type EntryId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    Directory,
    Symlink,
    File,
    Device,
    Other,
}

/// Stat data carried into the image (after scanner transforms).
#[derive(Debug, Clone, Copy, Default)]
pub struct EntryStat {
    /// Full mode word including the file type bits.
    pub mode:  u32,
    pub uid:   u32,
    pub gid:   u32,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub size:  u64,
    pub rdev:  u64,
}

#[derive(Debug, Clone)]
pub struct Entry {
    pub name:     String,
    pub kind:     EntryKind,
    pub stat:     EntryStat,
    pub parent:   EntryId,
    /// Children, sorted by name once the scan finishes.
    pub children: Vec<EntryId>,
    /// Symlinks only.
    pub target:   Option<String>,
    /// Regular files only: source path for content reads.
    pub source:   Option<PathBuf>,
}

pub struct EntryTree {
    entries: Vec<Entry>,
}

impl EntryTree {
    /// A tree containing just the root directory.
    pub fn new(root_stat: EntryStat) -> Self {
        EntryTree {
            entries: vec![Entry {
                name:     String::new(),
                kind:     EntryKind::Directory,
                stat:     root_stat,
                parent:   0,
                children: Vec::new(),
                target:   None,
                source:   None,
            }],
        }
    }

    pub const ROOT: EntryId = 0;

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        false // the root always exists
    }

    pub fn get(&self, id: EntryId) -> &Entry {
        &self.entries[id as usize]
    }

    pub fn get_mut(&mut self, id: EntryId) -> &mut Entry {
        &mut self.entries[id as usize]
    }

    pub fn add_child(&mut self, parent: EntryId, mut entry: Entry) -> EntryId {
        let id = self.entries.len() as EntryId;
        entry.parent = parent;
        self.entries.push(entry);
        self.entries[parent as usize].children.push(id);
        id
    }

    /// Sort every directory's children by name.  Called once after the
    /// scan; lookup and freeze both rely on this order.
    pub fn sort_children(&mut self) {
        for i in 0..self.entries.len() {
            let mut children = std::mem::take(&mut self.entries[i].children);
            children.sort_by(|&a, &b| {
                self.entries[a as usize].name.cmp(&self.entries[b as usize].name)
            });
            self.entries[i].children = children;
        }
    }

    /// Depth-first pre-order over the tree, children in sorted order.
    /// This is the canonical entry order used for inode assignment.
    pub fn dfs(&self) -> Vec<EntryId> {
        let mut order = Vec::with_capacity(self.entries.len());
        let mut stack = vec![Self::ROOT];
        while let Some(id) = stack.pop() {
            order.push(id);
            // Push in reverse so children pop in sorted order.
            for &c in self.get(id).children.iter().rev() {
                stack.push(c);
            }
        }
        order
    }

    /// Full path of an entry, `"/"`-separated, empty for the root.
    pub fn path_of(&self, id: EntryId) -> String {
        if id == Self::ROOT {
            return String::new();
        }
        let mut parts = Vec::new();
        let mut at = id;
        while at != Self::ROOT {
            parts.push(self.get(at).name.as_str());
            at = self.get(at).parent;
        }
        parts.reverse();
        parts.join("/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, kind: EntryKind) -> Entry {
        Entry {
            name:     name.to_owned(),
            kind,
            stat:     EntryStat::default(),
            parent:   0,
            children: Vec::new(),
            target:   None,
            source:   None,
        }
    }

    #[test]
    fn dfs_orders_children_by_name() {
        let mut tree = EntryTree::new(EntryStat::default());
        let d = tree.add_child(EntryTree::ROOT, entry("sub", EntryKind::Directory));
        tree.add_child(EntryTree::ROOT, entry("zz", EntryKind::File));
        tree.add_child(d, entry("b", EntryKind::File));
        tree.add_child(d, entry("a", EntryKind::File));
        tree.sort_children();

        let names: Vec<String> =
            tree.dfs().iter().map(|&id| tree.get(id).name.clone()).collect();
        assert_eq!(names, ["", "sub", "a", "b", "zz"]);
    }

    #[test]
    fn path_reconstruction() {
        let mut tree = EntryTree::new(EntryStat::default());
        let d = tree.add_child(EntryTree::ROOT, entry("usr", EntryKind::Directory));
        let e = tree.add_child(d, entry("bin", EntryKind::Directory));
        let f = tree.add_child(e, entry("env", EntryKind::File));
        assert_eq!(tree.path_of(f), "usr/bin/env");
        assert_eq!(tree.path_of(EntryTree::ROOT), "");
    }

    #[test]
    fn root_parent_is_itself() {
        let tree = EntryTree::new(EntryStat::default());
        assert_eq!(tree.get(EntryTree::ROOT).parent, EntryTree::ROOT);
    }
}
