//! Thin views over the frozen metadata blob.
//!
//! A [`MetadataView`] borrows the mapped (decompressed) METADATA_V2
//! payload and answers lookups directly against the bit-packed arrays;
//! the only eagerly materialised state is the string-table offset lists.
//! Accessors never block and never touch the block cache.

use crate::codec::ArcSlice;
use crate::error::{Error, Result};
use crate::metadata::packed::PackedIntSlice;
use crate::metadata::schema::{Array, Region, Schema};
use crate::metadata::strtab::StringTableView;
use crate::metadata::{chunk_offset_is_large_hole, InodeKind};

// ── Public record types ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub inode: u64,
    pub mode:  u32,
    pub kind:  InodeKind,
    pub uid:   u32,
    pub gid:   u32,
    pub size:  u64,
    pub mtime: i64,
    pub atime: i64,
    pub ctime: i64,
    pub rdev:  u64,
}

/// A chunk as seen by readers, holes expanded to their byte size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkRead {
    Data { block: u64, offset: u64, size: u64 },
    Hole { size: u64 },
}

impl ChunkRead {
    pub fn size(&self) -> u64 {
        match self {
            ChunkRead::Data { size, .. } => *size,
            ChunkRead::Hole { size } => *size,
        }
    }
}

/// Result of a path lookup.  `path` is the normalised path, so
/// resolving it again yields the same entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEntry {
    pub inode: u64,
    pub path:  String,
}

impl ResolvedEntry {
    pub fn path(&self) -> &str {
        &self.path
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadlinkMode {
    /// Exactly as stored.
    Raw,
    /// Separators adjusted for the current platform.
    Preferred,
    /// Forward slashes.
    Posix,
}

// ── View ─────────────────────────────────────────────────────────────────────

pub struct MetadataView {
    schema:   Schema,
    data:     ArcSlice,
    names:    StringTableView,
    symlinks: StringTableView,
}

impl MetadataView {
    pub fn new(schema_bytes: &[u8], data: ArcSlice) -> Result<Self> {
        let schema = Schema::from_bytes(schema_bytes)?;

        // Validate every declared region up-front so accessors can index
        // without re-checking.
        for (name, field) in &schema.fields {
            check_region(&data, field.region, name)?;
            if field.count * field.bits as u64 > field.region.len * 8 {
                return Err(Error::corrupted(format!("field '{name}' overflows its region")));
            }
        }
        for (name, st) in &schema.string_tables {
            check_region(&data, st.buffer, name)?;
            check_region(&data, st.index.region, name)?;
            if let Some(sym) = st.symtab {
                check_region(&data, sym, name)?;
            }
        }

        let names = load_string_table(&schema, &data, "names")?;
        let symlinks = load_string_table(&schema, &data, "symlinks")?;

        let view = MetadataView { schema, data, names, symlinks };
        view.check_counts()?;
        Ok(view)
    }

    fn check_counts(&self) -> Result<()> {
        let total = self.schema.inode_counts.total() as usize;
        for name in ["inode_mode_idx", "inode_owner_idx", "inode_group_idx", "inode_mtime_off"] {
            if self.array(name)?.len() != total {
                return Err(Error::corrupted(format!("field '{name}' count mismatch")));
            }
        }
        let dirs = self.schema.inode_counts.dirs as usize;
        if self.array("dir_first_entry")?.len() != dirs + 1 {
            return Err(Error::corrupted("dir_first_entry count mismatch"));
        }
        if self.array("chunk_table")?.len() != self.schema.unique_files as usize + 1 {
            return Err(Error::corrupted("chunk_table count mismatch"));
        }
        if self.array("block_category")?.len() != self.schema.block_count as usize {
            return Err(Error::corrupted("block_category count mismatch"));
        }
        Ok(())
    }

    // ── Schema-level accessors ───────────────────────────────────────────────

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn inode_count(&self) -> u64 {
        self.schema.inode_counts.total()
    }

    pub fn block_count(&self) -> u64 {
        self.schema.block_count
    }

    /// Category a physical block was written under.
    pub fn block_category(&self, block: u64) -> Result<u64> {
        let categories = self.array("block_category")?;
        if block as usize >= categories.len() {
            return Err(Error::NotFound(format!(
                "block {block} of {}",
                categories.len()
            )));
        }
        Ok(categories.get(block as usize))
    }

    /// Categories of every block, in physical order.
    pub fn block_categories(&self) -> Result<Vec<u64>> {
        Ok(self.array("block_category")?.iter().collect())
    }

    pub fn root(&self) -> u64 {
        0
    }

    pub fn kind_of(&self, inode: u64) -> Result<InodeKind> {
        let c = &self.schema.inode_counts;
        let mut at = inode;
        for (kind, count) in [
            (InodeKind::Directory, c.dirs),
            (InodeKind::Symlink, c.links),
            (InodeKind::File, c.regs),
            (InodeKind::Device, c.devs),
            (InodeKind::Other, c.others),
        ] {
            if at < count {
                return Ok(kind);
            }
            at -= count;
        }
        Err(Error::NotFound(format!("inode {inode} out of range")))
    }

    // ── Stat ─────────────────────────────────────────────────────────────────

    pub fn stat(&self, inode: u64) -> Result<Stat> {
        let kind = self.kind_of(inode)?;
        let i = inode as usize;

        let mode = self.array("modes")?.get(self.array("inode_mode_idx")?.get(i) as usize) as u32;
        let uid = self.array("uids")?.get(self.array("inode_owner_idx")?.get(i) as usize) as u32;
        let gid = self.array("gids")?.get(self.array("inode_group_idx")?.get(i) as usize) as u32;

        let res = self.schema.time_resolution_sec as i64;
        let base = self.schema.timestamp_base;
        let mtime = base + self.array("inode_mtime_off")?.get(i) as i64 * res;
        let (atime, ctime) = if self.schema.mtime_only {
            (mtime, mtime)
        } else {
            (
                base + self.array("inode_atime_off")?.get(i) as i64 * res,
                base + self.array("inode_ctime_off")?.get(i) as i64 * res,
            )
        };

        let size = match kind {
            InodeKind::File => self.file_size(inode)?,
            InodeKind::Directory => self.dir_entry_count(inode)? as u64,
            InodeKind::Symlink => self.readlink(inode, ReadlinkMode::Raw)?.len() as u64,
            _ => 0,
        };
        let rdev = match kind {
            InodeKind::Device => {
                let local = inode - self.schema.inode_counts.dirs - self.schema.inode_counts.links
                    - self.schema.inode_counts.regs;
                self.array("devices")?.get(local as usize)
            }
            _ => 0,
        };

        Ok(Stat { inode, mode, kind, uid, gid, size, mtime, atime, ctime, rdev })
    }

    // ── Directories ──────────────────────────────────────────────────────────

    pub fn dir_entry_count(&self, inode: u64) -> Result<usize> {
        let (first, last) = self.dir_entry_range(inode)?;
        Ok(last - first)
    }

    fn dir_entry_range(&self, inode: u64) -> Result<(usize, usize)> {
        if self.kind_of(inode)? != InodeKind::Directory {
            return Err(Error::InvalidArgument(format!("inode {inode} is not a directory")));
        }
        let first = self.array("dir_first_entry")?;
        Ok((first.get(inode as usize) as usize, first.get(inode as usize + 1) as usize))
    }

    /// Parent directory inode; the root's parent is itself.
    pub fn dir_parent(&self, inode: u64) -> Result<u64> {
        if self.kind_of(inode)? != InodeKind::Directory {
            return Err(Error::InvalidArgument(format!("inode {inode} is not a directory")));
        }
        Ok(self.array("dir_parent")?.get(inode as usize))
    }

    /// All entries of a directory as `(name, inode)`, sorted by name.
    pub fn readdir(&self, inode: u64) -> Result<Vec<(String, u64)>> {
        let (first, last) = self.dir_entry_range(inode)?;
        let name_idx = self.array("dent_name_idx")?;
        let inodes = self.array("dent_inode")?;
        (first..last)
            .map(|e| Ok((self.names.lookup(name_idx.get(e) as usize)?, inodes.get(e))))
            .collect()
    }

    /// Per-directory binary search on entry names.
    pub fn lookup_child(
        &self,
        dir:              u64,
        name:             &str,
        case_insensitive: bool,
    ) -> Result<Option<u64>> {
        let (first, last) = self.dir_entry_range(dir)?;
        let name_idx = self.array("dent_name_idx")?;
        let inodes = self.array("dent_inode")?;

        if case_insensitive {
            for e in first..last {
                if self.names.lookup(name_idx.get(e) as usize)?.eq_ignore_ascii_case(name) {
                    return Ok(Some(inodes.get(e)));
                }
            }
            return Ok(None);
        }

        let mut lo = first;
        let mut hi = last;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let mid_name = self.names.lookup(name_idx.get(mid) as usize)?;
            match mid_name.as_str().cmp(name) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return Ok(Some(inodes.get(mid))),
            }
        }
        Ok(None)
    }

    /// Walk `path` from the root.  `Ok(None)` means a component does not
    /// exist; errors are reserved for corruption.
    pub fn resolve(&self, path: &str, case_insensitive: bool) -> Result<Option<ResolvedEntry>> {
        let mut inode = self.root();
        let mut parts: Vec<String> = Vec::new();

        for seg in path.split('/') {
            match seg {
                "" | "." => continue,
                ".." => {
                    if self.kind_of(inode)? != InodeKind::Directory {
                        return Ok(None);
                    }
                    inode = self.dir_parent(inode)?;
                    parts.pop();
                }
                _ => {
                    if self.kind_of(inode)? != InodeKind::Directory {
                        return Ok(None);
                    }
                    match self.lookup_child(inode, seg, case_insensitive)? {
                        Some(child) => {
                            parts.push(seg.to_owned());
                            inode = child;
                        }
                        None => return Ok(None),
                    }
                }
            }
        }

        Ok(Some(ResolvedEntry { inode, path: parts.join("/") }))
    }

    // ── Symlinks ─────────────────────────────────────────────────────────────

    pub fn readlink(&self, inode: u64, mode: ReadlinkMode) -> Result<String> {
        if self.kind_of(inode)? != InodeKind::Symlink {
            return Err(Error::InvalidArgument(format!("inode {inode} is not a symlink")));
        }
        let local = (inode - self.schema.inode_counts.dirs) as usize;
        let idx = self.array("symlink_target_idx")?.get(local) as usize;
        let raw = self.symlinks.lookup(idx)?;
        Ok(match mode {
            ReadlinkMode::Raw => raw,
            ReadlinkMode::Posix => raw.replace('\\', "/"),
            ReadlinkMode::Preferred => {
                if cfg!(windows) {
                    raw.replace('/', "\\")
                } else {
                    raw.replace('\\', "/")
                }
            }
        })
    }

    // ── Regular files ────────────────────────────────────────────────────────

    /// Chunk list of a regular file, holes expanded.
    pub fn chunks(&self, inode: u64) -> Result<Vec<ChunkRead>> {
        if self.kind_of(inode)? != InodeKind::File {
            return Err(Error::InvalidArgument(format!("inode {inode} is not a regular file")));
        }
        let local = (inode - self.schema.inode_counts.dirs - self.schema.inode_counts.links) as usize;
        let unique = self.array("file_index")?.get(local) as usize;

        let table = self.array("chunk_table")?;
        let first = table.get(unique) as usize;
        let last = table.get(unique + 1) as usize;

        let blocks = self.array("chunk_block")?;
        let offsets = self.array("chunk_offset")?;
        let sizes = self.array("chunk_size")?;
        let large = self.array("large_hole_sizes")?;
        let bsb = self.schema.block_size_bits;
        let sentinel = chunk_offset_is_large_hole(bsb);

        (first..last)
            .map(|c| {
                let block = blocks.get(c);
                let offset = offsets.get(c);
                let size = sizes.get(c);
                if Some(block) == self.schema.hole_block {
                    let bytes = if offset == sentinel {
                        if size as usize >= large.len() {
                            return Err(Error::corrupted("large hole index out of range"));
                        }
                        large.get(size as usize)
                    } else {
                        (size << bsb) | offset
                    };
                    Ok(ChunkRead::Hole { size: bytes })
                } else {
                    if block >= self.schema.block_count {
                        return Err(Error::corrupted(format!(
                            "chunk references block {block} of {}",
                            self.schema.block_count
                        )));
                    }
                    Ok(ChunkRead::Data { block, offset, size })
                }
            })
            .collect()
    }

    pub fn file_size(&self, inode: u64) -> Result<u64> {
        Ok(self.chunks(inode)?.iter().map(|c| c.size()).sum())
    }

    // ── Walk ─────────────────────────────────────────────────────────────────

    /// Pre-order walk over every entry; the callback sees the full path
    /// and the inode.  The root is visited first with an empty path.
    pub fn walk(&self, cb: &mut dyn FnMut(&str, u64) -> Result<()>) -> Result<()> {
        cb("", self.root())?;
        self.walk_dir(self.root(), &mut String::new(), cb)
    }

    fn walk_dir(
        &self,
        dir:  u64,
        path: &mut String,
        cb:   &mut dyn FnMut(&str, u64) -> Result<()>,
    ) -> Result<()> {
        for (name, inode) in self.readdir(dir)? {
            let saved = path.len();
            if !path.is_empty() {
                path.push('/');
            }
            path.push_str(&name);
            cb(path, inode)?;
            if self.kind_of(inode)? == InodeKind::Directory {
                self.walk_dir(inode, path, cb)?;
            }
            path.truncate(saved);
        }
        Ok(())
    }

    // ── Internals ────────────────────────────────────────────────────────────

    fn array(&self, name: &str) -> Result<PackedIntSlice<'_>> {
        let field = self.schema.field(name)?;
        Ok(slice_of(&self.data, *field))
    }
}

fn check_region(data: &ArcSlice, region: Region, name: &str) -> Result<()> {
    if region.offset + region.len > data.len() as u64 {
        return Err(Error::corrupted(format!("region for '{name}' exceeds metadata blob")));
    }
    Ok(())
}

fn slice_of<'a>(data: &'a ArcSlice, field: Array) -> PackedIntSlice<'a> {
    let bytes =
        &data.as_slice()[field.region.offset as usize..(field.region.offset + field.region.len) as usize];
    PackedIntSlice::new(bytes, field.count as usize, field.bits)
}

fn region_arc(data: &ArcSlice, region: Region) -> ArcSlice {
    data.narrow(region.offset as usize, (region.offset + region.len) as usize)
}

fn load_string_table(schema: &Schema, data: &ArcSlice, name: &str) -> Result<StringTableView> {
    let desc = schema.string_table(name)?;
    let index = slice_of(data, desc.index);
    let symtab_bytes;
    let symtab = match desc.symtab {
        Some(region) => {
            symtab_bytes = data.as_slice()
                [region.offset as usize..(region.offset + region.len) as usize]
                .to_vec();
            Some(symtab_bytes.as_slice())
        }
        None => None,
    };
    StringTableView::new(
        region_arc(data, desc.buffer),
        index,
        desc.packed_index,
        desc.count as usize,
        symtab,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::metadata::builder::{freeze, FreezeInput};
    use crate::metadata::MetadataOptions;
    use crate::segmenter::{Chunk, FragmentChunk};
    use crate::writer::entry::{Entry, EntryKind, EntryStat, EntryTree};

    fn entry(name: &str, kind: EntryKind, stat: EntryStat) -> Entry {
        Entry {
            name: name.to_owned(),
            kind,
            stat,
            parent: 0,
            children: Vec::new(),
            target: None,
            source: None,
        }
    }

    /// Tree:
    ///   /            (dir)
    ///   /docs        (dir)
    ///   /docs/a.txt  (file, content id 0)
    ///   /docs/b.txt  (file, content id 0 — duplicate of a)
    ///   /hole.bin    (file, content id 1 — one data chunk + one hole)
    ///   /link        (symlink → docs/a.txt)
    fn sample() -> (EntryTree, Vec<Option<u32>>, Vec<Vec<FragmentChunk>>) {
        let dstat = EntryStat { mode: 0o40755, uid: 1000, gid: 100, mtime: 2000, atime: 2100, ctime: 2200, ..Default::default() };
        let mut tree = EntryTree::new(dstat);

        let docs = tree.add_child(EntryTree::ROOT, entry("docs", EntryKind::Directory, dstat));
        let fstat = EntryStat { mode: 0o100644, uid: 1000, gid: 100, size: 300, mtime: 3000, atime: 3100, ctime: 3200, ..Default::default() };
        let a = tree.add_child(docs, entry("a.txt", EntryKind::File, fstat));
        let b = tree.add_child(docs, entry("b.txt", EntryKind::File, fstat));

        let hstat = EntryStat { mode: 0o100600, size: 100 + (1 << 20), mtime: 1000, atime: 1000, ctime: 1000, ..Default::default() };
        let h = tree.add_child(EntryTree::ROOT, entry("hole.bin", EntryKind::File, hstat));

        let mut link = entry("link", EntryKind::Symlink, EntryStat { mode: 0o120777, mtime: 1000, atime: 1000, ctime: 1000, ..Default::default() });
        link.target = Some("docs/a.txt".to_owned());
        tree.add_child(EntryTree::ROOT, link);

        tree.sort_children();

        let mut unique_of = vec![None; tree.len()];
        unique_of[a as usize] = Some(0);
        unique_of[b as usize] = Some(0);
        unique_of[h as usize] = Some(1);

        let chunk_lists = vec![
            vec![FragmentChunk::Data(Chunk { block: 0, offset: 0, size: 300 })],
            vec![
                FragmentChunk::Data(Chunk { block: 0, offset: 300, size: 100 }),
                FragmentChunk::Hole { size: 1 << 20 },
            ],
        ];
        (tree, unique_of, chunk_lists)
    }

    fn view_of(options: &MetadataOptions) -> MetadataView {
        let (tree, unique_of, chunk_lists) = sample();
        let frozen = freeze(
            &FreezeInput {
                tree: &tree,
                unique_of: &unique_of,
                chunk_lists: &chunk_lists,
                block_count: 1,
                block_categories: &[0],
                block_size_bits: 16,
            },
            options,
        )
        .unwrap();
        MetadataView::new(&frozen.schema, ArcSlice::whole(Arc::new(frozen.data))).unwrap()
    }

    #[test]
    fn resolve_and_stat() {
        let view = view_of(&MetadataOptions::default());

        let a = view.resolve("docs/a.txt", false).unwrap().unwrap();
        let st = view.stat(a.inode).unwrap();
        assert_eq!(st.kind, InodeKind::File);
        assert_eq!(st.mode, 0o100644);
        assert_eq!(st.uid, 1000);
        assert_eq!(st.gid, 100);
        assert_eq!(st.size, 300);
        assert_eq!(st.mtime, 3000);
        assert_eq!(st.atime, 3100);
        assert_eq!(st.ctime, 3200);

        assert!(view.resolve("docs/missing", false).unwrap().is_none());
        assert!(view.resolve("docs/a.txt/x", false).unwrap().is_none());
    }

    #[test]
    fn resolve_is_idempotent_on_resolved_paths() {
        let view = view_of(&MetadataOptions::default());
        for path in ["", "/", "docs", "docs/a.txt", "./docs//b.txt", "docs/../hole.bin"] {
            if let Some(r) = view.resolve(path, false).unwrap() {
                let again = view.resolve(r.path(), false).unwrap().unwrap();
                assert_eq!(again, r, "path {path:?}");
            }
        }
    }

    #[test]
    fn case_insensitive_lookup() {
        let view = view_of(&MetadataOptions::default());
        assert!(view.resolve("DOCS/A.TXT", false).unwrap().is_none());
        let r = view.resolve("DOCS/A.TXT", true).unwrap().unwrap();
        let plain = view.resolve("docs/a.txt", false).unwrap().unwrap();
        assert_eq!(r.inode, plain.inode);
    }

    #[test]
    fn readdir_is_sorted() {
        let view = view_of(&MetadataOptions::default());
        let names: Vec<String> =
            view.readdir(view.root()).unwrap().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, ["docs", "hole.bin", "link"]);
    }

    #[test]
    fn duplicate_files_share_chunks() {
        let view = view_of(&MetadataOptions::default());
        let a = view.resolve("docs/a.txt", false).unwrap().unwrap();
        let b = view.resolve("docs/b.txt", false).unwrap().unwrap();
        assert_ne!(a.inode, b.inode);
        assert_eq!(view.chunks(a.inode).unwrap(), view.chunks(b.inode).unwrap());
    }

    #[test]
    fn holes_expand_to_their_size() {
        let view = view_of(&MetadataOptions::default());
        let h = view.resolve("hole.bin", false).unwrap().unwrap();
        let chunks = view.chunks(h.inode).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], ChunkRead::Data { block: 0, offset: 300, size: 100 });
        assert_eq!(chunks[1], ChunkRead::Hole { size: 1 << 20 });
        assert_eq!(view.file_size(h.inode).unwrap(), 100 + (1 << 20));
    }

    #[test]
    fn readlink_modes() {
        let view = view_of(&MetadataOptions::default());
        let l = view.resolve("link", false).unwrap().unwrap();
        assert_eq!(view.readlink(l.inode, ReadlinkMode::Raw).unwrap(), "docs/a.txt");
        assert_eq!(view.readlink(l.inode, ReadlinkMode::Posix).unwrap(), "docs/a.txt");
        assert!(view.readlink(view.root(), ReadlinkMode::Raw).is_err());
    }

    #[test]
    fn mtime_only_collapses_times() {
        let options = MetadataOptions { mtime_only: true, ..Default::default() };
        let view = view_of(&options);
        let a = view.resolve("docs/a.txt", false).unwrap().unwrap();
        let st = view.stat(a.inode).unwrap();
        assert_eq!(st.atime, st.mtime);
        assert_eq!(st.ctime, st.mtime);
        assert_eq!(st.mtime, 3000);
    }

    #[test]
    fn time_resolution_rounds_down() {
        let options = MetadataOptions { time_resolution_sec: 60, ..Default::default() };
        let view = view_of(&options);
        let a = view.resolve("docs/a.txt", false).unwrap().unwrap();
        let st = view.stat(a.inode).unwrap();
        // base is 1000; 3000 stores as offset (3000-1000)/60 = 33.
        assert_eq!(st.mtime, 1000 + 33 * 60);
    }

    #[test]
    fn walk_visits_everything_in_order() {
        let view = view_of(&MetadataOptions::default());
        let mut paths = Vec::new();
        view.walk(&mut |path, _| {
            paths.push(path.to_owned());
            Ok(())
        })
        .unwrap();
        assert_eq!(paths, ["", "docs", "docs/a.txt", "docs/b.txt", "hole.bin", "link"]);
    }

    #[test]
    fn frozen_fields_match_producer_input() {
        let view = view_of(&MetadataOptions::default());
        assert_eq!(view.schema().inode_counts.dirs, 2);
        assert_eq!(view.schema().inode_counts.links, 1);
        assert_eq!(view.schema().inode_counts.regs, 3);
        assert_eq!(view.schema().unique_files, 2);
        assert_eq!(view.inode_count(), 6);
        // Root and docs are dirs 0/1 in DFS order; root's parent is itself.
        assert_eq!(view.dir_parent(0).unwrap(), 0);
        assert_eq!(view.dir_parent(1).unwrap(), 0);
    }

    #[test]
    fn block_categories_are_queryable() {
        let view = view_of(&MetadataOptions::default());
        assert_eq!(view.block_categories().unwrap(), vec![0]);
        assert_eq!(view.block_category(0).unwrap(), 0);
        assert!(view.block_category(1).is_err());
    }
}
