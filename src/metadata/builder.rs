//! The metadata freezer: entry graph in, schema + packed data blob out.
//!
//! Freezing is a single pass.  Entries are visited in canonical DFS
//! order, bucketed by type rank (`DIR, LNK, REG, DEV, OTH`) to assign
//! dense inode numbers, and every integer array is bit-packed at the
//! width of its observed maximum.

use std::collections::{BTreeMap, HashMap};

use crate::error::{Error, Result};
use crate::metadata::packed::PackedIntVector;
use crate::metadata::schema::{Array, InodeCounts, Region, Schema, StringTableDesc, SCHEMA_VERSION};
use crate::metadata::strtab::{self, PackedStringTable};
use crate::metadata::{chunk_offset_is_large_hole, inline_hole_limit, MetadataOptions};
use crate::segmenter::FragmentChunk;
use crate::writer::entry::{EntryId, EntryKind, EntryTree};

/// Frozen metadata, ready for the METADATA_V2_SCHEMA / METADATA_V2
/// sections.
#[derive(Debug)]
pub struct FrozenMetadata {
    pub schema: Vec<u8>,
    pub data:   Vec<u8>,
}

pub struct FreezeInput<'a> {
    pub tree:             &'a EntryTree,
    /// Unique content id per entry (regular files only), arena-indexed.
    pub unique_of:        &'a [Option<u32>],
    /// Chunk list per unique file, already renumbered to physical blocks.
    pub chunk_lists:      &'a [Vec<FragmentChunk>],
    /// Physical blocks written to the image.
    pub block_count:      u64,
    /// Category of every written block, in physical order.
    pub block_categories: &'a [u32],
    pub block_size_bits:  u32,
}

// ── Small helpers ────────────────────────────────────────────────────────────

#[derive(Default)]
struct InternMap {
    values: Vec<u64>,
    index:  HashMap<u64, u64>,
}

impl InternMap {
    fn intern(&mut self, value: u64) -> u64 {
        *self.index.entry(value).or_insert_with(|| {
            self.values.push(value);
            self.values.len() as u64 - 1
        })
    }
}

#[derive(Default)]
struct StringIntern {
    values: Vec<String>,
    index:  HashMap<String, u64>,
}

impl StringIntern {
    fn intern(&mut self, value: &str) -> u64 {
        match self.index.get(value) {
            Some(&i) => i,
            None => {
                let i = self.values.len() as u64;
                self.values.push(value.to_owned());
                self.index.insert(value.to_owned(), i);
                i
            }
        }
    }
}

/// Encodes hole chunks, deduplicating large hole sizes.
struct HoleMapper {
    hole_block:   u64,
    bsb:          u32,
    inline_limit: u64,
    sentinel:     u64,
    sizes:        Vec<u64>,
    index:        HashMap<u64, u64>,
}

impl HoleMapper {
    fn new(hole_block: u64, block_size_bits: u32) -> Self {
        HoleMapper {
            hole_block,
            bsb:          block_size_bits,
            inline_limit: inline_hole_limit(block_size_bits),
            sentinel:     chunk_offset_is_large_hole(block_size_bits),
            sizes:        Vec::new(),
            index:        HashMap::new(),
        }
    }

    /// Returns `(block, offset, size)` for a hole of `size` bytes.
    fn map_hole(&mut self, size: u64) -> (u64, u64, u64) {
        let offset = size & ((1u64 << self.bsb) - 1);
        if size < self.inline_limit && offset != self.sentinel {
            (self.hole_block, offset, size >> self.bsb)
        } else {
            let idx = *self.index.entry(size).or_insert_with(|| {
                self.sizes.push(size);
                self.sizes.len() as u64 - 1
            });
            (self.hole_block, self.sentinel, idx)
        }
    }
}

struct Blob {
    data:   Vec<u8>,
    fields: BTreeMap<String, Array>,
}

impl Blob {
    fn put_raw(&mut self, bytes: &[u8]) -> Region {
        let offset = self.data.len() as u64;
        self.data.extend_from_slice(bytes);
        Region { offset, len: bytes.len() as u64 }
    }

    fn put_array(&mut self, name: &str, values: &[u64]) {
        let vec = PackedIntVector::from_values(values);
        let bits = vec.bits();
        let count = vec.len() as u64;
        let region = self.put_raw(&vec.into_bytes());
        self.fields.insert(name.to_owned(), Array { region, count, bits });
    }

    fn put_string_table(&mut self, st: PackedStringTable) -> StringTableDesc {
        let PackedStringTable { buffer, index, packed_index, symtab, count } = st;
        let buffer = self.put_raw(&buffer);
        let bits = index.bits();
        let index_count = index.len() as u64;
        let region = self.put_raw(&index.into_bytes());
        let symtab = symtab.map(|b| self.put_raw(&b));
        StringTableDesc {
            buffer,
            index: Array { region, count: index_count, bits },
            packed_index,
            symtab,
            count: count as u64,
        }
    }
}

// ── Freeze ───────────────────────────────────────────────────────────────────

pub fn freeze(input: &FreezeInput<'_>, options: &MetadataOptions) -> Result<FrozenMetadata> {
    let tree = input.tree;
    let resolution = options.time_resolution_sec.max(1) as i64;
    if input.block_categories.len() as u64 != input.block_count {
        return Err(Error::InvalidArgument(format!(
            "{} block categories for {} blocks",
            input.block_categories.len(),
            input.block_count
        )));
    }
    let dfs = tree.dfs();

    // Bucket entries by type rank; inode numbers are bucket-major.
    let mut buckets: [Vec<EntryId>; 5] = Default::default();
    for &id in &dfs {
        let bucket = match tree.get(id).kind {
            EntryKind::Directory => 0,
            EntryKind::Symlink   => 1,
            EntryKind::File      => 2,
            EntryKind::Device    => 3,
            EntryKind::Other     => 4,
        };
        buckets[bucket].push(id);
    }
    let counts = InodeCounts {
        dirs:   buckets[0].len() as u64,
        links:  buckets[1].len() as u64,
        regs:   buckets[2].len() as u64,
        devs:   buckets[3].len() as u64,
        others: buckets[4].len() as u64,
    };

    let mut inode_of = vec![0u64; tree.len()];
    let by_inode: Vec<EntryId> = buckets.iter().flatten().copied().collect();
    for (ino, &id) in by_inode.iter().enumerate() {
        inode_of[id as usize] = ino as u64;
    }

    // Global maps, first-seen in inode order.
    let mut modes = InternMap::default();
    let mut uids = InternMap::default();
    let mut gids = InternMap::default();
    let mut mode_idx = Vec::with_capacity(by_inode.len());
    let mut owner_idx = Vec::with_capacity(by_inode.len());
    let mut group_idx = Vec::with_capacity(by_inode.len());
    for &id in &by_inode {
        let stat = &tree.get(id).stat;
        mode_idx.push(modes.intern(stat.mode as u64));
        owner_idx.push(uids.intern(stat.uid as u64));
        group_idx.push(gids.intern(stat.gid as u64));
    }

    // Timestamps as offsets from the earliest one seen.
    let base = by_inode
        .iter()
        .map(|&id| {
            let s = &tree.get(id).stat;
            if options.mtime_only { s.mtime } else { s.mtime.min(s.atime).min(s.ctime) }
        })
        .min()
        .unwrap_or(0);
    let time_off = |t: i64| ((t - base).max(0) / resolution) as u64;
    let mtime_off: Vec<u64> =
        by_inode.iter().map(|&id| time_off(tree.get(id).stat.mtime)).collect();
    let (atime_off, ctime_off) = if options.mtime_only {
        (Vec::new(), Vec::new())
    } else {
        (
            by_inode.iter().map(|&id| time_off(tree.get(id).stat.atime)).collect(),
            by_inode.iter().map(|&id| time_off(tree.get(id).stat.ctime)).collect(),
        )
    };

    // Directory tables.  Entries are already name-sorted by the scanner.
    let mut names = StringIntern::default();
    let mut dir_first_entry = Vec::with_capacity(buckets[0].len() + 1);
    let mut dir_parent = Vec::with_capacity(buckets[0].len());
    let mut dent_name_idx = Vec::new();
    let mut dent_inode = Vec::new();
    for &dir in &buckets[0] {
        dir_first_entry.push(dent_name_idx.len() as u64);
        dir_parent.push(inode_of[tree.get(dir).parent as usize]);
        for &child in &tree.get(dir).children {
            dent_name_idx.push(names.intern(&tree.get(child).name));
            dent_inode.push(inode_of[child as usize]);
        }
    }
    dir_first_entry.push(dent_name_idx.len() as u64);

    // Symlink targets, deduplicated.
    let mut symlinks = StringIntern::default();
    let mut symlink_target_idx = Vec::with_capacity(buckets[1].len());
    for &link in &buckets[1] {
        let target = tree.get(link).target.as_deref().ok_or_else(|| {
            Error::InvalidArgument(format!("symlink entry '{}' has no target", tree.path_of(link)))
        })?;
        symlink_target_idx.push(symlinks.intern(target));
    }

    // Chunk tables over unique files; holes go through the mapper.
    let mut hole_mapper = HoleMapper::new(input.block_count, input.block_size_bits);
    let mut chunk_table = Vec::with_capacity(input.chunk_lists.len() + 1);
    let mut chunk_block = Vec::new();
    let mut chunk_offset = Vec::new();
    let mut chunk_size = Vec::new();
    let mut holes_used = false;
    for list in input.chunk_lists {
        chunk_table.push(chunk_block.len() as u64);
        for chunk in list {
            let (block, offset, size) = match chunk {
                FragmentChunk::Data(c) => (c.block as u64, c.offset as u64, c.size as u64),
                FragmentChunk::Hole { size } => {
                    holes_used = true;
                    hole_mapper.map_hole(*size)
                }
            };
            chunk_block.push(block);
            chunk_offset.push(offset);
            chunk_size.push(size);
        }
    }
    chunk_table.push(chunk_block.len() as u64);

    // Shared-files collapsing: every regular inode maps to its unique
    // file's chunk-table slot.
    let mut file_index = Vec::with_capacity(buckets[2].len());
    let mut total_fs_size = 0u64;
    for &reg in &buckets[2] {
        let unique = input.unique_of[reg as usize].ok_or_else(|| {
            Error::InvalidArgument(format!(
                "regular file '{}' has no content id",
                tree.path_of(reg)
            ))
        })?;
        if unique as usize >= input.chunk_lists.len() {
            return Err(Error::InvalidArgument(format!(
                "content id {unique} out of range {}",
                input.chunk_lists.len()
            )));
        }
        file_index.push(unique as u64);
        total_fs_size += tree.get(reg).stat.size;
    }

    let devices: Vec<u64> = buckets[3].iter().map(|&d| tree.get(d).stat.rdev).collect();

    // Assemble the blob.
    let mut blob = Blob { data: Vec::new(), fields: BTreeMap::new() };
    blob.put_array("modes", &modes.values);
    blob.put_array("uids", &uids.values);
    blob.put_array("gids", &gids.values);
    blob.put_array("inode_mode_idx", &mode_idx);
    blob.put_array("inode_owner_idx", &owner_idx);
    blob.put_array("inode_group_idx", &group_idx);
    blob.put_array("inode_mtime_off", &mtime_off);
    if !options.mtime_only {
        blob.put_array("inode_atime_off", &atime_off);
        blob.put_array("inode_ctime_off", &ctime_off);
    }
    blob.put_array("dir_first_entry", &dir_first_entry);
    blob.put_array("dir_parent", &dir_parent);
    blob.put_array("dent_name_idx", &dent_name_idx);
    blob.put_array("dent_inode", &dent_inode);
    blob.put_array("symlink_target_idx", &symlink_target_idx);
    blob.put_array("devices", &devices);
    blob.put_array("chunk_table", &chunk_table);
    blob.put_array("file_index", &file_index);
    blob.put_array("chunk_block", &chunk_block);
    blob.put_array("chunk_offset", &chunk_offset);
    blob.put_array("chunk_size", &chunk_size);
    blob.put_array("large_hole_sizes", &hole_mapper.sizes);
    let block_categories: Vec<u64> =
        input.block_categories.iter().map(|&c| c as u64).collect();
    blob.put_array("block_category", &block_categories);

    let mut string_tables = BTreeMap::new();
    string_tables.insert(
        "names".to_owned(),
        blob.put_string_table(strtab::pack(&names.values, &options.names)),
    );
    string_tables.insert(
        "symlinks".to_owned(),
        blob.put_string_table(strtab::pack(&symlinks.values, &options.symlinks)),
    );

    let schema = Schema {
        version:             SCHEMA_VERSION,
        block_size_bits:     input.block_size_bits,
        timestamp_base:      base,
        time_resolution_sec: options.time_resolution_sec.max(1),
        mtime_only:          options.mtime_only,
        inode_counts:        counts,
        unique_files:        input.chunk_lists.len() as u64,
        block_count:         input.block_count,
        hole_block:          holes_used.then_some(input.block_count),
        total_fs_size,
        features:            if holes_used { vec!["holes".to_owned()] } else { vec![] },
        fields:              blob.fields,
        string_tables,
    };

    Ok(FrozenMetadata { schema: schema.to_bytes()?, data: blob.data })
}
