//! Frozen, packed metadata.
//!
//! The metadata is a set of bit-packed integer arrays and string tables
//! described by a separately stored schema (see [`schema`]).  The writer
//! freezes the scanner's entry graph into a schema + data blob pair in a
//! single pass; readers materialise lightweight views that borrow from
//! the mapped bytes and never deserialise the whole thing.
//!
//! Inodes are grouped by type rank in the order `DIR, LNK, REG, DEV,
//! OTH`; inode numbers are dense.  Regular files whose chunk lists are
//! bit-identical share one chunk-table slot through the file index
//! array.  Sparse files are encoded as chunks referencing a virtual hole
//! block: small holes carry their size inline, large ones go through the
//! large-hole-size table.

pub mod builder;
pub mod packed;
pub mod schema;
pub mod strtab;
pub mod symtab;
pub mod view;

pub use builder::{freeze, FreezeInput, FrozenMetadata};
pub use schema::Schema;
pub use view::{ChunkRead, MetadataView, ReadlinkMode, ResolvedEntry, Stat};

use crate::metadata::strtab::StringTableOptions;

/// Chunk offset value reserved to mark a reference into the
/// large-hole-size table.  Inline holes whose low bits collide with the
/// sentinel are forced into the table as well.
pub fn chunk_offset_is_large_hole(block_size_bits: u32) -> u64 {
    (1u64 << block_size_bits) - 1
}

/// Holes at least this big (relative to the block size) always go
/// through the large-hole-size table.
pub fn inline_hole_limit(block_size_bits: u32) -> u64 {
    1u64 << (2 * block_size_bits + 1).min(63)
}

#[derive(Debug, Clone)]
pub struct MetadataOptions {
    /// Store only mtime; atime/ctime read back as mtime.
    pub mtime_only:          bool,
    /// Timestamps are stored divided by this resolution.
    pub time_resolution_sec: u32,
    pub names:               StringTableOptions,
    pub symlinks:            StringTableOptions,
}

impl Default for MetadataOptions {
    fn default() -> Self {
        MetadataOptions {
            mtime_only:          false,
            time_resolution_sec: 1,
            names:               StringTableOptions::default(),
            symlinks:            StringTableOptions::default(),
        }
    }
}

// ── Mode bits ────────────────────────────────────────────────────────────────
//
// POSIX file type bits, used instead of pulling in an OS-specific crate
// so images read identically on every platform.

pub const S_IFMT:   u32 = 0o170000;
pub const S_IFSOCK: u32 = 0o140000;
pub const S_IFLNK:  u32 = 0o120000;
pub const S_IFREG:  u32 = 0o100000;
pub const S_IFBLK:  u32 = 0o060000;
pub const S_IFDIR:  u32 = 0o040000;
pub const S_IFCHR:  u32 = 0o020000;
pub const S_IFIFO:  u32 = 0o010000;

/// File type extracted from a mode word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeKind {
    Directory,
    Symlink,
    File,
    Device,
    Other,
}

impl InodeKind {
    pub fn from_mode(mode: u32) -> Self {
        match mode & S_IFMT {
            S_IFDIR => InodeKind::Directory,
            S_IFLNK => InodeKind::Symlink,
            S_IFREG => InodeKind::File,
            S_IFBLK | S_IFCHR => InodeKind::Device,
            _ => InodeKind::Other,
        }
    }
}
