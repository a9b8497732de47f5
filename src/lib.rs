//! # dwarfs — read-optimized, content-deduplicated, compressed archive
//! filesystem
//!
//! Producers scan a directory tree, break regular-file content into
//! variable-sized fragments, eliminate redundancy across and within
//! files, pack the surviving bytes into a small number of large
//! compressed blocks, and emit a single image.  Consumers open that
//! image and answer POSIX-style metadata queries and random-access
//! reads without decompressing more than necessary.
//!
//! Format guarantees:
//! - All on-disk integers are little-endian; never negotiated
//! - Every section is self-describing: magic, version, type,
//!   compression, length, and (V2) an xxh3-64 fast checksum plus a
//!   SHA-512/256 strong checksum
//! - Compression tags are frozen; a tag is never reused
//! - The optional SECTION_INDEX is always last; the full section list is
//!   reconstructible by walking headers forward without it
//! - Unknown section kinds and compressions are tolerated on read unless
//!   they sit on a required path
//!
//! The write path lives in [`writer`], the read path in [`reader`]; the
//! [`segmenter`] and the frozen [`metadata`] tables are shared between
//! them.  [`extract`] turns an open image back into a directory tree.

pub mod codec;
pub mod error;
pub mod extract;
pub mod history;
pub mod metadata;
pub mod reader;
pub mod section;
pub mod segmenter;
pub mod worker;
pub mod writer;

// Flat re-exports for the most common types.
pub use codec::{BlockCompressor, BlockDecompressor, CompressionSpec};
pub use error::{Error, Result};
pub use extract::{extract as extract_filesystem, DiskSink, ExtractOptions, ExtractSink};
pub use history::History;
pub use metadata::{ChunkRead, InodeKind, MetadataView, ReadlinkMode, ResolvedEntry, Stat};
pub use reader::cache::{BlockCacheOptions, CacheTidyConfig, CacheTidyStrategy};
pub use reader::parser::ImageOffset;
pub use reader::{Filesystem, FilesystemOptions};
pub use section::SectionType;
pub use segmenter::{Segmenter, SegmenterConfig};
pub use writer::ordering::FileOrder;
pub use writer::{write_image, WriterOptions, WriterStats};
