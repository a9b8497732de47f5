//! The read side: open an image, answer metadata queries, serve random
//! access reads through the block cache.

pub mod cache;
pub mod parser;

use std::path::Path;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::history::History;
use crate::metadata::{ChunkRead, MetadataView, ReadlinkMode, ResolvedEntry, Stat};
use crate::section::SectionType;
use cache::{BlockCache, BlockCacheOptions, CacheFuture, CacheTidyConfig};
use parser::{FilesystemParser, ImageOffset};

// ── Options ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct FilesystemOptions {
    pub image_offset:     ImageOffset,
    pub cache:            BlockCacheOptions,
    pub tidy:             Option<CacheTidyConfig>,
    pub case_insensitive: bool,
    /// Verify strong checksums of the metadata sections at open.
    pub full_integrity:   bool,
}

// ── Read parts ───────────────────────────────────────────────────────────────

/// One piece of a file read: decoded block bytes, or a hole.
pub enum FilePart {
    Data(CacheFuture),
    Zeros(u64),
}

// ── Check report ─────────────────────────────────────────────────────────────

pub struct SectionCheck {
    pub description: String,
    pub result:      Result<()>,
}

pub struct CheckReport {
    pub sections: Vec<SectionCheck>,
}

impl CheckReport {
    pub fn errors(&self) -> usize {
        self.sections.iter().filter(|s| s.result.is_err()).count()
    }

    pub fn is_ok(&self) -> bool {
        self.errors() == 0
    }
}

// ── Filesystem ───────────────────────────────────────────────────────────────

pub struct Filesystem {
    parser:           FilesystemParser,
    meta:             MetadataView,
    cache:            BlockCache,
    case_insensitive: bool,
}

impl std::fmt::Debug for Filesystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filesystem").finish_non_exhaustive()
    }
}

impl Filesystem {
    pub fn open(path: &Path, options: &FilesystemOptions) -> Result<Self> {
        Self::with_parser(FilesystemParser::open(path, options.image_offset)?, options)
    }

    pub fn from_bytes(image: Vec<u8>, options: &FilesystemOptions) -> Result<Self> {
        Self::with_parser(
            FilesystemParser::new(Arc::new(image), options.image_offset)?,
            options,
        )
    }

    fn with_parser(parser: FilesystemParser, options: &FilesystemOptions) -> Result<Self> {
        // Metadata is required; failure to load it is fatal to the
        // reader instance.
        let schema_sec = parser.required_section(SectionType::MetadataV2Schema)?.clone();
        let meta_sec = parser.required_section(SectionType::MetadataV2)?.clone();
        let schema = parser.section_data(&schema_sec, options.full_integrity)?;
        let data = parser.section_data(&meta_sec, options.full_integrity)?;
        let meta = MetadataView::new(schema.as_slice(), data)?;

        let mut cache = BlockCache::new(parser.image().clone(), options.cache);
        for sec in parser.sections_of(SectionType::Block) {
            cache.insert(sec.clone());
        }
        if cache.block_count() as u64 != meta.block_count() {
            return Err(Error::corrupted(format!(
                "metadata references {} blocks, image has {}",
                meta.block_count(),
                cache.block_count()
            )));
        }
        if let Some(tidy) = options.tidy {
            cache.set_tidy_config(tidy);
        }

        Ok(Filesystem { parser, meta, cache, case_insensitive: options.case_insensitive })
    }

    // ── Metadata surface ─────────────────────────────────────────────────────

    pub fn metadata(&self) -> &MetadataView {
        &self.meta
    }

    pub fn find(&self, path: &str) -> Result<Option<ResolvedEntry>> {
        self.meta.resolve(path, self.case_insensitive)
    }

    pub fn stat(&self, inode: u64) -> Result<Stat> {
        self.meta.stat(inode)
    }

    pub fn readdir(&self, inode: u64) -> Result<Vec<(String, u64)>> {
        self.meta.readdir(inode)
    }

    pub fn readlink(&self, inode: u64, mode: ReadlinkMode) -> Result<String> {
        self.meta.readlink(inode, mode)
    }

    pub fn walk(&self, cb: &mut dyn FnMut(&str, u64) -> Result<()>) -> Result<()> {
        self.meta.walk(cb)
    }

    // ── Reads ────────────────────────────────────────────────────────────────

    /// Translate `(inode, offset, length)` into chunk-range parts.  Data
    /// parts resolve through the block cache; hole parts carry their
    /// zero length directly.
    pub fn read_parts(&self, inode: u64, offset: u64, length: u64) -> Result<Vec<FilePart>> {
        let chunks = self.meta.chunks(inode)?;
        let size: u64 = chunks.iter().map(|c| c.size()).sum();
        if offset > size {
            return Err(Error::InvalidArgument(format!(
                "read offset {offset} beyond file size {size}"
            )));
        }
        let length = length.min(size - offset);

        let mut parts = Vec::new();
        let mut pos = 0u64;
        let mut want_start = offset;
        let want_end = offset + length;

        for chunk in chunks {
            let chunk_end = pos + chunk.size();
            if chunk_end > want_start && pos < want_end {
                let skip = want_start - pos;
                let take = chunk_end.min(want_end) - want_start;
                match chunk {
                    ChunkRead::Data { block, offset: c_off, .. } => {
                        parts.push(FilePart::Data(self.cache.get(
                            block as usize,
                            (c_off + skip) as usize,
                            take as usize,
                        )));
                    }
                    ChunkRead::Hole { .. } => parts.push(FilePart::Zeros(take)),
                }
                want_start += take;
            }
            pos = chunk_end;
            if pos >= want_end {
                break;
            }
        }
        Ok(parts)
    }

    /// Gathered read; holes materialise as zero bytes.
    pub fn read(&self, inode: u64, offset: u64, length: u64) -> Result<Vec<u8>> {
        let parts = self.read_parts(inode, offset, length)?;
        let mut out = Vec::new();
        for part in parts {
            match part {
                FilePart::Data(future) => out.extend_from_slice(future.wait()?.data()),
                FilePart::Zeros(n) => out.resize(out.len() + n as usize, 0),
            }
        }
        Ok(out)
    }

    /// Whole-file convenience read.
    pub fn read_file(&self, inode: u64) -> Result<Vec<u8>> {
        let size = self.meta.file_size(inode)?;
        self.read(inode, 0, size)
    }

    // ── Introspection ────────────────────────────────────────────────────────

    pub fn history(&self) -> Result<Option<History>> {
        let mut last = None;
        for sec in self.parser.sections_of(SectionType::History) {
            last = Some(sec.clone());
        }
        match last {
            Some(sec) => {
                let data = self.parser.section_data(&sec, false)?;
                Ok(Some(History::from_bytes(data.as_slice())?))
            }
            None => Ok(None),
        }
    }

    /// Verify every section's fast checksum, and the strong checksum
    /// when `strong` is set.  The reader keeps serving other sections
    /// regardless of individual failures.
    pub fn check(&self, strong: bool) -> CheckReport {
        let image = self.parser.image();
        let sections = self
            .parser
            .sections()
            .iter()
            .map(|sec| {
                let result = sec
                    .check_fast(image)
                    .and_then(|()| if strong { sec.check_strong(image) } else { Ok(()) });
                SectionCheck { description: sec.header.describe(), result }
            })
            .collect();
        CheckReport { sections }
    }

    /// Human-readable image description; higher levels add more detail.
    ///
    /// Level 0 is a one-paragraph summary, level 1 adds the section
    /// list, level 2 adds a full entry listing.
    pub fn dump(&self, level: u32) -> Result<String> {
        use std::fmt::Write;

        let schema = self.meta.schema();
        let c = schema.inode_counts;
        let mut out = String::new();
        writeln!(
            &mut out,
            "image: {} sections, {} blocks, block size {} bytes{}",
            self.parser.sections().len(),
            self.meta.block_count(),
            1u64 << schema.block_size_bits,
            if self.parser.has_section_index() { ", section index" } else { "" },
        )
        .unwrap();
        writeln!(
            &mut out,
            "inodes: {} dirs, {} links, {} files ({} unique), {} devices, {} other",
            c.dirs, c.links, c.regs, schema.unique_files, c.devs, c.others
        )
        .unwrap();
        writeln!(&mut out, "original size: {} bytes", schema.total_fs_size).unwrap();
        let categories = self.meta.block_categories()?;
        if !categories.is_empty() {
            let mut counts = std::collections::BTreeMap::new();
            for c in categories {
                *counts.entry(c).or_insert(0usize) += 1;
            }
            let summary: Vec<String> = counts
                .iter()
                .map(|(c, n)| format!("{n} in category {c}"))
                .collect();
            writeln!(&mut out, "block categories: {}", summary.join(", ")).unwrap();
        }
        if !schema.features.is_empty() {
            writeln!(&mut out, "features: {}", schema.features.join(", ")).unwrap();
        }

        if level >= 1 {
            for sec in self.parser.sections() {
                writeln!(&mut out, "  {}", sec.header.describe()).unwrap();
            }
        }
        if level >= 2 {
            self.meta.walk(&mut |path, inode| {
                let stat = self.meta.stat(inode)?;
                writeln!(
                    &mut out,
                    "  {:o} {:>5}/{:<5} {:>12} {}",
                    stat.mode,
                    stat.uid,
                    stat.gid,
                    stat.size,
                    if path.is_empty() { "/" } else { path },
                )
                .unwrap();
                Ok(())
            })?;
        }
        Ok(out)
    }
}
