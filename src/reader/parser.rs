//! Image parsing: offset discovery, section walk, section index.
//!
//! The parser locates sections either through the tail SECTION_INDEX
//! (one probe at the last eight bytes of the image) or, when no index is
//! present, by walking headers sequentially from the image offset.
//! Checksums are not verified here; callers verify lazily before first
//! payload access.

use std::path::Path;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};

use crate::codec::{ArcSlice, BlockDecompressor, COMPRESSION_NONE};
use crate::error::{Error, Result};
use crate::section::{self, FsSection, SectionType, HEADER_V2_SIZE, MAGIC};

/// Where the image starts inside the backing bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageOffset {
    Exact(u64),
    /// Scan for the first well-formed header whose declared length keeps
    /// the section inside the backing range.
    Auto,
}

impl Default for ImageOffset {
    fn default() -> Self {
        ImageOffset::Exact(0)
    }
}

#[derive(Debug)]
pub struct FilesystemParser {
    image:        Arc<Vec<u8>>,
    image_offset: u64,
    sections:     Vec<FsSection>,
    has_index:    bool,
}

impl FilesystemParser {
    pub fn open(path: &Path, offset: ImageOffset) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Self::new(Arc::new(bytes), offset)
    }

    pub fn new(image: Arc<Vec<u8>>, offset: ImageOffset) -> Result<Self> {
        let image_offset = match offset {
            ImageOffset::Exact(o) => {
                // The first section header must parse at the given offset.
                FsSection::parse(&image, o)?;
                o
            }
            ImageOffset::Auto => discover_offset(&image)?,
        };

        let (sections, has_index) = match sections_from_index(&image, image_offset) {
            Some(sections) => (sections?, true),
            None => (sections_sequential(&image, image_offset)?, false),
        };

        if sections.is_empty() {
            return Err(Error::corrupted("image contains no sections"));
        }
        Ok(FilesystemParser { image, image_offset, sections, has_index })
    }

    pub fn image(&self) -> &Arc<Vec<u8>> {
        &self.image
    }

    pub fn image_offset(&self) -> u64 {
        self.image_offset
    }

    pub fn has_section_index(&self) -> bool {
        self.has_index
    }

    pub fn sections(&self) -> &[FsSection] {
        &self.sections
    }

    /// All sections of one kind, in image order.
    pub fn sections_of(&self, kind: SectionType) -> impl Iterator<Item = &FsSection> {
        self.sections.iter().filter(move |s| s.header.section_type() == Some(kind))
    }

    /// The unique section of a required kind.
    pub fn required_section(&self, kind: SectionType) -> Result<&FsSection> {
        let mut it = self.sections_of(kind);
        let sec = it
            .next()
            .ok_or_else(|| Error::corrupted(format!("image has no {} section", kind.name())))?;
        if it.next().is_some() {
            return Err(Error::corrupted(format!("image has multiple {} sections", kind.name())));
        }
        Ok(sec)
    }

    /// The raw (possibly compressed) payload of a section.
    pub fn payload(&self, sec: &FsSection) -> ArcSlice {
        ArcSlice::new(
            self.image.clone(),
            sec.payload_offset() as usize,
            sec.end() as usize,
        )
    }

    /// Decompress a whole section payload.  Fast checksum is verified
    /// first; the strong checksum only when `strong` is set.
    pub fn section_data(&self, sec: &FsSection, strong: bool) -> Result<ArcSlice> {
        sec.check_fast(&self.image)?;
        if strong {
            sec.check_strong(&self.image)?;
        }
        if sec.header.compression == COMPRESSION_NONE {
            return Ok(self.payload(sec));
        }
        let data = BlockDecompressor::new(sec.header.compression, self.payload(sec))
            .and_then(|d| d.decompress_all())
            .map_err(|e| attach_context(e, sec))?;
        Ok(ArcSlice::whole(Arc::new(data)))
    }
}

/// Carry the section context on errors that lack one.
pub(crate) fn attach_context(e: Error, sec: &FsSection) -> Error {
    match e {
        Error::DecompressionFailed { reason, context: None } => {
            Error::DecompressionFailed { reason, context: Some(sec.context()) }
        }
        Error::UnknownCompression { type_tag, context: None } => {
            Error::UnknownCompression { type_tag, context: Some(sec.context()) }
        }
        other => other,
    }
}

// ── Offset discovery ─────────────────────────────────────────────────────────

fn discover_offset(image: &[u8]) -> Result<u64> {
    let mut at = 0usize;
    while at + HEADER_V2_SIZE <= image.len() {
        match find_magic(image, at) {
            Some(pos) => {
                if let Ok(sec) = FsSection::parse(image, pos as u64) {
                    // Require a known leading section kind so stray magic
                    // bytes inside payloads don't win.
                    if sec.header.section_type().is_some() {
                        return Ok(pos as u64);
                    }
                }
                at = pos + 1;
            }
            None => break,
        }
    }
    Err(Error::corrupted("no section header found in image"))
}

fn find_magic(image: &[u8], from: usize) -> Option<usize> {
    image[from..]
        .windows(MAGIC.len())
        .position(|w| w == MAGIC)
        .map(|p| p + from)
}

// ── Section location ─────────────────────────────────────────────────────────

/// Try the tail index.  `None` means "no index present"; `Some(Err)`
/// means the index exists but is unusable.
fn sections_from_index(image: &[u8], image_offset: u64) -> Option<Result<Vec<FsSection>>> {
    if image.len() < 8 {
        return None;
    }
    let tail = LittleEndian::read_u64(&image[image.len() - 8..]);
    let (kind, offset) = section::split_index_word(tail);
    if kind != SectionType::SectionIndex as u16 {
        return None;
    }

    let index_sec = match FsSection::parse(image, image_offset + offset) {
        Ok(s) => s,
        Err(_) => return None,
    };
    if index_sec.header.section_type() != Some(SectionType::SectionIndex)
        || index_sec.end() != image.len() as u64
        || index_sec.header.compression != COMPRESSION_NONE
    {
        return None;
    }
    if let Err(e) = index_sec.check_fast(image) {
        return Some(Err(e));
    }

    let words = match section::decode_index(index_sec.payload(image)) {
        Ok(w) => w,
        Err(e) => return Some(Err(e)),
    };

    let mut sections = Vec::with_capacity(words.len());
    for word in words {
        let (kind, offset) = section::split_index_word(word);
        if kind == SectionType::SectionIndex as u16 {
            continue; // the index's own entry
        }
        match FsSection::parse(image, image_offset + offset) {
            Ok(sec) => {
                if sec.header.raw_type != kind {
                    return Some(Err(Error::corrupted_in(
                        format!("section index entry kind {kind} does not match header"),
                        sec.context(),
                    )));
                }
                sections.push(sec);
            }
            Err(e) => return Some(Err(e)),
        }
    }
    Some(Ok(sections))
}

fn sections_sequential(image: &[u8], image_offset: u64) -> Result<Vec<FsSection>> {
    let mut sections = Vec::new();
    let mut at = image_offset;
    while at < image.len() as u64 {
        let sec = FsSection::parse(image, at)?;
        at = sec.end();
        if sec.header.section_type() == Some(SectionType::SectionIndex) {
            continue;
        }
        sections.push(sec);
    }
    Ok(sections)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_image(with_index: bool) -> Vec<u8> {
        let mut out = Vec::new();
        let mut index = Vec::new();

        for (i, (kind, payload)) in [
            (SectionType::Block, &b"block-bytes"[..]),
            (SectionType::MetadataV2Schema, b"{}"),
            (SectionType::MetadataV2, b"data"),
        ]
        .iter()
        .enumerate()
        {
            index.push(section::index_word(*kind as u16, out.len() as u64));
            out.extend(section::write_section(i as u32, *kind, COMPRESSION_NONE, payload));
        }
        if with_index {
            index.push(section::index_word(SectionType::SectionIndex as u16, out.len() as u64));
            let payload = section::encode_index(&index);
            out.extend(section::write_section(3, SectionType::SectionIndex, COMPRESSION_NONE, &payload));
        }
        out
    }

    #[test]
    fn walks_with_and_without_index() {
        for with_index in [true, false] {
            let image = tiny_image(with_index);
            let parser = FilesystemParser::new(Arc::new(image), ImageOffset::Exact(0)).unwrap();
            assert_eq!(parser.has_section_index(), with_index);
            assert_eq!(parser.sections().len(), 3);
            assert_eq!(
                parser.sections()[0].header.section_type(),
                Some(SectionType::Block)
            );
        }
    }

    #[test]
    fn auto_offset_skips_garbage_prefix() {
        let mut padded = b"some leading garbage that is not an image".to_vec();
        padded.extend(tiny_image(true));
        let parser = FilesystemParser::new(Arc::new(padded), ImageOffset::Auto).unwrap();
        assert_eq!(parser.image_offset(), 41);
        assert_eq!(parser.sections().len(), 3);
    }

    #[test]
    fn explicit_offset() {
        let mut padded = vec![0u8; 100];
        padded.extend(tiny_image(false));
        let parser = FilesystemParser::new(Arc::new(padded), ImageOffset::Exact(100)).unwrap();
        assert_eq!(parser.sections().len(), 3);
    }

    #[test]
    fn truncated_tail_section_reports_corruption() {
        let image = tiny_image(false);
        let truncated = image[..image.len() - 2].to_vec();
        let err = FilesystemParser::new(Arc::new(truncated), ImageOffset::Exact(0)).unwrap_err();
        let ctx = err.section_context().expect("section context");
        assert_eq!(ctx.number, Some(2));
    }

    #[test]
    fn required_section_lookup() {
        let parser =
            FilesystemParser::new(Arc::new(tiny_image(true)), ImageOffset::Exact(0)).unwrap();
        assert!(parser.required_section(SectionType::MetadataV2).is_ok());
        assert!(parser.required_section(SectionType::History).is_err());
    }
}
