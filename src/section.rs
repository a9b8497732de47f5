//! Section framing — every image is a concatenation of self-describing
//! sections.
//!
//! # On-disk layout (all numeric fields little-endian)
//!
//! V2 header, 64 bytes — the shape this implementation writes:
//!
//! ```text
//! Offset  Size  Field
//!    0      6   magic          = "DWARFS" (6 ASCII bytes)
//!    6      1   major          (u8)
//!    7      1   minor          (u8)
//!    8      8   xxh3_64        fast checksum               (LE u64)
//!   16     32   sha2_512_256   strong checksum
//!   48      4   section_number 0-based, dense              (LE u32)
//!   52      2   type                                       (LE u16)
//!   54      2   compression                                (LE u16)
//!   56      8   length         compressed payload bytes    (LE u64)
//! ```
//!
//! V1 header, 20 bytes — legacy, read-only:
//!
//! ```text
//! Offset  Size  Field
//!    0      6   magic          = "DWARFS"
//!    6      1   major          (u8)
//!    7      1   minor          (u8)
//!    8      2   type           (LE u16)
//!   10      2   compression    (LE u16)
//!   12      8   length         (LE u64)
//! ```
//!
//! # Checksums
//! `xxh3_64` covers `[section_number .. end_of_payload)` — the last 16
//! header bytes plus the compressed payload — and is verified cheaply
//! before any access.  `sha2_512_256` covers the `xxh3_64` field followed
//! by the same range, so the strong checksum also protects the fast one.
//! A zero `xxh3_64` or an all-zero `sha2_512_256` means "no check
//! configured" and passes.
//!
//! # Section index
//! The optional SECTION_INDEX section is always last and is never
//! compressed.  Each payload entry is one LE u64 word
//! `(type << 48) | (offset & ((1 << 48) - 1))` with `offset` relative to
//! the image start.  Without the index, sections are walked sequentially.

use byteorder::{ByteOrder, LittleEndian};
use sha2::{Digest, Sha512_256};
use xxhash_rust::xxh3::Xxh3;

use crate::error::{Error, Result, SectionContext};

pub const MAGIC:          &[u8; 6] = b"DWARFS";
pub const MAJOR_VERSION:  u8       = 2;
pub const MINOR_VERSION:  u8       = 5;
pub const HEADER_V1_SIZE: usize    = 20;
pub const HEADER_V2_SIZE: usize    = 64;

/// Byte offset of `section_number` inside a V2 header — the start of the
/// range covered by the fast checksum.
const CHECKSUM_START: usize = 48;

// ── Section type ─────────────────────────────────────────────────────────────

/// Discriminates the role of a section within the image.
///
/// Tag values are frozen; unknown tags are tolerated on read for forward
/// compatibility unless the section is on a required path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum SectionType {
    Block            = 0,
    MetadataV2Schema = 7,
    MetadataV2       = 8,
    SectionIndex     = 9,
    History          = 10,
}

impl SectionType {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0  => Some(SectionType::Block),
            7  => Some(SectionType::MetadataV2Schema),
            8  => Some(SectionType::MetadataV2),
            9  => Some(SectionType::SectionIndex),
            10 => Some(SectionType::History),
            _  => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SectionType::Block            => "BLOCK",
            SectionType::MetadataV2Schema => "METADATA_V2_SCHEMA",
            SectionType::MetadataV2       => "METADATA_V2",
            SectionType::SectionIndex     => "SECTION_INDEX",
            SectionType::History          => "HISTORY",
        }
    }
}

pub fn section_type_name(raw: u16) -> String {
    match SectionType::from_u16(raw) {
        Some(t) => t.name().to_owned(),
        None    => format!("unknown ({raw})"),
    }
}

// ── Section header ───────────────────────────────────────────────────────────

/// Parsed section header, either shape.
///
/// V1 headers have no checksums and no section number; their checksum
/// accessors report "no check configured".
#[derive(Debug, Clone)]
pub struct SectionHeader {
    pub major:       u8,
    pub minor:       u8,
    /// `None` for V1 headers.
    pub number:      Option<u32>,
    pub raw_type:    u16,
    pub compression: u16,
    pub length:      u64,
    pub xxh3_64:     u64,
    pub sha2_512_256: [u8; 32],
    /// Header size in bytes (`HEADER_V1_SIZE` or `HEADER_V2_SIZE`).
    pub header_size: usize,
}

impl SectionHeader {
    pub fn section_type(&self) -> Option<SectionType> {
        SectionType::from_u16(self.raw_type)
    }

    pub fn is_v2(&self) -> bool {
        self.number.is_some()
    }

    /// Parse a V2 header from the first `HEADER_V2_SIZE` bytes of `buf`.
    /// Returns `None` if `buf` is too short or the magic does not match.
    pub fn parse_v2(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_V2_SIZE || &buf[0..6] != MAGIC {
            return None;
        }
        let mut sha = [0u8; 32];
        sha.copy_from_slice(&buf[16..48]);
        Some(SectionHeader {
            major:        buf[6],
            minor:        buf[7],
            xxh3_64:      LittleEndian::read_u64(&buf[8..16]),
            sha2_512_256: sha,
            number:       Some(LittleEndian::read_u32(&buf[48..52])),
            raw_type:     LittleEndian::read_u16(&buf[52..54]),
            compression:  LittleEndian::read_u16(&buf[54..56]),
            length:       LittleEndian::read_u64(&buf[56..64]),
            header_size:  HEADER_V2_SIZE,
        })
    }

    /// Parse a V1 header.  Same contract as [`SectionHeader::parse_v2`].
    pub fn parse_v1(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_V1_SIZE || &buf[0..6] != MAGIC {
            return None;
        }
        Some(SectionHeader {
            major:        buf[6],
            minor:        buf[7],
            xxh3_64:      0,
            sha2_512_256: [0u8; 32],
            number:       None,
            raw_type:     LittleEndian::read_u16(&buf[8..10]),
            compression:  LittleEndian::read_u16(&buf[10..12]),
            length:       LittleEndian::read_u64(&buf[12..20]),
            header_size:  HEADER_V1_SIZE,
        })
    }

    /// Serialise as a V2 header.  Checksum fields are written as-is; use
    /// [`write_section`] to emit a header with computed checksums.
    pub fn encode_v2(&self) -> [u8; HEADER_V2_SIZE] {
        let mut buf = [0u8; HEADER_V2_SIZE];
        buf[0..6].copy_from_slice(MAGIC);
        buf[6] = self.major;
        buf[7] = self.minor;
        LittleEndian::write_u64(&mut buf[8..16], self.xxh3_64);
        buf[16..48].copy_from_slice(&self.sha2_512_256);
        LittleEndian::write_u32(&mut buf[48..52], self.number.unwrap_or(0));
        LittleEndian::write_u16(&mut buf[52..54], self.raw_type);
        LittleEndian::write_u16(&mut buf[54..56], self.compression);
        LittleEndian::write_u64(&mut buf[56..64], self.length);
        buf
    }

    pub fn context(&self, offset: u64) -> SectionContext {
        SectionContext {
            number: self.number,
            kind:   self.section_type().unwrap_or(SectionType::Block),
            offset,
        }
    }

    /// One-line description for dumps and error messages.
    pub fn describe(&self) -> String {
        match self.number {
            Some(n) => format!(
                "[V{}.{}] num={}, type={}, compression={}, length={}, checksum={:#018x}",
                self.major, self.minor, n,
                section_type_name(self.raw_type),
                crate::codec::compression_name(self.compression),
                self.length, self.xxh3_64,
            ),
            None => format!(
                "[V1] type={}, compression={}, length={}",
                section_type_name(self.raw_type),
                crate::codec::compression_name(self.compression),
                self.length,
            ),
        }
    }
}

// ── Checksums ────────────────────────────────────────────────────────────────

/// Fast checksum over `[section_number .. end_of_payload)`.
pub fn compute_xxh3(header: &[u8; HEADER_V2_SIZE], payload: &[u8]) -> u64 {
    let mut h = Xxh3::new();
    h.update(&header[CHECKSUM_START..]);
    h.update(payload);
    h.digest()
}

/// Strong checksum over the `xxh3_64` field followed by
/// `[section_number .. end_of_payload)`.
pub fn compute_sha(header: &[u8; HEADER_V2_SIZE], payload: &[u8]) -> [u8; 32] {
    let mut h = Sha512_256::new();
    h.update(&header[8..16]);
    h.update(&header[CHECKSUM_START..]);
    h.update(payload);
    h.finalize().into()
}

// ── Parsed section ───────────────────────────────────────────────────────────

/// A section located inside an image byte range.
///
/// Payload bytes are not copied; `payload<'a>` borrows from the image.
/// Checksum verification is lazy — call [`FsSection::check_fast`] before
/// the first payload access and [`FsSection::check_strong`] when full
/// integrity is requested.
#[derive(Debug, Clone)]
pub struct FsSection {
    pub header: SectionHeader,
    /// Absolute offset of the header within the image byte range.
    pub start:  u64,
}

impl FsSection {
    /// Parse the section starting at `offset`, preferring the V2 shape.
    ///
    /// The declared payload must fit inside `image`; a header whose length
    /// runs past the end is reported as `corrupted_image`.
    pub fn parse(image: &[u8], offset: u64) -> Result<Self> {
        let at = offset as usize;
        let tail = image.get(at..).unwrap_or(&[]);

        let header = SectionHeader::parse_v2(tail)
            .or_else(|| SectionHeader::parse_v1(tail))
            .ok_or_else(|| Error::corrupted(format!("no section header at offset {offset}")))?;

        let end = offset
            .checked_add(header.header_size as u64)
            .and_then(|e| e.checked_add(header.length));
        match end {
            Some(e) if e <= image.len() as u64 => Ok(FsSection { header, start: offset }),
            _ => Err(Error::corrupted_in(
                format!("section length {} exceeds image size {}", header.length, image.len()),
                header.context(offset),
            )),
        }
    }

    pub fn payload_offset(&self) -> u64 {
        self.start + self.header.header_size as u64
    }

    pub fn end(&self) -> u64 {
        self.payload_offset() + self.header.length
    }

    pub fn payload<'a>(&self, image: &'a [u8]) -> &'a [u8] {
        let a = self.payload_offset() as usize;
        let b = self.end() as usize;
        &image[a..b]
    }

    pub fn context(&self) -> SectionContext {
        self.header.context(self.start)
    }

    /// Verify the fast checksum.  Passes for V1 sections and for a zero
    /// checksum field (no check configured).
    pub fn check_fast(&self, image: &[u8]) -> Result<()> {
        if !self.header.is_v2() || self.header.xxh3_64 == 0 {
            return Ok(());
        }
        let hdr = self.header_bytes(image);
        if compute_xxh3(&hdr, self.payload(image)) != self.header.xxh3_64 {
            return Err(Error::ChecksumMismatch { which: "xxh3-64", context: self.context() });
        }
        Ok(())
    }

    /// Verify the strong checksum.  Passes for V1 sections and for an
    /// all-zero checksum field.
    pub fn check_strong(&self, image: &[u8]) -> Result<()> {
        if !self.header.is_v2() || self.header.sha2_512_256 == [0u8; 32] {
            return Ok(());
        }
        let hdr = self.header_bytes(image);
        if compute_sha(&hdr, self.payload(image)) != self.header.sha2_512_256 {
            return Err(Error::ChecksumMismatch { which: "sha2-512/256", context: self.context() });
        }
        Ok(())
    }

    fn header_bytes(&self, image: &[u8]) -> [u8; HEADER_V2_SIZE] {
        let at = self.start as usize;
        let mut hdr = [0u8; HEADER_V2_SIZE];
        hdr.copy_from_slice(&image[at..at + HEADER_V2_SIZE]);
        hdr
    }
}

// ── Section writing ──────────────────────────────────────────────────────────

/// Serialise one V2 section (header with computed checksums + payload).
///
/// Returns the full on-disk bytes; the caller appends them to the image
/// stream and records the offset for the section index.
pub fn write_section(
    number:      u32,
    section_type: SectionType,
    compression: u16,
    payload:     &[u8],
) -> Vec<u8> {
    let mut header = SectionHeader {
        major:        MAJOR_VERSION,
        minor:        MINOR_VERSION,
        number:       Some(number),
        raw_type:     section_type as u16,
        compression,
        length:       payload.len() as u64,
        xxh3_64:      0,
        sha2_512_256: [0u8; 32],
        header_size:  HEADER_V2_SIZE,
    };

    // The strong checksum covers the fast checksum field, so the fast
    // checksum must be final before the strong one is computed.
    let enc = header.encode_v2();
    header.xxh3_64 = compute_xxh3(&enc, payload);
    let enc = header.encode_v2();
    header.sha2_512_256 = compute_sha(&enc, payload);

    let mut out = Vec::with_capacity(HEADER_V2_SIZE + payload.len());
    out.extend_from_slice(&header.encode_v2());
    out.extend_from_slice(payload);
    out
}

// ── Section index words ──────────────────────────────────────────────────────

const OFFSET_MASK: u64 = (1u64 << 48) - 1;

/// Pack one section index entry: `(type << 48) | (offset & ((1 << 48) - 1))`.
pub fn index_word(raw_type: u16, offset: u64) -> u64 {
    ((raw_type as u64) << 48) | (offset & OFFSET_MASK)
}

/// Unpack a section index entry into `(type, offset)`.
pub fn split_index_word(word: u64) -> (u16, u64) {
    ((word >> 48) as u16, word & OFFSET_MASK)
}

pub fn encode_index(entries: &[u64]) -> Vec<u8> {
    let mut out = vec![0u8; entries.len() * 8];
    LittleEndian::write_u64_into(entries, &mut out);
    out
}

pub fn decode_index(payload: &[u8]) -> Result<Vec<u64>> {
    if payload.len() % 8 != 0 {
        return Err(Error::corrupted("section index size is not a multiple of 8"));
    }
    let mut words = vec![0u64; payload.len() / 8];
    LittleEndian::read_u64_into(payload, &mut words);
    Ok(words)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v2_header_round_trip() {
        let bytes = write_section(3, SectionType::History, 0, b"payload");
        assert_eq!(bytes.len(), HEADER_V2_SIZE + 7);

        let sec = FsSection::parse(&bytes, 0).unwrap();
        assert_eq!(sec.header.number, Some(3));
        assert_eq!(sec.header.section_type(), Some(SectionType::History));
        assert_eq!(sec.header.length, 7);
        assert_eq!(sec.payload(&bytes), b"payload");
        sec.check_fast(&bytes).unwrap();
        sec.check_strong(&bytes).unwrap();
    }

    #[test]
    fn fast_checksum_detects_payload_flip() {
        let mut bytes = write_section(0, SectionType::Block, 0, b"0123456789");
        let last = bytes.len() - 1;
        bytes[last] ^= 0x40;

        let sec = FsSection::parse(&bytes, 0).unwrap();
        match sec.check_fast(&bytes) {
            Err(Error::ChecksumMismatch { which, context }) => {
                assert_eq!(which, "xxh3-64");
                assert_eq!(context.number, Some(0));
            }
            other => panic!("expected checksum mismatch, got {other:?}"),
        }
    }

    #[test]
    fn strong_checksum_covers_fast_field() {
        let mut bytes = write_section(1, SectionType::MetadataV2, 0, b"meta");
        bytes[9] ^= 0x01; // inside the xxh3_64 field

        let sec = FsSection::parse(&bytes, 0).unwrap();
        assert!(sec.check_fast(&bytes).is_err());
        assert!(sec.check_strong(&bytes).is_err());
    }

    #[test]
    fn zero_checksums_pass() {
        let payload = b"x".repeat(16);
        let header = SectionHeader {
            major: MAJOR_VERSION, minor: MINOR_VERSION,
            number: Some(0), raw_type: SectionType::Block as u16,
            compression: 0, length: payload.len() as u64,
            xxh3_64: 0, sha2_512_256: [0u8; 32],
            header_size: HEADER_V2_SIZE,
        };
        let mut bytes = header.encode_v2().to_vec();
        bytes.extend_from_slice(&payload);

        let sec = FsSection::parse(&bytes, 0).unwrap();
        sec.check_fast(&bytes).unwrap();
        sec.check_strong(&bytes).unwrap();
    }

    #[test]
    fn truncated_section_is_corrupted() {
        let bytes = write_section(0, SectionType::Block, 0, &[0u8; 100]);
        let err = FsSection::parse(&bytes[..bytes.len() - 1], 0).unwrap_err();
        assert!(matches!(err, Error::CorruptedImage { .. }));
    }

    #[test]
    fn index_word_round_trip() {
        let w = index_word(SectionType::MetadataV2 as u16, 0x1234_5678_9abc);
        assert_eq!(split_index_word(w), (8, 0x1234_5678_9abc));
    }
}
