//! Compression registry: frozen numeric tags, compressor/decompressor
//! factories, framed streaming decompression.
//!
//! # Identity rules
//! Every codec is identified by a `u16` tag written into every section
//! header.  Tag values are permanent; a tag is NEVER reused, even if a
//! codec is dropped from the build.  Readers tolerate unknown tags for
//! sections they never decode; decoding a section with an unknown tag
//! fails with `unknown_compression`.
//!
//! # Payload framing
//! For every codec except `NONE`, the compressed section payload is
//!
//! ```text
//! Offset  Size  Field
//!    0      8   uncompressed_size  (LE u64)
//!    8      2   metadata_len       (LE u16)
//!   10      n   metadata           opaque UTF-8 sidecar, may be empty
//!   10+n    …   codec stream
//! ```
//!
//! so a decompressor always knows `uncompressed_size` up-front.  The
//! sidecar is compressor-specific and passed through unchanged; built-in
//! codecs write an empty one.  `NONE` payloads are stored verbatim.
//!
//! # Registry
//! The process-wide registry is populated once from the built-in factory
//! list on first access and never mutated afterwards.  Factories advertise
//! name, description, supported options and library dependency, and build
//! compressors for their tag; decompressors are dispatched on the tag.

use std::io::{BufReader, Read};
use std::sync::{Arc, OnceLock};

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};

// ── Frozen compression tags ──────────────────────────────────────────────────
//
// These values are permanent.  Tag 4 is reserved (it belonged to a
// high-compression LZ4 variant this build does not supply).

pub const COMPRESSION_NONE:   u16 = 0;
pub const COMPRESSION_LZMA:   u16 = 1;
pub const COMPRESSION_ZSTD:   u16 = 2;
pub const COMPRESSION_LZ4:    u16 = 3;
pub const COMPRESSION_BROTLI: u16 = 5;

pub fn compression_name(tag: u16) -> String {
    match registry().factory(tag) {
        Some(f) => f.info().name.to_owned(),
        None    => format!("unknown ({tag})"),
    }
}

pub fn is_known_compression(tag: u16) -> bool {
    registry().factory(tag).is_some()
}

// ── Constraints and specs ────────────────────────────────────────────────────

/// Constraints a configured compressor imposes on its input.
///
/// `granularity` forces block sizes to a multiple (sample-aligned codecs);
/// `min_input`/`max_input` bound the usable input size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompressionConstraints {
    pub granularity: Option<u32>,
    pub min_input:   Option<usize>,
    pub max_input:   Option<usize>,
}

impl CompressionConstraints {
    /// Round `block_size` down to the nearest granularity multiple.
    pub fn adjust_block_size(&self, block_size: usize) -> usize {
        match self.granularity {
            Some(g) if g as usize > 1 => {
                let g = g as usize;
                ((block_size / g) * g).max(g)
            }
            _ => block_size,
        }
    }
}

/// A parsed compression spec string, e.g. `"zstd:level=19"`, `"lz4"`,
/// `"null"`.  The only recognised option is `level`; codecs without
/// levels reject it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionSpec {
    pub tag:   u16,
    pub level: Option<i32>,
}

impl CompressionSpec {
    pub const NULL: CompressionSpec = CompressionSpec { tag: COMPRESSION_NONE, level: None };

    pub fn parse(s: &str) -> Result<Self> {
        let (name, opts) = match s.split_once(':') {
            Some((n, o)) => (n, Some(o)),
            None         => (s, None),
        };
        let factory = registry()
            .factory_by_name(name)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown compression '{name}'")))?;

        let mut level = None;
        if let Some(opts) = opts {
            for opt in opts.split(':').filter(|o| !o.is_empty()) {
                match opt.split_once('=') {
                    Some(("level", v)) => {
                        level = Some(v.parse::<i32>().map_err(|_| {
                            Error::InvalidArgument(format!("bad level '{v}' in '{s}'"))
                        })?);
                    }
                    _ => {
                        return Err(Error::InvalidArgument(format!(
                            "unsupported option '{opt}' for compression '{name}'"
                        )));
                    }
                }
            }
        }
        if level.is_some() && !factory.info().options.contains(&"level") {
            return Err(Error::InvalidArgument(format!(
                "compression '{name}' does not take a level"
            )));
        }
        Ok(CompressionSpec { tag: factory.info().tag, level })
    }

    pub fn make_compressor(&self) -> Result<Box<dyn BlockCompressor>> {
        registry()
            .factory(self.tag)
            .ok_or(Error::UnknownCompression { type_tag: self.tag, context: None })?
            .make_compressor(self.level)
    }
}

// ── Compressor contract ──────────────────────────────────────────────────────

/// A configured compressor.  `compress` is pure apart from allocation.
pub trait BlockCompressor: Send + Sync {
    fn compression_type(&self) -> u16;

    /// Compress `data`, attaching the opaque `metadata` sidecar to the
    /// frame.  The sidecar round-trips unchanged through the matching
    /// decompressor.
    fn compress(&self, data: &[u8], metadata: Option<&str>) -> Result<Vec<u8>>;

    fn constraints(&self) -> CompressionConstraints {
        CompressionConstraints::default()
    }

    /// Estimated peak working set for one `compress` call on `input_len`
    /// bytes.  The writer's memory throttle schedules workers on this.
    fn estimate_memory_usage(&self, input_len: usize) -> u64;
}

// ── Factory / registry ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct CompressionInfo {
    pub tag:         u16,
    pub name:        &'static str,
    pub description: &'static str,
    pub options:     &'static [&'static str],
    /// Library this codec links against, for `--version`-style output.
    pub library:     &'static str,
}

pub trait CompressionFactory: Send + Sync {
    fn info(&self) -> &CompressionInfo;
    fn make_compressor(&self, level: Option<i32>) -> Result<Box<dyn BlockCompressor>>;
}

pub struct CompressionRegistry {
    factories: Vec<Box<dyn CompressionFactory>>,
}

impl CompressionRegistry {
    pub fn factory(&self, tag: u16) -> Option<&dyn CompressionFactory> {
        self.factories.iter().find(|f| f.info().tag == tag).map(|f| f.as_ref())
    }

    pub fn factory_by_name(&self, name: &str) -> Option<&dyn CompressionFactory> {
        let name = name.to_lowercase();
        // "null" is the historical alias accepted in spec strings.
        let name = if name == "null" { "none" } else { name.as_str() };
        self.factories.iter().find(|f| f.info().name == name).map(|f| f.as_ref())
    }

    pub fn list(&self) -> impl Iterator<Item = &CompressionInfo> {
        self.factories.iter().map(|f| f.info())
    }
}

/// The process-wide registry.  Populated once, shared immutably.
pub fn registry() -> &'static CompressionRegistry {
    static REGISTRY: OnceLock<CompressionRegistry> = OnceLock::new();
    REGISTRY.get_or_init(|| CompressionRegistry {
        factories: vec![
            Box::new(NullFactory),
            Box::new(LzmaFactory),
            Box::new(ZstdFactory),
            Box::new(Lz4Factory),
            Box::new(BrotliFactory),
        ],
    })
}

// ── Frame helpers ────────────────────────────────────────────────────────────

const FRAME_FIXED: usize = 10;

fn encode_frame(uncompressed_size: usize, metadata: Option<&str>, stream: Vec<u8>) -> Vec<u8> {
    let meta = metadata.unwrap_or("").as_bytes();
    debug_assert!(meta.len() <= u16::MAX as usize);
    let mut out = Vec::with_capacity(FRAME_FIXED + meta.len() + stream.len());
    out.extend_from_slice(&(uncompressed_size as u64).to_le_bytes());
    out.extend_from_slice(&(meta.len() as u16).to_le_bytes());
    out.extend_from_slice(meta);
    out.extend_from_slice(&stream);
    out
}

struct Frame {
    uncompressed_size: usize,
    metadata:          Option<String>,
    /// Start of the codec stream within the payload.
    stream_start:      usize,
}

fn decode_frame(payload: &[u8]) -> Result<Frame> {
    if payload.len() < FRAME_FIXED {
        return Err(Error::corrupted("compressed payload shorter than frame header"));
    }
    let uncompressed_size = LittleEndian::read_u64(&payload[0..8]) as usize;
    let meta_len = LittleEndian::read_u16(&payload[8..10]) as usize;
    if payload.len() < FRAME_FIXED + meta_len {
        return Err(Error::corrupted("compressed payload truncates metadata sidecar"));
    }
    let metadata = if meta_len == 0 {
        None
    } else {
        Some(
            std::str::from_utf8(&payload[FRAME_FIXED..FRAME_FIXED + meta_len])
                .map_err(|_| Error::corrupted("compression metadata is not UTF-8"))?
                .to_owned(),
        )
    };
    Ok(Frame { uncompressed_size, metadata, stream_start: FRAME_FIXED + meta_len })
}

// ── Shared-image byte source ─────────────────────────────────────────────────

/// A byte range inside a shared image buffer.  Cloning is cheap; the
/// backing buffer stays alive as long as any slice does.
#[derive(Debug, Clone)]
pub struct ArcSlice {
    data:  Arc<Vec<u8>>,
    start: usize,
    end:   usize,
}

impl ArcSlice {
    pub fn new(data: Arc<Vec<u8>>, start: usize, end: usize) -> Self {
        debug_assert!(start <= end && end <= data.len());
        ArcSlice { data, start, end }
    }

    pub fn whole(data: Arc<Vec<u8>>) -> Self {
        let end = data.len();
        ArcSlice { data, start: 0, end }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.start..self.end]
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// A sub-range of this slice sharing the same backing buffer.
    pub fn narrow(&self, start: usize, end: usize) -> ArcSlice {
        debug_assert!(start <= end && end <= self.len());
        ArcSlice {
            data:  self.data.clone(),
            start: self.start + start,
            end:   self.start + end,
        }
    }

    fn reader(&self, skip: usize) -> ArcSliceReader {
        ArcSliceReader { data: self.data.clone(), pos: self.start + skip, end: self.end }
    }
}

/// `Read` adapter over an [`ArcSlice`], for codecs with pull-style APIs.
struct ArcSliceReader {
    data: Arc<Vec<u8>>,
    pos:  usize,
    end:  usize,
}

impl Read for ArcSliceReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = buf.len().min(self.end - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

// ── Framed decompressor ──────────────────────────────────────────────────────

/// Incremental decompressor for one section payload.
///
/// The output buffer is owned by the decompressor and grows by at most
/// `max_bytes` per [`BlockDecompressor::decompress_frame`] call; the block
/// cache reads partial results through [`BlockDecompressor::data`].
/// Codecs without a streaming decode path (LZ4, LZMA) produce everything
/// on the first frame call.
pub struct BlockDecompressor {
    uncompressed_size: usize,
    metadata:          Option<String>,
    target:            Vec<u8>,
    state:             DecoderState,
}

impl std::fmt::Debug for BlockDecompressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockDecompressor").finish_non_exhaustive()
    }
}

enum DecoderState {
    /// Bounded copy of the stored span.
    Null { src: ArcSlice, pos: usize },
    Zstd { rdr: zstd::stream::read::Decoder<'static, BufReader<ArcSliceReader>> },
    Brotli { rdr: Box<brotli::Decompressor<ArcSliceReader>> },
    /// Whole-shot codecs: stream kept until the first frame call.
    Lz4 { src: ArcSlice, stream_start: usize },
    Lzma { src: ArcSlice, stream_start: usize },
    Done,
}

impl BlockDecompressor {
    /// Set up decompression of `payload` compressed with `compression`.
    /// No output is produced until the first frame call.
    pub fn new(compression: u16, payload: ArcSlice) -> Result<Self> {
        match compression {
            COMPRESSION_NONE => {
                let size = payload.len();
                Ok(BlockDecompressor {
                    uncompressed_size: size,
                    metadata:          None,
                    target:            Vec::with_capacity(size),
                    state:             DecoderState::Null { src: payload, pos: 0 },
                })
            }
            COMPRESSION_ZSTD => {
                let frame = decode_frame(payload.as_slice())?;
                let rdr = zstd::stream::read::Decoder::new(payload.reader(frame.stream_start))
                    .map_err(|e| decompression_failed(e.to_string()))?;
                Ok(Self::framed(frame, DecoderState::Zstd { rdr }))
            }
            COMPRESSION_BROTLI => {
                let frame = decode_frame(payload.as_slice())?;
                let rdr = Box::new(brotli::Decompressor::new(
                    payload.reader(frame.stream_start),
                    4096,
                ));
                Ok(Self::framed(frame, DecoderState::Brotli { rdr }))
            }
            COMPRESSION_LZ4 => {
                let frame = decode_frame(payload.as_slice())?;
                let stream_start = frame.stream_start;
                Ok(Self::framed(frame, DecoderState::Lz4 { src: payload, stream_start }))
            }
            COMPRESSION_LZMA => {
                let frame = decode_frame(payload.as_slice())?;
                let stream_start = frame.stream_start;
                Ok(Self::framed(frame, DecoderState::Lzma { src: payload, stream_start }))
            }
            tag => Err(Error::UnknownCompression { type_tag: tag, context: None }),
        }
    }

    fn framed(frame: Frame, state: DecoderState) -> Self {
        BlockDecompressor {
            uncompressed_size: frame.uncompressed_size,
            metadata:          frame.metadata,
            target:            Vec::with_capacity(frame.uncompressed_size),
            state,
        }
    }

    /// Total uncompressed size, known up-front.
    pub fn uncompressed_size(&self) -> usize {
        self.uncompressed_size
    }

    /// Opaque compressor sidecar, passed through unchanged.
    pub fn metadata(&self) -> Option<&str> {
        self.metadata.as_deref()
    }

    /// Uncompressed bytes decoded so far.
    pub fn data(&self) -> &[u8] {
        &self.target
    }

    /// Decode up to `max_bytes` more output.  Returns `true` once the
    /// whole payload is decoded.
    pub fn decompress_frame(&mut self, max_bytes: usize) -> Result<bool> {
        let avail = self.target.len();
        let want = (self.uncompressed_size - avail).min(max_bytes.max(1));
        if want == 0 {
            self.state = DecoderState::Done;
            return Ok(true);
        }

        match &mut self.state {
            DecoderState::Null { src, pos } => {
                let n = want.min(src.len() - *pos);
                self.target.extend_from_slice(&src.as_slice()[*pos..*pos + n]);
                *pos += n;
            }
            DecoderState::Zstd { rdr } => {
                read_into(rdr, &mut self.target, want)?;
            }
            DecoderState::Brotli { rdr } => {
                read_into(rdr.as_mut(), &mut self.target, want)?;
            }
            DecoderState::Lz4 { src, stream_start } => {
                let stream = &src.as_slice()[*stream_start..];
                let out = lz4_flex::decompress(stream, self.uncompressed_size)
                    .map_err(|e| decompression_failed(e.to_string()))?;
                self.finish_whole_shot(out)?;
            }
            DecoderState::Lzma { src, stream_start } => {
                let mut rdr = &src.as_slice()[*stream_start..];
                let mut out = Vec::with_capacity(self.uncompressed_size);
                lzma_rs::lzma_decompress(&mut rdr, &mut out)
                    .map_err(|e| decompression_failed(e.to_string()))?;
                self.finish_whole_shot(out)?;
            }
            DecoderState::Done => {}
        }

        if self.target.len() >= self.uncompressed_size {
            self.state = DecoderState::Done;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Decode everything remaining and return the output buffer.
    pub fn decompress_all(mut self) -> Result<Vec<u8>> {
        while !self.decompress_frame(usize::MAX)? {}
        Ok(self.target)
    }

    fn finish_whole_shot(&mut self, out: Vec<u8>) -> Result<()> {
        if out.len() != self.uncompressed_size {
            return Err(decompression_failed(format!(
                "declared {} uncompressed bytes, stream produced {}",
                self.uncompressed_size,
                out.len()
            )));
        }
        self.target = out;
        Ok(())
    }
}

fn read_into(rdr: &mut dyn Read, target: &mut Vec<u8>, want: usize) -> Result<()> {
    let start = target.len();
    target.resize(start + want, 0);
    let mut got = 0;
    while got < want {
        match rdr.read(&mut target[start + got..]) {
            Ok(0) => {
                target.truncate(start + got);
                return Err(decompression_failed("stream ended before declared size"));
            }
            Ok(n) => got += n,
            Err(e) => {
                target.truncate(start + got);
                return Err(decompression_failed(e.to_string()));
            }
        }
    }
    Ok(())
}

fn decompression_failed(reason: impl Into<String>) -> Error {
    Error::DecompressionFailed { reason: reason.into(), context: None }
}

// ── Built-in codecs ──────────────────────────────────────────────────────────

struct NullFactory;
struct NullCompressor;

impl CompressionFactory for NullFactory {
    fn info(&self) -> &CompressionInfo {
        static INFO: CompressionInfo = CompressionInfo {
            tag:         COMPRESSION_NONE,
            name:        "none",
            description: "no compression",
            options:     &[],
            library:     "builtin",
        };
        &INFO
    }
    fn make_compressor(&self, _level: Option<i32>) -> Result<Box<dyn BlockCompressor>> {
        Ok(Box::new(NullCompressor))
    }
}

impl BlockCompressor for NullCompressor {
    fn compression_type(&self) -> u16 { COMPRESSION_NONE }
    fn compress(&self, data: &[u8], _metadata: Option<&str>) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
    fn estimate_memory_usage(&self, input_len: usize) -> u64 {
        input_len as u64
    }
}

pub const DEFAULT_ZSTD_LEVEL: i32 = 3;

struct ZstdFactory;
struct ZstdCompressor { level: i32 }

impl CompressionFactory for ZstdFactory {
    fn info(&self) -> &CompressionInfo {
        static INFO: CompressionInfo = CompressionInfo {
            tag:         COMPRESSION_ZSTD,
            name:        "zstd",
            description: "Zstandard (balanced speed/ratio, default)",
            options:     &["level"],
            library:     "zstd",
        };
        &INFO
    }
    fn make_compressor(&self, level: Option<i32>) -> Result<Box<dyn BlockCompressor>> {
        Ok(Box::new(ZstdCompressor { level: level.unwrap_or(DEFAULT_ZSTD_LEVEL) }))
    }
}

impl BlockCompressor for ZstdCompressor {
    fn compression_type(&self) -> u16 { COMPRESSION_ZSTD }
    fn compress(&self, data: &[u8], metadata: Option<&str>) -> Result<Vec<u8>> {
        let stream = zstd::encode_all(data, self.level).map_err(Error::Io)?;
        Ok(encode_frame(data.len(), metadata, stream))
    }
    fn estimate_memory_usage(&self, input_len: usize) -> u64 {
        // Window plus compression context; grows with level.
        let window = 1u64 << (17 + (self.level.clamp(1, 22) as u64) / 4);
        window + input_len as u64
    }
}

struct Lz4Factory;
struct Lz4Compressor;

impl CompressionFactory for Lz4Factory {
    fn info(&self) -> &CompressionInfo {
        static INFO: CompressionInfo = CompressionInfo {
            tag:         COMPRESSION_LZ4,
            name:        "lz4",
            description: "LZ4 (maximum throughput, lower ratio)",
            options:     &[],
            library:     "lz4_flex",
        };
        &INFO
    }
    fn make_compressor(&self, _level: Option<i32>) -> Result<Box<dyn BlockCompressor>> {
        Ok(Box::new(Lz4Compressor))
    }
}

impl BlockCompressor for Lz4Compressor {
    fn compression_type(&self) -> u16 { COMPRESSION_LZ4 }
    fn compress(&self, data: &[u8], metadata: Option<&str>) -> Result<Vec<u8>> {
        Ok(encode_frame(data.len(), metadata, lz4_flex::compress(data)))
    }
    fn estimate_memory_usage(&self, input_len: usize) -> u64 {
        (1u64 << 16) + 2 * input_len as u64
    }
}

struct BrotliFactory;
struct BrotliCompressor { quality: u32 }

impl CompressionFactory for BrotliFactory {
    fn info(&self) -> &CompressionInfo {
        static INFO: CompressionInfo = CompressionInfo {
            tag:         COMPRESSION_BROTLI,
            name:        "brotli",
            description: "Brotli (high ratio, optimised for text)",
            options:     &["level"],
            library:     "brotli",
        };
        &INFO
    }
    fn make_compressor(&self, level: Option<i32>) -> Result<Box<dyn BlockCompressor>> {
        Ok(Box::new(BrotliCompressor { quality: level.unwrap_or(9).clamp(0, 11) as u32 }))
    }
}

impl BlockCompressor for BrotliCompressor {
    fn compression_type(&self) -> u16 { COMPRESSION_BROTLI }
    fn compress(&self, data: &[u8], metadata: Option<&str>) -> Result<Vec<u8>> {
        use std::io::Write;
        let mut stream = Vec::new();
        {
            let mut w = brotli::CompressorWriter::new(&mut stream, 4096, self.quality, 22);
            w.write_all(data).map_err(Error::Io)?;
        }
        Ok(encode_frame(data.len(), metadata, stream))
    }
    fn estimate_memory_usage(&self, input_len: usize) -> u64 {
        (1u64 << 22) + input_len as u64
    }
}

struct LzmaFactory;
struct LzmaCompressor;

impl CompressionFactory for LzmaFactory {
    fn info(&self) -> &CompressionInfo {
        static INFO: CompressionInfo = CompressionInfo {
            tag:         COMPRESSION_LZMA,
            name:        "lzma",
            description: "LZMA (highest ratio, slowest)",
            options:     &[],
            library:     "lzma-rs",
        };
        &INFO
    }
    fn make_compressor(&self, _level: Option<i32>) -> Result<Box<dyn BlockCompressor>> {
        Ok(Box::new(LzmaCompressor))
    }
}

impl BlockCompressor for LzmaCompressor {
    fn compression_type(&self) -> u16 { COMPRESSION_LZMA }
    fn compress(&self, data: &[u8], metadata: Option<&str>) -> Result<Vec<u8>> {
        let mut stream = Vec::new();
        lzma_rs::lzma_compress(&mut std::io::Cursor::new(data), &mut stream)
            .map_err(Error::Io)?;
        Ok(encode_frame(data.len(), metadata, stream))
    }
    fn estimate_memory_usage(&self, input_len: usize) -> u64 {
        // Dictionary-dominated; lzma-rs defaults to a large window.
        (64u64 << 20) + input_len as u64
    }
}
