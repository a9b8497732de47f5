//! Content-defined segmentation with cross-block lookback.
//!
//! The segmenter consumes ordered fragments for one category and produces
//! `≤ 1 << block_size_bits`-byte blocks plus, for every input byte, a
//! chunk list pointing into those blocks.  Duplicate runs are elided:
//! when a window of incoming bytes matches a byte run in any of the last
//! `max_active_blocks` emitted blocks (the in-flight block included), a
//! chunk referencing the existing bytes is emitted instead of copying.
//!
//! # Matching
//! A cyclic rolling hash over windows of `1 << blockhash_window_size`
//! bytes drives the search.  Only positions whose hash has
//! `window_increment_shift` trailing zero bits are candidate anchors,
//! which rate-limits hash-table traffic.  Each block keeps a bloom filter
//! over its anchor hashes and a hash → offset multimap; a positive bloom
//! probe triggers the table lookup, a verified hit is extended backward
//! and forward as far as bytes agree.  When several blocks match the same
//! anchor the most recent block wins; within a block the longest
//! extension wins.
//!
//! # Sparse files
//! With `enable_sparse_files`, zero runs of at least [`HOLE_MIN_RUN`]
//! bytes become hole chunks that never touch a block and bypass
//! compression entirely.
//!
//! # Finish semantics
//! `finish` flushes the in-flight block regardless of size; chunk lists
//! are complete when each `add_chunkable` call returns.

mod bloom;
mod rolling;

pub use bloom::BloomFilter;
pub use rolling::RollingHash;

pub(crate) use rolling::splitmix64;

use std::collections::HashMap;
use std::collections::VecDeque;
use std::ops::Range;
use std::sync::Arc;

use crate::codec::CompressionConstraints;
use crate::writer::block_manager::BlockManager;

/// Zero runs at least this long become hole chunks (sparse mode only).
pub const HOLE_MIN_RUN: usize = 16 * 1024;

/// Offsets retained per hash value; bounds pathological repetition.
const MAX_OFFSETS_PER_HASH: usize = 8;

// ── Configuration ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SegmenterConfig {
    /// log2 of the match window in bytes.
    pub blockhash_window_size:  u32,
    /// Anchor gate: positions with this many trailing zero hash bits.
    pub window_increment_shift: u32,
    /// Lookback depth in closed blocks.
    pub max_active_blocks:      usize,
    /// Bloom sizing shift applied to the expected anchor count per block.
    pub bloom_filter_size:      u32,
    /// log2 of the block size in bytes.
    pub block_size_bits:        u32,
    pub enable_sparse_files:    bool,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        SegmenterConfig {
            blockhash_window_size:  12,
            window_increment_shift: 1,
            max_active_blocks:      1,
            bloom_filter_size:      4,
            block_size_bits:        22,
            enable_sparse_files:    false,
        }
    }
}

impl SegmenterConfig {
    pub fn block_size(&self) -> usize {
        1usize << self.block_size_bits
    }

    fn window(&self) -> usize {
        1usize << self.blockhash_window_size
    }

    fn anchor_mask(&self) -> u64 {
        (1u64 << self.window_increment_shift) - 1
    }

    fn bloom_bits(&self, block_size: usize) -> usize {
        (block_size >> self.window_increment_shift) << self.bloom_filter_size
    }
}

// ── Chunks ───────────────────────────────────────────────────────────────────

/// A `(block, offset, size)` reference into block bytes.  On the writer
/// side `block` is a logical number; the block manager renumbers it to
/// the physical order at commit time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub block:  u32,
    pub offset: u32,
    pub size:   u32,
}

/// One entry of a fragment's chunk list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentChunk {
    Data(Chunk),
    Hole { size: u64 },
}

impl FragmentChunk {
    pub fn size(&self) -> u64 {
        match self {
            FragmentChunk::Data(c) => c.size as u64,
            FragmentChunk::Hole { size } => *size,
        }
    }
}

/// Accumulates a fragment's chunk list, merging adjacent chunks that
/// reference contiguous ranges of the same block, and adjacent holes.
#[derive(Default)]
struct ChunkBuilder {
    chunks: Vec<FragmentChunk>,
}

impl ChunkBuilder {
    fn push_data(&mut self, block: u32, offset: usize, size: usize) {
        if size == 0 {
            return;
        }
        if let Some(FragmentChunk::Data(last)) = self.chunks.last_mut() {
            if last.block == block && last.offset as usize + last.size as usize == offset {
                last.size += size as u32;
                return;
            }
        }
        self.chunks.push(FragmentChunk::Data(Chunk {
            block,
            offset: offset as u32,
            size:   size as u32,
        }));
    }

    fn push_hole(&mut self, size: u64) {
        if size == 0 {
            return;
        }
        if let Some(FragmentChunk::Hole { size: last }) = self.chunks.last_mut() {
            *last += size;
            return;
        }
        self.chunks.push(FragmentChunk::Hole { size });
    }
}

// ── Block state ──────────────────────────────────────────────────────────────

/// The block currently being filled.
struct InflightBlock {
    logical: u32,
    data:    Vec<u8>,
    table:   HashMap<u64, Vec<u32>>,
    bloom:   BloomFilter,
    indexer: RollingHash,
}

/// A closed block kept in the lookback window.
struct ActiveBlock {
    logical: u32,
    data:    Arc<Vec<u8>>,
    table:   HashMap<u64, Vec<u32>>,
    bloom:   BloomFilter,
}

impl InflightBlock {
    fn new(logical: u32, block_size: usize, bloom_bits: usize, window: usize) -> Self {
        InflightBlock {
            logical,
            data:    Vec::with_capacity(block_size),
            table:   HashMap::new(),
            bloom:   BloomFilter::new(bloom_bits),
            indexer: RollingHash::new(window),
        }
    }

    /// Append bytes, indexing every anchor window they complete.
    fn append(&mut self, bytes: &[u8], anchor_mask: u64) {
        let window = self.indexer.window_size();
        for &b in bytes {
            let len = self.data.len();
            let out = if len >= window { self.data[len - window] } else { 0 };
            self.data.push(b);
            self.indexer.roll(out, b);
            if self.indexer.is_primed() {
                let h = self.indexer.hash();
                if h & anchor_mask == 0 {
                    let offset = (self.data.len() - window) as u32;
                    self.bloom.add(h);
                    let offsets = self.table.entry(h).or_default();
                    if offsets.len() < MAX_OFFSETS_PER_HASH {
                        offsets.push(offset);
                    }
                }
            }
        }
    }
}

// ── Match description ────────────────────────────────────────────────────────

struct Match {
    logical:      u32,
    block_offset: usize,
    data_start:   usize,
    len:          usize,
}

// ── Statistics ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct SegmenterStats {
    pub input_bytes:   u64,
    pub matched_bytes: u64,
    pub hole_bytes:    u64,
    pub blocks_closed: u64,
    pub anchor_probes: u64,
    pub table_hits:    u64,
}

// ── Segmenter ────────────────────────────────────────────────────────────────

pub type BlockReady = Box<dyn FnMut(u32, Arc<Vec<u8>>) + Send>;

pub struct Segmenter {
    block_size:  usize,
    window:      usize,
    anchor_mask: u64,
    /// Pending literals are appended to the in-flight block once they
    /// trail the scan position by this much, so later input can match
    /// earlier bytes of the same fragment.
    flush_limit: usize,
    bloom_bits:  usize,
    max_active:  usize,
    sparse:      bool,
    blkmgr:      Arc<BlockManager>,
    block_ready: BlockReady,
    inflight:    Option<InflightBlock>,
    active:      VecDeque<ActiveBlock>,
    stats:       SegmenterStats,
}

impl Segmenter {
    pub fn new(
        cfg:         &SegmenterConfig,
        constraints: &CompressionConstraints,
        blkmgr:      Arc<BlockManager>,
        block_ready: BlockReady,
    ) -> Self {
        let block_size = constraints.adjust_block_size(cfg.block_size());
        Segmenter {
            block_size,
            window:      cfg.window(),
            anchor_mask: cfg.anchor_mask(),
            flush_limit: 8 * cfg.window(),
            bloom_bits:  cfg.bloom_bits(block_size),
            max_active:  cfg.max_active_blocks,
            sparse:      cfg.enable_sparse_files,
            blkmgr,
            block_ready,
            inflight:    None,
            active:      VecDeque::new(),
            stats:       SegmenterStats::default(),
        }
    }

    /// Peak working-set estimate used by the writer to throttle
    /// concurrent segmenters.
    pub fn estimate_memory_usage(cfg: &SegmenterConfig, cc: &CompressionConstraints) -> u64 {
        let block_size = cc.adjust_block_size(cfg.block_size()) as u64;
        let anchors = block_size >> cfg.window_increment_shift;
        let table = anchors * 16;
        let bloom = (cfg.bloom_bits(block_size as usize) / 8) as u64;
        (cfg.max_active_blocks as u64).max(1) * (block_size + table + bloom)
    }

    pub fn stats(&self) -> SegmenterStats {
        self.stats
    }

    /// Segment one fragment, returning its complete chunk list.
    pub fn add_chunkable(&mut self, data: &[u8]) -> Vec<FragmentChunk> {
        self.stats.input_bytes += data.len() as u64;
        let mut out = ChunkBuilder::default();

        if self.sparse {
            let mut seg_start = 0usize;
            let mut i = 0usize;
            while i < data.len() {
                if data[i] == 0 {
                    let run_start = i;
                    while i < data.len() && data[i] == 0 {
                        i += 1;
                    }
                    if i - run_start >= HOLE_MIN_RUN {
                        self.segment_run(&data[seg_start..run_start], &mut out);
                        out.push_hole((i - run_start) as u64);
                        self.stats.hole_bytes += (i - run_start) as u64;
                        seg_start = i;
                    }
                } else {
                    i += 1;
                }
            }
            self.segment_run(&data[seg_start..], &mut out);
        } else {
            self.segment_run(data, &mut out);
        }

        out.chunks
    }

    /// Flush the in-flight block regardless of size.
    pub fn finish(mut self) -> SegmenterStats {
        if self.inflight.as_ref().is_some_and(|b| !b.data.is_empty()) {
            self.close_block();
        }
        self.stats
    }

    // ── Scan loop ────────────────────────────────────────────────────────────

    fn segment_run(&mut self, data: &[u8], out: &mut ChunkBuilder) {
        if data.is_empty() {
            return;
        }
        let w = self.window;
        let mut scanner = RollingHash::new(w);
        let mut emitted = 0usize;
        let mut pos = 0usize;

        while pos < data.len() {
            let incoming = data[pos];
            let outgoing = if pos >= w { data[pos - w] } else { 0 };
            scanner.roll(outgoing, incoming);
            pos += 1;

            if !scanner.is_primed() {
                continue;
            }

            // Keep the current window pending, flush older literals.
            if pos - w - emitted >= self.flush_limit {
                self.append_literals(data, emitted..pos - w, out);
                emitted = pos - w;
            }

            let h = scanner.hash();
            if h & self.anchor_mask != 0 {
                continue;
            }
            self.stats.anchor_probes += 1;

            let win_start = pos - w;
            if let Some(m) = self.find_match(h, data, win_start, emitted) {
                self.stats.table_hits += 1;
                self.stats.matched_bytes += m.len as u64;
                self.append_literals(data, emitted..m.data_start, out);
                out.push_data(m.logical, m.block_offset, m.len);
                emitted = m.data_start + m.len;
                pos = emitted;
                scanner.reset();
            }
        }

        self.append_literals(data, emitted..data.len(), out);
    }

    /// Probe the in-flight block and the active set, most recent first.
    /// Within the first block that verifies, the longest extension wins.
    fn find_match(&self, h: u64, data: &[u8], win_start: usize, emitted: usize) -> Option<Match> {
        if let Some(blk) = &self.inflight {
            if blk.bloom.contains(h) {
                if let Some(m) = best_in_block(
                    h, &blk.table, &blk.data, blk.logical, data, win_start, emitted, self.window,
                ) {
                    return Some(m);
                }
            }
        }
        for blk in self.active.iter().rev() {
            if blk.bloom.contains(h) {
                if let Some(m) = best_in_block(
                    h, &blk.table, &blk.data, blk.logical, data, win_start, emitted, self.window,
                ) {
                    return Some(m);
                }
            }
        }
        None
    }

    // ── Block management ─────────────────────────────────────────────────────

    /// Copy `range` into the in-flight block, closing and reopening
    /// blocks as they fill, and record the resulting chunks.
    fn append_literals(&mut self, data: &[u8], range: Range<usize>, out: &mut ChunkBuilder) {
        let mut start = range.start;
        while start < range.end {
            if self.inflight.is_none() {
                let logical = self.blkmgr.claim_logical_block() as u32;
                self.inflight = Some(InflightBlock::new(
                    logical,
                    self.block_size,
                    self.bloom_bits,
                    self.window,
                ));
            }
            let block_size = self.block_size;
            let anchor_mask = self.anchor_mask;
            let blk = self.inflight.as_mut().unwrap();

            let room = block_size - blk.data.len();
            let n = room.min(range.end - start);
            let offset = blk.data.len();
            blk.append(&data[start..start + n], anchor_mask);
            out.push_data(blk.logical, offset, n);
            start += n;

            if blk.data.len() == block_size {
                self.close_block();
            }
        }
    }

    fn close_block(&mut self) {
        let blk = self.inflight.take().expect("no in-flight block to close");
        let data = Arc::new(blk.data);
        (self.block_ready)(blk.logical, data.clone());
        self.stats.blocks_closed += 1;

        self.active.push_back(ActiveBlock {
            logical: blk.logical,
            data,
            table:   blk.table,
            bloom:   blk.bloom,
        });
        while self.active.len() > self.max_active {
            self.active.pop_front();
        }
    }
}

/// Verify and extend every candidate offset for `h` in one block,
/// returning the longest resulting match.
#[allow(clippy::too_many_arguments)]
fn best_in_block(
    h:         u64,
    table:     &HashMap<u64, Vec<u32>>,
    block:     &[u8],
    logical:   u32,
    data:      &[u8],
    win_start: usize,
    emitted:   usize,
    window:    usize,
) -> Option<Match> {
    let offsets = table.get(&h)?;
    let mut best: Option<Match> = None;

    for &o in offsets {
        let o = o as usize;
        if o + window > block.len() {
            continue;
        }
        if block[o..o + window] != data[win_start..win_start + window] {
            continue; // hash collision
        }

        let mut fwd = window;
        while win_start + fwd < data.len()
            && o + fwd < block.len()
            && data[win_start + fwd] == block[o + fwd]
        {
            fwd += 1;
        }
        let mut back = 0usize;
        while win_start - back > emitted
            && o - back > 0
            && data[win_start - back - 1] == block[o - back - 1]
        {
            back += 1;
        }

        let len = back + fwd;
        if best.as_ref().is_none_or(|b| len > b.len) {
            best = Some(Match {
                logical,
                block_offset: o - back,
                data_start:   win_start - back,
                len,
            });
        }
    }

    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect_segmenter(
        cfg: &SegmenterConfig,
    ) -> (Segmenter, Arc<std::sync::Mutex<Vec<(u32, Arc<Vec<u8>>)>>>) {
        let blocks = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = blocks.clone();
        let seg = Segmenter::new(
            cfg,
            &CompressionConstraints::default(),
            Arc::new(BlockManager::new()),
            Box::new(move |logical, data| sink.lock().unwrap().push((logical, data))),
        );
        (seg, blocks)
    }

    /// Reassemble a fragment from its chunk list and the emitted blocks.
    fn reassemble(
        chunks: &[FragmentChunk],
        blocks: &[(u32, Arc<Vec<u8>>)],
    ) -> Vec<u8> {
        let mut out = Vec::new();
        for c in chunks {
            match c {
                FragmentChunk::Data(c) => {
                    let blk = &blocks.iter().find(|(l, _)| *l == c.block).unwrap().1;
                    out.extend_from_slice(
                        &blk[c.offset as usize..(c.offset + c.size) as usize],
                    );
                }
                FragmentChunk::Hole { size } => {
                    out.extend(std::iter::repeat(0u8).take(*size as usize));
                }
            }
        }
        out
    }

    fn pseudo_random(len: usize, mut seed: u64) -> Vec<u8> {
        let mut out = Vec::with_capacity(len);
        for _ in 0..len {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            out.push((seed >> 33) as u8);
        }
        out
    }

    fn small_cfg() -> SegmenterConfig {
        SegmenterConfig {
            blockhash_window_size: 6,
            window_increment_shift: 1,
            max_active_blocks: 2,
            bloom_filter_size: 4,
            block_size_bits: 16,
            enable_sparse_files: false,
        }
    }

    #[test]
    fn every_byte_is_covered_exactly_once() {
        let cfg = small_cfg();
        let (mut seg, blocks) = collect_segmenter(&cfg);
        let data = pseudo_random(200_000, 1);

        let chunks = seg.add_chunkable(&data);
        seg.finish();

        let total: u64 = chunks.iter().map(|c| c.size()).sum();
        assert_eq!(total, data.len() as u64);
        assert_eq!(reassemble(&chunks, &blocks.lock().unwrap()), data);
    }

    #[test]
    fn identical_fragments_share_bytes() {
        let cfg = small_cfg();
        let (mut seg, blocks) = collect_segmenter(&cfg);
        let data = pseudo_random(32_000, 2);

        let first = seg.add_chunkable(&data);
        let second = seg.add_chunkable(&data);
        let stats = seg.finish();

        let blocks = blocks.lock().unwrap();
        assert_eq!(reassemble(&first, &blocks), data);
        assert_eq!(reassemble(&second, &blocks), data);

        // The second copy is deduplicated almost entirely.
        assert!(stats.matched_bytes >= (data.len() - 2 * (1 << cfg.blockhash_window_size)) as u64);
        let stored: usize = blocks.iter().map(|(_, d)| d.len()).sum();
        assert!(stored < data.len() + data.len() / 4, "stored {stored} of {}", data.len());
    }

    #[test]
    fn slice_of_earlier_fragment_matches() {
        let cfg = small_cfg();
        let (mut seg, blocks) = collect_segmenter(&cfg);
        let a = pseudo_random(40_000, 3);
        let b = a[10_000..30_000].to_vec();

        let ca = seg.add_chunkable(&a);
        let cb = seg.add_chunkable(&b);
        let stats = seg.finish();

        let blocks = blocks.lock().unwrap();
        assert_eq!(reassemble(&ca, &blocks), a);
        assert_eq!(reassemble(&cb, &blocks), b);
        assert!(stats.matched_bytes as usize >= b.len() - 2 * (1 << cfg.blockhash_window_size));
    }

    #[test]
    fn blocks_do_not_exceed_configured_size() {
        let cfg = small_cfg();
        let (mut seg, blocks) = collect_segmenter(&cfg);
        let data = pseudo_random(5 * (1 << cfg.block_size_bits) / 2, 4);

        seg.add_chunkable(&data);
        seg.finish();

        for (_, blk) in blocks.lock().unwrap().iter() {
            assert!(blk.len() <= 1 << cfg.block_size_bits);
        }
    }

    #[test]
    fn random_data_has_low_overhead() {
        let cfg = small_cfg();
        let (mut seg, blocks) = collect_segmenter(&cfg);
        let data = pseudo_random(300_000, 5);

        seg.add_chunkable(&data);
        seg.finish();

        let stored: usize = blocks.lock().unwrap().iter().map(|(_, d)| d.len()).sum();
        assert!(stored <= data.len() + data.len() / 100);
    }

    #[test]
    fn zero_run_becomes_hole_chunk() {
        let mut cfg = small_cfg();
        cfg.enable_sparse_files = true;
        let (mut seg, blocks) = collect_segmenter(&cfg);

        let mut data = pseudo_random(8_000, 6);
        data.extend(std::iter::repeat(0u8).take(1 << 20));
        data.extend(pseudo_random(8_000, 7));

        let chunks = seg.add_chunkable(&data);
        seg.finish();

        assert!(chunks
            .iter()
            .any(|c| matches!(c, FragmentChunk::Hole { size } if *size >= 1 << 20)));
        assert_eq!(reassemble(&chunks, &blocks.lock().unwrap()), data);
    }

    #[test]
    fn all_zero_fragment_produces_no_blocks() {
        let mut cfg = small_cfg();
        cfg.enable_sparse_files = true;
        let (mut seg, blocks) = collect_segmenter(&cfg);

        let data = vec![0u8; 1 << 20];
        let chunks = seg.add_chunkable(&data);
        seg.finish();

        assert_eq!(chunks.len(), 1);
        assert!(matches!(chunks[0], FragmentChunk::Hole { size } if size == 1 << 20));
        assert!(blocks.lock().unwrap().is_empty());
    }

    #[test]
    fn empty_fragment_yields_no_chunks() {
        let cfg = small_cfg();
        let (mut seg, _) = collect_segmenter(&cfg);
        assert!(seg.add_chunkable(&[]).is_empty());
        seg.finish();
    }

    #[test]
    fn adjacent_chunks_are_merged() {
        let cfg = small_cfg();
        let (mut seg, _) = collect_segmenter(&cfg);
        // Fits in one block; literals must collapse into a single chunk.
        let data = pseudo_random(10_000, 8);
        let chunks = seg.add_chunkable(&data);
        seg.finish();
        assert_eq!(chunks.len(), 1);
    }
}
