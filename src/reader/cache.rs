//! The block cache: bounded, LRU-evicted, single-flight decompression
//! with optional prefetch and background tidying.
//!
//! Each cached block moves through `MISSING → FETCHING → PARTIAL(k) →
//! READY` (or `POISONED` on decode failure).  Exactly one decode task
//! exists per block; concurrent requests attach to its waiter list.  A
//! request whose range is already decoded completes synchronously.
//! Once a block is fully decoded its buffer is frozen and handed out as
//! shared read-only ranges that keep it alive past eviction.
//!
//! There is no global lock on the hot path beyond a short registry
//! probe; state transitions take the block-local mutex.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::codec::{ArcSlice, BlockDecompressor};
use crate::error::{Error, Result, SectionContext};
use crate::section::FsSection;
use crate::worker::WorkerGroup;

/// Decode step size; waiters are re-checked after every step.
const DECODE_STEP: usize = 512 * 1024;

// ── Options ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct BlockCacheOptions {
    pub max_bytes:   usize,
    /// Decoder threads; 0 selects the CPU count.
    pub num_workers: usize,
    /// Below 1.0, a decode task pauses once every waiter is satisfied
    /// instead of running to READY; the block stays PARTIAL until a
    /// later request needs more of it.
    pub decompress_ratio: f64,
    pub disable_block_integrity_check: bool,
    /// Consecutive monotonic reads in one block that trigger prefetch of
    /// the next block; 0 disables the detector.
    pub sequential_access_detector_threshold: usize,
}

impl Default for BlockCacheOptions {
    fn default() -> Self {
        BlockCacheOptions {
            max_bytes:   512 << 20,
            num_workers: 0,
            decompress_ratio: 1.0,
            disable_block_integrity_check: false,
            sequential_access_detector_threshold: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTidyStrategy {
    None,
    /// Evict blocks untouched for longer than `expiry_time`.
    ExpiryTime,
    /// Evict blocks whose backing pages the OS has paged out.
    BlockSwappedOut,
}

#[derive(Debug, Clone, Copy)]
pub struct CacheTidyConfig {
    pub strategy:    CacheTidyStrategy,
    pub interval:    Duration,
    pub expiry_time: Duration,
}

impl Default for CacheTidyConfig {
    fn default() -> Self {
        CacheTidyConfig {
            strategy:    CacheTidyStrategy::None,
            interval:    Duration::from_secs(1),
            expiry_time: Duration::from_secs(60),
        }
    }
}

// ── Block range ──────────────────────────────────────────────────────────────

/// A read-only view of uncompressed block bytes.  Views of READY blocks
/// share the block buffer and pin it; views served from PARTIAL state
/// own a copy.
#[derive(Debug, Clone)]
pub struct BlockRange {
    data:   Arc<Vec<u8>>,
    offset: usize,
    len:    usize,
}

impl BlockRange {
    fn shared(data: Arc<Vec<u8>>, offset: usize, len: usize) -> Self {
        BlockRange { data, offset, len }
    }

    fn copied(bytes: &[u8]) -> Self {
        BlockRange { data: Arc::new(bytes.to_vec()), offset: 0, len: bytes.len() }
    }

    pub fn data(&self) -> &[u8] {
        &self.data[self.offset..self.offset + self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Completion handle for a cache request.  Dropping it detaches from the
/// waiter list; an in-flight decode always runs on so the block stays
/// usable for later requests.
pub struct CacheFuture(FutureState);

enum FutureState {
    Now(Result<BlockRange>),
    Later(Receiver<Result<BlockRange>>),
}

impl CacheFuture {
    fn ready(result: Result<BlockRange>) -> Self {
        CacheFuture(FutureState::Now(result))
    }

    pub fn wait(self) -> Result<BlockRange> {
        match self.0 {
            FutureState::Now(r) => r,
            FutureState::Later(rx) => rx
                .recv()
                .unwrap_or_else(|_| Err(Error::ResourceExhausted("cache worker vanished".into()))),
        }
    }
}

// ── Cached block ─────────────────────────────────────────────────────────────

struct Waiter {
    offset: usize,
    len:    usize,
    tx:     Sender<Result<BlockRange>>,
}

enum BlockState {
    /// Decode in progress; `PARTIAL(k)` is `decompressor.data().len()`.
    Fetching {
        decompressor: BlockDecompressor,
        waiters:      Vec<Waiter>,
        /// Set while a worker job is driving the frame loop.
        running:      bool,
    },
    Ready(Arc<Vec<u8>>),
    Poisoned(String),
}

struct CachedBlock {
    state:   BlockState,
    context: SectionContext,
}

impl CachedBlock {
    fn available(&self) -> usize {
        match &self.state {
            BlockState::Fetching { decompressor, .. } => decompressor.data().len(),
            BlockState::Ready(data) => data.len(),
            BlockState::Poisoned(_) => 0,
        }
    }
}

struct EntryMeta {
    block:        Arc<Mutex<CachedBlock>>,
    last_touched: Instant,
    /// Bytes charged against `max_bytes`; set when the block is READY.
    charged:      usize,
}

struct SeqDetector {
    block:  usize,
    end:    usize,
    streak: usize,
}

struct CacheState {
    entries:     HashMap<usize, EntryMeta>,
    total_bytes: usize,
    seq:         Option<SeqDetector>,
}

// ── Cache ────────────────────────────────────────────────────────────────────

pub struct BlockCache {
    image:    Arc<Vec<u8>>,
    blocks:   Vec<FsSection>,
    options:  BlockCacheOptions,
    state:    Arc<Mutex<CacheState>>,
    workers:  Arc<WorkerGroup>,
    tidy:     Mutex<Option<TidyHandle>>,
}

struct TidyHandle {
    stop:   Sender<()>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl BlockCache {
    pub fn new(image: Arc<Vec<u8>>, options: BlockCacheOptions) -> Self {
        BlockCache {
            image,
            blocks: Vec::new(),
            options,
            state: Arc::new(Mutex::new(CacheState {
                entries:     HashMap::new(),
                total_bytes: 0,
                seq:         None,
            })),
            workers: Arc::new(WorkerGroup::new("decomp", options.num_workers, 0)),
            tidy: Mutex::new(None),
        }
    }

    /// Register the next physical BLOCK section.  Insertion order is the
    /// physical block order chunks refer to.
    pub fn insert(&mut self, section: FsSection) {
        self.blocks.push(section);
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn set_tidy_config(&self, cfg: CacheTidyConfig) {
        let mut tidy = self.tidy.lock().unwrap();
        *tidy = None; // stop a previous tidy thread first
        if cfg.strategy == CacheTidyStrategy::None {
            return;
        }
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let state = self.state.clone();
        let thread = std::thread::Builder::new()
            .name("cache-tidy".to_owned())
            .spawn(move || {
                while stop_rx.recv_timeout(cfg.interval).is_err() {
                    tidy_pass(&state, &cfg);
                }
            })
            .expect("failed to spawn tidy thread");
        *tidy = Some(TidyHandle { stop: stop_tx, thread: Some(thread) });
    }

    /// Request `length` uncompressed bytes at `offset` of block
    /// `block_no`.
    pub fn get(&self, block_no: usize, offset: usize, length: usize) -> CacheFuture {
        let section = match self.blocks.get(block_no) {
            Some(s) => s.clone(),
            None => {
                return CacheFuture::ready(Err(Error::NotFound(format!(
                    "block {block_no} of {}",
                    self.blocks.len()
                ))));
            }
        };

        let entry = {
            let mut state = self.state.lock().unwrap();
            self.detect_sequential(&mut state, block_no, offset, length);
            match self.entry_or_start(&mut state, block_no, &section) {
                Ok(e) => e,
                Err(e) => return CacheFuture::ready(Err(e)),
            }
        };

        let mut block = entry.lock().unwrap();
        let context = block.context;
        match &mut block.state {
            BlockState::Ready(data) => {
                if offset + length > data.len() {
                    return CacheFuture::ready(Err(range_error(&context, offset, length)));
                }
                CacheFuture::ready(Ok(BlockRange::shared(data.clone(), offset, length)))
            }
            BlockState::Fetching { decompressor, waiters, running } => {
                if offset + length > decompressor.uncompressed_size() {
                    return CacheFuture::ready(Err(range_error(&context, offset, length)));
                }
                if offset + length <= decompressor.data().len() {
                    return CacheFuture::ready(Ok(BlockRange::copied(
                        &decompressor.data()[offset..offset + length],
                    )));
                }
                let (tx, rx) = bounded(1);
                waiters.push(Waiter { offset, len: length, tx });
                if !*running {
                    // The task paused with all waiters satisfied; resume.
                    *running = true;
                    self.spawn_decode(block_no);
                }
                CacheFuture(FutureState::Later(rx))
            }
            BlockState::Poisoned(reason) => CacheFuture::ready(Err(Error::DecompressionFailed {
                reason:  reason.clone(),
                context: Some(context),
            })),
        }
    }

    // ── Internals ────────────────────────────────────────────────────────────

    /// Find the block entry, creating it (and spawning its single decode
    /// task) on first touch.
    fn entry_or_start(
        &self,
        state:    &mut CacheState,
        block_no: usize,
        section:  &FsSection,
    ) -> Result<Arc<Mutex<CachedBlock>>> {
        if let Some(meta) = state.entries.get_mut(&block_no) {
            meta.last_touched = Instant::now();
            return Ok(meta.block.clone());
        }

        if !self.options.disable_block_integrity_check {
            section.check_fast(&self.image)?;
        }
        let decompressor = BlockDecompressor::new(
            section.header.compression,
            ArcSlice::new(
                self.image.clone(),
                section.payload_offset() as usize,
                section.end() as usize,
            ),
        )
        .map_err(|e| super::parser::attach_context(e, section))?;

        let block = Arc::new(Mutex::new(CachedBlock {
            state:   BlockState::Fetching {
                decompressor,
                waiters: Vec::new(),
                running: true,
            },
            context: section.context(),
        }));
        state.entries.insert(
            block_no,
            EntryMeta { block: block.clone(), last_touched: Instant::now(), charged: 0 },
        );
        self.spawn_decode(block_no);
        Ok(block)
    }

    fn spawn_decode(&self, block_no: usize) {
        let state = self.state.clone();
        let max_bytes = self.options.max_bytes;
        let run_to_ready = self.options.decompress_ratio >= 1.0;
        self.workers.add_job(move || decode_task(&state, block_no, max_bytes, run_to_ready));
    }

    fn detect_sequential(
        &self,
        state:    &mut CacheState,
        block_no: usize,
        offset:   usize,
        length:   usize,
    ) {
        let threshold = self.options.sequential_access_detector_threshold;
        if threshold == 0 {
            return;
        }
        let streak = match &state.seq {
            Some(s) if s.block == block_no && s.end == offset => s.streak + 1,
            _ => 1,
        };
        state.seq = Some(SeqDetector { block: block_no, end: offset + length, streak });

        if streak >= threshold && block_no + 1 < self.blocks.len() {
            let next = block_no + 1;
            let section = self.blocks[next].clone();
            let _ = self.entry_or_start(state, next, &section);
        }
    }
}

impl Drop for BlockCache {
    fn drop(&mut self) {
        *self.tidy.lock().unwrap() = None;
    }
}

impl Drop for TidyHandle {
    fn drop(&mut self) {
        let _ = self.stop.send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn range_error(context: &SectionContext, offset: usize, length: usize) -> Error {
    Error::InvalidArgument(format!(
        "range [{offset}, {}) exceeds block in {context}",
        offset + length
    ))
}

// ── Decode task ──────────────────────────────────────────────────────────────

/// Drive the frame loop of one block.  Satisfies waiters as bytes become
/// available; transitions to READY (freezing the buffer) or pauses when
/// partial decompression is enabled and nobody is waiting.
fn decode_task(state: &Arc<Mutex<CacheState>>, block_no: usize, max_bytes: usize, run_to_ready: bool) {
    let entry = {
        let state = state.lock().unwrap();
        match state.entries.get(&block_no) {
            Some(meta) => meta.block.clone(),
            None => return, // tidied away before the task ran
        }
    };

    loop {
        let mut block = entry.lock().unwrap();
        let context = block.context;
        let BlockState::Fetching { decompressor, waiters, running } = &mut block.state else {
            return;
        };

        // Serve every waiter the current buffer can satisfy.
        let avail = decompressor.data().len();
        waiters.retain(|w| {
            if w.offset + w.len <= avail {
                let _ = w.tx.send(Ok(BlockRange::copied(
                    &decompressor.data()[w.offset..w.offset + w.len],
                )));
                false
            } else {
                true
            }
        });

        if !run_to_ready && waiters.is_empty() && avail > 0 {
            *running = false;
            return; // PARTIAL; a later request resumes the task
        }

        match decompressor.decompress_frame(DECODE_STEP) {
            Ok(false) => continue,
            Ok(true) => {
                let data = Arc::new(decompressor.data().to_vec());
                for w in waiters.drain(..) {
                    let result = if w.offset + w.len <= data.len() {
                        Ok(BlockRange::shared(data.clone(), w.offset, w.len))
                    } else {
                        Err(range_error(&context, w.offset, w.len))
                    };
                    let _ = w.tx.send(result);
                }
                let size = data.len();
                block.state = BlockState::Ready(data);
                drop(block);

                let mut state = state.lock().unwrap();
                if let Some(meta) = state.entries.get_mut(&block_no) {
                    meta.charged = size;
                    state.total_bytes += size;
                }
                evict_lru(&mut state, max_bytes);
                return;
            }
            Err(e) => {
                let reason = e.to_string();
                for w in waiters.drain(..) {
                    let _ = w.tx.send(Err(Error::DecompressionFailed {
                        reason:  reason.clone(),
                        context: Some(context),
                    }));
                }
                block.state = BlockState::Poisoned(reason);
                return;
            }
        }
    }
}

// ── Eviction / tidying ───────────────────────────────────────────────────────

/// LRU eviction of READY blocks down to `max_bytes`.  Blocks with
/// outstanding ranges are pinned (their buffer has other owners); their
/// bytes stay alive with the views, so dropping the cache entry is safe
/// but pointless — skip them.
fn evict_lru(state: &mut CacheState, max_bytes: usize) {
    while state.total_bytes > max_bytes {
        let candidate = state
            .entries
            .iter()
            .filter(|(_, m)| m.charged > 0 && !is_pinned(m))
            .min_by_key(|(_, m)| m.last_touched)
            .map(|(&k, _)| k);
        match candidate {
            Some(k) => {
                let meta = state.entries.remove(&k).unwrap();
                state.total_bytes -= meta.charged;
            }
            None => break,
        }
    }
}

fn is_pinned(meta: &EntryMeta) -> bool {
    let block = meta.block.lock().unwrap();
    match &block.state {
        BlockState::Ready(data) => Arc::strong_count(data) > 1,
        _ => true, // fetching or poisoned entries are never LRU-evicted
    }
}

fn tidy_pass(state: &Arc<Mutex<CacheState>>, cfg: &CacheTidyConfig) {
    let mut state = state.lock().unwrap();
    let expired: Vec<usize> = state
        .entries
        .iter()
        .filter(|(_, m)| m.charged > 0 && !is_pinned(m))
        .filter(|(_, m)| match cfg.strategy {
            CacheTidyStrategy::ExpiryTime => m.last_touched.elapsed() > cfg.expiry_time,
            CacheTidyStrategy::BlockSwappedOut => is_swapped_out(m),
            CacheTidyStrategy::None => false,
        })
        .map(|(&k, _)| k)
        .collect();
    for k in expired {
        let meta = state.entries.remove(&k).unwrap();
        state.total_bytes -= meta.charged;
    }
}

/// Best-effort page-residency probe of a READY block's buffer.
#[cfg(unix)]
fn is_swapped_out(meta: &EntryMeta) -> bool {
    let block = meta.block.lock().unwrap();
    let BlockState::Ready(data) = &block.state else { return false };
    if data.is_empty() {
        return false;
    }

    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    let addr = data.as_ptr() as usize;
    let start = addr & !(page - 1);
    let len = addr + data.len() - start;
    let pages = len.div_ceil(page);
    let mut vec = vec![0u8; pages];
    let rc = unsafe {
        libc::mincore(
            start as *mut libc::c_void,
            len,
            vec.as_mut_ptr() as *mut libc::c_char as *mut _,
        )
    };
    rc == 0 && vec.iter().any(|&v| v & 1 == 0)
}

#[cfg(not(unix))]
fn is_swapped_out(_meta: &EntryMeta) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{CompressionSpec, COMPRESSION_ZSTD};
    use crate::section::{write_section, SectionType};

    /// Build an image of compressed block sections from raw buffers.
    fn cache_of(blocks: &[Vec<u8>], options: BlockCacheOptions) -> BlockCache {
        let compressor = CompressionSpec { tag: COMPRESSION_ZSTD, level: None }
            .make_compressor()
            .unwrap();
        let mut image = Vec::new();
        let mut sections = Vec::new();
        for (i, data) in blocks.iter().enumerate() {
            let payload = compressor.compress(data, None).unwrap();
            let at = image.len() as u64;
            image.extend(write_section(i as u32, SectionType::Block, COMPRESSION_ZSTD, &payload));
            sections.push(at);
        }
        let image = Arc::new(image);
        let mut cache = BlockCache::new(image.clone(), options);
        for &at in &sections {
            cache.insert(FsSection::parse(&image, at).unwrap());
        }
        cache
    }

    fn block(i: u8, len: usize) -> Vec<u8> {
        (0..len).map(|j| (j as u8).wrapping_mul(31).wrapping_add(i)).collect()
    }

    #[test]
    fn serves_correct_bytes() {
        let data = block(1, 200_000);
        let cache = cache_of(&[data.clone()], BlockCacheOptions::default());
        let range = cache.get(0, 1000, 5000).wait().unwrap();
        assert_eq!(range.data(), &data[1000..6000]);
    }

    #[test]
    fn concurrent_reads_match_sequential() {
        let data = block(2, 500_000);
        let cache = Arc::new(cache_of(&[data.clone()], BlockCacheOptions::default()));

        let mut handles = Vec::new();
        for t in 0..8usize {
            let cache = cache.clone();
            let expect = data.clone();
            handles.push(std::thread::spawn(move || {
                for k in 0..20usize {
                    let off = (t * 13_337 + k * 7_919) % (expect.len() - 4096);
                    let got = cache.get(0, off, 4096).wait().unwrap();
                    assert_eq!(got.data(), &expect[off..off + 4096]);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn out_of_range_requests_fail() {
        let cache = cache_of(&[block(3, 1000)], BlockCacheOptions::default());
        assert!(cache.get(0, 900, 200).wait().is_err());
        assert!(cache.get(5, 0, 1).wait().is_err());
    }

    #[test]
    fn corrupt_block_poisons_only_that_block() {
        let blocks = [block(4, 100_000), block(5, 100_000)];
        let compressor = CompressionSpec { tag: COMPRESSION_ZSTD, level: None }
            .make_compressor()
            .unwrap();
        let mut image = Vec::new();
        let mut offsets = Vec::new();
        for (i, data) in blocks.iter().enumerate() {
            let mut payload = compressor.compress(data, None).unwrap();
            if i == 0 {
                // Corrupt the codec stream but leave the checksum valid
                // by recomputing the section afterwards.
                let mid = payload.len() / 2;
                payload[mid] ^= 0xff;
            }
            offsets.push(image.len() as u64);
            image.extend(write_section(i as u32, SectionType::Block, COMPRESSION_ZSTD, &payload));
        }
        let image = Arc::new(image);
        let mut cache = BlockCache::new(
            image.clone(),
            BlockCacheOptions { disable_block_integrity_check: true, ..Default::default() },
        );
        for &at in &offsets {
            cache.insert(FsSection::parse(&image, at).unwrap());
        }

        let err = cache.get(0, 0, 1000).wait().unwrap_err();
        assert!(matches!(err, Error::DecompressionFailed { .. }));
        // Poisoned stays poisoned, without re-decoding.
        assert!(cache.get(0, 0, 1).wait().is_err());
        // The healthy block still works.
        assert_eq!(cache.get(1, 0, 100).wait().unwrap().data(), &blocks[1][..100]);
    }

    #[test]
    fn eviction_respects_max_bytes() {
        let blocks: Vec<Vec<u8>> = (0..6).map(|i| block(i, 100_000)).collect();
        let options = BlockCacheOptions { max_bytes: 250_000, ..Default::default() };
        let cache = cache_of(&blocks, options);

        for (i, b) in blocks.iter().enumerate() {
            assert_eq!(cache.get(i, 0, 100).wait().unwrap().data(), &b[..100]);
        }
        // Let decodes finish, then confirm the budget holds.
        std::thread::sleep(Duration::from_millis(200));
        for (i, b) in blocks.iter().enumerate() {
            assert_eq!(cache.get(i, 50, 100).wait().unwrap().data(), &b[50..150]);
        }
        let total = cache.state.lock().unwrap().total_bytes;
        assert!(total <= 250_000 + 100_000, "cache holds {total} bytes");
    }

    #[test]
    fn expiry_tidy_empties_the_cache() {
        let cache = cache_of(&[block(9, 50_000)], BlockCacheOptions::default());
        cache.set_tidy_config(CacheTidyConfig {
            strategy:    CacheTidyStrategy::ExpiryTime,
            interval:    Duration::from_millis(20),
            expiry_time: Duration::from_millis(50),
        });

        cache.get(0, 0, 100).wait().unwrap();
        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(cache.state.lock().unwrap().entries.len(), 0);
    }

    #[test]
    fn sequential_reads_prefetch_the_next_block() {
        let blocks: Vec<Vec<u8>> = (0..2).map(|i| block(i, 100_000)).collect();
        let options = BlockCacheOptions {
            sequential_access_detector_threshold: 3,
            ..Default::default()
        };
        let cache = cache_of(&blocks, options);

        for k in 0..4 {
            cache.get(0, k * 1000, 1000).wait().unwrap();
        }
        std::thread::sleep(Duration::from_millis(200));
        assert!(cache.state.lock().unwrap().entries.contains_key(&1));
    }

    #[test]
    fn ready_ranges_survive_eviction() {
        let cache = cache_of(&[block(7, 80_000)], BlockCacheOptions::default());
        let range = cache.get(0, 10, 100).wait().unwrap();
        {
            let mut state = cache.state.lock().unwrap();
            // Wait for READY, then force-drop the entry.
            drop(state.entries.drain());
            state.total_bytes = 0;
        }
        assert_eq!(range.len(), 100);
        let _ = range.data()[0];
    }
}
