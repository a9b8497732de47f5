//! The filesystem writer: scan, order, segment, compress, freeze, frame.
//!
//! Blocks closed by the segmenter are compressed on a worker pool and
//! written in submission order; the block manager records where each
//! logical block landed so chunk tables can be rewritten to physical
//! indices before the metadata is frozen.  Backpressure comes from the
//! bounded worker queue (a segmenter stalls in `add_chunkable` while all
//! downstream compression slots are busy) and a credit-based memory
//! throttle sized from the compressor's own estimates.
//!
//! Any failure while encoding aborts the writer; the partially-written
//! image is the caller's to discard.

pub mod block_manager;
pub mod categorizer;
pub mod entry;
pub mod filter;
pub mod nilsimsa;
pub mod ordering;
pub mod scanner;
pub mod similarity;

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use crossbeam_channel::{bounded, unbounded, Receiver};

use crate::codec::{
    BlockCompressor, CompressionSpec, COMPRESSION_NONE, COMPRESSION_ZSTD,
};
use crate::error::{Error, Result};
use crate::history::History;
use crate::metadata::{self, FreezeInput, MetadataOptions};
use crate::section::{self, SectionType};
use crate::segmenter::{FragmentChunk, Segmenter, SegmenterConfig, SegmenterStats};
use crate::worker::{MemoryThrottle, WorkerGroup};
use block_manager::BlockManager;
use categorizer::{Categorizer, CategoryFragment, CategoryId, RawCategorizer};
use ordering::{order_by_nilsimsa, order_by_similarity, order_files, FileOrder, OrderCandidate};
use scanner::{ScanOptions, ScanResult};

// ── Options ──────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct WriterOptions {
    pub scan:                 ScanOptions,
    pub segmenter:            SegmenterConfig,
    pub metadata:             MetadataOptions,
    pub order:                FileOrder,
    pub block_compression:    CompressionSpec,
    pub metadata_compression: CompressionSpec,
    pub history_compression:  CompressionSpec,
    /// Compression worker threads; 0 selects the CPU count.
    pub num_workers:          usize,
    /// Credit budget for concurrent compressor working sets.
    pub memory_limit:         u64,
    pub no_section_index:     bool,
    pub no_history:           bool,
    /// Recorded in the HISTORY section.
    pub history_arguments:    Vec<String>,
    pub categorizer:          Option<Arc<dyn Categorizer>>,
}

impl Default for WriterOptions {
    fn default() -> Self {
        WriterOptions {
            scan:                 ScanOptions::default(),
            segmenter:            SegmenterConfig::default(),
            metadata:             MetadataOptions::default(),
            order:                FileOrder::Nilsimsa {
                max_children:     16384,
                max_cluster_size: 16384,
            },
            block_compression:    CompressionSpec { tag: COMPRESSION_ZSTD, level: None },
            metadata_compression: CompressionSpec { tag: COMPRESSION_ZSTD, level: None },
            history_compression:  CompressionSpec { tag: COMPRESSION_ZSTD, level: None },
            num_workers:          0,
            memory_limit:         1 << 30,
            no_section_index:     false,
            no_history:           false,
            history_arguments:    Vec::new(),
            categorizer:          None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WriterStats {
    pub image_size:        u64,
    pub sections_written:  u32,
    pub blocks_written:    u64,
    pub input_bytes:       u64,
    pub matched_bytes:     u64,
    pub hole_bytes:        u64,
    pub unique_files:      u64,
    pub duplicate_files:   u64,
    pub compressed_bytes:  u64,
}

// ── Section stream ───────────────────────────────────────────────────────────

struct SectionStream<W: Write> {
    out:    W,
    offset: u64,
    number: u32,
    index:  Vec<u64>,
}

impl<W: Write> SectionStream<W> {
    fn new(out: W) -> Self {
        SectionStream { out, offset: 0, number: 0, index: Vec::new() }
    }

    fn write_section(&mut self, kind: SectionType, compression: u16, payload: &[u8]) -> Result<u64> {
        let bytes = section::write_section(self.number, kind, compression, payload);
        self.out.write_all(&bytes)?;
        self.index.push(section::index_word(kind as u16, self.offset));
        let at = self.offset;
        self.offset += bytes.len() as u64;
        self.number += 1;
        Ok(at)
    }
}

// ── Block pipeline ───────────────────────────────────────────────────────────

struct PendingBlock {
    logical:  u32,
    category: CategoryId,
    rx:       Receiver<Result<(u16, Vec<u8>)>>,
}

struct BlockPipeline<'a, W: Write> {
    stream:   &'a mut SectionStream<W>,
    blkmgr:   Arc<BlockManager>,
    pending:  VecDeque<PendingBlock>,
    physical: usize,
    stats:    WriterStats,
}

impl<W: Write> BlockPipeline<'_, W> {
    /// Write every block whose compression already finished, in
    /// submission order.  With `block_on_head` the head of the queue is
    /// awaited, draining everything.
    fn drain(&mut self, block_on_head: bool) -> Result<()> {
        while let Some(front) = self.pending.front() {
            let result = if block_on_head {
                match front.rx.recv() {
                    Ok(r) => r,
                    Err(_) => Err(Error::ResourceExhausted("compression worker vanished".into())),
                }
            } else {
                match front.rx.try_recv() {
                    Ok(r) => r,
                    Err(crossbeam_channel::TryRecvError::Empty) => return Ok(()),
                    Err(crossbeam_channel::TryRecvError::Disconnected) => {
                        Err(Error::ResourceExhausted("compression worker vanished".into()))
                    }
                }
            };
            let front = self.pending.pop_front().unwrap();
            let (compression, payload) = result?;

            self.stream.write_section(SectionType::Block, compression, &payload)?;
            self.blkmgr.set_written_block(front.logical as usize, self.physical, front.category);
            self.physical += 1;
            self.stats.blocks_written += 1;
            self.stats.compressed_bytes += payload.len() as u64;
        }
        Ok(())
    }
}

// ── Writer ───────────────────────────────────────────────────────────────────

/// Scan `root` and write a complete image to `out`.
pub fn write_image<W: Write>(out: W, root: &Path, options: &WriterOptions) -> Result<WriterStats> {
    let scan_result = scanner::scan(root, &options.scan)?;
    write_scanned(out, scan_result, options)
}

fn write_scanned<W: Write>(
    out:         W,
    scan_result: ScanResult,
    options:     &WriterOptions,
) -> Result<WriterStats> {
    let ScanResult { tree, unique_of, unique_files, stats: scan_stats } = scan_result;
    let categorizer: Arc<dyn Categorizer> = options
        .categorizer
        .clone()
        .unwrap_or_else(|| Arc::new(RawCategorizer));
    let compressor: Arc<dyn BlockCompressor> = options.block_compression.make_compressor()?.into();

    // Pass 1: categorize every unique file and compute the ordering keys
    // the chosen order needs.  Contents are read one file at a time and
    // dropped again.
    let mut fragments: Vec<Vec<CategoryFragment>> = Vec::with_capacity(unique_files.len());
    let mut sim_keys: Vec<u32> = Vec::new();
    let mut digests: Vec<nilsimsa::NilsimsaDigest> = Vec::new();
    let mut paths: Vec<String> = Vec::with_capacity(unique_files.len());
    for uf in &unique_files {
        let path = tree.path_of(uf.entry);
        let content = read_source(&tree, uf.entry)?;
        fragments.push(categorizer.categorize(&path, &content));
        match &options.order {
            FileOrder::Similarity => sim_keys.push(similarity::similarity_hash(&content)),
            FileOrder::Nilsimsa { .. } => digests.push(nilsimsa::nilsimsa_digest(&content)),
            _ => {}
        }
        paths.push(path);
    }

    let mut stream = SectionStream::new(out);
    let blkmgr = Arc::new(BlockManager::new());
    let workers = Arc::new(WorkerGroup::new(
        "compress",
        options.num_workers,
        2 * options.num_workers.max(1).max(num_cpus::get()),
    ));
    let throttle = MemoryThrottle::new(options.memory_limit.max(1));
    let (pending_tx, pending_rx) = unbounded::<PendingBlock>();

    let mut pipeline = BlockPipeline {
        stream:   &mut stream,
        blkmgr:   blkmgr.clone(),
        pending:  VecDeque::new(),
        physical: 0,
        stats:    WriterStats::default(),
    };

    // Which categories exist, and which unique files have data in each.
    let mut members: BTreeMap<CategoryId, Vec<usize>> = BTreeMap::new();
    for (u, frags) in fragments.iter().enumerate() {
        for f in frags {
            members.entry(f.category).or_default().push(u);
        }
    }
    for list in members.values_mut() {
        list.dedup();
    }

    // Per category: order members, segment their fragments in order.
    let mut chunks_of: Vec<Vec<(u64, Vec<FragmentChunk>)>> = vec![Vec::new(); unique_files.len()];
    let mut seg_stats = SegmenterStats::default();

    for (&category, member_list) in &members {
        let order = order_members(options, member_list, &paths, &sim_keys, &digests);

        let block_ready = {
            let pending_tx = pending_tx.clone();
            let compressor = compressor.clone();
            let workers = workers.clone();
            let throttle = throttle.clone();
            let tag = options.block_compression.tag;
            Box::new(move |logical: u32, data: Arc<Vec<u8>>| {
                let (tx, rx) = bounded::<Result<(u16, Vec<u8>)>>(1);
                let _ = pending_tx.send(PendingBlock { logical, category, rx });
                let compressor = compressor.clone();
                let throttle = throttle.clone();
                workers.add_job(move || {
                    let credit = throttle.request(compressor.estimate_memory_usage(data.len()));
                    let result = compressor.compress(&data, None).map(|compressed| {
                        // A block the codec can't shrink is stored raw.
                        if compressed.len() >= data.len() {
                            (COMPRESSION_NONE, data.to_vec())
                        } else {
                            (tag, compressed)
                        }
                    });
                    let _ = tx.send(result);
                    drop(credit);
                });
            })
        };

        let mut seg = Segmenter::new(
            &options.segmenter,
            &compressor.constraints(),
            blkmgr.clone(),
            block_ready,
        );

        for &u in &order {
            let content = read_source(&tree, unique_files[u].entry)?;
            for frag in fragments[u].iter().filter(|f| f.category == category) {
                let data = &content[frag.range.start as usize..frag.range.end as usize];
                let chunks = seg.add_chunkable(data);
                chunks_of[u].push((frag.range.start, chunks));
            }
            while let Ok(p) = pending_rx.try_recv() {
                pipeline.pending.push_back(p);
            }
            pipeline.drain(false)?;
        }

        let s = seg.finish();
        seg_stats.input_bytes += s.input_bytes;
        seg_stats.matched_bytes += s.matched_bytes;
        seg_stats.hole_bytes += s.hole_bytes;
        seg_stats.blocks_closed += s.blocks_closed;
    }

    // Everything is queued; wait for the compressors and flush in order.
    drop(pending_tx);
    while let Ok(p) = pending_rx.recv() {
        pipeline.pending.push_back(p);
    }
    pipeline.drain(true)?;
    workers.wait();

    let mut stats = pipeline.stats;
    let block_count = pipeline.physical as u64;

    // Assemble final chunk lists: fragment order by file offset, logical
    // block numbers rewritten to physical.
    let mut chunk_lists: Vec<Vec<FragmentChunk>> = Vec::with_capacity(unique_files.len());
    for (u, mut parts) in chunks_of.into_iter().enumerate() {
        parts.sort_by_key(|&(start, _)| start);
        let mut list: Vec<FragmentChunk> = parts.into_iter().flat_map(|(_, c)| c).collect();
        blkmgr.map_logical_blocks(&mut list);

        let total: u64 = list.iter().map(|c| c.size()).sum();
        if total != unique_files[u].size {
            return Err(Error::corrupted(format!(
                "chunk coverage {} of file '{}' does not match size {}",
                total, paths[u], unique_files[u].size
            )));
        }
        chunk_lists.push(list);
    }

    // Freeze and write the metadata pair.
    let block_categories = blkmgr.written_block_categories();
    let frozen = metadata::freeze(
        &FreezeInput {
            tree:             &tree,
            unique_of:        &unique_of,
            chunk_lists:      &chunk_lists,
            block_count,
            block_categories: &block_categories,
            block_size_bits:  options.segmenter.block_size_bits,
        },
        &options.metadata,
    )?;
    let meta_compressor = options.metadata_compression.make_compressor()?;
    for (kind, payload) in [
        (SectionType::MetadataV2Schema, &frozen.schema),
        (SectionType::MetadataV2, &frozen.data),
    ] {
        let (tag, bytes) = compress_section(meta_compressor.as_ref(), payload)?;
        stream.write_section(kind, tag, &bytes)?;
    }

    if !options.no_history {
        let mut history = History::new();
        history.append(options.history_arguments.clone());
        let payload = history.to_bytes()?;
        let hist_compressor = options.history_compression.make_compressor()?;
        let (tag, bytes) = compress_section(hist_compressor.as_ref(), &payload)?;
        stream.write_section(SectionType::History, tag, &bytes)?;
    }

    if !options.no_section_index {
        // The index lists every prior section plus itself, so readers can
        // locate it from the last eight bytes of the image.
        let mut entries = stream.index.clone();
        entries.push(section::index_word(SectionType::SectionIndex as u16, stream.offset));
        let payload = section::encode_index(&entries);
        stream.write_section(SectionType::SectionIndex, COMPRESSION_NONE, &payload)?;
    }

    stream.out.flush()?;

    stats.image_size = stream.offset;
    stats.sections_written = stream.number;
    stats.input_bytes = seg_stats.input_bytes;
    stats.matched_bytes = seg_stats.matched_bytes;
    stats.hole_bytes = seg_stats.hole_bytes;
    stats.unique_files = unique_files.len() as u64;
    stats.duplicate_files = scan_stats.duplicate_files;
    Ok(stats)
}

fn order_members(
    options:  &WriterOptions,
    members:  &[usize],
    paths:    &[String],
    sim_keys: &[u32],
    digests:  &[nilsimsa::NilsimsaDigest],
) -> Vec<usize> {
    let member_paths: Vec<&str> = members.iter().map(|&u| paths[u].as_str()).collect();
    let perm = match &options.order {
        FileOrder::Similarity => {
            let keys: Vec<u32> = members.iter().map(|&u| sim_keys[u]).collect();
            order_by_similarity(&keys, &member_paths)
        }
        FileOrder::Nilsimsa { max_children, max_cluster_size } => {
            let d: Vec<nilsimsa::NilsimsaDigest> = members.iter().map(|&u| digests[u]).collect();
            order_by_nilsimsa(
                &d,
                &member_paths,
                &nilsimsa::NilsimsaOptions {
                    max_children:     *max_children,
                    max_cluster_size: *max_cluster_size,
                },
            )
        }
        other => {
            let candidates: Vec<OrderCandidate<'_>> = member_paths
                .iter()
                .map(|&path| OrderCandidate { path, content: &[] })
                .collect();
            order_files(other, &candidates)
        }
    };
    perm.into_iter().map(|i| members[i]).collect()
}

fn read_source(tree: &entry::EntryTree, id: entry::EntryId) -> Result<Vec<u8>> {
    let path = tree.get(id).source.as_ref().ok_or_else(|| {
        Error::InvalidArgument(format!("entry '{}' has no source path", tree.path_of(id)))
    })?;
    Ok(fs::read(path)?)
}

fn compress_section(compressor: &dyn BlockCompressor, payload: &[u8]) -> Result<(u16, Vec<u8>)> {
    let compressed = compressor.compress(payload, None)?;
    if compressed.len() >= payload.len() {
        Ok((COMPRESSION_NONE, payload.to_vec()))
    } else {
        Ok((compressor.compression_type(), compressed))
    }
}
