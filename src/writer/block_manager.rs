//! Logical → physical block renumbering.
//!
//! Segmenters claim logical block numbers under a short critical section
//! as they close blocks; the filesystem writer records the physical
//! position each block actually lands at.  Chunk tables are rewritten to
//! physical indices at commit time.

use std::sync::Mutex;

use crate::segmenter::FragmentChunk;

#[derive(Default)]
struct State {
    num_blocks: usize,
    /// Indexed by logical block number: `(physical, category)`.
    block_map:  Vec<Option<(usize, u32)>>,
}

#[derive(Default)]
pub struct BlockManager {
    state: Mutex<State>,
}

impl BlockManager {
    pub fn new() -> Self {
        BlockManager::default()
    }

    /// Claim the next logical block number.
    pub fn claim_logical_block(&self) -> usize {
        let mut state = self.state.lock().unwrap();
        let n = state.num_blocks;
        state.num_blocks += 1;
        n
    }

    /// Record where a logical block landed in the physical stream.
    pub fn set_written_block(&self, logical: usize, written: usize, category: u32) {
        let mut state = self.state.lock().unwrap();
        assert!(logical < state.num_blocks);
        if state.block_map.len() < state.num_blocks {
            let num_blocks = state.num_blocks;
            state.block_map.resize(num_blocks, None);
        }
        state.block_map[logical] = Some((written, category));
    }

    pub fn num_blocks(&self) -> usize {
        self.state.lock().unwrap().num_blocks
    }

    /// Rewrite every data chunk in `chunks` from logical to physical
    /// block numbers.  Hole chunks are untouched.
    pub fn map_logical_blocks(&self, chunks: &mut [FragmentChunk]) {
        let state = self.state.lock().unwrap();
        for chunk in chunks {
            if let FragmentChunk::Data(c) = chunk {
                let mapping = state
                    .block_map
                    .get(c.block as usize)
                    .copied()
                    .flatten()
                    .expect("logical block was never written");
                c.block = mapping.0 as u32;
            }
        }
    }

    /// Category of every written block, in physical order.
    pub fn written_block_categories(&self) -> Vec<u32> {
        let state = self.state.lock().unwrap();
        let mut result = vec![0u32; state.num_blocks];
        for mapping in state.block_map.iter().flatten() {
            result[mapping.0] = mapping.1;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segmenter::Chunk;

    #[test]
    fn renumbers_chunks_to_physical_order() {
        let mgr = BlockManager::new();
        assert_eq!(mgr.claim_logical_block(), 0);
        assert_eq!(mgr.claim_logical_block(), 1);
        assert_eq!(mgr.claim_logical_block(), 2);

        // Blocks finish out of order.
        mgr.set_written_block(2, 0, 7);
        mgr.set_written_block(0, 1, 7);
        mgr.set_written_block(1, 2, 9);

        let mut chunks = vec![
            FragmentChunk::Data(Chunk { block: 0, offset: 0, size: 10 }),
            FragmentChunk::Hole { size: 100 },
            FragmentChunk::Data(Chunk { block: 2, offset: 5, size: 3 }),
        ];
        mgr.map_logical_blocks(&mut chunks);

        assert_eq!(chunks[0], FragmentChunk::Data(Chunk { block: 1, offset: 0, size: 10 }));
        assert_eq!(chunks[1], FragmentChunk::Hole { size: 100 });
        assert_eq!(chunks[2], FragmentChunk::Data(Chunk { block: 0, offset: 5, size: 3 }));

        assert_eq!(mgr.written_block_categories(), vec![7, 7, 9]);
    }
}
