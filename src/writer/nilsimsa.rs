//! Nilsimsa: a 256-bit locality-sensitive hash, plus the greedy
//! clustering that orders similar files adjacently.
//!
//! Trigrams over a sliding five-byte window feed a 256-bucket
//! accumulator; the digest sets bit `i` when bucket `i` exceeds the mean.
//! Similar inputs produce digests at small hamming distance.
//!
//! Clustering is greedy nearest-neighbour chaining and would go
//! quadratic if left unbounded; `max_children` caps the candidate window
//! scanned per step and `max_cluster_size` caps a chain before it is
//! re-seeded from path order.  Ties always break towards the earlier
//! path so the output is deterministic.

use crate::segmenter::splitmix64;

pub const DIGEST_BITS: usize = 256;

/// Byte substitution table for the trigram mix, generated by a seeded
/// Fisher–Yates shuffle so the constants are reproducible.
const TRAN: [u8; 256] = build_tran();

const fn build_tran() -> [u8; 256] {
    let mut t = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        t[i] = i as u8;
        i += 1;
    }
    let mut seed = 0x6a09_e667_f3bc_c908u64;
    let mut i = 255usize;
    while i > 0 {
        seed = splitmix64(seed);
        let j = (seed % (i as u64 + 1)) as usize;
        let tmp = t[i];
        t[i] = t[j];
        t[j] = tmp;
        i -= 1;
    }
    t
}

#[inline]
fn tran3(a: u8, b: u8, c: u8, n: u8) -> u8 {
    let x = TRAN[((a as usize) + (n as usize)) & 255];
    let y = TRAN[b as usize].wrapping_mul(n.wrapping_add(n).wrapping_add(1));
    let z = TRAN[(c ^ TRAN[n as usize]) as usize];
    (x ^ y).wrapping_add(z)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NilsimsaDigest(pub [u8; 32]);

impl NilsimsaDigest {
    pub fn distance(&self, other: &NilsimsaDigest) -> u32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum()
    }
}

pub fn nilsimsa_digest(data: &[u8]) -> NilsimsaDigest {
    let mut acc = [0u32; 256];
    let mut window = [0u8; 4];
    let mut have = 0usize;
    let mut trigrams = 0u64;

    for &ch in data {
        if have >= 2 {
            acc[tran3(ch, window[0], window[1], 0) as usize] += 1;
            trigrams += 1;
        }
        if have >= 3 {
            acc[tran3(ch, window[0], window[2], 1) as usize] += 1;
            acc[tran3(ch, window[1], window[2], 2) as usize] += 1;
            trigrams += 2;
        }
        if have >= 4 {
            acc[tran3(ch, window[0], window[3], 3) as usize] += 1;
            acc[tran3(ch, window[1], window[3], 4) as usize] += 1;
            acc[tran3(ch, window[2], window[3], 5) as usize] += 1;
            acc[tran3(window[3], window[0], ch, 6) as usize] += 1;
            acc[tran3(window[3], window[2], ch, 7) as usize] += 1;
            trigrams += 5;
        }
        window.rotate_right(1);
        window[0] = ch;
        have = (have + 1).min(5);
    }

    let mut digest = [0u8; 32];
    if trigrams > 0 {
        let threshold = trigrams / 256;
        for (i, &count) in acc.iter().enumerate() {
            if count as u64 > threshold {
                digest[i / 8] |= 1 << (i % 8);
            }
        }
    }
    NilsimsaDigest(digest)
}

// ── Clustering ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct NilsimsaOptions {
    /// Candidate window scanned per greedy step.
    pub max_children:     usize,
    /// Chain length before re-seeding from path order.
    pub max_cluster_size: usize,
}

impl Default for NilsimsaOptions {
    fn default() -> Self {
        NilsimsaOptions { max_children: 16384, max_cluster_size: 16384 }
    }
}

/// Order `digests` so that adjacent entries have small hamming distance.
///
/// `by_path` is the index permutation sorted by path; it seeds the chain
/// and breaks every tie, so the result is deterministic.  Returns a
/// permutation of `0..digests.len()`.
pub fn cluster_order(
    digests: &[NilsimsaDigest],
    by_path: &[usize],
    options: &NilsimsaOptions,
) -> Vec<usize> {
    assert_eq!(digests.len(), by_path.len());
    let mut remaining: Vec<usize> = by_path.to_vec();
    let mut order = Vec::with_capacity(digests.len());

    while let Some(seed) = take_first(&mut remaining) {
        order.push(seed);
        let mut current = seed;
        let mut chain = 1usize;

        while chain < options.max_cluster_size.max(1) && !remaining.is_empty() {
            let window = remaining.len().min(options.max_children.max(1));
            let best = nearest_in_window(&digests[current], digests, &remaining[..window]);
            let next = remaining.remove(best);
            order.push(next);
            current = next;
            chain += 1;
        }
    }

    order
}

fn take_first(remaining: &mut Vec<usize>) -> Option<usize> {
    if remaining.is_empty() {
        None
    } else {
        Some(remaining.remove(0))
    }
}

/// Position (within `window`) of the candidate closest to `from`.
/// Ties resolve to the earliest position.
fn nearest_in_window(
    from:    &NilsimsaDigest,
    digests: &[NilsimsaDigest],
    window:  &[usize],
) -> usize {
    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;
        if window.len() >= 1024 {
            return window
                .par_iter()
                .enumerate()
                .map(|(pos, &i)| (from.distance(&digests[i]), pos))
                .min()
                .map(|(_, pos)| pos)
                .unwrap();
        }
    }
    window
        .iter()
        .enumerate()
        .map(|(pos, &i)| (from.distance(&digests[i]), pos))
        .min()
        .map(|(_, pos)| pos)
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_inputs_have_zero_distance() {
        let a = nilsimsa_digest(b"some reasonably long input with actual content in it");
        let b = nilsimsa_digest(b"some reasonably long input with actual content in it");
        assert_eq!(a.distance(&b), 0);
    }

    #[test]
    fn similar_inputs_are_closer_than_dissimilar_ones() {
        let base: Vec<u8> = b"fn process(input: &str) -> Result<Output> { parse(input) }".repeat(40);
        let mut similar = base.clone();
        similar.extend_from_slice(b"fn extra() {}");
        let different: Vec<u8> =
            (0..base.len() as u32).map(|i| (i.wrapping_mul(2654435761) >> 11) as u8).collect();

        let d_base = nilsimsa_digest(&base);
        let d_sim = nilsimsa_digest(&similar);
        let d_diff = nilsimsa_digest(&different);
        assert!(d_base.distance(&d_sim) < d_base.distance(&d_diff));
    }

    #[test]
    fn cluster_order_is_a_permutation() {
        let digests: Vec<NilsimsaDigest> = (0..50u8)
            .map(|i| nilsimsa_digest(&vec![i; 200]))
            .collect();
        let by_path: Vec<usize> = (0..50).collect();
        let mut order = cluster_order(&digests, &by_path, &NilsimsaOptions::default());
        order.sort_unstable();
        assert_eq!(order, by_path);
    }

    #[test]
    fn duplicate_digests_end_up_adjacent() {
        // Three content classes, interleaved in path order.
        let classes = [
            nilsimsa_digest(&b"alpha alpha alpha alpha".repeat(30)),
            nilsimsa_digest(&b"bravo bravo bravo bravo".repeat(30)),
            nilsimsa_digest(&b"charlie charlie charlie".repeat(30)),
        ];
        let digests: Vec<NilsimsaDigest> = (0..30).map(|i| classes[i % 3]).collect();
        let by_path: Vec<usize> = (0..30).collect();
        let order = cluster_order(&digests, &by_path, &NilsimsaOptions::default());

        // Every run of ten identical digests must be contiguous.
        for chunk in order.chunks(10) {
            let class = chunk[0] % 3;
            assert!(chunk.iter().all(|&i| i % 3 == class), "order {order:?}");
        }
    }

    #[test]
    fn cluster_size_cap_reseeds_from_path_order() {
        let digests: Vec<NilsimsaDigest> = (0..9).map(|_| nilsimsa_digest(b"same")).collect();
        let by_path: Vec<usize> = (0..9).collect();
        let opts = NilsimsaOptions { max_children: 4, max_cluster_size: 3 };
        let order = cluster_order(&digests, &by_path, &opts);
        assert_eq!(order.len(), 9);
        // All digests are equal, so chains follow path order exactly.
        assert_eq!(order, by_path);
    }
}
