//! Inode ordering: ranks regular-file inodes per category before they
//! reach the segmenter.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::writer::nilsimsa::{cluster_order, nilsimsa_digest, NilsimsaDigest, NilsimsaOptions};
use crate::writer::similarity::similarity_hash;

/// How regular files are ordered before segmentation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOrder {
    /// Scan order (deterministic, fastest).
    None,
    Path,
    ReversePath,
    /// 32-bit histogram fingerprint, sorted lexicographically.
    Similarity,
    /// 256-bit locality-sensitive clustering.
    Nilsimsa { max_children: usize, max_cluster_size: usize },
    /// Caller-supplied path order; missing paths keep input order at the
    /// end.
    Explicit(Vec<String>),
}

impl FileOrder {
    /// Parse a CLI-style order spec: `none`, `path`, `revpath`,
    /// `similarity`, `nilsimsa[:max-children[:max-cluster-size]]`.
    pub fn parse(s: &str) -> Result<Self> {
        let mut parts = s.split(':');
        let name = parts.next().unwrap_or("");
        let order = match name {
            "none"       => FileOrder::None,
            "path"       => FileOrder::Path,
            "revpath"    => FileOrder::ReversePath,
            "similarity" => FileOrder::Similarity,
            "nilsimsa" => {
                let defaults = NilsimsaOptions::default();
                let max_children = match parts.next() {
                    Some(v) => parse_bound(v, s)?,
                    None    => defaults.max_children,
                };
                let max_cluster_size = match parts.next() {
                    Some(v) => parse_bound(v, s)?,
                    None    => defaults.max_cluster_size,
                };
                FileOrder::Nilsimsa { max_children, max_cluster_size }
            }
            _ => return Err(Error::InvalidArgument(format!("unknown file order '{s}'"))),
        };
        if parts.next().is_some() {
            return Err(Error::InvalidArgument(format!("trailing options in file order '{s}'")));
        }
        Ok(order)
    }

    /// Whether this ordering needs file content.
    pub fn needs_content(&self) -> bool {
        matches!(self, FileOrder::Similarity | FileOrder::Nilsimsa { .. })
    }
}

fn parse_bound(v: &str, spec: &str) -> Result<usize> {
    v.parse::<usize>()
        .ok()
        .filter(|&n| n > 0)
        .ok_or_else(|| Error::InvalidArgument(format!("bad bound '{v}' in file order '{spec}'")))
}

/// One orderable file.  `content` is only consulted by the
/// content-based orderings.
pub struct OrderCandidate<'a> {
    pub path:    &'a str,
    pub content: &'a [u8],
}

/// Produce the segmentation order as a permutation of `0..candidates.len()`.
///
/// Every ordering is total and deterministic; content-based orderings
/// break ties by path.
pub fn order_files(order: &FileOrder, candidates: &[OrderCandidate<'_>]) -> Vec<usize> {
    let n = candidates.len();
    match order {
        FileOrder::None => (0..n).collect(),

        FileOrder::Path => {
            let mut idx: Vec<usize> = (0..n).collect();
            idx.sort_by(|&a, &b| candidates[a].path.cmp(candidates[b].path));
            idx
        }

        FileOrder::ReversePath => {
            let rev = |i: usize| -> Vec<&str> {
                candidates[i].path.rsplit('/').collect()
            };
            let mut idx: Vec<usize> = (0..n).collect();
            idx.sort_by(|&a, &b| rev(a).cmp(&rev(b)).then_with(|| {
                candidates[a].path.cmp(candidates[b].path)
            }));
            idx
        }

        FileOrder::Similarity => {
            let keys: Vec<u32> = map_content(candidates, |c| similarity_hash(c.content));
            let paths: Vec<&str> = candidates.iter().map(|c| c.path).collect();
            order_by_similarity(&keys, &paths)
        }

        FileOrder::Nilsimsa { max_children, max_cluster_size } => {
            let digests: Vec<NilsimsaDigest> =
                map_content(candidates, |c| nilsimsa_digest(c.content));
            let paths: Vec<&str> = candidates.iter().map(|c| c.path).collect();
            order_by_nilsimsa(
                &digests,
                &paths,
                &NilsimsaOptions {
                    max_children:     *max_children,
                    max_cluster_size: *max_cluster_size,
                },
            )
        }

        FileOrder::Explicit(paths) => {
            let rank: HashMap<&str, usize> =
                paths.iter().enumerate().map(|(i, p)| (p.as_str(), i)).collect();
            let mut listed: Vec<usize> = Vec::new();
            let mut rest: Vec<usize> = Vec::new();
            for i in 0..n {
                match rank.get(candidates[i].path) {
                    Some(_) => listed.push(i),
                    None    => rest.push(i),
                }
            }
            listed.sort_by_key(|&i| rank[candidates[i].path]);
            listed.extend(rest);
            listed
        }
    }
}

/// Lexicographic order of the 32-bit fingerprints, path tie-break.
pub fn order_by_similarity(keys: &[u32], paths: &[&str]) -> Vec<usize> {
    let mut idx: Vec<usize> = (0..keys.len()).collect();
    idx.sort_by(|&a, &b| keys[a].cmp(&keys[b]).then_with(|| paths[a].cmp(paths[b])));
    idx
}

/// Greedy nilsimsa clustering, seeded and tie-broken by path order.
pub fn order_by_nilsimsa(
    digests: &[NilsimsaDigest],
    paths:   &[&str],
    options: &NilsimsaOptions,
) -> Vec<usize> {
    let mut by_path: Vec<usize> = (0..digests.len()).collect();
    by_path.sort_by(|&a, &b| paths[a].cmp(paths[b]));
    cluster_order(digests, &by_path, options)
}

/// Content hashing for the content-based orderings, parallel when the
/// worker-pool feature is enabled.
fn map_content<T: Send>(
    candidates: &[OrderCandidate<'_>],
    f: impl Fn(&OrderCandidate<'_>) -> T + Send + Sync,
) -> Vec<T> {
    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;
        return candidates.par_iter().map(&f).collect();
    }
    #[cfg(not(feature = "parallel"))]
    candidates.iter().map(f).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidates<'a>(specs: &'a [(&'a str, &'a [u8])]) -> Vec<OrderCandidate<'a>> {
        specs.iter().map(|&(path, content)| OrderCandidate { path, content }).collect()
    }

    #[test]
    fn parse_specs() {
        assert_eq!(FileOrder::parse("path").unwrap(), FileOrder::Path);
        assert_eq!(FileOrder::parse("revpath").unwrap(), FileOrder::ReversePath);
        assert_eq!(
            FileOrder::parse("nilsimsa:100:200").unwrap(),
            FileOrder::Nilsimsa { max_children: 100, max_cluster_size: 200 }
        );
        assert!(FileOrder::parse("nilsimsa:0").is_err());
        assert!(FileOrder::parse("alphabetical").is_err());
        assert!(FileOrder::parse("path:x").is_err());
    }

    #[test]
    fn path_order() {
        let c = candidates(&[("b/x", b""), ("a/y", b""), ("a/x", b"")]);
        assert_eq!(order_files(&FileOrder::Path, &c), vec![2, 1, 0]);
    }

    #[test]
    fn reverse_path_groups_by_file_name() {
        let c = candidates(&[
            ("src/a.c", b""),
            ("doc/b.txt", b""),
            ("lib/a.c", b""),
        ]);
        let order = order_files(&FileOrder::ReversePath, &c);
        // Both a.c files sort adjacent despite different directories.
        let pos_of = |i: usize| order.iter().position(|&x| x == i).unwrap();
        assert_eq!(pos_of(0).abs_diff(pos_of(2)), 1);
    }

    #[test]
    fn explicit_order_appends_missing_in_input_order() {
        let c = candidates(&[("a", b""), ("b", b""), ("c", b""), ("d", b"")]);
        let order = order_files(
            &FileOrder::Explicit(vec!["c".to_owned(), "a".to_owned()]),
            &c,
        );
        assert_eq!(order, vec![2, 0, 1, 3]);
    }

    #[test]
    fn similarity_groups_equal_content() {
        let text = b"very textual content indeed".repeat(30);
        let bin: Vec<u8> = (0..600u32).map(|i| (i.wrapping_mul(40503) >> 7) as u8).collect();
        let items = [
            ("1", text.as_slice()),
            ("2", bin.as_slice()),
            ("3", text.as_slice()),
            ("4", bin.as_slice()),
        ];
        let c = candidates(&items);
        let order = order_files(&FileOrder::Similarity, &c);
        let pos_of = |i: usize| order.iter().position(|&x| x == i).unwrap();
        assert_eq!(pos_of(0).abs_diff(pos_of(2)), 1);
        assert_eq!(pos_of(1).abs_diff(pos_of(3)), 1);
    }

    #[test]
    fn every_order_is_a_permutation() {
        let data = b"data".repeat(10);
        let items = [("x", data.as_slice()), ("y", data.as_slice()), ("z", data.as_slice())];
        let c = candidates(&items);
        for order in [
            FileOrder::None,
            FileOrder::Path,
            FileOrder::ReversePath,
            FileOrder::Similarity,
            FileOrder::Nilsimsa { max_children: 2, max_cluster_size: 2 },
            FileOrder::Explicit(vec!["z".to_owned()]),
        ] {
            let mut p = order_files(&order, &c);
            p.sort_unstable();
            assert_eq!(p, vec![0, 1, 2], "order {order:?}");
        }
    }
}
