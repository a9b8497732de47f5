//! Source-tree scanner.
//!
//! Walks the input tree in deterministic name order, applies the entry
//! filter and metadata transforms, builds the entry graph, and
//! deduplicates regular files by content hash.  Hashing is at-most-once:
//! files whose size is unique in the tree are never hashed at all, and
//! no file is hashed twice.

use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::Path;

use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::writer::entry::{Entry, EntryId, EntryKind, EntryStat, EntryTree};
use crate::writer::filter::EntryFilter;

#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    pub filter:    EntryFilter,
    /// Override the owner of every entry.
    pub uid:       Option<u32>,
    /// Override the group of every entry.
    pub gid:       Option<u32>,
    /// Override every timestamp (seconds since the epoch).
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ScanStats {
    pub entries_scanned: u64,
    pub entries_excluded: u64,
    pub regular_files:   u64,
    pub duplicate_files: u64,
    pub hashed_files:    u64,
    pub total_file_bytes: u64,
}

/// One distinct file content; `entry` is the first entry seen with it.
#[derive(Debug, Clone, Copy)]
pub struct UniqueFile {
    pub entry: EntryId,
    pub size:  u64,
}

pub struct ScanResult {
    pub tree:         EntryTree,
    /// Arena-indexed: content id for regular files, `None` otherwise.
    pub unique_of:    Vec<Option<u32>>,
    pub unique_files: Vec<UniqueFile>,
    pub stats:        ScanStats,
}

pub fn scan(root: &Path, options: &ScanOptions) -> Result<ScanResult> {
    let root_md = fs::metadata(root)?;
    if !root_md.is_dir() {
        return Err(Error::InvalidArgument(format!(
            "scan root '{}' is not a directory",
            root.display()
        )));
    }

    let mut stats = ScanStats::default();
    let mut tree = EntryTree::new(apply_overrides(stat_of(&root_md, EntryKind::Directory), options));

    // (depth, entry) stack mapping walkdir depths onto tree parents.
    let mut dirs: Vec<(usize, EntryId)> = vec![(0, EntryTree::ROOT)];
    // Regular files in scan order: (entry, size, path).
    let mut files: Vec<(EntryId, u64)> = Vec::new();

    let mut it = WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter();

    while let Some(item) = it.next() {
        let item = item.map_err(|e| Error::Io(std::io::Error::other(e)))?;
        stats.entries_scanned += 1;

        let rel = item
            .path()
            .strip_prefix(root)
            .map_err(|_| Error::corrupted("walked entry outside scan root"))?
            .to_string_lossy()
            .replace('\\', "/");
        let file_type = item.file_type();

        if !options.filter.accepts(&rel, file_type.is_dir()) {
            stats.entries_excluded += 1;
            if file_type.is_dir() {
                it.skip_current_dir();
            }
            continue;
        }

        let md = fs::symlink_metadata(item.path())?;
        let kind = kind_of(&md);
        let stat = apply_overrides(stat_of(&md, kind), options);
        let name = item.file_name().to_string_lossy().into_owned();

        while dirs.last().map(|&(d, _)| d >= item.depth()).unwrap_or(false) {
            dirs.pop();
        }
        let parent = dirs.last().map(|&(_, id)| id).unwrap_or(EntryTree::ROOT);

        let entry = Entry {
            name,
            kind,
            stat,
            parent,
            children: Vec::new(),
            target: if kind == EntryKind::Symlink {
                Some(fs::read_link(item.path())?.to_string_lossy().into_owned())
            } else {
                None
            },
            source: (kind == EntryKind::File).then(|| item.path().to_path_buf()),
        };
        let id = tree.add_child(parent, entry);

        match kind {
            EntryKind::Directory => dirs.push((item.depth(), id)),
            EntryKind::File => {
                stats.regular_files += 1;
                stats.total_file_bytes += md.len();
                files.push((id, md.len()));
            }
            _ => {}
        }
    }

    tree.sort_children();

    let (unique_of, unique_files) = deduplicate(&tree, &files, &mut stats)?;
    Ok(ScanResult { tree, unique_of, unique_files, stats })
}

// ── Deduplication ────────────────────────────────────────────────────────────

fn deduplicate(
    tree:  &EntryTree,
    files: &[(EntryId, u64)],
    stats: &mut ScanStats,
) -> Result<(Vec<Option<u32>>, Vec<UniqueFile>)> {
    // Files whose size is unique can't be duplicates; only the rest are
    // hashed.
    let mut by_size: HashMap<u64, u32> = HashMap::new();
    for &(_, size) in files {
        *by_size.entry(size).or_default() += 1;
    }

    let need_hash: Vec<EntryId> = files
        .iter()
        .filter(|&&(_, size)| by_size[&size] > 1)
        .map(|&(id, _)| id)
        .collect();
    stats.hashed_files = need_hash.len() as u64;

    let hashes: Vec<(EntryId, [u8; 32])> = hash_files(tree, &need_hash)?;
    let hash_of: HashMap<EntryId, [u8; 32]> = hashes.into_iter().collect();

    let mut unique_of = vec![None; tree.len()];
    let mut unique_files = Vec::new();
    let mut by_content: HashMap<(u64, [u8; 32]), u32> = HashMap::new();

    for &(id, size) in files {
        let unique = match hash_of.get(&id) {
            Some(&hash) => match by_content.get(&(size, hash)) {
                Some(&u) => {
                    stats.duplicate_files += 1;
                    u
                }
                None => {
                    let u = unique_files.len() as u32;
                    by_content.insert((size, hash), u);
                    unique_files.push(UniqueFile { entry: id, size });
                    u
                }
            },
            None => {
                let u = unique_files.len() as u32;
                unique_files.push(UniqueFile { entry: id, size });
                u
            }
        };
        unique_of[id as usize] = Some(unique);
    }

    Ok((unique_of, unique_files))
}

fn hash_files(tree: &EntryTree, entries: &[EntryId]) -> Result<Vec<(EntryId, [u8; 32])>> {
    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;
        return entries
            .par_iter()
            .map(|&id| Ok((id, hash_one(tree, id)?)))
            .collect();
    }
    #[cfg(not(feature = "parallel"))]
    entries.iter().map(|&id| Ok((id, hash_one(tree, id)?))).collect()
}

fn hash_one(tree: &EntryTree, id: EntryId) -> Result<[u8; 32]> {
    let path = tree.get(id).source.as_ref().ok_or_else(|| {
        Error::InvalidArgument(format!("entry '{}' has no source path", tree.path_of(id)))
    })?;
    let mut file = fs::File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; 256 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(*hasher.finalize().as_bytes())
}

// ── Stat extraction ──────────────────────────────────────────────────────────

fn apply_overrides(mut stat: EntryStat, options: &ScanOptions) -> EntryStat {
    if let Some(uid) = options.uid {
        stat.uid = uid;
    }
    if let Some(gid) = options.gid {
        stat.gid = gid;
    }
    if let Some(t) = options.timestamp {
        stat.atime = t;
        stat.mtime = t;
        stat.ctime = t;
    }
    stat
}

#[cfg(unix)]
fn kind_of(md: &fs::Metadata) -> EntryKind {
    use std::os::unix::fs::FileTypeExt;
    let ft = md.file_type();
    if ft.is_dir() {
        EntryKind::Directory
    } else if ft.is_symlink() {
        EntryKind::Symlink
    } else if ft.is_file() {
        EntryKind::File
    } else if ft.is_block_device() || ft.is_char_device() {
        EntryKind::Device
    } else {
        EntryKind::Other
    }
}

#[cfg(not(unix))]
fn kind_of(md: &fs::Metadata) -> EntryKind {
    let ft = md.file_type();
    if ft.is_dir() {
        EntryKind::Directory
    } else if ft.is_symlink() {
        EntryKind::Symlink
    } else if ft.is_file() {
        EntryKind::File
    } else {
        EntryKind::Other
    }
}

#[cfg(unix)]
fn stat_of(md: &fs::Metadata, _kind: EntryKind) -> EntryStat {
    use std::os::unix::fs::MetadataExt;
    EntryStat {
        mode:  md.mode(),
        uid:   md.uid(),
        gid:   md.gid(),
        atime: md.atime(),
        mtime: md.mtime(),
        ctime: md.ctime(),
        size:  md.len(),
        rdev:  md.rdev(),
    }
}

#[cfg(not(unix))]
fn stat_of(md: &fs::Metadata, kind: EntryKind) -> EntryStat {
    use crate::metadata::{S_IFDIR, S_IFLNK, S_IFREG};
    use std::time::UNIX_EPOCH;

    let secs = |t: std::io::Result<std::time::SystemTime>| {
        t.ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    };
    let mtime = secs(md.modified());
    EntryStat {
        mode: match kind {
            EntryKind::Directory => S_IFDIR | 0o755,
            EntryKind::Symlink   => S_IFLNK | 0o777,
            _                    => S_IFREG | 0o644,
        },
        uid:   0,
        gid:   0,
        atime: secs(md.accessed()),
        mtime,
        ctime: mtime,
        size:  md.len(),
        rdev:  0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, content: &[u8]) {
        let path = dir.join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::File::create(path).unwrap().write_all(content).unwrap();
    }

    #[test]
    fn scans_and_deduplicates() {
        let tmp = tempfile::tempdir().unwrap();
        write_file(tmp.path(), "a/one.bin", b"identical content here");
        write_file(tmp.path(), "b/two.bin", b"identical content here");
        write_file(tmp.path(), "b/three.bin", b"something else entirely");
        write_file(tmp.path(), "lonely.bin", b"x");

        let result = scan(tmp.path(), &ScanOptions::default()).unwrap();
        assert_eq!(result.stats.regular_files, 4);
        assert_eq!(result.stats.duplicate_files, 1);
        assert_eq!(result.unique_files.len(), 3);
        // Only the same-size pair got hashed.
        assert_eq!(result.stats.hashed_files, 2);

        let one = find(&result.tree, "a/one.bin");
        let two = find(&result.tree, "b/two.bin");
        assert_eq!(result.unique_of[one as usize], result.unique_of[two as usize]);
    }

    #[test]
    fn filter_prunes_directories() {
        let tmp = tempfile::tempdir().unwrap();
        write_file(tmp.path(), "src/keep.rs", b"keep");
        write_file(tmp.path(), "target/skip.o", b"skip");

        let options = ScanOptions {
            filter: EntryFilter::new().exclude("target/"),
            ..Default::default()
        };
        let result = scan(tmp.path(), &options).unwrap();
        assert_eq!(result.stats.regular_files, 1);
        assert!(result.tree.dfs().iter().all(|&id| result.tree.get(id).name != "target"));
    }

    #[test]
    fn overrides_apply_everywhere() {
        let tmp = tempfile::tempdir().unwrap();
        write_file(tmp.path(), "f", b"data");

        let options = ScanOptions {
            uid: Some(0),
            gid: Some(0),
            timestamp: Some(1_600_000_000),
            ..Default::default()
        };
        let result = scan(tmp.path(), &options).unwrap();
        for &id in &result.tree.dfs() {
            let stat = &result.tree.get(id).stat;
            assert_eq!(stat.uid, 0);
            assert_eq!(stat.gid, 0);
            assert_eq!(stat.mtime, 1_600_000_000);
        }
    }

    #[test]
    fn symlinks_carry_their_target() {
        #[cfg(unix)]
        {
            let tmp = tempfile::tempdir().unwrap();
            write_file(tmp.path(), "real", b"content");
            std::os::unix::fs::symlink("real", tmp.path().join("link")).unwrap();

            let result = scan(tmp.path(), &ScanOptions::default()).unwrap();
            let link = find(&result.tree, "link");
            assert_eq!(result.tree.get(link).kind, EntryKind::Symlink);
            assert_eq!(result.tree.get(link).target.as_deref(), Some("real"));
        }
    }

    fn find(tree: &EntryTree, path: &str) -> EntryId {
        *tree
            .dfs()
            .iter()
            .find(|&&id| tree.path_of(id) == path)
            .unwrap()
    }
}
