//! Filesystem extraction: an ordered stream of entry records driven from
//! a mounted-image walk.
//!
//! The extractor visits entries in metadata order, optionally filtered
//! by a glob matcher, and feeds a sink: `begin_entry` once per entry,
//! then zero or more `data` calls for regular-file content.  File
//! content is read in segments of at most `max_queued_bytes` so a huge
//! file never sits in memory at once.  [`DiskSink`] materialises the
//! stream into a directory tree.

use std::fs;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::metadata::{InodeKind, ReadlinkMode, Stat};
use crate::reader::Filesystem;
use crate::writer::filter::GlobMatcher;

#[derive(Clone)]
pub struct ExtractOptions {
    /// Only entries whose path matches are extracted (directories are
    /// always created for matching children).
    pub matcher:          Option<GlobMatcher>,
    /// Upper bound on bytes handed to the sink per `data` call.
    pub max_queued_bytes: u64,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        ExtractOptions { matcher: None, max_queued_bytes: 64 << 20 }
    }
}

/// Consumer of the extraction stream.
pub trait ExtractSink {
    /// Called once per entry, in walk order.
    fn begin_entry(&mut self, path: &str, stat: &Stat, link_target: Option<&str>) -> Result<()>;

    /// Regular-file content, in ascending offset order.
    fn data(&mut self, path: &str, offset: u64, bytes: &[u8]) -> Result<()>;
}

/// Extract `fs` into `sink`.
pub fn extract(fs: &Filesystem, options: &ExtractOptions, sink: &mut dyn ExtractSink) -> Result<()> {
    let step = options.max_queued_bytes.max(1);

    fs.walk(&mut |path, inode| {
        if path.is_empty() {
            return Ok(()); // the root maps onto the target itself
        }
        if let Some(matcher) = &options.matcher {
            let stat = fs.stat(inode)?;
            let is_dir = stat.kind == InodeKind::Directory;
            if !matcher.matches_entry(path, is_dir) && !is_dir {
                return Ok(());
            }
        }

        let stat = fs.stat(inode)?;
        let target;
        let link_target = match stat.kind {
            InodeKind::Symlink => {
                target = fs.readlink(inode, ReadlinkMode::Preferred)?;
                Some(target.as_str())
            }
            _ => None,
        };
        sink.begin_entry(path, &stat, link_target)?;

        if stat.kind == InodeKind::File {
            let mut offset = 0u64;
            while offset < stat.size {
                let take = step.min(stat.size - offset);
                let bytes = fs.read(inode, offset, take)?;
                sink.data(path, offset, &bytes)?;
                offset += take;
            }
        }
        Ok(())
    })
}

// ── Disk sink ────────────────────────────────────────────────────────────────

/// Writes the extraction stream into a directory.  Holes stay sparse
/// where the platform allows it (zero runs are seeked over, not
/// written).
pub struct DiskSink {
    root: PathBuf,
}

impl DiskSink {
    pub fn new(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)?;
        Ok(DiskSink { root: root.to_owned() })
    }

    fn target(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }
}

impl ExtractSink for DiskSink {
    fn begin_entry(&mut self, path: &str, stat: &Stat, link_target: Option<&str>) -> Result<()> {
        let target = self.target(path);
        match stat.kind {
            InodeKind::Directory => fs::create_dir_all(&target)?,
            InodeKind::File => {
                let f = fs::File::create(&target)?;
                f.set_len(stat.size)?;
            }
            InodeKind::Symlink => {
                let link = link_target
                    .ok_or_else(|| Error::InvalidArgument(format!("symlink '{path}' lost its target")))?;
                #[cfg(unix)]
                std::os::unix::fs::symlink(link, &target)?;
                #[cfg(not(unix))]
                fs::write(&target, link)?;
            }
            // Device and special nodes need privileges to recreate;
            // extraction records them but materialises nothing.
            InodeKind::Device | InodeKind::Other => {}
        }

        #[cfg(unix)]
        if stat.kind != InodeKind::Symlink {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&target, fs::Permissions::from_mode(stat.mode & 0o7777));
        }
        Ok(())
    }

    fn data(&mut self, path: &str, offset: u64, bytes: &[u8]) -> Result<()> {
        let mut f = fs::OpenOptions::new().write(true).open(self.target(path))?;
        f.seek(SeekFrom::Start(offset))?;

        // Skip zero runs so sparse source files stay sparse on disk.
        let mut at = 0usize;
        while at < bytes.len() {
            let zeros = bytes[at..].iter().take_while(|&&b| b == 0).count();
            if zeros > 4096 || at + zeros == bytes.len() {
                f.seek(SeekFrom::Current(zeros as i64))?;
            } else {
                f.write_all(&bytes[at..at + zeros])?;
            }
            at += zeros;
            let nonzero = bytes[at..].iter().take_while(|&&b| b != 0).count();
            f.write_all(&bytes[at..at + nonzero])?;
            at += nonzero;
        }
        Ok(())
    }
}
