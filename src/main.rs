//! Command-line driver.  All behaviour lives in the library; this is a
//! thin argument-parsing shell around it.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use dwarfs::reader::cache::BlockCacheOptions;
use dwarfs::writer::filter::EntryFilter;
use dwarfs::writer::scanner::ScanOptions;
use dwarfs::{
    extract_filesystem, write_image, CompressionSpec, DiskSink, ExtractOptions, FileOrder,
    Filesystem, FilesystemOptions, ImageOffset, ReadlinkMode, WriterOptions,
};

#[derive(Parser)]
#[command(name = "dwarfs", version, about = "DwarFS image tool")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create an image from a directory tree.
    Pack {
        /// Input directory.
        input:  PathBuf,
        /// Output image file.
        output: PathBuf,
        /// Block compression, e.g. `zstd`, `zstd:level=19`, `lz4`, `null`.
        #[arg(short = 'C', long, default_value = "zstd")]
        compression: String,
        /// File order: none, path, revpath, similarity,
        /// nilsimsa[:max-children[:max-cluster-size]].
        #[arg(long, default_value = "nilsimsa")]
        order: String,
        /// Block size as log2, e.g. 22 for 4 MiB blocks.
        #[arg(short = 'S', long, default_value_t = 22)]
        block_size_bits: u32,
        /// Match window as log2.
        #[arg(short = 'W', long, default_value_t = 12)]
        window_size: u32,
        /// Lookback depth in blocks.
        #[arg(long, default_value_t = 1)]
        max_active_blocks: usize,
        /// Encode long zero runs as holes.
        #[arg(long)]
        sparse: bool,
        /// Exclude glob patterns (repeatable, first match wins).
        #[arg(long = "exclude")]
        excludes: Vec<String>,
        /// Override owner uid.
        #[arg(long)]
        uid: Option<u32>,
        /// Override group gid.
        #[arg(long)]
        gid: Option<u32>,
        /// Override all timestamps (seconds since epoch).
        #[arg(long)]
        timestamp: Option<i64>,
        /// Store mtime only.
        #[arg(long)]
        mtime_only: bool,
        /// Compression worker threads (0 = CPUs).
        #[arg(short = 'j', long, default_value_t = 0)]
        num_workers: usize,
        #[arg(long)]
        no_section_index: bool,
        #[arg(long)]
        no_history: bool,
    },

    /// List image contents.
    Ls {
        image: PathBuf,
        /// Directory inside the image; defaults to the root.
        path:  Option<String>,
        /// Long listing with mode, owner and size.
        #[arg(short = 'l', long)]
        long: bool,
    },

    /// Print a file inside the image to stdout.
    Cat {
        image: PathBuf,
        path:  String,
    },

    /// Extract the image (or a matching subset) into a directory.
    Extract {
        image:  PathBuf,
        output: PathBuf,
        /// Only extract entries matching this glob.
        #[arg(long)]
        pattern: Option<String>,
        /// Image offset in bytes, or `auto`.
        #[arg(long, default_value = "0")]
        offset: String,
    },

    /// Verify section checksums.
    Check {
        image: PathBuf,
        /// Also verify the SHA-512/256 strong checksums.
        #[arg(long)]
        strong: bool,
    },

    /// Show image information.
    Info {
        image: PathBuf,
        /// Detail level (0..=2).
        #[arg(short = 'd', long, default_value_t = 1)]
        detail: u32,
        /// Show the image history.
        #[arg(long)]
        history: bool,
    },
}

fn main() -> ExitCode {
    match run(Cli::parse()) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("dwarfs: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> dwarfs::Result<ExitCode> {
    match cli.command {
        Command::Pack {
            input,
            output,
            compression,
            order,
            block_size_bits,
            window_size,
            max_active_blocks,
            sparse,
            excludes,
            uid,
            gid,
            timestamp,
            mtime_only,
            num_workers,
            no_section_index,
            no_history,
        } => {
            let mut filter = EntryFilter::new();
            for pattern in &excludes {
                filter = filter.exclude(pattern);
            }

            let mut options = WriterOptions {
                scan: ScanOptions { filter, uid, gid, timestamp },
                order: FileOrder::parse(&order)?,
                block_compression: CompressionSpec::parse(&compression)?,
                num_workers,
                no_section_index,
                no_history,
                history_arguments: std::env::args().skip(1).collect(),
                ..Default::default()
            };
            options.segmenter.block_size_bits = block_size_bits;
            options.segmenter.blockhash_window_size = window_size;
            options.segmenter.max_active_blocks = max_active_blocks;
            options.segmenter.enable_sparse_files = sparse;
            options.metadata.mtime_only = mtime_only;

            let out = std::fs::File::create(&output)?;
            let stats = write_image(std::io::BufWriter::new(out), &input, &options)?;
            eprintln!(
                "wrote {} ({} sections, {} blocks, {} unique / {} duplicate files, {:.1}% of input saved by segmenting)",
                output.display(),
                stats.sections_written,
                stats.blocks_written,
                stats.unique_files,
                stats.duplicate_files,
                if stats.input_bytes > 0 {
                    100.0 * (stats.matched_bytes + stats.hole_bytes) as f64 / stats.input_bytes as f64
                } else {
                    0.0
                },
            );
            Ok(ExitCode::SUCCESS)
        }

        Command::Ls { image, path, long } => {
            let fs = open(&image, ImageOffset::Exact(0))?;
            let path = path.unwrap_or_default();
            let entry = fs
                .find(&path)?
                .ok_or_else(|| dwarfs::Error::NotFound(path.clone()))?;
            for (name, inode) in fs.readdir(entry.inode)? {
                if long {
                    let st = fs.stat(inode)?;
                    println!("{:o} {:>5} {:>5} {:>12} {}", st.mode, st.uid, st.gid, st.size, name);
                } else {
                    println!("{name}");
                }
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::Cat { image, path } => {
            let fs = open(&image, ImageOffset::Exact(0))?;
            let entry = fs
                .find(&path)?
                .ok_or_else(|| dwarfs::Error::NotFound(path.clone()))?;
            let stat = fs.stat(entry.inode)?;
            match stat.kind {
                dwarfs::InodeKind::Symlink => {
                    println!("{}", fs.readlink(entry.inode, ReadlinkMode::Raw)?);
                }
                _ => {
                    use std::io::Write;
                    let data = fs.read_file(entry.inode)?;
                    std::io::stdout().write_all(&data)?;
                }
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::Extract { image, output, pattern, offset } => {
            let offset = match offset.as_str() {
                "auto" => ImageOffset::Auto,
                s => ImageOffset::Exact(s.parse::<u64>().map_err(|_| {
                    dwarfs::Error::InvalidArgument(format!("bad image offset '{s}'"))
                })?),
            };
            let fs = open(&image, offset)?;
            let options = ExtractOptions {
                matcher: pattern
                    .as_deref()
                    .map(dwarfs::writer::filter::GlobMatcher::new),
                ..Default::default()
            };
            let mut sink = DiskSink::new(&output)?;
            extract_filesystem(&fs, &options, &mut sink)?;
            Ok(ExitCode::SUCCESS)
        }

        Command::Check { image, strong } => {
            let fs = open(&image, ImageOffset::Exact(0))?;
            let report = fs.check(strong);
            for sec in &report.sections {
                match &sec.result {
                    Ok(()) => println!("OK   {}", sec.description),
                    Err(e) => println!("FAIL {} — {e}", sec.description),
                }
            }
            if report.is_ok() {
                Ok(ExitCode::SUCCESS)
            } else {
                eprintln!("dwarfs: {} section(s) failed verification", report.errors());
                Ok(ExitCode::FAILURE)
            }
        }

        Command::Info { image, detail, history } => {
            let fs = open(&image, ImageOffset::Exact(0))?;
            print!("{}", fs.dump(detail)?);
            if history {
                match fs.history()? {
                    Some(h) => print!("{}", h.render()),
                    None => println!("no history recorded"),
                }
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn open(image: &std::path::Path, offset: ImageOffset) -> dwarfs::Result<Filesystem> {
    Filesystem::open(
        image,
        &FilesystemOptions {
            image_offset: offset,
            cache: BlockCacheOptions::default(),
            ..Default::default()
        },
    )
}
