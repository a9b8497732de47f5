//! Crate-wide error model.
//!
//! Every failure surfaced to an embedder maps onto one of a small set of
//! kinds (`corrupted_image`, `checksum_mismatch`, `decompression_failed`,
//! ...).  Failures on a section carry the section context — number, type
//! and image offset — so a single-line error message can point at the
//! exact spot in the image.

use std::io;
use thiserror::Error;

use crate::section::SectionType;

/// Where in the image an error happened.
///
/// `number` is `None` for V1 sections (they carry no section number).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionContext {
    pub number: Option<u32>,
    pub kind:   SectionType,
    pub offset: u64,
}

impl std::fmt::Display for SectionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.number {
            Some(n) => write!(f, "section {} ({}) at offset {}", n, self.kind.name(), self.offset),
            None    => write!(f, "section ({}) at offset {}", self.kind.name(), self.offset),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("corrupted image: {reason}{}", ctx_suffix(.context))]
    CorruptedImage {
        reason:  String,
        context: Option<SectionContext>,
    },

    #[error("unsupported version {major}.{minor}")]
    UnsupportedVersion { major: u8, minor: u8 },

    #[error("unknown compression type {type_tag}{}", ctx_suffix(.context))]
    UnknownCompression {
        type_tag: u16,
        context:  Option<SectionContext>,
    },

    #[error("decompression failed: {reason}{}", ctx_suffix(.context))]
    DecompressionFailed {
        reason:  String,
        context: Option<SectionContext>,
    },

    #[error("checksum mismatch ({which}) in {context}")]
    ChecksumMismatch {
        /// `"xxh3-64"` or `"sha2-512/256"`.
        which:   &'static str,
        context: SectionContext,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
}

impl Error {
    pub fn corrupted(reason: impl Into<String>) -> Self {
        Error::CorruptedImage { reason: reason.into(), context: None }
    }

    pub fn corrupted_in(reason: impl Into<String>, context: SectionContext) -> Self {
        Error::CorruptedImage { reason: reason.into(), context: Some(context) }
    }

    /// The section context attached to this error, if any.
    pub fn section_context(&self) -> Option<SectionContext> {
        match self {
            Error::CorruptedImage { context, .. }
            | Error::UnknownCompression { context, .. }
            | Error::DecompressionFailed { context, .. } => *context,
            Error::ChecksumMismatch { context, .. } => Some(*context),
            _ => None,
        }
    }
}

fn ctx_suffix(ctx: &Option<SectionContext>) -> String {
    match ctx {
        Some(c) => format!(" in {c}"),
        None    => String::new(),
    }
}

pub type Result<T> = std::result::Result<T, Error>;
