//! Content categorisation.
//!
//! A categorizer labels regions of a regular file with a category (and
//! optional subcategory) so homogeneous data can be steered to
//! homogeneous ordering and compression.  Concrete categorizers are
//! pluggable; the built-in [`RawCategorizer`] puts everything into one
//! default category, which always produces a valid image.

use std::ops::Range;

pub type CategoryId = u32;

pub const DEFAULT_CATEGORY: CategoryId = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryFragment {
    pub category:    CategoryId,
    pub subcategory: Option<u32>,
    pub range:       Range<u64>,
}

pub trait Categorizer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Label `data` (the whole file at `path`).  Fragments must be
    /// non-overlapping, ordered, and cover the file exactly.
    fn categorize(&self, path: &str, data: &[u8]) -> Vec<CategoryFragment>;

    /// Human-readable category name for stats and dumps.
    fn category_name(&self, category: CategoryId) -> String;
}

/// The identity categorizer: one default category for everything.
pub struct RawCategorizer;

impl Categorizer for RawCategorizer {
    fn name(&self) -> &'static str {
        "raw"
    }

    fn categorize(&self, _path: &str, data: &[u8]) -> Vec<CategoryFragment> {
        vec![CategoryFragment {
            category:    DEFAULT_CATEGORY,
            subcategory: None,
            range:       0..data.len() as u64,
        }]
    }

    fn category_name(&self, _category: CategoryId) -> String {
        "<default>".to_owned()
    }
}
