//! The frozen-layout schema.
//!
//! Field offsets and bit widths are described separately from the data:
//! the METADATA_V2_SCHEMA section carries this document (JSON), the
//! METADATA_V2 section carries the bit-packed data blob it describes.
//! Readers materialise thin views over the blob; nothing in the blob is
//! self-describing.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const SCHEMA_VERSION: u32 = 1;

/// Optional invariants an image may depend on.  A reader must refuse an
/// image whose feature set it does not fully understand.
pub const SUPPORTED_FEATURES: &[&str] = &["holes"];

/// A byte range inside the data blob.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Region {
    pub offset: u64,
    pub len:    u64,
}

/// A bit-packed integer array inside the data blob.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Array {
    pub region: Region,
    pub count:  u64,
    pub bits:   u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StringTableDesc {
    pub buffer:       Region,
    pub index:        Array,
    pub packed_index: bool,
    pub symtab:       Option<Region>,
    pub count:        u64,
}

/// Inode counts per type rank, in inode-number order.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct InodeCounts {
    pub dirs:   u64,
    pub links:  u64,
    pub regs:   u64,
    pub devs:   u64,
    pub others: u64,
}

impl InodeCounts {
    pub fn total(&self) -> u64 {
        self.dirs + self.links + self.regs + self.devs + self.others
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schema {
    pub version:             u32,
    pub block_size_bits:     u32,
    /// Earliest timestamp in the tree; per-inode times are offsets.
    pub timestamp_base:      i64,
    pub time_resolution_sec: u32,
    pub mtime_only:          bool,
    pub inode_counts:        InodeCounts,
    pub unique_files:        u64,
    pub block_count:         u64,
    /// Virtual block index hole chunks reference, if any exist.
    pub hole_block:          Option<u64>,
    pub total_fs_size:       u64,
    pub features:            Vec<String>,
    pub fields:              BTreeMap<String, Array>,
    pub string_tables:       BTreeMap<String, StringTableDesc>,
}

impl Schema {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::InvalidArgument(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let schema: Schema = serde_json::from_slice(bytes)
            .map_err(|e| Error::corrupted(format!("metadata schema: {e}")))?;
        if schema.version != SCHEMA_VERSION {
            return Err(Error::corrupted(format!(
                "metadata schema version {} not supported",
                schema.version
            )));
        }
        for feature in &schema.features {
            if !SUPPORTED_FEATURES.contains(&feature.as_str()) {
                return Err(Error::corrupted(format!(
                    "image requires unsupported feature '{feature}'"
                )));
            }
        }
        Ok(schema)
    }

    pub fn field(&self, name: &str) -> Result<&Array> {
        self.fields
            .get(name)
            .ok_or_else(|| Error::corrupted(format!("metadata schema misses field '{name}'")))
    }

    pub fn string_table(&self, name: &str) -> Result<&StringTableDesc> {
        self.string_tables
            .get(name)
            .ok_or_else(|| Error::corrupted(format!("metadata schema misses string table '{name}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> Schema {
        Schema {
            version:             SCHEMA_VERSION,
            block_size_bits:     22,
            timestamp_base:      0,
            time_resolution_sec: 1,
            mtime_only:          false,
            inode_counts:        InodeCounts { dirs: 1, ..Default::default() },
            unique_files:        0,
            block_count:         0,
            hole_block:          None,
            total_fs_size:       0,
            features:            vec![],
            fields:              BTreeMap::new(),
            string_tables:       BTreeMap::new(),
        }
    }

    #[test]
    fn round_trip() {
        let schema = minimal();
        let restored = Schema::from_bytes(&schema.to_bytes().unwrap()).unwrap();
        assert_eq!(restored.inode_counts.dirs, 1);
    }

    #[test]
    fn unknown_feature_is_rejected() {
        let mut schema = minimal();
        schema.features.push("quantum".to_owned());
        assert!(Schema::from_bytes(&schema.to_bytes().unwrap()).is_err());
    }

    #[test]
    fn wrong_version_is_rejected() {
        let mut schema = minimal();
        schema.version = 99;
        assert!(Schema::from_bytes(&schema.to_bytes().unwrap()).is_err());
    }
}
