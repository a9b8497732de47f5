//! Frozen string tables for names and symlink targets.
//!
//! A table is a concatenated byte buffer plus an index.  The index is
//! either absolute offsets (`count + 1` entries) or, when packed, the
//! per-string lengths (prefix-summed into offsets when the view is
//! built).  The buffer may additionally be dictionary-compressed with a
//! [`SymbolTable`]; that is only kept when it actually shrinks the data.

use std::sync::Arc;

use crate::codec::ArcSlice;
use crate::error::{Error, Result};
use crate::metadata::packed::{PackedIntSlice, PackedIntVector};
use crate::metadata::symtab::SymbolTable;

// ── Packing ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct StringTableOptions {
    /// Store per-string lengths instead of absolute offsets.
    pub pack_index: bool,
    /// Train a symbol table and keep it if it shrinks the buffer.
    pub pack_data:  bool,
}

impl Default for StringTableOptions {
    fn default() -> Self {
        StringTableOptions { pack_index: true, pack_data: true }
    }
}

/// Builder output, consumed by the metadata freezer.
pub struct PackedStringTable {
    pub buffer:       Vec<u8>,
    pub index:        PackedIntVector,
    pub packed_index: bool,
    pub symtab:       Option<Vec<u8>>,
    pub count:        usize,
}

pub fn pack(strings: &[String], options: &StringTableOptions) -> PackedStringTable {
    let mut symtab = None;
    let mut stored: Vec<Vec<u8>> = Vec::with_capacity(strings.len());

    if options.pack_data && !strings.is_empty() {
        let mut sample = Vec::new();
        for s in strings {
            if sample.len() >= 64 * 1024 {
                break;
            }
            sample.extend_from_slice(s.as_bytes());
        }
        let table = SymbolTable::build(&sample);
        if !table.is_empty() {
            let raw: usize = strings.iter().map(|s| s.len()).sum();
            let encoded: Vec<Vec<u8>> = strings.iter().map(|s| table.encode(s.as_bytes())).collect();
            let packed: usize = encoded.iter().map(|e| e.len()).sum();
            let dict = table.serialize();
            if packed + dict.len() < raw {
                symtab = Some(dict);
                stored = encoded;
            }
        }
    }
    if symtab.is_none() {
        stored = strings.iter().map(|s| s.as_bytes().to_vec()).collect();
    }

    let mut buffer = Vec::new();
    let index = if options.pack_index {
        let lengths: Vec<u64> = stored.iter().map(|s| s.len() as u64).collect();
        for s in &stored {
            buffer.extend_from_slice(s);
        }
        PackedIntVector::from_values(&lengths)
    } else {
        let mut offsets = Vec::with_capacity(stored.len() + 1);
        offsets.push(0u64);
        for s in &stored {
            buffer.extend_from_slice(s);
            offsets.push(buffer.len() as u64);
        }
        PackedIntVector::from_values(&offsets)
    };

    PackedStringTable {
        buffer,
        index,
        packed_index: options.pack_index,
        symtab,
        count: strings.len(),
    }
}

// ── View ─────────────────────────────────────────────────────────────────────

/// Read-side string table.  Offsets are materialised once at load; string
/// bytes stay in the frozen buffer until looked up.
pub struct StringTableView {
    buffer:  ArcSlice,
    offsets: Vec<u32>,
    symtab:  Option<SymbolTable>,
}

impl StringTableView {
    /// `index` is the frozen index array; `packed_index` selects the
    /// lengths interpretation.  `count` is the number of strings.
    pub fn new(
        buffer:       ArcSlice,
        index:        PackedIntSlice<'_>,
        packed_index: bool,
        count:        usize,
        symtab:       Option<&[u8]>,
    ) -> Result<Self> {
        let mut offsets = Vec::with_capacity(count + 1);
        if packed_index {
            if index.len() != count {
                return Err(Error::corrupted("string table length index count mismatch"));
            }
            let mut at = 0u64;
            offsets.push(0);
            for len in index.iter() {
                at += len;
                offsets.push(u32::try_from(at).map_err(|_| Error::corrupted("string table overflow"))?);
            }
        } else {
            if index.len() != count + 1 {
                return Err(Error::corrupted("string table offset index count mismatch"));
            }
            for off in index.iter() {
                offsets.push(u32::try_from(off).map_err(|_| Error::corrupted("string table overflow"))?);
            }
        }
        if offsets.last().copied().unwrap_or(0) as usize > buffer.len() {
            return Err(Error::corrupted("string table index exceeds buffer"));
        }

        let symtab = match symtab {
            Some(bytes) => Some(SymbolTable::deserialize(bytes)?),
            None        => None,
        };

        Ok(StringTableView { buffer, offsets, symtab })
    }

    /// An empty table (no strings stored at all).
    pub fn empty() -> Self {
        StringTableView {
            buffer:  ArcSlice::whole(Arc::new(Vec::new())),
            offsets: vec![0],
            symtab:  None,
        }
    }

    pub fn len(&self) -> usize {
        self.offsets.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_packed(&self) -> bool {
        self.symtab.is_some()
    }

    /// The i-th original string.
    pub fn lookup(&self, index: usize) -> Result<String> {
        if index >= self.len() {
            return Err(Error::corrupted(format!(
                "string index {index} out of range {}",
                self.len()
            )));
        }
        let a = self.offsets[index] as usize;
        let b = self.offsets[index + 1] as usize;
        let raw = &self.buffer.as_slice()[a..b];
        let bytes = match &self.symtab {
            Some(t) => t.decode(raw)?,
            None    => raw.to_vec(),
        };
        String::from_utf8(bytes).map_err(|_| Error::corrupted("string table entry is not UTF-8"))
    }

    /// Total bytes the table would occupy without any packing.
    pub fn unpacked_size(&self) -> Result<usize> {
        let mut total = 0;
        for i in 0..self.len() {
            total += self.lookup(i)?.len();
        }
        Ok(total)
    }
}
