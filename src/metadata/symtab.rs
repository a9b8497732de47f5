//! Static-symbol-table string compression for the metadata string tables.
//!
//! A table of up to 255 symbols (2–8 bytes each) is trained on a sample
//! of the input; encoding replaces greedy longest-match symbol
//! occurrences with one-byte codes and escapes every other byte as
//! `0xFF, literal`.  Decoding needs only the table, so individual strings
//! remain independently addressable inside the frozen buffer.
//!
//! # Serialised form
//!
//! ```text
//! Offset  Size  Field
//!    0      1   symbol_count  (≤ 255)
//!    …      1   len           (2..=8)       ┐ repeated
//!    …    len   symbol bytes                ┘ symbol_count times
//! ```

use std::collections::HashMap;

use crate::error::{Error, Result};

/// Code reserved for escaped literals.
const ESCAPE: u8 = 0xFF;
const MAX_SYMBOLS: usize = 255;
const MIN_SYMBOL_LEN: usize = 2;
const MAX_SYMBOL_LEN: usize = 8;

/// Cap on the training sample; frequencies beyond this add little.
const SAMPLE_LIMIT: usize = 64 * 1024;

pub struct SymbolTable {
    symbols: Vec<Vec<u8>>,
    /// Longest-match lookup: symbol bytes → code.
    by_bytes: HashMap<Vec<u8>, u8>,
}

impl SymbolTable {
    /// Train a table on `sample`.  Deterministic: candidates are ranked
    /// by gain, ties broken by symbol bytes.
    pub fn build(sample: &[u8]) -> Self {
        let sample = &sample[..sample.len().min(SAMPLE_LIMIT)];

        let mut counts: HashMap<&[u8], u32> = HashMap::new();
        for n in MIN_SYMBOL_LEN..=MAX_SYMBOL_LEN {
            for win in sample.windows(n) {
                *counts.entry(win).or_default() += 1;
            }
        }

        let mut candidates: Vec<(u64, &[u8])> = counts
            .into_iter()
            .filter(|&(_, count)| count >= 4)
            .map(|(bytes, count)| (count as u64 * (bytes.len() - 1) as u64, bytes))
            .collect();
        candidates.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1)));
        candidates.truncate(MAX_SYMBOLS);

        Self::from_symbols(candidates.into_iter().map(|(_, b)| b.to_vec()).collect())
    }

    fn from_symbols(symbols: Vec<Vec<u8>>) -> Self {
        let by_bytes = symbols
            .iter()
            .enumerate()
            .map(|(code, bytes)| (bytes.clone(), code as u8))
            .collect();
        SymbolTable { symbols, by_bytes }
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn encode(&self, input: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(input.len());
        let mut pos = 0;
        while pos < input.len() {
            let mut matched = false;
            let longest = MAX_SYMBOL_LEN.min(input.len() - pos);
            for n in (MIN_SYMBOL_LEN..=longest).rev() {
                if let Some(&code) = self.by_bytes.get(&input[pos..pos + n]) {
                    out.push(code);
                    pos += n;
                    matched = true;
                    break;
                }
            }
            if !matched {
                out.push(ESCAPE);
                out.push(input[pos]);
                pos += 1;
            }
        }
        out
    }

    pub fn decode(&self, input: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(input.len() * 2);
        let mut pos = 0;
        while pos < input.len() {
            let code = input[pos];
            pos += 1;
            if code == ESCAPE {
                let lit = *input
                    .get(pos)
                    .ok_or_else(|| Error::corrupted("string table escape at end of data"))?;
                out.push(lit);
                pos += 1;
            } else {
                let sym = self
                    .symbols
                    .get(code as usize)
                    .ok_or_else(|| Error::corrupted(format!("string table code {code} out of range")))?;
                out.extend_from_slice(sym);
            }
        }
        Ok(out)
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = vec![self.symbols.len() as u8];
        for sym in &self.symbols {
            out.push(sym.len() as u8);
            out.extend_from_slice(sym);
        }
        out
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let count = *data.first().ok_or_else(|| Error::corrupted("empty symbol table"))? as usize;
        let mut symbols = Vec::with_capacity(count);
        let mut pos = 1;
        for _ in 0..count {
            let len = *data
                .get(pos)
                .ok_or_else(|| Error::corrupted("truncated symbol table"))? as usize;
            pos += 1;
            if !(MIN_SYMBOL_LEN..=MAX_SYMBOL_LEN).contains(&len) || pos + len > data.len() {
                return Err(Error::corrupted("malformed symbol table entry"));
            }
            symbols.push(data[pos..pos + len].to_vec());
            pos += len;
        }
        Ok(Self::from_symbols(symbols))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_corpus() -> Vec<u8> {
        let mut s = Vec::new();
        for i in 0..200 {
            s.extend_from_slice(format!("library/source/module_{i:03}.rs\0").as_bytes());
        }
        s
    }

    #[test]
    fn encode_decode_round_trip() {
        let corpus = sample_corpus();
        let table = SymbolTable::build(&corpus);
        assert!(!table.is_empty());

        for input in [&b"library/source/module_042.rs"[..], b"", b"\xff\xfe\x00", b"unrelated"] {
            let encoded = table.encode(input);
            assert_eq!(table.decode(&encoded).unwrap(), input);
        }
    }

    #[test]
    fn repetitive_input_compresses() {
        let corpus = sample_corpus();
        let table = SymbolTable::build(&corpus);
        let encoded = table.encode(&corpus);
        assert!(encoded.len() < corpus.len() / 2, "{} vs {}", encoded.len(), corpus.len());
    }

    #[test]
    fn serialization_round_trip() {
        let table = SymbolTable::build(&sample_corpus());
        let restored = SymbolTable::deserialize(&table.serialize()).unwrap();
        let input = b"library/source/module_007.rs";
        assert_eq!(restored.decode(&table.encode(input)).unwrap(), input);
    }

    #[test]
    fn truncated_table_is_rejected() {
        let table = SymbolTable::build(&sample_corpus());
        let bytes = table.serialize();
        assert!(SymbolTable::deserialize(&bytes[..bytes.len() / 2]).is_err());
    }
}
