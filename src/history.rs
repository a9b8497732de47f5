//! The HISTORY section payload.
//!
//! Every written image records who produced it and with which arguments;
//! rewriting an image appends another record rather than replacing the
//! list.

use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryEntry {
    pub version:   String,
    /// Seconds since the epoch.
    pub timestamp: i64,
    pub arguments: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct History {
    pub entries: Vec<HistoryEntry>,
}

impl History {
    pub fn new() -> Self {
        History::default()
    }

    pub fn append(&mut self, arguments: Vec<String>) {
        self.entries.push(HistoryEntry {
            version:   env!("CARGO_PKG_VERSION").to_owned(),
            timestamp: Utc::now().timestamp(),
            arguments,
        });
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::InvalidArgument(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::corrupted(format!("history: {e}")))
    }

    /// One line per entry, newest last.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for e in &self.entries {
            let when = Utc
                .timestamp_opt(e.timestamp, 0)
                .single()
                .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                .unwrap_or_else(|| format!("@{}", e.timestamp));
            out.push_str(&format!("{} v{} {}\n", when, e.version, e.arguments.join(" ")));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_round_trip() {
        let mut h = History::new();
        h.append(vec!["pack".to_owned(), "/data".to_owned()]);
        h.append(vec!["rewrite".to_owned()]);

        let restored = History::from_bytes(&h.to_bytes().unwrap()).unwrap();
        assert_eq!(restored, h);
        assert_eq!(restored.entries.len(), 2);
        assert_eq!(restored.entries[0].arguments[0], "pack");
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(History::from_bytes(b"not json").is_err());
    }
}
