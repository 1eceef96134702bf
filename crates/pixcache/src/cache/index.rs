//! # Cache index
//!
//! Authoritative metadata for the disk tier: one [`CacheEntry`] per stored object,
//! persisted as a single JSON document that is rewritten in full (temp file, then
//! rename) after every mutation.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::CacheKey;
use crate::error::Result;

pub const INDEX_FILE_NAME: &str = "cached_items_info.json";

/// Metadata for one object on disk. All fields are optional so that legacy or
/// hand-edited indexes still load.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_visited: Option<DateTime<Utc>>,
}

impl CacheEntry {
    pub fn new(size: u64, now: DateTime<Utc>) -> Self {
        Self {
            size: Some(size),
            last_modified: Some(now),
            last_visited: Some(now),
        }
    }

    /// Unknown sizes count as zero.
    pub fn size_or_zero(&self) -> u64 {
        self.size.unwrap_or(0)
    }
}

/// In-memory view of the index with a running size total.
#[derive(Debug, Clone, Default)]
pub struct CacheIndex {
    entries: BTreeMap<CacheKey, CacheEntry>,
    total_size: u64,
}

impl CacheIndex {
    pub fn get(&self, key: &CacheKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Insert or replace an entry, returning the previous one.
    pub fn upsert(&mut self, key: CacheKey, entry: CacheEntry) -> Option<CacheEntry> {
        self.total_size = self.total_size.saturating_add(entry.size_or_zero());
        let previous = self.entries.insert(key, entry);
        if let Some(previous) = &previous {
            self.total_size = self.total_size.saturating_sub(previous.size_or_zero());
        }
        previous
    }

    pub fn remove(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        let removed = self.entries.remove(key);
        if let Some(entry) = &removed {
            self.total_size = self.total_size.saturating_sub(entry.size_or_zero());
        }
        removed
    }

    /// Update `last_visited`; returns false if the key is not indexed.
    pub fn touch(&mut self, key: &CacheKey, now: DateTime<Utc>) -> bool {
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.last_visited = Some(now);
                true
            }
            None => false,
        }
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &CacheKey> {
        self.entries.keys()
    }

    /// Drain every entry, leaving the index empty.
    pub fn take_all(&mut self) -> Vec<CacheKey> {
        self.total_size = 0;
        std::mem::take(&mut self.entries).into_keys().collect()
    }

    /// Keys last written before `cutoff`. Entries without a modification date count
    /// as expired.
    pub fn select_expired(&self, cutoff: DateTime<Utc>) -> Vec<CacheKey> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.last_modified.is_none_or(|modified| modified < cutoff))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Least recently visited keys whose removal brings the total down to `target`.
    ///
    /// Missing visit dates sort first; ties are broken by key so the choice is
    /// deterministic.
    pub fn select_least_recent(&self, target: u64) -> Vec<CacheKey> {
        let mut candidates: Vec<(&CacheKey, &CacheEntry)> = self.entries.iter().collect();
        candidates.sort_by(|(ka, a), (kb, b)| {
            a.last_visited
                .cmp(&b.last_visited)
                .then_with(|| ka.cmp(kb))
        });

        let mut remaining = self.total_size;
        let mut selected = Vec::new();
        for (key, entry) in candidates {
            if remaining <= target {
                break;
            }
            remaining = remaining.saturating_sub(entry.size_or_zero());
            selected.push(key.clone());
        }
        selected
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.entries)?)
    }

    /// Parse a serialized index. Entries whose key is not a valid digest are
    /// skipped, since keys double as filenames.
    pub fn from_json(data: &[u8]) -> Result<Self> {
        let raw: BTreeMap<String, CacheEntry> = serde_json::from_slice(data)?;
        let mut index = Self::default();
        for (name, entry) in raw {
            match CacheKey::parse(&name) {
                Some(key) => {
                    index.upsert(key, entry);
                }
                None => warn!(key = %name, "Skipping index entry with invalid key"),
            }
        }
        Ok(index)
    }

    /// Load the index at `path`. A missing file yields an empty index; an
    /// unreadable or corrupt one is reported and replaced by an empty index.
    pub fn load(path: &Path) -> (Self, bool) {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return (Self::default(), false),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read cache index, starting empty");
                return (Self::default(), true);
            }
        };
        match Self::from_json(&data) {
            Ok(index) => (index, false),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Corrupt cache index, starting empty");
                (Self::default(), true)
            }
        }
    }

    /// Drop entries whose file no longer exists under `root`. Returns the dropped keys.
    pub fn retain_existing(&mut self, root: &Path) -> Vec<CacheKey> {
        let missing: Vec<CacheKey> = self
            .entries
            .keys()
            .filter(|key| !root.join(key.to_filename()).is_file())
            .cloned()
            .collect();
        for key in &missing {
            self.remove(key);
        }
        missing
    }
}

/// Replace `path` with `data` atomically.
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}
