//! In-memory index from date to log offset.

use crate::types::PageDate;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Maps each saved date to the offset of its newest log entry.
///
/// Not persisted; rebuilt from the log on open.
pub struct PageIndex {
    /// Date -> offset of the live entry.
    entries: RwLock<BTreeMap<PageDate, u64>>,

    /// Entries seen in the log, live or shadowed.
    total_entries: RwLock<u64>,
}

impl PageIndex {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            total_entries: RwLock::new(0),
        }
    }

    /// Build from `(offset, date)` pairs in log order; later entries win.
    pub fn from_entries(entries: impl IntoIterator<Item = (u64, PageDate)>) -> Self {
        let index = Self::new();
        for (offset, date) in entries {
            index.insert(date, offset);
        }
        index
    }

    /// Point `date` at a new entry, returning the offset it replaced.
    pub fn insert(&self, date: PageDate, offset: u64) -> Option<u64> {
        *self.total_entries.write() += 1;
        self.entries.write().insert(date, offset)
    }

    pub fn get(&self, date: &PageDate) -> Option<u64> {
        self.entries.read().get(date).copied()
    }

    pub fn contains(&self, date: &PageDate) -> bool {
        self.entries.read().contains_key(date)
    }

    /// Saved dates, oldest first.
    pub fn dates(&self) -> Vec<PageDate> {
        self.entries.read().keys().copied().collect()
    }

    /// `(date, offset)` for every live entry, oldest date first.
    pub fn live_entries(&self) -> Vec<(PageDate, u64)> {
        self.entries
            .read()
            .iter()
            .map(|(date, offset)| (*date, *offset))
            .collect()
    }

    /// Swap in a freshly compacted layout.
    pub fn reset(&self, entries: impl IntoIterator<Item = (u64, PageDate)>) {
        let mut map = self.entries.write();
        let mut total = self.total_entries.write();
        map.clear();
        *total = 0;
        for (offset, date) in entries {
            map.insert(date, offset);
            *total += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn total_entries(&self) -> u64 {
        *self.total_entries.read()
    }

    /// Entries overwritten by a later write for the same date.
    pub fn superseded(&self) -> u64 {
        self.total_entries() - self.len() as u64
    }
}

impl Default for PageIndex {
    fn default() -> Self {
        Self::new()
    }
}
