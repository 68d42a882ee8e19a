//! Bounded, indexed replay log of region changes.

use crate::error::{Result, SyncError};
use crate::types::RegionRecord;
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::Arc;

use super::watermark::WatermarkStore;

/// Default number of records kept for catch-up.
pub const DEFAULT_HISTORY_CAPACITY: usize = 10_000;

/// Outcome of looking up history from an index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HistoryLookup {
    /// Records from `start_index` up to the newest, in index order.
    Records {
        start_index: u64,
        records: Vec<RegionRecord>,
    },
    /// The index equals the next index: nothing to catch up on.
    Current,
    /// The index was evicted (or is from the future); no catch-up is possible.
    Unavailable {
        requested: u64,
        start_index: u64,
        next_index: u64,
    },
}

/// Index bookkeeping and bodies, always read and written together.
struct Inner {
    /// Record with index `start_index + i` lives at position `i`.
    entries: VecDeque<RegionRecord>,
    start_index: u64,
    next_index: u64,
}

/// Bounded history of region changes.
///
/// Entries always span exactly `[start_index, next_index)`. The next index
/// is persisted on every record so a restarted coordinator never hands out an
/// index twice, but the entries themselves start empty after a restart.
pub struct HistoryBuffer {
    inner: RwLock<Inner>,
    capacity: usize,
    store: Arc<dyn WatermarkStore>,
}

impl HistoryBuffer {
    /// Open a buffer seeded from the persisted watermark.
    pub fn open(capacity: usize, store: Arc<dyn WatermarkStore>) -> Result<Self> {
        if capacity == 0 {
            return Err(SyncError::InvalidConfig(
                "history capacity must be greater than zero".into(),
            ));
        }
        let watermark = store.load_watermark()?.unwrap_or(0);

        tracing::debug!(watermark, capacity, "opened region history");

        Ok(Self {
            inner: RwLock::new(Inner {
                entries: VecDeque::with_capacity(capacity.min(DEFAULT_HISTORY_CAPACITY)),
                start_index: watermark,
                next_index: watermark,
            }),
            capacity,
            store,
        })
    }

    /// Append a record and return its index.
    ///
    /// The watermark is persisted before the record becomes visible; if that
    /// fails the buffer is left untouched.
    pub fn record(&self, region: RegionRecord) -> Result<u64> {
        let mut inner = self.inner.write();

        let index = inner.next_index;
        self.store.save_watermark(index + 1)?;

        inner.entries.push_back(region);
        inner.next_index += 1;

        if inner.entries.len() > self.capacity {
            inner.entries.pop_front();
            inner.start_index += 1;
        }

        Ok(index)
    }

    /// Next index to be assigned.
    pub fn next_index(&self) -> u64 {
        self.inner.read().next_index
    }

    /// Oldest retained index.
    pub fn start_index(&self) -> u64 {
        self.inner.read().start_index
    }

    /// Number of retained records.
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// All records with index >= `index`, oldest first.
    ///
    /// Empty both when the caller is already current and when the requested
    /// range has been evicted; use [`HistoryBuffer::lookup`] to tell them apart.
    pub fn records_from(&self, index: u64) -> Vec<RegionRecord> {
        let inner = self.inner.read();
        Self::slice_from(&inner, index)
    }

    /// Like `records_from`, but says why the result is empty.
    pub fn lookup(&self, index: u64) -> HistoryLookup {
        let inner = self.inner.read();

        if index == inner.next_index {
            return HistoryLookup::Current;
        }

        let records = Self::slice_from(&inner, index);
        if records.is_empty() {
            return HistoryLookup::Unavailable {
                requested: index,
                start_index: inner.start_index,
                next_index: inner.next_index,
            };
        }

        HistoryLookup::Records {
            start_index: index,
            records,
        }
    }

    fn slice_from(inner: &Inner, index: u64) -> Vec<RegionRecord> {
        if index < inner.start_index || index >= inner.next_index {
            return Vec::new();
        }

        let offset = (index - inner.start_index) as usize;
        inner.entries.range(offset..).cloned().collect()
    }
}
