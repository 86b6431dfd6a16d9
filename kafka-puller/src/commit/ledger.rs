//! Per-partition tracking of pulled offsets and their completion state.
//!
//! Entries arrive in pull order but complete in any order. The ledger only
//! ever surfaces the highest offset whose predecessors have all completed,
//! so an in-progress message always holds the commit watermark back.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryStatus {
    InProgress,
    Completed,
}

#[derive(Debug, Clone)]
struct OffsetEntry {
    offset: i64,
    status: EntryStatus,
}

#[derive(Debug, Default)]
pub struct PartitionLedger {
    entries: Vec<OffsetEntry>,
    committed: Option<i64>,
}

impl PartitionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a pulled offset as in progress. Offsets already tracked or
    /// already behind the watermark are ignored (broker redelivery).
    pub fn record(&mut self, offset: i64) {
        if let Some(committed) = self.committed {
            if offset <= committed {
                return;
            }
        }
        if self.entries.iter().any(|e| e.offset == offset) {
            return;
        }
        self.entries.push(OffsetEntry {
            offset,
            status: EntryStatus::InProgress,
        });
    }

    /// Marks `offset` completed and scans for a new commit watermark: the
    /// largest contiguous prefix of completed entries strictly above the
    /// last committed offset. Returns the watermark when it advances, after
    /// pruning the prefix.
    pub fn complete(&mut self, offset: i64) -> Option<i64> {
        // Entries are appended in pull order; sorting is a no-op then, and
        // it keeps the scan correct for any interleaving.
        self.entries.sort_by_key(|e| e.offset);

        if let Some(entry) = self.entries.iter_mut().find(|e| e.offset == offset) {
            entry.status = EntryStatus::Completed;
        }

        let mut prefix = 0;
        let mut watermark = None;
        for entry in &self.entries {
            if entry.status != EntryStatus::Completed {
                break;
            }
            prefix += 1;
            watermark = Some(entry.offset);
        }

        let watermark = watermark?;
        if let Some(committed) = self.committed {
            if watermark <= committed {
                return None;
            }
        }

        self.entries.drain(..prefix);
        self.committed = Some(watermark);
        Some(watermark)
    }

    pub fn committed(&self) -> Option<i64> {
        self.committed
    }

    pub fn in_flight(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.status == EntryStatus::InProgress)
            .count()
    }
}
