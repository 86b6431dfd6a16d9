//! Commit strategies: when a processed offset is marked on the broker.

use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tracing::{error, warn};

use crate::broker::OffsetMarker;
use crate::config::CommitMode;
use crate::metrics_consts::OFFSETS_MARKED;

mod ledger;
pub use ledger::PartitionLedger;

/// Hooks bracketing the life of a pulled message. `on_pull` runs when the
/// message leaves the broker stream; `before_handler`/`after_handler`
/// bracket the handler invocation. `after_handler` is guaranteed to run for
/// every pulled offset, whatever the handler did.
pub trait CommitStrategy: Send + Sync + 'static {
    fn on_pull(&self, topic: &str, partition: i32, offset: i64);

    fn before_handler(&self, _topic: &str, _partition: i32, _offset: i64) {}

    fn after_handler(&self, topic: &str, partition: i32, offset: i64);
}

pub fn commit_strategy_for(mode: CommitMode, marker: Arc<dyn OffsetMarker>) -> Arc<dyn CommitStrategy> {
    match mode {
        CommitMode::OnPull => Arc::new(CommitOnPull::new(marker)),
        CommitMode::OnMessageCompletion => Arc::new(CommitOnCompletion::new(marker)),
    }
}

/// Marks every offset the moment it is pulled. A message is considered
/// committed even when its handler later fails: at-most-once delivery.
pub struct CommitOnPull {
    marker: Arc<dyn OffsetMarker>,
}

impl CommitOnPull {
    pub fn new(marker: Arc<dyn OffsetMarker>) -> Self {
        Self { marker }
    }
}

impl CommitStrategy for CommitOnPull {
    fn on_pull(&self, topic: &str, partition: i32, offset: i64) {
        if let Err(e) = self.marker.mark_offset(topic, partition, offset) {
            error!(topic, partition, offset, error = %e, "failed to mark offset");
            return;
        }
        metrics::counter!(OFFSETS_MARKED).increment(1);
    }

    fn after_handler(&self, _topic: &str, _partition: i32, _offset: i64) {}
}

/// Holds marks until handlers complete, committing the highest offset whose
/// predecessors have all completed. Tolerates out-of-order completion.
pub struct CommitOnCompletion {
    marker: Arc<dyn OffsetMarker>,
    partitions: DashMap<(String, i32), Mutex<PartitionLedger>>,
}

impl CommitOnCompletion {
    pub fn new(marker: Arc<dyn OffsetMarker>) -> Self {
        Self {
            marker,
            partitions: DashMap::new(),
        }
    }
}

impl CommitStrategy for CommitOnCompletion {
    fn on_pull(&self, topic: &str, partition: i32, offset: i64) {
        let ledger = self
            .partitions
            .entry((topic.to_string(), partition))
            .or_insert_with(|| Mutex::new(PartitionLedger::new()));
        match ledger.lock() {
            Ok(mut ledger) => ledger.record(offset),
            Err(_) => warn!(topic, partition, "poisoned partition ledger"),
        };
    }

    fn after_handler(&self, topic: &str, partition: i32, offset: i64) {
        let Some(ledger) = self.partitions.get(&(topic.to_string(), partition)) else {
            warn!(topic, partition, offset, "completion for an untracked partition");
            return;
        };
        let watermark = match ledger.lock() {
            Ok(mut ledger) => ledger.complete(offset),
            Err(_) => {
                warn!(topic, partition, "poisoned partition ledger");
                None
            }
        };
        drop(ledger);

        if let Some(watermark) = watermark {
            if let Err(e) = self.marker.mark_offset(topic, partition, watermark) {
                error!(topic, partition, watermark, error = %e, "failed to mark offset");
                return;
            }
            metrics::counter!(OFFSETS_MARKED).increment(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[derive(Default)]
    struct RecordingMarker {
        marks: Mutex<Vec<(String, i32, i64)>>,
    }

    impl RecordingMarker {
        fn marks(&self) -> Vec<(String, i32, i64)> {
            self.marks.lock().unwrap().clone()
        }
    }

    impl OffsetMarker for RecordingMarker {
        fn mark_offset(&self, topic: &str, partition: i32, offset: i64) -> Result<()> {
            self.marks
                .lock()
                .unwrap()
                .push((topic.to_string(), partition, offset));
            Ok(())
        }
    }

    #[test]
    fn on_pull_marks_immediately() {
        let marker = Arc::new(RecordingMarker::default());
        let commit = CommitOnPull::new(marker.clone());

        commit.on_pull("t", 0, 10);
        commit.before_handler("t", 0, 10);
        commit.after_handler("t", 0, 10);

        assert_eq!(marker.marks(), vec![("t".to_string(), 0, 10)]);
    }

    #[test]
    fn on_completion_holds_marks_until_the_gap_closes() {
        let marker = Arc::new(RecordingMarker::default());
        let commit = CommitOnCompletion::new(marker.clone());

        commit.on_pull("t", 0, 1);
        commit.on_pull("t", 0, 2);
        commit.on_pull("t", 0, 3);

        commit.after_handler("t", 0, 2);
        commit.after_handler("t", 0, 3);
        assert!(marker.marks().is_empty());

        commit.after_handler("t", 0, 1);
        assert_eq!(marker.marks(), vec![("t".to_string(), 0, 3)]);
    }

    #[test]
    fn partitions_are_tracked_independently() {
        let marker = Arc::new(RecordingMarker::default());
        let commit = CommitOnCompletion::new(marker.clone());

        commit.on_pull("t", 0, 5);
        commit.on_pull("t", 1, 9);
        commit.after_handler("t", 1, 9);
        commit.after_handler("t", 0, 5);

        assert_eq!(
            marker.marks(),
            vec![("t".to_string(), 1, 9), ("t".to_string(), 0, 5)]
        );
    }
}
