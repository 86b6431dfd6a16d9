//! Consumer strategies: how pulled messages are scheduled onto the handler.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::broker::{PartitionClaim, RebalanceNotification};
use crate::message::Message;

mod ordered;
mod replay;
mod unordered;

pub(crate) use ordered::PullOrdered;
pub(crate) use replay::PullOrderedWithReplay;
pub(crate) use unordered::PullUnordered;

/// The inputs a strategy consumes. Unordered reads the merged message
/// stream; the ordered strategies read partition claims.
pub(crate) struct StrategyStreams {
    pub messages: mpsc::Receiver<Message>,
    pub partitions: mpsc::Receiver<PartitionClaim>,
}

#[async_trait]
pub(crate) trait ConsumerStrategy: Send + Sync + 'static {
    /// Drives consumption until shutdown. Responsible for tearing down any
    /// workers it spawned before returning.
    async fn run(&self, streams: StrategyStreams, shutdown: CancellationToken);

    /// Called for every rebalance notification before the user callback.
    fn on_rebalance(&self, _notification: &RebalanceNotification) {}
}
