//! Ordered consumption with a one-time offset replay.
//!
//! The first time this consumer claims a (topic, partition) it re-injects
//! the records returned by the stash provider before touching the live
//! stream. A rebalance that releases the partition clears its key, so a
//! later re-claim replays again.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{PartitionClaim, RebalanceKind, RebalanceNotification};
use crate::codes;
use crate::context::RuntimeContext;
use crate::handler::{invoke_with_retry, report_error, OffsetStashProvider};
use crate::metrics_consts::{REPLAY_MESSAGES, REPLAY_RUNS};
use crate::strategy::ordered::{offer_claim, spawn_partition_workers};
use crate::strategy::{ConsumerStrategy, StrategyStreams};

pub(crate) struct PullOrderedWithReplay {
    ctx: Arc<RuntimeContext>,
    workers: usize,
    fanout_capacity: usize,
    stash: Option<Arc<dyn OffsetStashProvider>>,
    /// Keys this instance has already replayed. Owned per consumer, so two
    /// consumers in one process never share replay state.
    claimed: Mutex<HashSet<(String, i32)>>,
}

impl PullOrderedWithReplay {
    pub fn new(
        ctx: Arc<RuntimeContext>,
        workers: usize,
        fanout_capacity: usize,
        stash: Option<Arc<dyn OffsetStashProvider>>,
    ) -> Self {
        Self {
            ctx,
            workers,
            fanout_capacity,
            stash,
            claimed: Mutex::new(HashSet::new()),
        }
    }

    fn first_claim(&self, topic: &str, partition: i32) -> bool {
        match self.claimed.lock() {
            Ok(mut claimed) => claimed.insert((topic.to_string(), partition)),
            Err(_) => {
                warn!("poisoned replay claim set");
                false
            }
        }
    }
}

#[async_trait]
impl ConsumerStrategy for PullOrderedWithReplay {
    async fn run(&self, mut streams: StrategyStreams, shutdown: CancellationToken) {
        let (fanout_tx, workers) = spawn_partition_workers(
            self.ctx.clone(),
            self.workers,
            self.fanout_capacity,
            shutdown.clone(),
        );
        info!(workers = self.workers, "replay dispatch started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                next = streams.partitions.recv() => {
                    let Some(claim) = next else { break };
                    if let Some(liveness) = &self.ctx.liveness {
                        liveness.report_healthy().await;
                    }
                    self.drive_claim(claim, fanout_tx.clone());
                }
            }
        }

        drop(fanout_tx);
        join_all(workers).await;
        info!("replay dispatch stopped");
    }

    fn on_rebalance(&self, notification: &RebalanceNotification) {
        // Only a successful rebalance changes ownership; Start and Error
        // leave the replay state untouched.
        if notification.kind != RebalanceKind::Ok {
            return;
        }
        let Ok(mut claimed) = self.claimed.lock() else {
            warn!("poisoned replay claim set");
            return;
        };
        for (topic, partitions) in &notification.released {
            for partition in partitions {
                if claimed.remove(&(topic.clone(), *partition)) {
                    debug!(
                        topic = %topic,
                        partition,
                        "released partition will replay on re-claim"
                    );
                }
            }
        }
    }
}

impl PullOrderedWithReplay {
    /// Spawns the per-claim driver: replay first when this is the first
    /// claim of the key, then hand the claim to the live workers. Live
    /// consumption of the partition is blocked until replay completes.
    fn drive_claim(
        &self,
        claim: PartitionClaim,
        fanout: tokio::sync::mpsc::Sender<PartitionClaim>,
    ) {
        let replay_first = self.first_claim(claim.topic(), claim.partition());
        let ctx = self.ctx.clone();
        let stash = self.stash.clone();

        tokio::spawn(async move {
            if replay_first {
                if let Some(provider) = stash {
                    replay_partition(&ctx, provider, claim.topic(), claim.partition()).await;
                }
            }
            offer_claim(&fanout, claim);
        });
    }
}

async fn replay_partition(
    ctx: &RuntimeContext,
    provider: Arc<dyn OffsetStashProvider>,
    topic: &str,
    partition: i32,
) {
    metrics::counter!(REPLAY_RUNS).increment(1);

    let stashes = match fetch_with_retry(ctx, &provider, topic, partition).await {
        Ok(stashes) => stashes,
        Err(e) => {
            error!(
                code = codes::REPLAY_FETCH_FAILED,
                transaction_id = %ctx.transaction_id,
                topic,
                partition,
                error = %e,
                "offset stash fetch failed; continuing with live consumption"
            );
            report_error(ctx, &e, None);
            return;
        }
    };

    debug!(topic, partition, count = stashes.len(), "replaying stash");
    for stash in stashes {
        let message = stash.into_message();
        metrics::counter!(REPLAY_MESSAGES).increment(1);
        if let Err(e) = invoke_with_retry(ctx, &message).await {
            error!(
                code = codes::REPLAY_HANDLER_FAILED,
                topic,
                partition,
                offset = message.offset(),
                transaction_id = message.transaction_id(),
                error = %e,
                "replayed message failed; continuing"
            );
            report_error(ctx, &e, Some(&message));
        }
    }
}

/// Fetches the stash with the handler retry policy; provider panics are
/// recovered into errors.
async fn fetch_with_retry(
    ctx: &RuntimeContext,
    provider: &Arc<dyn OffsetStashProvider>,
    topic: &str,
    partition: i32,
) -> Result<Vec<crate::message::OffsetStash>> {
    let attempts = ctx.retry_count.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let task = {
            let provider = provider.clone();
            let topic = topic.to_string();
            tokio::spawn(async move { provider.fetch(&topic, partition).await })
        };
        let outcome = match task.await {
            Ok(result) => result,
            Err(join_error) if join_error.is_panic() => {
                Err(anyhow!("offset stash provider panicked"))
            }
            Err(_) => Err(anyhow!("offset stash fetch was cancelled")),
        };
        match outcome {
            Ok(stashes) => return Ok(stashes),
            Err(e) if attempt < attempts => {
                warn!(
                    topic,
                    partition,
                    attempt,
                    error = %e,
                    "offset stash fetch failed; retrying"
                );
                tokio::time::sleep(ctx.retry_delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
