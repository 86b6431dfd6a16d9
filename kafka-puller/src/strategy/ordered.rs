//! Ordered consumption: partition claims cycle through a bounded fan-out
//! channel; each claim is held by at most one worker at a time, so handling
//! within a partition is strictly serialized and offsets are marked in pull
//! order.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::{ClaimPeek, PartitionClaim};
use crate::context::RuntimeContext;
use crate::handler::{invoke_with_retry, report_error};
use crate::metrics_consts::{CLAIMS_DROPPED, HANDLER_FAILURES, MESSAGES_PULLED};
use crate::strategy::{ConsumerStrategy, StrategyStreams};

/// How long an idle claim rests before another worker peeks it again.
const IDLE_BACKOFF: Duration = Duration::from_secs(1);

pub(crate) struct PullOrdered {
    ctx: Arc<RuntimeContext>,
    workers: usize,
    fanout_capacity: usize,
}

impl PullOrdered {
    pub fn new(ctx: Arc<RuntimeContext>, workers: usize, fanout_capacity: usize) -> Self {
        Self {
            ctx,
            workers,
            fanout_capacity,
        }
    }
}

#[async_trait]
impl ConsumerStrategy for PullOrdered {
    async fn run(&self, mut streams: StrategyStreams, shutdown: CancellationToken) {
        let (fanout_tx, workers) = spawn_partition_workers(
            self.ctx.clone(),
            self.workers,
            self.fanout_capacity,
            shutdown.clone(),
        );
        info!(workers = self.workers, "ordered dispatch started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                next = streams.partitions.recv() => {
                    let Some(claim) = next else { break };
                    if let Some(liveness) = &self.ctx.liveness {
                        liveness.report_healthy().await;
                    }
                    offer_claim(&fanout_tx, claim);
                }
            }
        }

        drop(fanout_tx);
        join_all(workers).await;
        info!("ordered dispatch stopped");
    }
}

/// Hands a claim to the worker fan-out without blocking the dispatch loop.
/// A full channel drops the claim; the broker redelivers it after the next
/// rebalance.
pub(super) fn offer_claim(fanout: &mpsc::Sender<PartitionClaim>, claim: PartitionClaim) {
    match fanout.try_send(claim) {
        Ok(()) => {}
        Err(TrySendError::Full(claim)) => {
            metrics::counter!(CLAIMS_DROPPED).increment(1);
            warn!(
                topic = claim.topic(),
                partition = claim.partition(),
                "no worker slot available for partition claim"
            );
        }
        Err(TrySendError::Closed(_)) => {
            debug!("partition fan-out is closed");
        }
    }
}

/// Spawns the fixed pool of partition workers sharing one fan-out channel.
/// Returns the sender used to enqueue (and re-enqueue) claims.
pub(super) fn spawn_partition_workers(
    ctx: Arc<RuntimeContext>,
    workers: usize,
    fanout_capacity: usize,
    shutdown: CancellationToken,
) -> (mpsc::Sender<PartitionClaim>, Vec<JoinHandle<()>>) {
    let (fanout_tx, fanout_rx) = mpsc::channel(fanout_capacity.max(1));
    let slots = Arc::new(Mutex::new(fanout_rx));

    let handles = (0..workers.max(1))
        .map(|worker_id| {
            let ctx = ctx.clone();
            let slots = slots.clone();
            let requeue = fanout_tx.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                partition_worker(ctx, slots, requeue, shutdown).await;
                debug!(worker_id, "partition worker exited");
            })
        })
        .collect();

    (fanout_tx, handles)
}

async fn partition_worker(
    ctx: Arc<RuntimeContext>,
    slots: Arc<Mutex<mpsc::Receiver<PartitionClaim>>>,
    requeue: mpsc::Sender<PartitionClaim>,
    shutdown: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = async { slots.lock().await.recv().await } => next,
        };
        let Some(mut claim) = next else { break };

        match claim.peek() {
            ClaimPeek::Message(message) => {
                metrics::counter!(MESSAGES_PULLED).increment(1);
                ctx.commit
                    .on_pull(message.topic(), message.partition(), message.offset());
                process_claimed(&ctx, &message).await;
                if requeue.send(claim).await.is_err() {
                    break;
                }
            }
            ClaimPeek::Empty => {
                if requeue.send(claim).await.is_err() {
                    break;
                }
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(IDLE_BACKOFF) => {}
                }
            }
            ClaimPeek::Closed => {
                debug!(
                    topic = claim.topic(),
                    partition = claim.partition(),
                    "partition stream closed; dropping claim"
                );
            }
        }
    }
}

/// One serialized handler invocation: retry on failure, surface the final
/// error, and always complete the offset so the ledger can advance.
pub(super) async fn process_claimed(ctx: &RuntimeContext, message: &crate::message::Message) {
    ctx.commit
        .before_handler(message.topic(), message.partition(), message.offset());

    let result = invoke_with_retry(ctx, message).await;
    if let Err(e) = &result {
        metrics::counter!(HANDLER_FAILURES).increment(1);
        report_error(ctx, e, Some(message));
    }

    ctx.commit
        .after_handler(message.topic(), message.partition(), message.offset());
}
