//! Unordered consumption: the merged stream fans out to a worker pool.
//! Throughput over ordering; two messages from one partition can be in
//! flight at once.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::context::RuntimeContext;
use crate::metrics_consts::MESSAGES_PULLED;
use crate::pool::WorkerPool;
use crate::strategy::{ConsumerStrategy, StrategyStreams};

pub(crate) struct PullUnordered {
    ctx: Arc<RuntimeContext>,
    pool_size: usize,
}

impl PullUnordered {
    pub fn new(ctx: Arc<RuntimeContext>, pool_size: usize) -> Self {
        Self { ctx, pool_size }
    }
}

#[async_trait]
impl ConsumerStrategy for PullUnordered {
    async fn run(&self, mut streams: StrategyStreams, shutdown: CancellationToken) {
        let pool = WorkerPool::start(self.ctx.clone(), self.pool_size);
        info!(pool_size = self.pool_size, "unordered dispatch started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                next = streams.messages.recv() => {
                    let Some(message) = next else { break };
                    if let Some(liveness) = &self.ctx.liveness {
                        liveness.report_healthy().await;
                    }
                    metrics::counter!(MESSAGES_PULLED).increment(1);
                    self.ctx.commit.on_pull(
                        message.topic(),
                        message.partition(),
                        message.offset(),
                    );
                    if !pool.submit(message).await {
                        warn!("worker pool is closed; stopping dispatch");
                        break;
                    }
                }
            }
        }

        pool.close().await;
        info!("unordered dispatch stopped");
    }
}
