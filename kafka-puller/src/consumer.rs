//! The consumer service: factory, pull loop wiring, offset marking,
//! health, and shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::broker::{BrokerClient, BrokerStreams, MonotonicMarker, OffsetMarker};
use crate::client::KafkaBroker;
use crate::commit::commit_strategy_for;
use crate::config::{Config, ConsumerMode};
use crate::context::RuntimeContext;
use crate::error::ConfigError;
use crate::handler::{report_error, report_notification};
use crate::health::Health;
use crate::metrics_consts::{BROKER_ERRORS, REBALANCE_NOTIFICATIONS};
use crate::strategy::{
    ConsumerStrategy, PullOrdered, PullOrderedWithReplay, PullUnordered, StrategyStreams,
};

/// A long-lived consumer bound to one group and topic set.
///
/// `pull` is non-blocking: it spawns the error drain, the notification
/// drain, and the dispatch loop for the configured strategy. `close` tears
/// everything down and is idempotent.
pub struct PullConsumer {
    ctx: Arc<RuntimeContext>,
    strategy: Arc<dyn ConsumerStrategy>,
    broker: Arc<dyn BrokerClient>,
    marker: Arc<dyn OffsetMarker>,
    streams: Mutex<Option<BrokerStreams>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
    can_consume: Arc<AtomicBool>,
    closed: AtomicBool,
    group: String,
    topics: Vec<String>,
}

impl PullConsumer {
    /// Validates the configuration and connects the rdkafka client.
    /// Nothing is spawned until `pull`.
    pub fn new(cfg: Config) -> Result<Self, ConfigError> {
        cfg.validate()?;
        let broker = KafkaBroker::connect(&cfg)?;
        Self::assemble(cfg, Box::new(broker))
    }

    /// Builds a consumer over any broker client. Used by tests and by
    /// services that bring their own transport.
    pub fn with_broker(cfg: Config, broker: Box<dyn BrokerClient>) -> Result<Self, ConfigError> {
        cfg.validate()?;
        Self::assemble(cfg, broker)
    }

    fn assemble(cfg: Config, mut broker: Box<dyn BrokerClient>) -> Result<Self, ConfigError> {
        let streams = broker.take_streams().ok_or(ConfigError::StreamsTaken)?;
        let broker: Arc<dyn BrokerClient> = Arc::from(broker);
        let marker: Arc<dyn OffsetMarker> = Arc::new(MonotonicMarker::new(broker.marker()));

        let handler = cfg.handler.clone().ok_or(ConfigError::MissingHandler)?;
        let commit = commit_strategy_for(cfg.commit_mode, marker.clone());
        let ctx = Arc::new(RuntimeContext {
            handler,
            commit,
            on_error: cfg.on_error.clone(),
            on_notification: cfg.on_notification.clone(),
            timeout: cfg.timeout,
            retry_count: cfg.retry_count,
            retry_delay: cfg.retry_delay,
            transaction_id: cfg.transaction_id.clone(),
            liveness: cfg.liveness.clone(),
        });

        let pool_size = cfg.pool_size();
        let strategy: Arc<dyn ConsumerStrategy> = match cfg.consumer_mode {
            ConsumerMode::PullUnordered => Arc::new(PullUnordered::new(ctx.clone(), pool_size)),
            ConsumerMode::PullOrdered => {
                Arc::new(PullOrdered::new(ctx.clone(), pool_size, cfg.partitions))
            }
            ConsumerMode::PullOrderedWithOffsetReplay => Arc::new(PullOrderedWithReplay::new(
                ctx.clone(),
                pool_size,
                cfg.partitions,
                cfg.offset_stash.clone(),
            )),
        };

        Ok(Self {
            ctx,
            strategy,
            broker,
            marker,
            streams: Mutex::new(Some(streams)),
            tasks: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
            can_consume: Arc::new(AtomicBool::new(true)),
            closed: AtomicBool::new(false),
            group: cfg.group,
            topics: cfg.topics,
        })
    }

    /// Starts consuming. Non-blocking; spawns the drains and the dispatch
    /// loop. A second call is a no-op.
    pub fn pull(&self) {
        let streams = match self.streams.lock() {
            Ok(mut streams) => streams.take(),
            Err(_) => {
                warn!("poisoned stream slot");
                None
            }
        };
        let Some(streams) = streams else {
            warn!("pull already started");
            return;
        };
        let BrokerStreams {
            messages,
            partitions,
            mut errors,
            mut notifications,
        } = streams;

        info!(group = %self.group, topics = ?self.topics, "starting consumption");

        let mut tasks = Vec::with_capacity(3);

        // Broker errors are surfaced and accounted for, never fatal.
        let ctx = self.ctx.clone();
        let can_consume = self.can_consume.clone();
        let token = self.shutdown.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    next = errors.recv() => {
                        let Some(err) = next else { break };
                        metrics::counter!(BROKER_ERRORS).increment(1);
                        can_consume.store(false, Ordering::SeqCst);
                        error!(
                            transaction_id = %ctx.transaction_id,
                            error = %err,
                            "broker error"
                        );
                        report_error(&ctx, &err, None);
                        if let Some(liveness) = &ctx.liveness {
                            liveness.report_healthy().await;
                        }
                    }
                }
            }
        }));

        // Rebalance notifications feed the strategy hook first, then the
        // user callback.
        let ctx = self.ctx.clone();
        let strategy = self.strategy.clone();
        let token = self.shutdown.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    next = notifications.recv() => {
                        let Some(notification) = next else { break };
                        metrics::counter!(REBALANCE_NOTIFICATIONS).increment(1);
                        info!(notification = %notification, "rebalance");
                        strategy.on_rebalance(&notification);
                        report_notification(&ctx, &notification.to_string());
                        if let Some(liveness) = &ctx.liveness {
                            liveness.report_healthy().await;
                        }
                    }
                }
            }
        }));

        let strategy = self.strategy.clone();
        let token = self.shutdown.clone();
        tasks.push(tokio::spawn(async move {
            strategy
                .run(
                    StrategyStreams {
                        messages,
                        partitions,
                    },
                    token,
                )
                .await;
        }));

        match self.tasks.lock() {
            Ok(mut slot) => slot.extend(tasks),
            Err(_) => warn!("poisoned task list"),
        }
    }

    /// Marks an offset directly. Monotonic per partition: a mark below the
    /// current watermark has no effect.
    pub fn mark_offset(&self, topic: &str, partition: i32, offset: i64) {
        if let Err(e) = self.marker.mark_offset(topic, partition, offset) {
            error!(topic, partition, offset, error = %e, "failed to mark offset");
            report_error(&self.ctx, &e, None);
        }
    }

    /// Stops consumption, waits for workers to drain, and closes the broker
    /// client. Idempotent; only the underlying client's error is returned.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(group = %self.group, "closing consumer");
        self.shutdown.cancel();

        let drained: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for task in drained {
            let _unused = task.await;
        }

        self.broker.close()
    }

    /// Probes the cluster and folds in the observed consumption state.
    pub async fn health(&self) -> Result<Health> {
        let probe = self.broker.probe().await?;
        Ok(Health::from_probe(
            probe,
            self.can_consume.load(Ordering::SeqCst),
            self.group.clone(),
            self.topics.clone(),
        ))
    }
}
