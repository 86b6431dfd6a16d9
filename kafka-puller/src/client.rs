//! rdkafka-backed implementation of the broker client.
//!
//! A `StreamConsumer` with a notifying context feeds a driver task. In
//! unordered mode the driver forwards the merged stream; in the ordered
//! modes it splits a partition queue per assignment and emits one
//! `PartitionClaim` per owned partition.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context as _, Result};
use async_trait::async_trait;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::{ClientConfig, ClientContext, TopicPartitionList};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::{
    BrokerClient, BrokerProbe, BrokerStreams, OffsetMarker, PartitionClaim, RebalanceNotification,
};
use crate::config::{Config, ConsumerMode, InitialOffset};
use crate::error::ConfigError;
use crate::message::Message;
use crate::metrics_consts::BROKER_ERRORS;

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const CLAIM_BUFFER: usize = 64;

/// Rebalance callbacks run on librdkafka threads; they only push events
/// into this channel for the driver to act on.
enum ContextEvent {
    Assigned(Vec<(String, i32)>),
    Revoked(Vec<(String, i32)>),
    Failed(String),
}

struct NotifyContext {
    events: mpsc::UnboundedSender<ContextEvent>,
}

impl ClientContext for NotifyContext {}

impl ConsumerContext for NotifyContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(partitions) => {
                if self
                    .events
                    .send(ContextEvent::Revoked(partition_pairs(partitions)))
                    .is_err()
                {
                    warn!("revoke event dropped; driver is gone");
                }
            }
            Rebalance::Error(e) => {
                let _unused = self.events.send(ContextEvent::Failed(e.to_string()));
            }
            Rebalance::Assign(_) => {}
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Assign(partitions) => {
                if self
                    .events
                    .send(ContextEvent::Assigned(partition_pairs(partitions)))
                    .is_err()
                {
                    warn!("assign event dropped; driver is gone");
                }
            }
            Rebalance::Error(e) => {
                let _unused = self.events.send(ContextEvent::Failed(e.to_string()));
            }
            Rebalance::Revoke(_) => {}
        }
    }
}

fn partition_pairs(list: &TopicPartitionList) -> Vec<(String, i32)> {
    list.elements()
        .into_iter()
        .map(|elem| (elem.topic().to_string(), elem.partition()))
        .collect()
}

pub struct KafkaBroker {
    consumer: Arc<StreamConsumer<NotifyContext>>,
    streams: Option<BrokerStreams>,
    driver: Option<Driver>,
    shutdown: CancellationToken,
    closed: AtomicBool,
    probe_config: ClientConfig,
    group: String,
    topics: Vec<String>,
    brokers: Vec<String>,
}

impl KafkaBroker {
    /// Builds the consumer-group client and subscribes. Nothing is spawned
    /// here; the driver starts when the streams are taken.
    pub fn connect(cfg: &Config) -> Result<Self, ConfigError> {
        let client_config = client_config_for(cfg);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let consumer: StreamConsumer<NotifyContext> =
            client_config.create_with_context(NotifyContext { events: events_tx })?;

        let topic_refs: Vec<&str> = cfg.topics.iter().map(String::as_str).collect();
        consumer.subscribe(&topic_refs)?;
        let consumer = Arc::new(consumer);

        if let Some(retention) = cfg.retention {
            // Offset retention is a broker-side setting; librdkafka has no
            // per-consumer override.
            debug!(?retention, "offset retention override requested; broker setting applies");
        }

        let (messages_tx, messages_rx) = mpsc::channel(cfg.pool_size().max(1));
        let (partitions_tx, partitions_rx) = mpsc::channel(cfg.partitions.max(1));
        let (errors_tx, errors_rx) = mpsc::channel(64);
        let (notifications_tx, notifications_rx) = mpsc::channel(64);

        let shutdown = CancellationToken::new();
        let partition_streams = matches!(
            cfg.consumer_mode,
            ConsumerMode::PullOrdered | ConsumerMode::PullOrderedWithOffsetReplay
        );

        let driver = Driver {
            consumer: consumer.clone(),
            events: events_rx,
            messages: messages_tx,
            partitions: partitions_tx,
            errors: errors_tx,
            notifications: notifications_tx,
            partition_streams,
            shutdown: shutdown.clone(),
            claims: HashMap::new(),
            pending_released: HashMap::new(),
            rebalance_announced: false,
        };

        Ok(Self {
            consumer,
            streams: Some(BrokerStreams {
                messages: messages_rx,
                partitions: partitions_rx,
                errors: errors_rx,
                notifications: notifications_rx,
            }),
            driver: Some(driver),
            shutdown,
            closed: AtomicBool::new(false),
            probe_config: probe_config_for(cfg),
            group: cfg.group.clone(),
            topics: cfg.topics.clone(),
            brokers: cfg.brokers.clone(),
        })
    }
}

#[async_trait]
impl BrokerClient for KafkaBroker {
    fn take_streams(&mut self) -> Option<BrokerStreams> {
        let streams = self.streams.take()?;
        if let Some(driver) = self.driver.take() {
            tokio::spawn(driver.run());
        }
        Some(streams)
    }

    fn marker(&self) -> Arc<dyn OffsetMarker> {
        Arc::new(KafkaMarker {
            consumer: self.consumer.clone(),
        })
    }

    async fn probe(&self) -> Result<BrokerProbe> {
        let config = self.probe_config.clone();
        let group = self.group.clone();
        let topics = self.topics.clone();
        let brokers = self.brokers.clone();
        tokio::task::spawn_blocking(move || probe_cluster(&config, &group, &topics, &brokers))
            .await
            .map_err(|e| anyhow!("probe task failed: {e}"))?
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.cancel();
        match self.consumer.commit_consumer_state(CommitMode::Sync) {
            Ok(()) => Ok(()),
            // Nothing stored yet is a normal way to shut down.
            Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => Ok(()),
            Err(e) => Err(anyhow!(e)),
        }
    }
}

struct KafkaMarker {
    consumer: Arc<StreamConsumer<NotifyContext>>,
}

impl OffsetMarker for KafkaMarker {
    fn mark_offset(&self, topic: &str, partition: i32, offset: i64) -> Result<()> {
        // librdkafka stores next-to-read semantics for us; the pulled offset
        // passes through unchanged.
        self.consumer
            .store_offset(topic, partition, offset)
            .map_err(|e| anyhow!(e))
    }
}

struct ClaimEntry {
    feed: mpsc::Sender<Message>,
    forwarder: Option<JoinHandle<()>>,
}

struct Driver {
    consumer: Arc<StreamConsumer<NotifyContext>>,
    events: mpsc::UnboundedReceiver<ContextEvent>,
    messages: mpsc::Sender<Message>,
    partitions: mpsc::Sender<PartitionClaim>,
    errors: mpsc::Sender<anyhow::Error>,
    notifications: mpsc::Sender<RebalanceNotification>,
    partition_streams: bool,
    shutdown: CancellationToken,
    claims: HashMap<(String, i32), ClaimEntry>,
    pending_released: HashMap<String, Vec<i32>>,
    rebalance_announced: bool,
}

impl Driver {
    async fn run(mut self) {
        info!("kafka driver started");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = self.events.recv() => {
                    let Some(event) = event else { break };
                    self.handle_event(event).await;
                }
                received = self.consumer.recv() => match received {
                    Ok(borrowed) => {
                        // BorrowedMessage must not live across an await.
                        let message = Message::from_owned(&borrowed.detach());
                        drop(borrowed);
                        self.route(message).await;
                    }
                    Err(e) => {
                        metrics::counter!(BROKER_ERRORS).increment(1);
                        warn!(error = %e, "kafka consumer error");
                        if self.errors.send(anyhow!(e)).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
        for (_, entry) in self.claims.drain() {
            if let Some(forwarder) = entry.forwarder {
                forwarder.abort();
            }
        }
        info!("kafka driver stopped");
    }

    async fn handle_event(&mut self, event: ContextEvent) {
        match event {
            ContextEvent::Revoked(partitions) => {
                if !self.rebalance_announced {
                    self.rebalance_announced = true;
                    let _unused = self.notifications.send(RebalanceNotification::start()).await;
                }
                for (topic, partition) in partitions {
                    if let Some(entry) = self.claims.remove(&(topic.clone(), partition)) {
                        if let Some(forwarder) = entry.forwarder {
                            forwarder.abort();
                        }
                    }
                    self.pending_released
                        .entry(topic)
                        .or_default()
                        .push(partition);
                }
            }
            ContextEvent::Assigned(partitions) => {
                let mut claimed: HashMap<String, Vec<i32>> = HashMap::new();
                for (topic, partition) in &partitions {
                    claimed.entry(topic.clone()).or_default().push(*partition);
                }

                if self.partition_streams {
                    for (topic, partition) in partitions {
                        self.open_claim(topic, partition).await;
                    }
                }

                let released = std::mem::take(&mut self.pending_released);
                self.rebalance_announced = false;
                let mut current: HashMap<String, Vec<i32>> = HashMap::new();
                for (topic, partition) in self.claims.keys() {
                    current.entry(topic.clone()).or_default().push(*partition);
                }
                if !self.partition_streams {
                    current = claimed.clone();
                }

                let _unused = self
                    .notifications
                    .send(RebalanceNotification::ok(claimed, released, current))
                    .await;
            }
            ContextEvent::Failed(detail) => {
                let _unused = self
                    .notifications
                    .send(RebalanceNotification::error(detail.clone()))
                    .await;
                let _unused = self.errors.send(anyhow!("rebalance failed: {detail}")).await;
            }
        }
    }

    /// Splits the partition's queue off the merged stream and emits a claim
    /// for it. A claim that does not fit the channel is dropped; the broker
    /// redelivers the assignment on the next rebalance.
    async fn open_claim(&mut self, topic: String, partition: i32) {
        let key = (topic.clone(), partition);
        if self.claims.contains_key(&key) {
            return;
        }

        let (feed_tx, feed_rx) = mpsc::channel(CLAIM_BUFFER);
        let forwarder = match self.consumer.split_partition_queue(&topic, partition) {
            Some(queue) => {
                let feed = feed_tx.clone();
                let errors = self.errors.clone();
                let token = self.shutdown.clone();
                let forwarded_topic = topic.clone();
                Some(tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            _ = token.cancelled() => break,
                            received = queue.recv() => match received {
                                Ok(borrowed) => {
                                    let message = Message::from_owned(&borrowed.detach());
                                    drop(borrowed);
                                    if feed.send(message).await.is_err() {
                                        break;
                                    }
                                }
                                Err(e) => {
                                    metrics::counter!(BROKER_ERRORS).increment(1);
                                    warn!(
                                        topic = %forwarded_topic,
                                        partition,
                                        error = %e,
                                        "partition stream error"
                                    );
                                    if errors.send(anyhow!(e)).await.is_err() {
                                        break;
                                    }
                                }
                            }
                        }
                    }
                }))
            }
            None => {
                warn!(topic = %topic, partition, "partition queue unavailable; routing via merged stream");
                None
            }
        };

        self.claims.insert(
            key,
            ClaimEntry {
                feed: feed_tx,
                forwarder,
            },
        );

        let claim = PartitionClaim::new(topic.clone(), partition, feed_rx);
        if self.partitions.try_send(claim).is_err() {
            warn!(topic = %topic, partition, "partition claim channel full; claim dropped");
        }
    }

    async fn route(&mut self, message: Message) {
        if self.partition_streams {
            // A message can beat the assignment event to the merged stream;
            // open the claim lazily and feed it.
            let key = (message.topic().to_string(), message.partition());
            if !self.claims.contains_key(&key) {
                self.open_claim(key.0.clone(), key.1).await;
            }
            if let Some(entry) = self.claims.get(&key) {
                let _unused = entry.feed.send(message).await;
            }
        } else {
            let _unused = self.messages.send(message).await;
        }
    }
}

fn client_config_for(cfg: &Config) -> ClientConfig {
    let mut config = ClientConfig::new();
    config
        .set("bootstrap.servers", cfg.brokers.join(","))
        .set("group.id", &cfg.group)
        .set("enable.auto.offset.store", "false")
        .set("enable.auto.commit", "true")
        .set("auto.commit.interval.ms", "5000")
        .set(
            "auto.offset.reset",
            match cfg.initial_offset {
                InitialOffset::Newest => "latest",
                InitialOffset::Oldest => "earliest",
            },
        )
        .set(
            "session.timeout.ms",
            cfg.rebalance_timeout.as_millis().to_string(),
        )
        .set(
            "max.poll.interval.ms",
            cfg.timeout.as_millis().max(300_000).to_string(),
        )
        .set(
            "topic.metadata.refresh.sparse",
            (!cfg.metadata_full).to_string(),
        );
    config
}

fn probe_config_for(cfg: &Config) -> ClientConfig {
    let mut config = ClientConfig::new();
    config
        .set("bootstrap.servers", cfg.brokers.join(","))
        .set("group.id", format!("{}-probe", cfg.group))
        .set("socket.timeout.ms", "10000");
    config
}

fn probe_cluster(
    config: &ClientConfig,
    group: &str,
    topics: &[String],
    addresses: &[String],
) -> Result<BrokerProbe> {
    let consumer: BaseConsumer = config.create().context("failed to create probe consumer")?;

    let coordinator_ok = consumer.fetch_group_list(Some(group), PROBE_TIMEOUT).is_ok();

    let metadata = consumer
        .fetch_metadata(None, PROBE_TIMEOUT)
        .context("failed to fetch metadata")?;

    let live: HashSet<String> = metadata
        .brokers()
        .iter()
        .map(|broker| format!("{}:{}", broker.host(), broker.port()))
        .collect();

    let mut probe = BrokerProbe {
        coordinator_ok,
        ..Default::default()
    };
    for address in addresses {
        probe.brokers.insert(address.clone(), live.contains(address));
    }
    for topic in metadata.topics() {
        if topics.iter().any(|t| t == topic.name()) {
            probe.partitions.insert(
                topic.name().to_string(),
                topic.partitions().iter().map(|p| p.id()).collect(),
            );
        }
    }
    Ok(probe)
}
