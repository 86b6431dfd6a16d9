use std::sync::Arc;
use std::time::Duration;

use envconfig::Envconfig;
use uuid::Uuid;

use crate::error::ConfigError;
use crate::handler::{ErrorCallback, MessageHandler, NotificationCallback, OffsetStashProvider};

/// When a processed offset is marked on the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommitMode {
    /// Mark at pull time; at-most-once.
    #[default]
    OnPull,
    /// Mark after handler completion, tolerating out-of-order completion.
    OnMessageCompletion,
}

/// How messages are scheduled onto the user handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConsumerMode {
    /// Merged stream fanned out to a worker pool; no ordering guarantee.
    #[default]
    PullUnordered,
    /// Per-partition serialized handling with handler retry.
    PullOrdered,
    /// Ordered, plus a one-time stash replay on first claim of a partition.
    PullOrderedWithOffsetReplay,
}

/// Where to start when the group has no committed offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InitialOffset {
    #[default]
    Newest,
    Oldest,
}

/// Consumer configuration. `Config::new` applies the documented defaults;
/// set any field afterwards, or use the `with_*` helpers.
#[derive(Clone)]
pub struct Config {
    pub brokers: Vec<String>,
    pub group: String,
    pub topics: Vec<String>,
    /// Required; construction fails without one.
    pub handler: Option<Arc<dyn MessageHandler>>,
    /// Effective worker count is cores x this.
    pub subscriber_per_core: usize,
    pub commit_mode: CommitMode,
    pub consumer_mode: ConsumerMode,
    pub initial_offset: InitialOffset,
    /// Per-message handler deadline.
    pub timeout: Duration,
    /// Broker offset retention override; `None` keeps the broker default.
    pub retention: Option<Duration>,
    pub rebalance_timeout: Duration,
    /// Whether to fetch metadata for all topics rather than subscribed ones.
    pub metadata_full: bool,
    /// Total handler attempts in the ordered strategies.
    pub retry_count: u32,
    pub retry_delay: Duration,
    /// Capacity of the partition-claim fan-out channel.
    pub partitions: usize,
    /// Source of replayed records; only consulted in replay mode.
    pub offset_stash: Option<Arc<dyn OffsetStashProvider>>,
    pub on_error: Option<ErrorCallback>,
    pub on_notification: Option<NotificationCallback>,
    /// Transaction id used when no message is associated.
    pub transaction_id: String,
    /// Liveness handle the runtime loops report into.
    pub liveness: Option<health::HealthHandle>,
}

impl Config {
    pub fn new(brokers: Vec<String>, group: String, topics: Vec<String>) -> Self {
        Self {
            brokers,
            group,
            topics,
            handler: None,
            subscriber_per_core: 20,
            commit_mode: CommitMode::default(),
            consumer_mode: ConsumerMode::default(),
            initial_offset: InitialOffset::default(),
            timeout: Duration::from_secs(60),
            retention: None,
            rebalance_timeout: Duration::from_secs(60),
            metadata_full: true,
            retry_count: 10,
            retry_delay: Duration::from_secs(30),
            partitions: 500,
            offset_stash: None,
            on_error: None,
            on_notification: None,
            transaction_id: Uuid::new_v4().to_string(),
            liveness: None,
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn with_commit_mode(mut self, mode: CommitMode) -> Self {
        self.commit_mode = mode;
        self
    }

    pub fn with_consumer_mode(mut self, mode: ConsumerMode) -> Self {
        self.consumer_mode = mode;
        self
    }

    pub fn with_offset_stash(mut self, provider: Arc<dyn OffsetStashProvider>) -> Self {
        self.offset_stash = Some(provider);
        self
    }

    pub fn with_error_callback(mut self, callback: ErrorCallback) -> Self {
        self.on_error = Some(callback);
        self
    }

    pub fn with_notification_callback(mut self, callback: NotificationCallback) -> Self {
        self.on_notification = Some(callback);
        self
    }

    /// Effective worker count: cores x subscribers per core.
    pub fn pool_size(&self) -> usize {
        num_cpus::get().max(1) * self.subscriber_per_core
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.brokers.is_empty() {
            return Err(ConfigError::MissingBrokers);
        }
        if self.group.is_empty() {
            return Err(ConfigError::MissingGroup);
        }
        if self.topics.is_empty() {
            return Err(ConfigError::MissingTopics);
        }
        if self.handler.is_none() {
            return Err(ConfigError::MissingHandler);
        }
        if self.subscriber_per_core == 0 {
            return Err(ConfigError::InvalidSubscriberCount);
        }
        Ok(())
    }
}

/// Environment-variable form of the consumer options, for services that
/// configure themselves the usual way. Handler and callbacks are attached
/// afterwards on the resulting `Config`.
#[derive(Envconfig, Clone, Debug)]
pub struct EnvConfig {
    #[envconfig(from = "KAFKA_HOSTS", default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(from = "KAFKA_CONSUMER_GROUP")]
    pub kafka_consumer_group: String,

    /// Comma-separated topic list.
    #[envconfig(from = "KAFKA_CONSUMER_TOPICS")]
    pub kafka_consumer_topics: String,

    #[envconfig(from = "KAFKA_SUBSCRIBERS_PER_CORE", default = "20")]
    pub kafka_subscribers_per_core: usize,

    #[envconfig(from = "KAFKA_HANDLER_TIMEOUT_SECS", default = "60")]
    pub kafka_handler_timeout_secs: u64,

    #[envconfig(from = "KAFKA_HANDLER_RETRY_COUNT", default = "10")]
    pub kafka_handler_retry_count: u32,

    #[envconfig(from = "KAFKA_HANDLER_RETRY_DELAY_SECS", default = "30")]
    pub kafka_handler_retry_delay_secs: u64,

    #[envconfig(from = "KAFKA_REBALANCE_TIMEOUT_SECS", default = "60")]
    pub kafka_rebalance_timeout_secs: u64,

    #[envconfig(from = "KAFKA_PARTITION_CAPACITY", default = "500")]
    pub kafka_partition_capacity: usize,

    /// "newest" or "oldest".
    #[envconfig(from = "KAFKA_INITIAL_OFFSET", default = "newest")]
    pub kafka_initial_offset: String,

    #[envconfig(from = "KAFKA_METADATA_FULL", default = "true")]
    pub kafka_metadata_full: bool,
}

impl EnvConfig {
    pub fn into_config(self) -> Result<Config, ConfigError> {
        let initial_offset = match self.kafka_initial_offset.to_lowercase().as_str() {
            "newest" | "latest" => InitialOffset::Newest,
            "oldest" | "earliest" => InitialOffset::Oldest,
            other => return Err(ConfigError::InvalidInitialOffset(other.to_string())),
        };

        let mut config = Config::new(
            split_list(&self.kafka_hosts),
            self.kafka_consumer_group,
            split_list(&self.kafka_consumer_topics),
        );
        config.subscriber_per_core = self.kafka_subscribers_per_core;
        config.timeout = Duration::from_secs(self.kafka_handler_timeout_secs);
        config.retry_count = self.kafka_handler_retry_count;
        config.retry_delay = Duration::from_secs(self.kafka_handler_retry_delay_secs);
        config.rebalance_timeout = Duration::from_secs(self.kafka_rebalance_timeout_secs);
        config.partitions = self.kafka_partition_capacity;
        config.initial_offset = initial_offset;
        config.metadata_full = self.kafka_metadata_full;
        Ok(config)
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
