use thiserror::Error;

/// Errors surfaced synchronously while constructing a consumer.
///
/// Nothing is spawned when construction fails; the caller gets one of these
/// and the process keeps whatever state it had.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("at least one broker address is required")]
    MissingBrokers,

    #[error("consumer group is required")]
    MissingGroup,

    #[error("at least one topic is required")]
    MissingTopics,

    #[error("a message handler is required")]
    MissingHandler,

    #[error("subscribers per core must be positive")]
    InvalidSubscriberCount,

    #[error("unknown initial offset {0:?} (expected \"newest\" or \"oldest\")")]
    InvalidInitialOffset(String),

    #[error("broker streams were already taken")]
    StreamsTaken,

    #[error("kafka client: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
}
