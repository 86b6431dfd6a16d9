//! Metric names emitted by the consumer runtime.

pub const MESSAGES_PULLED: &str = "kafka_puller_messages_pulled_total";
pub const HANDLER_FAILURES: &str = "kafka_puller_handler_failures_total";
pub const HANDLER_TIMEOUTS: &str = "kafka_puller_handler_timeouts_total";
pub const HANDLER_PANICS: &str = "kafka_puller_handler_panics_total";
pub const OFFSETS_MARKED: &str = "kafka_puller_offsets_marked_total";
pub const BROKER_ERRORS: &str = "kafka_puller_broker_errors_total";
pub const REBALANCE_NOTIFICATIONS: &str = "kafka_puller_rebalance_notifications_total";
pub const REPLAY_RUNS: &str = "kafka_puller_replay_runs_total";
pub const REPLAY_MESSAGES: &str = "kafka_puller_replay_messages_total";
pub const CLAIMS_DROPPED: &str = "kafka_puller_claims_dropped_total";
pub const POOL_JOBS: &str = "kafka_puller_pool_jobs_total";
