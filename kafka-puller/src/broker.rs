use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

use crate::message::Message;

/// Sink for processed offsets. Implementations are thread-safe by contract.
pub trait OffsetMarker: Send + Sync + 'static {
    fn mark_offset(&self, topic: &str, partition: i32, offset: i64) -> Result<()>;
}

/// The consumer-group client the runtime is built against.
///
/// Streams are handed out exactly once; the claim stream is only populated
/// when the client was configured for per-partition delivery.
#[async_trait]
pub trait BrokerClient: Send + Sync + 'static {
    /// Takes the stream bundle. Returns `None` after the first call.
    fn take_streams(&mut self) -> Option<BrokerStreams>;

    /// A cheap handle for marking offsets from any task.
    fn marker(&self) -> Arc<dyn OffsetMarker>;

    /// Connectivity probe over a short-lived client.
    async fn probe(&self) -> Result<BrokerProbe>;

    /// Tears the client down. Idempotent; returns the underlying error.
    fn close(&self) -> Result<()>;
}

/// The four streams a broker client produces.
pub struct BrokerStreams {
    pub messages: mpsc::Receiver<Message>,
    pub partitions: mpsc::Receiver<PartitionClaim>,
    pub errors: mpsc::Receiver<anyhow::Error>,
    pub notifications: mpsc::Receiver<RebalanceNotification>,
}

/// Ownership of one (topic, partition) and its message stream.
pub struct PartitionClaim {
    topic: String,
    partition: i32,
    messages: mpsc::Receiver<Message>,
}

/// Outcome of a non-blocking look at a claim's stream.
pub enum ClaimPeek {
    Message(Message),
    Empty,
    Closed,
}

impl PartitionClaim {
    pub fn new(topic: String, partition: i32, messages: mpsc::Receiver<Message>) -> Self {
        Self {
            topic,
            partition,
            messages,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    /// Non-blocking peek at the next message, distinguishing an idle stream
    /// from one the broker has closed (partition revoked).
    pub fn peek(&mut self) -> ClaimPeek {
        match self.messages.try_recv() {
            Ok(message) => ClaimPeek::Message(message),
            Err(TryRecvError::Empty) => ClaimPeek::Empty,
            Err(TryRecvError::Disconnected) => ClaimPeek::Closed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebalanceKind {
    Start,
    Error,
    Ok,
}

/// A group-membership change reported by the broker client.
///
/// `released` is only populated on `Ok` and names the partitions this
/// consumer no longer owns.
#[derive(Debug, Clone)]
pub struct RebalanceNotification {
    pub kind: RebalanceKind,
    pub claimed: HashMap<String, Vec<i32>>,
    pub released: HashMap<String, Vec<i32>>,
    pub current: HashMap<String, Vec<i32>>,
    pub error: Option<String>,
}

impl RebalanceNotification {
    pub fn start() -> Self {
        Self {
            kind: RebalanceKind::Start,
            claimed: HashMap::new(),
            released: HashMap::new(),
            current: HashMap::new(),
            error: None,
        }
    }

    pub fn ok(
        claimed: HashMap<String, Vec<i32>>,
        released: HashMap<String, Vec<i32>>,
        current: HashMap<String, Vec<i32>>,
    ) -> Self {
        Self {
            kind: RebalanceKind::Ok,
            claimed,
            released,
            current,
            error: None,
        }
    }

    pub fn error(detail: String) -> Self {
        Self {
            kind: RebalanceKind::Error,
            claimed: HashMap::new(),
            released: HashMap::new(),
            current: HashMap::new(),
            error: Some(detail),
        }
    }
}

impl fmt::Display for RebalanceNotification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            RebalanceKind::Start => write!(f, "rebalance started"),
            RebalanceKind::Error => write!(
                f,
                "rebalance error: {}",
                self.error.as_deref().unwrap_or("unknown")
            ),
            RebalanceKind::Ok => write!(
                f,
                "rebalance ok: claimed={:?} released={:?} current={:?}",
                self.claimed, self.released, self.current
            ),
        }
    }
}

/// Connectivity data gathered by a broker probe.
#[derive(Debug, Clone, Default)]
pub struct BrokerProbe {
    /// Whether the group coordinator answered.
    pub coordinator_ok: bool,
    /// Configured address -> currently connected.
    pub brokers: HashMap<String, bool>,
    /// Topic -> partition ids, for the configured topics.
    pub partitions: HashMap<String, Vec<i32>>,
}

/// Marker wrapper that drops marks at or below the highest offset already
/// marked for a partition, so a late or repeated mark cannot move the
/// committed offset backwards.
pub struct MonotonicMarker {
    inner: Arc<dyn OffsetMarker>,
    watermarks: DashMap<(String, i32), i64>,
}

impl MonotonicMarker {
    pub fn new(inner: Arc<dyn OffsetMarker>) -> Self {
        Self {
            inner,
            watermarks: DashMap::new(),
        }
    }
}

impl OffsetMarker for MonotonicMarker {
    fn mark_offset(&self, topic: &str, partition: i32, offset: i64) -> Result<()> {
        use dashmap::mapref::entry::Entry;

        match self.watermarks.entry((topic.to_string(), partition)) {
            Entry::Occupied(mut current) => {
                if offset <= *current.get() {
                    return Ok(());
                }
                current.insert(offset);
            }
            Entry::Vacant(slot) => {
                slot.insert(offset);
            }
        }
        self.inner.mark_offset(topic, partition, offset)
    }
}
