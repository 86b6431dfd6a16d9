//! In-memory broker client for exercising the consumer runtime without a
//! cluster. Used by this crate's integration tests; exported so downstream
//! services can drive their handlers the same way.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::broker::{
    BrokerClient, BrokerProbe, BrokerStreams, OffsetMarker, PartitionClaim, RebalanceNotification,
};
use crate::message::Message;

const CHANNEL_CAPACITY: usize = 128;

struct MockState {
    marks: Mutex<Vec<(String, i32, i64)>>,
    closed: AtomicBool,
    probe: Mutex<BrokerProbe>,
}

/// The `BrokerClient` half handed to the consumer.
pub struct MockBroker {
    streams: Option<BrokerStreams>,
    state: Arc<MockState>,
}

/// The test's half: feed streams and observe marks.
#[derive(Clone)]
pub struct MockBrokerHandle {
    pub messages: mpsc::Sender<Message>,
    pub partitions: mpsc::Sender<PartitionClaim>,
    pub errors: mpsc::Sender<anyhow::Error>,
    pub notifications: mpsc::Sender<RebalanceNotification>,
    state: Arc<MockState>,
}

impl MockBroker {
    pub fn new() -> (Self, MockBrokerHandle) {
        let (messages_tx, messages_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (partitions_tx, partitions_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (errors_tx, errors_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (notifications_tx, notifications_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let state = Arc::new(MockState {
            marks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            probe: Mutex::new(BrokerProbe {
                coordinator_ok: true,
                brokers: HashMap::new(),
                partitions: HashMap::new(),
            }),
        });

        let broker = Self {
            streams: Some(BrokerStreams {
                messages: messages_rx,
                partitions: partitions_rx,
                errors: errors_rx,
                notifications: notifications_rx,
            }),
            state: state.clone(),
        };
        let handle = MockBrokerHandle {
            messages: messages_tx,
            partitions: partitions_tx,
            errors: errors_tx,
            notifications: notifications_tx,
            state,
        };
        (broker, handle)
    }
}

struct MockMarker {
    state: Arc<MockState>,
}

impl OffsetMarker for MockMarker {
    fn mark_offset(&self, topic: &str, partition: i32, offset: i64) -> Result<()> {
        if let Ok(mut marks) = self.state.marks.lock() {
            marks.push((topic.to_string(), partition, offset));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerClient for MockBroker {
    fn take_streams(&mut self) -> Option<BrokerStreams> {
        self.streams.take()
    }

    fn marker(&self) -> Arc<dyn OffsetMarker> {
        Arc::new(MockMarker {
            state: self.state.clone(),
        })
    }

    async fn probe(&self) -> Result<BrokerProbe> {
        Ok(self
            .state
            .probe
            .lock()
            .map(|probe| probe.clone())
            .unwrap_or_default())
    }

    fn close(&self) -> Result<()> {
        self.state.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl MockBrokerHandle {
    /// All offsets marked so far, in order.
    pub fn marks(&self) -> Vec<(String, i32, i64)> {
        self.state
            .marks
            .lock()
            .map(|marks| marks.clone())
            .unwrap_or_default()
    }

    /// The last mark for a partition, if any.
    pub fn committed(&self, topic: &str, partition: i32) -> Option<i64> {
        self.marks()
            .into_iter()
            .filter(|(t, p, _)| t == topic && *p == partition)
            .map(|(_, _, offset)| offset)
            .last()
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    pub fn set_probe(&self, probe: BrokerProbe) {
        if let Ok(mut slot) = self.state.probe.lock() {
            *slot = probe;
        }
    }

    /// Feeds a message into the merged stream (unordered mode).
    pub async fn feed(&self, topic: &str, partition: i32, offset: i64, value: &[u8]) {
        let message = Message::new(
            topic.to_string(),
            partition,
            offset,
            value.to_vec(),
            HashMap::new(),
        );
        self.messages.send(message).await.expect("merged stream closed");
    }

    /// Delivers a partition claim; the returned sender feeds its stream.
    pub async fn claim(&self, topic: &str, partition: i32) -> mpsc::Sender<Message> {
        let (claim, feed_tx) = prepare_claim(topic, partition);
        self.partitions.send(claim).await.expect("claim stream closed");
        feed_tx
    }
}

/// Builds a claim and its feeding sender without delivering it, so a test
/// can queue messages before the consumer sees the claim.
pub fn prepare_claim(topic: &str, partition: i32) -> (PartitionClaim, mpsc::Sender<Message>) {
    let (feed_tx, feed_rx) = mpsc::channel(CHANNEL_CAPACITY);
    (
        PartitionClaim::new(topic.to_string(), partition, feed_rx),
        feed_tx,
    )
}

/// Builds a message for feeding partition claims directly.
pub fn test_message(topic: &str, partition: i32, offset: i64, value: &[u8]) -> Message {
    Message::new(
        topic.to_string(),
        partition,
        offset,
        value.to_vec(),
        HashMap::new(),
    )
}
