use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use rdkafka::message::{Headers, OwnedMessage};
use rdkafka::Message as _;
use uuid::Uuid;

/// Header key carrying an upstream transaction id, when the producer set one.
pub const TRANSACTION_ID_HEADER: &str = "transaction-id";

/// One record pulled from a topic partition.
///
/// Owned end to end so it can cross task boundaries; the transaction id is
/// derived lazily and the cache is shared across clones, so retries of the
/// same message observe the same id.
#[derive(Debug, Clone)]
pub struct Message {
    value: Vec<u8>,
    topic: String,
    partition: i32,
    offset: i64,
    pulled_at: DateTime<Utc>,
    headers: HashMap<String, String>,
    transaction_id: Arc<OnceCell<String>>,
}

impl Message {
    pub fn new(
        topic: String,
        partition: i32,
        offset: i64,
        value: Vec<u8>,
        headers: HashMap<String, String>,
    ) -> Self {
        Self {
            value,
            topic,
            partition,
            offset,
            pulled_at: Utc::now(),
            headers,
            transaction_id: Arc::new(OnceCell::new()),
        }
    }

    pub(crate) fn from_owned(msg: &OwnedMessage) -> Self {
        let headers = msg.headers().map(collect_headers).unwrap_or_default();
        Self::new(
            msg.topic().to_string(),
            msg.partition(),
            msg.offset(),
            msg.payload().map(|p| p.to_vec()).unwrap_or_default(),
            headers,
        )
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn pulled_at(&self) -> DateTime<Utc> {
        self.pulled_at
    }

    /// Returns a copy of the headers; mutating it does not affect the message.
    pub fn headers(&self) -> HashMap<String, String> {
        self.headers.clone()
    }

    /// Returns the header value, or "" when the key is absent.
    pub fn header(&self, key: &str) -> &str {
        self.headers.get(key).map(String::as_str).unwrap_or("")
    }

    /// The transaction id tying this message to upstream processing.
    ///
    /// Taken from the well-known header when present, otherwise generated
    /// once and cached for the lifetime of the message and its clones.
    pub fn transaction_id(&self) -> &str {
        self.transaction_id.get_or_init(|| {
            match self.headers.get(TRANSACTION_ID_HEADER) {
                Some(id) if !id.is_empty() => id.clone(),
                _ => Uuid::new_v4().to_string(),
            }
        })
    }
}

fn collect_headers<H: Headers>(headers: &H) -> HashMap<String, String> {
    headers
        .iter()
        .map(|h| {
            (
                h.key.to_string(),
                h.value
                    .map(|v| String::from_utf8_lossy(v).into_owned())
                    .unwrap_or_default(),
            )
        })
        .collect()
}

/// A pre-formed record the replay strategy feeds to the handler as if it had
/// just been pulled from the broker.
#[derive(Debug, Clone)]
pub struct OffsetStash {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub value: Vec<u8>,
    pub headers: HashMap<String, String>,
    pub pulled_at: DateTime<Utc>,
    pub transaction_id: String,
}

impl OffsetStash {
    /// Converts the stash entry into a message the handler can consume.
    pub fn into_message(self) -> Message {
        let transaction_id = Arc::new(OnceCell::new());
        if !self.transaction_id.is_empty() {
            transaction_id.set(self.transaction_id).ok();
        }
        Message {
            value: self.value,
            topic: self.topic,
            partition: self.partition,
            offset: self.offset,
            pulled_at: self.pulled_at,
            headers: self.headers,
            transaction_id,
        }
    }
}
