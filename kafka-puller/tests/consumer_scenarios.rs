//! End-to-end scenarios over the in-memory broker: each strategy/commit
//! combination, replay, retries, timeouts, and the service surface.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use kafka_puller::test_utils::{prepare_claim, test_message, MockBroker, MockBrokerHandle};
use kafka_puller::{
    CommitMode, Config, ConsumerMode, Message, OffsetStash, OffsetStashProvider, PullConsumer,
    RebalanceNotification,
};

fn base_config() -> Config {
    let mut config = Config::new(
        vec!["localhost:9092".to_string()],
        "scenarios".to_string(),
        vec!["events".to_string()],
    );
    // Keep the suite fast; production defaults are minutes.
    config.timeout = Duration::from_secs(1);
    config.retry_delay = Duration::from_millis(1);
    config.subscriber_per_core = 2;
    config
}

fn start(config: Config) -> (PullConsumer, MockBrokerHandle) {
    let (broker, handle) = MockBroker::new();
    let consumer = PullConsumer::with_broker(config, Box::new(broker)).expect("valid config");
    consumer.pull();
    (consumer, handle)
}

async fn wait_for<F: Fn() -> bool>(check: F, what: &str) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

struct Recording {
    offsets: Mutex<Vec<i64>>,
    calls: AtomicUsize,
}

impl Recording {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            offsets: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        })
    }

    fn offsets(&self) -> Vec<i64> {
        self.offsets.lock().unwrap().clone()
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn recording_handler(recording: Arc<Recording>) -> Arc<dyn kafka_puller::MessageHandler> {
    Arc::new(move |msg: Message| {
        let recording = recording.clone();
        async move {
            recording.calls.fetch_add(1, Ordering::SeqCst);
            recording.offsets.lock().unwrap().push(msg.offset());
            Ok::<(), anyhow::Error>(())
        }
    })
}

fn counting_errors() -> (Arc<AtomicUsize>, kafka_puller::ErrorCallback) {
    let count = Arc::new(AtomicUsize::new(0));
    let counted = count.clone();
    let callback: kafka_puller::ErrorCallback =
        Arc::new(move |_err: &anyhow::Error, _msg: Option<&Message>| {
            counted.fetch_add(1, Ordering::SeqCst);
        });
    (count, callback)
}

#[tokio::test]
async fn unordered_happy_path_marks_on_pull() {
    let recording = Recording::new();
    let (errors, on_error) = counting_errors();
    let config = base_config()
        .with_handler(recording_handler(recording.clone()))
        .with_error_callback(on_error);
    let (consumer, handle) = start(config);

    handle.feed("events", 0, 10, b"a").await;
    handle.feed("events", 0, 11, b"b").await;
    handle.feed("events", 1, 20, b"c").await;

    wait_for(|| recording.calls() == 3, "three handled messages").await;
    wait_for(|| handle.marks().len() == 3, "three marks").await;

    let mut marks = handle.marks();
    marks.sort();
    assert_eq!(
        marks,
        vec![
            ("events".to_string(), 0, 10),
            ("events".to_string(), 0, 11),
            ("events".to_string(), 1, 20),
        ]
    );
    assert_eq!(errors.load(Ordering::SeqCst), 0);

    consumer.close().await.unwrap();
    assert!(handle.is_closed());
}

#[tokio::test]
async fn ordered_retries_until_success() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counted = calls.clone();
    let handler = Arc::new(move |_msg: Message| {
        let calls = counted.clone();
        async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(anyhow!("x"))
            } else {
                Ok(())
            }
        }
    });

    let (errors, on_error) = counting_errors();
    let mut config = base_config()
        .with_handler(handler)
        .with_commit_mode(CommitMode::OnMessageCompletion)
        .with_consumer_mode(ConsumerMode::PullOrdered)
        .with_error_callback(on_error);
    config.retry_count = 3;
    let (consumer, handle) = start(config);

    let (claim, feed) = prepare_claim("events", 0);
    feed.send(test_message("events", 0, 100, b"payload"))
        .await
        .unwrap();
    handle.partitions.send(claim).await.unwrap();

    wait_for(|| calls.load(Ordering::SeqCst) == 3, "three attempts").await;
    wait_for(
        || handle.committed("events", 0) == Some(100),
        "offset 100 committed",
    )
    .await;
    assert_eq!(errors.load(Ordering::SeqCst), 0);

    consumer.close().await.unwrap();
}

#[tokio::test]
async fn ordered_retry_exhaustion_surfaces_the_error_and_still_completes() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counted = calls.clone();
    let handler = Arc::new(move |_msg: Message| {
        let calls = counted.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), anyhow::Error>(anyhow!("always failing"))
        }
    });

    let (errors, on_error) = counting_errors();
    let mut config = base_config()
        .with_handler(handler)
        .with_commit_mode(CommitMode::OnMessageCompletion)
        .with_consumer_mode(ConsumerMode::PullOrdered)
        .with_error_callback(on_error);
    config.retry_count = 3;
    let (consumer, handle) = start(config);

    let (claim, feed) = prepare_claim("events", 0);
    feed.send(test_message("events", 0, 100, b"payload"))
        .await
        .unwrap();
    handle.partitions.send(claim).await.unwrap();

    wait_for(|| calls.load(Ordering::SeqCst) == 3, "three attempts").await;
    wait_for(|| errors.load(Ordering::SeqCst) == 1, "one surfaced error").await;
    // The offset still completes so the partition can advance.
    wait_for(
        || handle.committed("events", 0) == Some(100),
        "offset 100 committed",
    )
    .await;

    consumer.close().await.unwrap();
}

#[tokio::test]
async fn completion_commits_only_behind_the_lowest_in_progress_offset() {
    // Delay completion of offset 1 so 2 and 3 finish first; the single
    // commit must jump straight to 3.
    let handler = Arc::new(|msg: Message| async move {
        let delay = match msg.offset() {
            1 => 150,
            2 => 10,
            _ => 40,
        };
        tokio::time::sleep(Duration::from_millis(delay)).await;
        Ok::<(), anyhow::Error>(())
    });

    let config = base_config()
        .with_handler(handler)
        .with_commit_mode(CommitMode::OnMessageCompletion);
    let (consumer, handle) = start(config);

    handle.feed("events", 0, 1, b"a").await;
    handle.feed("events", 0, 2, b"b").await;
    handle.feed("events", 0, 3, b"c").await;

    wait_for(
        || handle.committed("events", 0) == Some(3),
        "watermark at 3",
    )
    .await;
    let partition_marks: Vec<i64> = handle
        .marks()
        .into_iter()
        .filter(|(t, p, _)| t == "events" && *p == 0)
        .map(|(_, _, o)| o)
        .collect();
    assert_eq!(partition_marks, vec![3], "single commit straight to 3");

    consumer.close().await.unwrap();
}

struct StashOfTwo {
    fetches: AtomicUsize,
}

#[async_trait]
impl OffsetStashProvider for StashOfTwo {
    async fn fetch(&self, topic: &str, partition: i32) -> Result<Vec<OffsetStash>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(vec![
            OffsetStash {
                topic: topic.to_string(),
                partition,
                offset: 50,
                value: b"r1".to_vec(),
                headers: HashMap::new(),
                pulled_at: chrono::Utc::now(),
                transaction_id: "txn-50".to_string(),
            },
            OffsetStash {
                topic: topic.to_string(),
                partition,
                offset: 51,
                value: b"r2".to_vec(),
                headers: HashMap::new(),
                pulled_at: chrono::Utc::now(),
                transaction_id: String::new(),
            },
        ])
    }
}

#[tokio::test]
async fn replay_precedes_live_and_reruns_after_release() {
    let recording = Recording::new();
    let stash = Arc::new(StashOfTwo {
        fetches: AtomicUsize::new(0),
    });

    // Observed after the strategy hook ran, so the test can sequence the
    // re-claim behind the release.
    let notified = Arc::new(AtomicUsize::new(0));
    let notified_sink = notified.clone();
    let on_notification: kafka_puller::NotificationCallback = Arc::new(move |_text: &str| {
        notified_sink.fetch_add(1, Ordering::SeqCst);
    });

    let config = base_config()
        .with_handler(recording_handler(recording.clone()))
        .with_commit_mode(CommitMode::OnMessageCompletion)
        .with_consumer_mode(ConsumerMode::PullOrderedWithOffsetReplay)
        .with_offset_stash(stash.clone())
        .with_notification_callback(on_notification);
    let (consumer, handle) = start(config);

    let (claim, feed) = prepare_claim("events", 0);
    feed.send(test_message("events", 0, 60, b"live")).await.unwrap();
    handle.partitions.send(claim).await.unwrap();

    wait_for(|| recording.calls() == 3, "two replayed plus one live").await;
    assert_eq!(recording.offsets(), vec![50, 51, 60]);
    assert_eq!(stash.fetches.load(Ordering::SeqCst), 1);

    // A successful rebalance releasing the partition resets its replay
    // state; the next claim replays again.
    let mut released = HashMap::new();
    released.insert("events".to_string(), vec![0]);
    handle
        .notifications
        .send(RebalanceNotification::ok(
            HashMap::new(),
            released,
            HashMap::new(),
        ))
        .await
        .unwrap();
    wait_for(
        || notified.load(Ordering::SeqCst) == 1,
        "release processed by the strategy",
    )
    .await;

    // Re-claim after the release.
    let (claim, _feed) = prepare_claim("events", 0);
    handle.partitions.send(claim).await.unwrap();

    wait_for(
        || stash.fetches.load(Ordering::SeqCst) == 2,
        "second replay after release",
    )
    .await;

    consumer.close().await.unwrap();
}

#[tokio::test]
async fn rebalance_start_does_not_reset_replay_state() {
    let recording = Recording::new();
    let stash = Arc::new(StashOfTwo {
        fetches: AtomicUsize::new(0),
    });

    let config = base_config()
        .with_handler(recording_handler(recording.clone()))
        .with_consumer_mode(ConsumerMode::PullOrderedWithOffsetReplay)
        .with_offset_stash(stash.clone());
    let (consumer, handle) = start(config);

    let _feed = handle.claim("events", 0).await;
    wait_for(|| stash.fetches.load(Ordering::SeqCst) == 1, "first replay").await;

    handle
        .notifications
        .send(RebalanceNotification::start())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Still claimed: a re-claim without a release must not replay again.
    let _feed2 = handle.claim("events", 0).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(stash.fetches.load(Ordering::SeqCst), 1);

    consumer.close().await.unwrap();
}

#[tokio::test]
async fn handler_timeout_does_not_wedge_the_partition() {
    let finished = Arc::new(AtomicUsize::new(0));
    let counted = finished.clone();
    let handler = Arc::new(move |msg: Message| {
        let finished = counted.clone();
        async move {
            if msg.offset() == 7 {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            finished.fetch_add(1, Ordering::SeqCst);
            Ok::<(), anyhow::Error>(())
        }
    });

    let mut config = base_config()
        .with_handler(handler)
        .with_commit_mode(CommitMode::OnMessageCompletion);
    config.timeout = Duration::from_millis(10);
    let (consumer, handle) = start(config);

    handle.feed("events", 0, 7, b"slow").await;

    // The offset completes well before the handler would have finished.
    wait_for(|| handle.committed("events", 0) == Some(7), "offset 7 committed").await;
    assert_eq!(finished.load(Ordering::SeqCst), 0);

    // The partition keeps moving.
    handle.feed("events", 0, 8, b"fast").await;
    wait_for(|| handle.committed("events", 0) == Some(8), "offset 8 committed").await;

    consumer.close().await.unwrap();
}

#[tokio::test]
async fn broker_errors_flip_can_consume_and_reach_the_callback() {
    let recording = Recording::new();
    let (errors, on_error) = counting_errors();
    let config = base_config()
        .with_handler(recording_handler(recording))
        .with_error_callback(on_error);
    let (consumer, handle) = start(config);

    assert!(consumer.health().await.unwrap().can_consume);

    handle.errors.send(anyhow!("broker went away")).await.unwrap();
    wait_for(|| errors.load(Ordering::SeqCst) == 1, "error callback").await;
    assert!(!consumer.health().await.unwrap().can_consume);

    consumer.close().await.unwrap();
}

#[tokio::test]
async fn notifications_reach_the_user_callback() {
    let recording = Recording::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let callback: kafka_puller::NotificationCallback = Arc::new(move |text| {
        sink.lock().unwrap().push(text.to_string());
    });

    let config = base_config()
        .with_handler(recording_handler(recording))
        .with_notification_callback(callback);
    let (consumer, handle) = start(config);

    handle
        .notifications
        .send(RebalanceNotification::start())
        .await
        .unwrap();
    wait_for(|| !seen.lock().unwrap().is_empty(), "notification text").await;
    assert!(seen.lock().unwrap()[0].contains("rebalance started"));

    consumer.close().await.unwrap();
}

#[tokio::test]
async fn mark_offset_is_monotonic_per_partition() {
    let recording = Recording::new();
    let config = base_config().with_handler(recording_handler(recording));
    let (consumer, handle) = start(config);

    consumer.mark_offset("events", 0, 10);
    consumer.mark_offset("events", 0, 5);
    consumer.mark_offset("events", 0, 11);

    assert_eq!(
        handle.marks(),
        vec![("events".to_string(), 0, 10), ("events".to_string(), 0, 11)]
    );

    consumer.close().await.unwrap();
}

#[tokio::test]
async fn close_is_idempotent() {
    let recording = Recording::new();
    let config = base_config().with_handler(recording_handler(recording));
    let (consumer, handle) = start(config);

    consumer.close().await.unwrap();
    consumer.close().await.unwrap();
    assert!(handle.is_closed());
}

#[tokio::test]
async fn construction_fails_without_required_fields() {
    let (broker, _handle) = MockBroker::new();
    let mut config = base_config();
    config.group = String::new();
    let err = PullConsumer::with_broker(config, Box::new(broker));
    assert!(err.is_err());
}
