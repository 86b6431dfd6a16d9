//! Bounded worker pool used by the unordered strategy.
//!
//! A capacity-1 intake channel feeds a bounded jobs queue through a feeder
//! task; N workers drain the queue. Shutdown cancels the feeder, which
//! closes the queue, and workers exit once it is drained.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::context::RuntimeContext;
use crate::handler::{invoke_handler, report_error};
use crate::message::Message;
use crate::metrics_consts::{HANDLER_FAILURES, POOL_JOBS};

pub(crate) struct WorkerPool {
    intake: mpsc::Sender<Message>,
    shutdown: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl WorkerPool {
    pub fn start(ctx: Arc<RuntimeContext>, size: usize) -> Self {
        let size = size.max(1);
        info!(size, "starting worker pool");

        let (intake_tx, mut intake_rx) = mpsc::channel::<Message>(1);
        let (jobs_tx, jobs_rx) = mpsc::channel::<Message>(size);
        let jobs_rx = Arc::new(Mutex::new(jobs_rx));
        let shutdown = CancellationToken::new();

        let mut handles = Vec::with_capacity(size + 1);

        let token = shutdown.clone();
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    next = intake_rx.recv() => {
                        let Some(message) = next else { break };
                        if jobs_tx.send(message).await.is_err() {
                            break;
                        }
                    }
                }
            }
            // Dropping jobs_tx closes the queue; workers drain what is left.
        }));

        for worker_id in 0..size {
            let jobs = jobs_rx.clone();
            let ctx = ctx.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let next = { jobs.lock().await.recv().await };
                    let Some(message) = next else { break };
                    run_job(&ctx, message).await;
                }
                debug!(worker_id, "pool worker exited");
            }));
        }

        Self {
            intake: intake_tx,
            shutdown,
            handles: Mutex::new(handles),
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueues a message; returns false once the pool has shut down.
    pub async fn submit(&self, message: Message) -> bool {
        self.intake.send(message).await.is_ok()
    }

    /// Stops the feeder and waits for every worker to finish the jobs that
    /// were already queued. Safe to call more than once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();
        let drained: Vec<JoinHandle<()>> = {
            let mut handles = self.handles.lock().await;
            handles.drain(..).collect()
        };
        for handle in drained {
            let _unused = handle.await;
        }
        info!("worker pool shut down");
    }
}

async fn run_job(ctx: &RuntimeContext, message: Message) {
    metrics::counter!(POOL_JOBS).increment(1);
    ctx.commit
        .before_handler(message.topic(), message.partition(), message.offset());

    let result = invoke_handler(ctx, &message).await;
    if let Err(e) = &result {
        metrics::counter!(HANDLER_FAILURES).increment(1);
        report_error(ctx, e, Some(&message));
    }

    // Runs whatever happened above, so the partition ledger never wedges on
    // a failed or abandoned handler.
    ctx.commit
        .after_handler(message.topic(), message.partition(), message.offset());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::CommitStrategy;
    use crate::handler::MessageHandler;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingCommit {
        after: StdMutex<Vec<i64>>,
    }

    impl CommitStrategy for RecordingCommit {
        fn on_pull(&self, _topic: &str, _partition: i32, _offset: i64) {}
        fn after_handler(&self, _topic: &str, _partition: i32, offset: i64) {
            self.after.lock().unwrap().push(offset);
        }
    }

    fn context(
        handler: Arc<dyn MessageHandler>,
        commit: Arc<RecordingCommit>,
    ) -> Arc<RuntimeContext> {
        Arc::new(RuntimeContext {
            handler,
            commit,
            on_error: None,
            on_notification: None,
            timeout: Duration::from_secs(1),
            retry_count: 1,
            retry_delay: Duration::from_millis(1),
            transaction_id: "test".to_string(),
            liveness: None,
        })
    }

    fn message(offset: i64) -> Message {
        Message::new("t".to_string(), 0, offset, vec![], Default::default())
    }

    async fn wait_until<F: Fn() -> bool>(check: F) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(check());
    }

    #[tokio::test]
    async fn jobs_run_and_completion_is_recorded() {
        let handled = Arc::new(AtomicUsize::new(0));
        let counted = handled.clone();
        let handler = Arc::new(move |_msg: Message| {
            let counted = counted.clone();
            async move {
                counted.fetch_add(1, Ordering::SeqCst);
                Ok::<(), anyhow::Error>(())
            }
        });
        let commit = Arc::new(RecordingCommit::default());
        let pool = WorkerPool::start(context(handler, commit.clone()), 4);

        for offset in 0..10 {
            assert!(pool.submit(message(offset)).await);
        }
        wait_until(|| handled.load(Ordering::SeqCst) == 10).await;
        wait_until(|| commit.after.lock().unwrap().len() == 10).await;

        pool.close().await;
    }

    #[tokio::test]
    async fn panicking_job_still_completes_its_offset() {
        let handler = Arc::new(|msg: Message| async move {
            if msg.offset() == 1 {
                panic!("bad payload");
            }
            Ok::<(), anyhow::Error>(())
        });
        let commit = Arc::new(RecordingCommit::default());
        let pool = WorkerPool::start(context(handler, commit.clone()), 2);

        assert!(pool.submit(message(1)).await);
        assert!(pool.submit(message(2)).await);
        wait_until(|| commit.after.lock().unwrap().len() == 2).await;

        pool.close().await;
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let handler = Arc::new(|_msg: Message| async move { Ok::<(), anyhow::Error>(()) });
        let commit = Arc::new(RecordingCommit::default());
        let pool = WorkerPool::start(context(handler, commit), 2);

        pool.close().await;
        pool.close().await;
    }
}
