use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::timeout;
use tracing::{error, warn};

use crate::codes;
use crate::context::RuntimeContext;
use crate::message::{Message, OffsetStash};
use crate::metrics_consts::{HANDLER_PANICS, HANDLER_TIMEOUTS};

/// User-supplied processing for each pulled message. Required.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: Message) -> Result<()>;
}

/// Closures work directly as handlers.
#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, message: Message) -> Result<()> {
        (self)(message).await
    }
}

/// Source of historical records re-injected on the first claim of a
/// partition. Only consulted by the offset-replay strategy.
#[async_trait]
pub trait OffsetStashProvider: Send + Sync + 'static {
    async fn fetch(&self, topic: &str, partition: i32) -> Result<Vec<OffsetStash>>;
}

/// Optional callback invoked for broker and handler failures. The message is
/// `None` for broker-level errors.
pub type ErrorCallback = Arc<dyn Fn(&anyhow::Error, Option<&Message>) + Send + Sync>;

/// Optional callback invoked with a stringified rebalance notification.
pub type NotificationCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Runs the handler as its own task under the configured deadline.
///
/// Panics are recovered into errors. On deadline expiry the task is left
/// running (nothing can cancel a blocked handler); a watcher reports its
/// eventual failure through the error callback, and the caller proceeds so
/// the partition can advance.
pub(crate) async fn invoke_handler(ctx: &RuntimeContext, message: &Message) -> Result<()> {
    let handler = ctx.handler.clone();
    let msg = message.clone();
    let mut task: JoinHandle<Result<()>> = tokio::spawn(async move { handler.handle(msg).await });

    match timeout(ctx.timeout, &mut task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_error)) => Err(recovered(join_error)),
        Err(_) => {
            metrics::counter!(HANDLER_TIMEOUTS).increment(1);
            warn!(
                topic = message.topic(),
                partition = message.partition(),
                offset = message.offset(),
                transaction_id = message.transaction_id(),
                "handler exceeded its deadline; abandoning invocation"
            );
            watch_abandoned(ctx, message, task);
            Err(anyhow!(
                "handler exceeded {}ms deadline",
                ctx.timeout.as_millis()
            ))
        }
    }
}

/// Invokes the handler up to `retry_count` times with `retry_delay` between
/// failures, returning the final error when every attempt fails.
pub(crate) async fn invoke_with_retry(ctx: &RuntimeContext, message: &Message) -> Result<()> {
    let attempts = ctx.retry_count.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match invoke_handler(ctx, message).await {
            Ok(()) => return Ok(()),
            Err(e) if attempt < attempts => {
                warn!(
                    topic = message.topic(),
                    partition = message.partition(),
                    offset = message.offset(),
                    attempt,
                    error = %e,
                    "handler failed; retrying"
                );
                tokio::time::sleep(ctx.retry_delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Reports an error through the user callback, recovering callback panics.
pub(crate) fn report_error(ctx: &RuntimeContext, error: &anyhow::Error, message: Option<&Message>) {
    let Some(callback) = &ctx.on_error else { return };
    if catch_unwind(AssertUnwindSafe(|| callback(error, message))).is_err() {
        error!(code = codes::CALLBACK_PANIC_RECOVERED, "error callback panicked");
    }
}

/// Forwards a stringified notification to the user callback; a panicking
/// callback is recovered and routed through the error callback.
pub(crate) fn report_notification(ctx: &RuntimeContext, notification: &str) {
    let Some(callback) = &ctx.on_notification else { return };
    if catch_unwind(AssertUnwindSafe(|| callback(notification))).is_err() {
        error!(
            code = codes::NOTIFICATION_PANIC_RECOVERED,
            "notification callback panicked"
        );
        report_error(ctx, &anyhow!("notification callback panicked"), None);
    }
}

fn recovered(join_error: JoinError) -> anyhow::Error {
    if join_error.is_panic() {
        metrics::counter!(HANDLER_PANICS).increment(1);
        let payload = join_error.into_panic();
        let detail = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "opaque panic payload".to_string()
        };
        error!(
            code = codes::JOB_PANIC_RECOVERED,
            detail = %detail,
            "handler panicked"
        );
        anyhow!("handler panicked: {detail}")
    } else {
        anyhow!("handler task was cancelled")
    }
}

fn watch_abandoned(ctx: &RuntimeContext, message: &Message, task: JoinHandle<Result<()>>) {
    let on_error = ctx.on_error.clone();
    let message = message.clone();
    tokio::spawn(async move {
        let outcome = match task.await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(join_error) => Some(recovered(join_error)),
        };
        if let Some(error) = outcome {
            warn!(
                topic = message.topic(),
                partition = message.partition(),
                offset = message.offset(),
                error = %error,
                "abandoned handler eventually failed"
            );
            if let Some(callback) = on_error {
                if catch_unwind(AssertUnwindSafe(|| callback(&error, Some(&message)))).is_err() {
                    error!(
                        code = codes::CALLBACK_PANIC_RECOVERED,
                        "error callback panicked"
                    );
                }
            }
        }
    });
}
