use std::sync::Arc;
use std::time::Duration;

use crate::commit::CommitStrategy;
use crate::handler::{ErrorCallback, MessageHandler, NotificationCallback};

/// Everything a dispatch loop or worker needs to process one message:
/// the user handler, the active commit strategy, the optional callbacks,
/// and the retry/timeout policy.
pub(crate) struct RuntimeContext {
    pub handler: Arc<dyn MessageHandler>,
    pub commit: Arc<dyn CommitStrategy>,
    pub on_error: Option<ErrorCallback>,
    pub on_notification: Option<NotificationCallback>,
    pub timeout: Duration,
    pub retry_count: u32,
    pub retry_delay: Duration,
    /// Transaction id for log lines with no message in hand.
    pub transaction_id: String,
    pub liveness: Option<health::HealthHandle>,
}
