//! Stable codes attached to logged failure sites.
//!
//! Dashboards and alerts key off these, so they must not change once shipped.

/// Fetching the custom offset stash failed after exhausting retries.
pub const REPLAY_FETCH_FAILED: &str = "Kafka101";

/// A replayed stash message failed its handler after exhausting retries.
pub const REPLAY_HANDLER_FAILED: &str = "Kafka102";

/// A message handler panicked inside a pool or partition worker.
pub const JOB_PANIC_RECOVERED: &str = "JobPanicRecovered";

/// The user notification callback panicked.
pub const NOTIFICATION_PANIC_RECOVERED: &str = "NotificationPanicRecovered";

/// The user error callback panicked.
pub const CALLBACK_PANIC_RECOVERED: &str = "CallbackPanicRecovered";
