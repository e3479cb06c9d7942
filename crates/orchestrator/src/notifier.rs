use tracing::error;

use crate::error::ProcessingError;
use crate::notification::NotificationHelper;

/// Receives the outcome of a phase.
///
/// A phase calls exactly one of these methods, exactly once.
pub trait PhaseResultNotifier: Send + Sync {
    fn phase_successfully(&self);

    fn phase_failure(&self, reason: ProcessingError);

    /// The phase fully handled the message; no further phases run.
    fn phase_consumed_message(&self);
}

/// Last stop for failures no phase could recover from.
pub trait SystemExceptionHandler: Send + Sync {
    fn handle_exception(&self, error: &ProcessingError);
}

/// Logs system failures and optionally reports them as error notifications.
#[derive(Debug, Clone, Default)]
pub struct LoggingSystemExceptionHandler {
    notifications: NotificationHelper,
}

impl LoggingSystemExceptionHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_notifications(mut self, notifications: NotificationHelper) -> Self {
        self.notifications = notifications;
        self
    }
}

impl SystemExceptionHandler for LoggingSystemExceptionHandler {
    fn handle_exception(&self, err: &ProcessingError) {
        error!(error = %err, "Message processing failed");
        self.notifications
            .error(err.to_string(), Some("message_processing".to_string()));
    }
}
