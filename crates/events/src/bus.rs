//! In-process fan-out of connector notifications.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::types::NotificationEnvelope;

/// Notifications buffered per listener before a slow listener starts lagging.
const DEFAULT_BACKLOG: usize = 1000;

#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    #[error("Notification sink is closed")]
    Closed,

    #[error("Notification rejected: {0}")]
    Rejected(String),
}

/// Destination for pipeline notifications.
pub trait NotificationSink: Send + Sync {
    /// Fire a notification, returning how many listeners received it.
    fn fire(&self, envelope: NotificationEnvelope) -> Result<usize, NotificationError>;
}

/// Broadcasts connector notifications to every registered listener.
///
/// Firing never blocks the pipeline. With no listener attached the
/// notification is counted and discarded.
#[derive(Clone)]
pub struct NotificationBus {
    sender: broadcast::Sender<NotificationEnvelope>,
    fired: Arc<AtomicUsize>,
}

impl NotificationBus {
    pub fn new() -> Self {
        Self::with_backlog(DEFAULT_BACKLOG)
    }

    /// A zero backlog is raised to one.
    pub fn with_backlog(backlog: usize) -> Self {
        let (sender, _) = broadcast::channel(backlog.max(1));
        Self {
            sender,
            fired: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Returns the number of listeners the notification reached.
    pub fn broadcast(&self, envelope: NotificationEnvelope) -> usize {
        self.fired.fetch_add(1, Ordering::Relaxed);
        self.sender.send(envelope).unwrap_or(0)
    }

    /// Register a listener. It only sees notifications fired after this call.
    pub fn listen(&self) -> broadcast::Receiver<NotificationEnvelope> {
        self.sender.subscribe()
    }

    pub fn listener_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Notifications fired since creation, whether or not anyone listened.
    pub fn fired_count(&self) -> usize {
        self.fired.load(Ordering::Relaxed)
    }
}

impl NotificationSink for NotificationBus {
    fn fire(&self, envelope: NotificationEnvelope) -> Result<usize, NotificationError> {
        Ok(self.broadcast(envelope))
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for NotificationBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationBus")
            .field("listeners", &self.listener_count())
            .field("fired", &self.fired_count())
            .finish()
    }
}
