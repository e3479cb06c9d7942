//! Event contexts and the response-completion signal.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use uuid::Uuid;

/// One-shot signal completed when everything related to a message has been
/// written back to the source.
///
/// Clones share the same state. Only the first call to [`complete`] has an
/// effect; later calls return `false`.
///
/// [`complete`]: CompletionSignal::complete
#[derive(Clone, Default)]
pub struct CompletionSignal {
    inner: Arc<SignalInner>,
}

#[derive(Default)]
struct SignalInner {
    completed: AtomicBool,
    notify: Notify,
}

impl CompletionSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Complete the signal, waking every waiter.
    ///
    /// Returns `true` only for the call that actually completed it.
    pub fn complete(&self) -> bool {
        if self.inner.completed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.inner.notify.notify_waiters();
        true
    }

    pub fn is_completed(&self) -> bool {
        self.inner.completed.load(Ordering::SeqCst)
    }

    /// Wait until the signal is completed.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_completed() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for CompletionSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionSignal")
            .field("completed", &self.is_completed())
            .finish()
    }
}

/// Terminal outcome recorded on an [`EventContext`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextOutcome {
    Succeeded,
    Failed { description: String },
}

/// Per-message execution context shared by every [`Event`](super::Event)
/// derived from the same inbound message.
///
/// The context refers to its flow by name only; it never owns the flow.
#[derive(Clone)]
pub struct EventContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    id: Uuid,
    correlation_id: String,
    flow_name: String,
    source_location: String,
    created_at: DateTime<Utc>,
    response_completion: Option<CompletionSignal>,
    parent: Option<EventContext>,
    outcome: Mutex<Option<ContextOutcome>>,
}

impl EventContext {
    /// Create a root context. When the source supplied no correlation id the
    /// context id is used.
    pub fn new(
        flow_name: impl Into<String>,
        source_location: impl Into<String>,
        correlation_id: Option<String>,
        response_completion: Option<CompletionSignal>,
    ) -> Self {
        let id = Uuid::new_v4();
        Self {
            inner: Arc::new(ContextInner {
                id,
                correlation_id: correlation_id.unwrap_or_else(|| id.to_string()),
                flow_name: flow_name.into(),
                source_location: source_location.into(),
                created_at: Utc::now(),
                response_completion,
                parent: None,
                outcome: Mutex::new(None),
            }),
        }
    }

    /// Create a child context used while routing through a flow.
    ///
    /// The child shares the correlation id but records its own outcome, so a
    /// failure inside the flow never marks the parent.
    pub fn child(&self) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                id: Uuid::new_v4(),
                correlation_id: self.inner.correlation_id.clone(),
                flow_name: self.inner.flow_name.clone(),
                source_location: self.inner.source_location.clone(),
                created_at: Utc::now(),
                response_completion: None,
                parent: Some(self.clone()),
                outcome: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn correlation_id(&self) -> &str {
        &self.inner.correlation_id
    }

    pub fn flow_name(&self) -> &str {
        &self.inner.flow_name
    }

    pub fn source_location(&self) -> &str {
        &self.inner.source_location
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    pub fn response_completion(&self) -> Option<&CompletionSignal> {
        self.inner.response_completion.as_ref()
    }

    pub fn parent(&self) -> Option<&EventContext> {
        self.inner.parent.as_ref()
    }

    pub fn is_root(&self) -> bool {
        self.inner.parent.is_none()
    }

    pub fn root_context(&self) -> EventContext {
        let mut current = self.clone();
        while let Some(parent) = current.parent().cloned() {
            current = parent;
        }
        current
    }

    /// Record a successful outcome. Returns `false` if an outcome was already recorded.
    pub fn success(&self) -> bool {
        self.record(ContextOutcome::Succeeded)
    }

    /// Record a failed outcome. Returns `false` if an outcome was already recorded.
    pub fn error(&self, description: impl Into<String>) -> bool {
        self.record(ContextOutcome::Failed {
            description: description.into(),
        })
    }

    pub fn outcome(&self) -> Option<ContextOutcome> {
        self.inner
            .outcome
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn record(&self, outcome: ContextOutcome) -> bool {
        let mut slot = self.inner.outcome.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return false;
        }
        *slot = Some(outcome);
        true
    }
}

impl std::fmt::Debug for EventContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventContext")
            .field("id", &self.inner.id)
            .field("correlation_id", &self.inner.correlation_id)
            .field("flow_name", &self.inner.flow_name)
            .field("source_location", &self.inner.source_location)
            .field("is_root", &self.is_root())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_signal_completes_once() {
        let signal = CompletionSignal::new();
        let clone = signal.clone();

        assert!(!signal.is_completed());
        assert!(clone.complete());
        assert!(!signal.complete());
        assert!(signal.is_completed());
    }

    #[tokio::test]
    async fn test_completion_signal_wakes_waiter() {
        let signal = CompletionSignal::new();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.wait().await })
        };

        tokio::task::yield_now().await;
        signal.complete();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_on_completed_signal_returns() {
        let signal = CompletionSignal::new();
        signal.complete();
        signal.wait().await;
    }

    #[test]
    fn test_correlation_id_defaults_to_context_id() {
        let ctx = EventContext::new("orders", "orders/source", None, None);
        assert_eq!(ctx.correlation_id(), ctx.id().to_string());

        let ctx = EventContext::new("orders", "orders/source", Some("abc".into()), None);
        assert_eq!(ctx.correlation_id(), "abc");
    }

    #[test]
    fn test_child_failure_does_not_mark_parent() {
        let parent = EventContext::new("orders", "orders/source", None, Some(CompletionSignal::new()));
        let child = parent.child();

        assert!(child.error("boom"));
        assert_eq!(
            child.outcome(),
            Some(ContextOutcome::Failed {
                description: "boom".to_string()
            })
        );
        assert!(parent.outcome().is_none());
        assert!(child.response_completion().is_none());
        assert_eq!(child.correlation_id(), parent.correlation_id());
        assert_eq!(child.root_context().id(), parent.id());
    }

    #[test]
    fn test_outcome_recorded_once() {
        let ctx = EventContext::new("orders", "orders/source", None, None);
        assert!(ctx.success());
        assert!(!ctx.error("late"));
        assert_eq!(ctx.outcome(), Some(ContextOutcome::Succeeded));
    }
}
