//! Source-supplied templates.
//!
//! A message source hands the pipeline one [`MessageProcessTemplate`] per
//! inbound message. Phases never inspect concrete template types: each
//! template advertises a [`CapabilitySet`] and exposes the matching views
//! (`as_validation`, `as_flow_process`, ...).

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::warn;

use conduit_core::{Event, Message, MessagingError};

/// Parameters handed to the source when a response is written.
pub type ResponseParameters = HashMap<String, Value>;

/// Deferred builder of response parameters for a given event.
pub type ParametersFunction = Arc<dyn Fn(&Event) -> ResponseParameters + Send + Sync>;

/// Template hook producing a source-specific notification for a received event.
pub type NotificationFunction = Arc<dyn Fn(&Event) -> Option<CustomNotification> + Send + Sync>;

/// Parameters function that always yields no parameters.
pub fn empty_parameters() -> ParametersFunction {
    Arc::new(|_| ResponseParameters::new())
}

#[derive(Debug, Clone, PartialEq)]
pub struct CustomNotification {
    pub action: String,
    pub data: Value,
}

/// Capabilities a template can offer to the phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TemplateCapability {
    Validation,
    FlowProcessing,
    RequestResponse,
    FlowProcess,
    EndPhase,
}

impl TemplateCapability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::FlowProcessing => "flow_processing",
            Self::RequestResponse => "request_response",
            Self::FlowProcess => "flow_process",
            Self::EndPhase => "end_phase",
        }
    }

    fn bit(self) -> u8 {
        match self {
            Self::Validation => 1,
            Self::FlowProcessing => 1 << 1,
            Self::RequestResponse => 1 << 2,
            Self::FlowProcess => 1 << 3,
            Self::EndPhase => 1 << 4,
        }
    }
}

impl fmt::Display for TemplateCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CapabilitySet(u8);

impl CapabilitySet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn of(capabilities: &[TemplateCapability]) -> Self {
        capabilities
            .iter()
            .fold(Self::empty(), |set, capability| set.with(*capability))
    }

    pub fn with(self, capability: TemplateCapability) -> Self {
        Self(self.0 | capability.bit())
    }

    pub fn contains(&self, capability: TemplateCapability) -> bool {
        self.0 & capability.bit() != 0
    }

    pub fn contains_all(&self, other: CapabilitySet) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let all = [
            TemplateCapability::Validation,
            TemplateCapability::FlowProcessing,
            TemplateCapability::RequestResponse,
            TemplateCapability::FlowProcess,
            TemplateCapability::EndPhase,
        ];
        f.debug_set()
            .entries(all.iter().filter(|c| self.contains(**c)))
            .finish()
    }
}

/// Root template contract.
///
/// Views default to `None`; a template returns `Some(self)` for every
/// capability it lists in [`capabilities`](Self::capabilities).
pub trait MessageProcessTemplate: Send + Sync {
    fn capabilities(&self) -> CapabilitySet;

    fn as_validation(self: Arc<Self>) -> Option<Arc<dyn ValidationTemplate>> {
        None
    }

    fn as_flow_processing(self: Arc<Self>) -> Option<Arc<dyn FlowProcessingTemplate>> {
        None
    }

    fn as_request_response(self: Arc<Self>) -> Option<Arc<dyn RequestResponseTemplate>> {
        None
    }

    fn as_flow_process(self: Arc<Self>) -> Option<Arc<dyn FlowProcessTemplate>> {
        None
    }

    fn as_end_phase(self: Arc<Self>) -> Option<Arc<dyn EndPhaseTemplate>> {
        None
    }
}

pub trait ValidationTemplate: Send + Sync {
    fn validate_message(&self) -> bool;

    fn discard_invalid_message(&self) -> anyhow::Result<()>;
}

/// Synchronous routing hooks used by the flow-processing phase.
pub trait FlowProcessingTemplate: Send + Sync {
    /// Materialize the event to route.
    fn event(&self) -> anyhow::Result<Event>;

    fn before_route_event(&self, event: Event) -> Result<Event, MessagingError> {
        Ok(event)
    }

    fn route_event(&self, event: Event) -> Result<Event, MessagingError>;

    fn after_route_event(&self, event: Event) -> Result<Event, MessagingError> {
        Ok(event)
    }

    fn after_successful_processing_flow(&self, _event: &Event) {}

    fn after_failure_processing_flow(&self, _error: &MessagingError) {}
}

/// Response hooks for request/response sources.
pub trait RequestResponseTemplate: Send + Sync {
    fn send_response_to_client(&self, event: &Event) -> anyhow::Result<()>;

    fn send_failure_response_to_client(&self, error: &MessagingError) -> anyhow::Result<()>;
}

/// What a source produced for one inbound message.
#[derive(Debug, Clone)]
pub struct SourceResultAdapter {
    pub message: Message,
    pub correlation_id: Option<String>,
}

impl SourceResultAdapter {
    pub fn new(message: Message) -> Self {
        Self {
            message,
            correlation_id: None,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// Hooks the mediator drives for one message.
#[async_trait]
pub trait FlowProcessTemplate: Send + Sync {
    fn source_message(&self) -> SourceResultAdapter;

    async fn route_event_async(&self, event: Event) -> Result<Event, MessagingError>;

    fn send_response_to_client(
        &self,
        event: &Event,
        parameters: ResponseParameters,
        callback: Box<dyn CompletableCallback<()>>,
    );

    fn send_failure_response_to_client(
        &self,
        error: &MessagingError,
        parameters: ResponseParameters,
        callback: Box<dyn CompletableCallback<()>>,
    );

    /// Called once the message reached its terminal outcome.
    fn after_phase_execution(&self, result: Result<Event, MessagingError>) -> anyhow::Result<()>;

    fn successful_execution_response_parameters(&self) -> ParametersFunction {
        empty_parameters()
    }

    fn failed_execution_response_parameters(&self) -> ParametersFunction {
        empty_parameters()
    }

    fn notification_functions(&self) -> Vec<NotificationFunction> {
        Vec::new()
    }
}

pub trait EndPhaseTemplate: Send + Sync {
    fn message_processing_ended(&self);
}

/// Completion callback for asynchronous template operations.
///
/// Exactly one of the two methods is called, and only once. The callbacks
/// built by [`callback`] and [`always`] report an error when dropped without
/// being called.
pub trait CompletableCallback<T>: Send {
    fn complete(self: Box<Self>, value: T);

    fn error(self: Box<Self>, error: anyhow::Error);
}

fn dropped_error() -> anyhow::Error {
    anyhow::anyhow!("callback dropped without being called")
}

struct FnCallback<T, S, E>
where
    S: FnOnce(T) + Send,
    E: FnOnce(anyhow::Error) + Send,
{
    handlers: Option<(S, E)>,
    _value: PhantomData<fn(T)>,
}

impl<T, S, E> CompletableCallback<T> for FnCallback<T, S, E>
where
    S: FnOnce(T) + Send,
    E: FnOnce(anyhow::Error) + Send,
{
    fn complete(mut self: Box<Self>, value: T) {
        if let Some((on_complete, _)) = self.handlers.take() {
            on_complete(value);
        }
    }

    fn error(mut self: Box<Self>, error: anyhow::Error) {
        if let Some((_, on_error)) = self.handlers.take() {
            on_error(error);
        }
    }
}

impl<T, S, E> Drop for FnCallback<T, S, E>
where
    S: FnOnce(T) + Send,
    E: FnOnce(anyhow::Error) + Send,
{
    fn drop(&mut self) {
        if let Some((_, on_error)) = self.handlers.take() {
            warn!("Callback dropped without being called");
            on_error(dropped_error());
        }
    }
}

/// Build a callback from two closures.
pub fn callback<T, S, E>(on_complete: S, on_error: E) -> Box<dyn CompletableCallback<T>>
where
    T: 'static,
    S: FnOnce(T) + Send + 'static,
    E: FnOnce(anyhow::Error) + Send + 'static,
{
    Box::new(FnCallback {
        handlers: Some((on_complete, on_error)),
        _value: PhantomData,
    })
}

struct AlwaysCallback<T, F>
where
    F: FnOnce(anyhow::Result<T>) + Send,
{
    f: Option<F>,
    _value: PhantomData<fn(T)>,
}

impl<T, F> CompletableCallback<T> for AlwaysCallback<T, F>
where
    F: FnOnce(anyhow::Result<T>) + Send,
{
    fn complete(mut self: Box<Self>, value: T) {
        if let Some(f) = self.f.take() {
            f(Ok(value));
        }
    }

    fn error(mut self: Box<Self>, error: anyhow::Error) {
        if let Some(f) = self.f.take() {
            f(Err(error));
        }
    }
}

impl<T, F> Drop for AlwaysCallback<T, F>
where
    F: FnOnce(anyhow::Result<T>) + Send,
{
    fn drop(&mut self) {
        if let Some(f) = self.f.take() {
            warn!("Callback dropped without being called");
            f(Err(dropped_error()));
        }
    }
}

/// Build a callback that receives either outcome as a `Result`.
pub fn always<T, F>(f: F) -> Box<dyn CompletableCallback<T>>
where
    T: 'static,
    F: FnOnce(anyhow::Result<T>) + Send + 'static,
{
    Box::new(AlwaysCallback {
        f: Some(f),
        _value: PhantomData,
    })
}

/// Bridge a callback to a future.
///
/// A callback dropped without being called resolves the receiver with an error.
pub fn oneshot_callback<T>() -> (
    Box<dyn CompletableCallback<T>>,
    oneshot::Receiver<anyhow::Result<T>>,
)
where
    T: Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    let callback = always(move |result| {
        let _ = tx.send(result);
    });
    (callback, rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_capability_set() {
        let set = CapabilitySet::of(&[
            TemplateCapability::FlowProcess,
            TemplateCapability::EndPhase,
        ]);
        assert!(set.contains(TemplateCapability::FlowProcess));
        assert!(set.contains(TemplateCapability::EndPhase));
        assert!(!set.contains(TemplateCapability::Validation));
        assert!(set.contains_all(CapabilitySet::of(&[TemplateCapability::EndPhase])));
        assert!(!set.contains_all(CapabilitySet::of(&[
            TemplateCapability::EndPhase,
            TemplateCapability::Validation,
        ])));
        assert!(set.contains_all(CapabilitySet::empty()));
        assert!(CapabilitySet::empty().is_empty());
    }

    #[test]
    fn test_callback_routes_outcome() {
        let completed = Arc::new(AtomicUsize::new(0));
        let failed = Arc::new(AtomicUsize::new(0));

        let (c, f) = (completed.clone(), failed.clone());
        let cb = callback::<u32, _, _>(
            move |v| {
                c.fetch_add(v as usize, Ordering::SeqCst);
            },
            move |_| {
                f.fetch_add(1, Ordering::SeqCst);
            },
        );
        cb.complete(3);

        let (c, f) = (completed.clone(), failed.clone());
        let cb = callback::<u32, _, _>(
            move |v| {
                c.fetch_add(v as usize, Ordering::SeqCst);
            },
            move |_| {
                f.fetch_add(1, Ordering::SeqCst);
            },
        );
        cb.error(anyhow::anyhow!("send failed"));

        assert_eq!(completed.load(Ordering::SeqCst), 3);
        assert_eq!(failed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_oneshot_callback() {
        let (cb, rx) = oneshot_callback::<&'static str>();
        cb.complete("done");
        assert_eq!(rx.await.unwrap().unwrap(), "done");

        let (cb, rx) = oneshot_callback::<()>();
        cb.error(anyhow::anyhow!("closed"));
        assert!(rx.await.unwrap().is_err());

        let (cb, rx) = oneshot_callback::<()>();
        drop(cb);
        assert!(rx.await.unwrap().is_err());
    }

    #[test]
    fn test_dropped_callback_reports_error() {
        let failed = Arc::new(AtomicUsize::new(0));

        let f = failed.clone();
        let cb = callback::<u32, _, _>(|_| {}, move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });
        drop(cb);

        let f = failed.clone();
        let cb = always::<u32, _>(move |result| {
            if result.is_err() {
                f.fetch_add(1, Ordering::SeqCst);
            }
        });
        drop(cb);

        let f = failed.clone();
        let cb = always::<u32, _>(move |result| {
            if result.is_err() {
                f.fetch_add(1, Ordering::SeqCst);
            }
        });
        cb.complete(1);

        assert_eq!(failed.load(Ordering::SeqCst), 2);
    }
}
