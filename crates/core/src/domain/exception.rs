//! Failure types raised while routing an event or writing its response.

use std::fmt;
use std::sync::Arc;

use super::context::EventContext;
use super::error_type::{ErrorType, ErrorTypeLocator};
use super::event::{Event, EventError};
use crate::error::CoreError;

/// Error raised while an event was being processed by a flow.
///
/// Carries the event that was being processed and, once an exception
/// handler ran, the event the handler produced. A handler may mark the
/// error as handled, in which case the outermost execution frame returns
/// the processed event instead of the error.
#[derive(Clone)]
pub struct MessagingError {
    message: String,
    event: Event,
    cause: Arc<anyhow::Error>,
    error_type: Option<ErrorType>,
    failing_component: Option<String>,
    handled: bool,
    processed_event: Option<Event>,
}

impl MessagingError {
    pub fn new(event: Event, cause: impl Into<anyhow::Error>) -> Self {
        Self::from_shared(event, Arc::new(cause.into()))
    }

    pub fn from_shared(event: Event, cause: Arc<anyhow::Error>) -> Self {
        Self {
            message: cause.to_string(),
            event,
            cause,
            error_type: None,
            failing_component: None,
            handled: false,
            processed_event: None,
        }
    }

    pub fn with_error_type(mut self, error_type: ErrorType) -> Self {
        self.error_type = Some(error_type);
        self
    }

    pub fn with_failing_component(mut self, component: impl Into<String>) -> Self {
        self.failing_component = Some(component.into());
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// The event that was being processed when the error was raised.
    pub fn event(&self) -> &Event {
        &self.event
    }

    pub fn cause(&self) -> &Arc<anyhow::Error> {
        &self.cause
    }

    pub fn error_type(&self) -> Option<&ErrorType> {
        self.error_type.as_ref()
    }

    pub fn failing_component(&self) -> Option<&str> {
        self.failing_component.as_deref()
    }

    pub fn is_handled(&self) -> bool {
        self.handled
    }

    pub fn set_handled(&mut self, handled: bool) {
        self.handled = handled;
    }

    pub fn processed_event(&self) -> Option<&Event> {
        self.processed_event.as_ref()
    }

    pub fn set_processed_event(&mut self, event: Event) {
        self.processed_event = Some(event);
    }

    /// The processed event if a handler produced one, otherwise the original event.
    pub fn result_event(&self) -> &Event {
        self.processed_event.as_ref().unwrap_or(&self.event)
    }

    /// Rebind the carried events to `context`, e.g. when an error raised in
    /// a child context is handed back to its parent.
    pub fn in_context(mut self, context: &EventContext) -> Self {
        self.event = Event::builder_from(&self.event)
            .context(context.clone())
            .build();
        self.processed_event = self
            .processed_event
            .map(|e| Event::builder_from(&e).context(context.clone()).build());
        self
    }

    /// Find an error of type `T` in the cause chain.
    pub fn caused_by<T>(&self) -> Option<&T>
    where
        T: std::error::Error + Send + Sync + 'static,
    {
        self.cause.chain().find_map(|e| e.downcast_ref::<T>())
    }

    /// Whether the client connection was lost, in which case no error
    /// response can be delivered.
    pub fn is_remote_connection_failure(&self) -> bool {
        self.error_type.as_ref() == Some(&ErrorType::SOURCE_REMOTE_CONNECTION)
            || self.caused_by::<SourceRemoteConnectionError>().is_some()
    }

    /// Build the event describing this failure: the result event with an
    /// [`EventError`] of the resolved error type.
    pub fn error_event(&self, locator: &dyn ErrorTypeLocator) -> Event {
        let base = self.result_event();
        if base.error().is_some() {
            return base.clone();
        }
        let error_type = self
            .error_type
            .clone()
            .unwrap_or_else(|| locator.lookup(&self.cause));
        Event::builder_from(base)
            .error(EventError::from_cause(error_type, self.cause.clone()))
            .build()
    }
}

impl fmt::Display for MessagingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl fmt::Debug for MessagingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessagingError")
            .field("message", &self.message)
            .field("event_id", &self.event.id())
            .field("error_type", &self.error_type.as_ref().map(|t| t.to_string()))
            .field("failing_component", &self.failing_component)
            .field("handled", &self.handled)
            .finish()
    }
}

impl std::error::Error for MessagingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        let cause: &anyhow::Error = &self.cause;
        Some(cause.as_ref())
    }
}

/// Stage of response delivery at which a [`SourceError`] was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceErrorStage {
    ResponseGenerate,
    ResponseSend,
    ErrorResponseGenerate,
    ErrorResponseSend,
}

impl SourceErrorStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ResponseGenerate => "response_generate",
            Self::ResponseSend => "response_send",
            Self::ErrorResponseGenerate => "error_response_generate",
            Self::ErrorResponseSend => "error_response_send",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "response_generate" => Ok(Self::ResponseGenerate),
            "response_send" => Ok(Self::ResponseSend),
            "error_response_generate" => Ok(Self::ErrorResponseGenerate),
            "error_response_send" => Ok(Self::ErrorResponseSend),
            other => Err(CoreError::UnknownSourceErrorStage(other.to_string())),
        }
    }

    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::ResponseGenerate => ErrorType::SOURCE_RESPONSE_GENERATE,
            Self::ResponseSend => ErrorType::SOURCE_RESPONSE_SEND,
            Self::ErrorResponseGenerate => ErrorType::SOURCE_ERROR_RESPONSE_GENERATE,
            Self::ErrorResponseSend => ErrorType::SOURCE_ERROR_RESPONSE_SEND,
        }
    }

    pub fn is_error_response(&self) -> bool {
        matches!(self, Self::ErrorResponseGenerate | Self::ErrorResponseSend)
    }
}

impl fmt::Display for SourceErrorStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error raised by a source while generating or sending a response.
#[derive(Clone)]
pub struct SourceError {
    stage: SourceErrorStage,
    event: Event,
    cause: Arc<anyhow::Error>,
    original: Option<MessagingError>,
}

impl SourceError {
    pub fn new(stage: SourceErrorStage, event: Event, cause: impl Into<anyhow::Error>) -> Self {
        Self::from_shared(stage, event, Arc::new(cause.into()))
    }

    pub fn from_shared(stage: SourceErrorStage, event: Event, cause: Arc<anyhow::Error>) -> Self {
        Self {
            stage,
            event,
            cause,
            original: None,
        }
    }

    /// Attach the messaging error whose error response failed to be delivered.
    pub fn with_original(mut self, original: MessagingError) -> Self {
        self.original = Some(original);
        self
    }

    pub fn stage(&self) -> SourceErrorStage {
        self.stage
    }

    pub fn event(&self) -> &Event {
        &self.event
    }

    pub fn cause(&self) -> &Arc<anyhow::Error> {
        &self.cause
    }

    pub fn original(&self) -> Option<&MessagingError> {
        self.original.as_ref()
    }

    pub fn error_type(&self) -> ErrorType {
        self.stage.error_type()
    }

    /// Convert into a messaging error whose event carries the stage's error type.
    pub fn to_messaging_error(&self) -> MessagingError {
        let error_type = self.error_type();
        let event = Event::builder_from(&self.event)
            .error(EventError::from_cause(error_type.clone(), self.cause.clone()))
            .build();
        MessagingError::from_shared(event, self.cause.clone()).with_error_type(error_type)
    }
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "source failed at {}: {}", self.stage, self.cause)
    }
}

impl fmt::Debug for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceError")
            .field("stage", &self.stage)
            .field("event_id", &self.event.id())
            .field("cause", &self.cause.to_string())
            .field("original", &self.original)
            .finish()
    }
}

impl std::error::Error for SourceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        let cause: &anyhow::Error = &self.cause;
        Some(cause.as_ref())
    }
}

/// Why a flow refused to accept an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackPressureReason {
    MaxConcurrencyExceeded,
    EventsAccumulated,
    RequiredSchedulerBusy,
}

impl BackPressureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MaxConcurrencyExceeded => "max_concurrency_exceeded",
            Self::EventsAccumulated => "events_accumulated",
            Self::RequiredSchedulerBusy => "required_scheduler_busy",
        }
    }
}

impl fmt::Display for BackPressureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raised by a flow's admission check when it cannot take more work.
#[derive(Debug, Clone, thiserror::Error)]
#[error("flow '{flow}' is unable to accept new events: {reason}")]
pub struct BackPressureError {
    pub flow: String,
    pub reason: BackPressureReason,
}

impl BackPressureError {
    pub fn new(flow: impl Into<String>, reason: BackPressureReason) -> Self {
        Self {
            flow: flow.into(),
            reason,
        }
    }
}

/// The connection to the client was lost before a response could be written.
#[derive(Debug, Clone, thiserror::Error)]
#[error("remote connection lost: {0}")]
pub struct SourceRemoteConnectionError(pub String);

/// Flow-level exception listener.
pub trait MessagingExceptionHandler: Send + Sync {
    /// Handle `error` raised while processing `event`, returning the event
    /// the handler produced. Handlers that recover mark the error handled.
    fn handle_exception(&self, error: &mut MessagingError, event: &Event) -> Event;
}

/// Handler that lets the error propagate, attaching it to the event.
#[derive(Debug, Default, Clone, Copy)]
pub struct PropagatingExceptionHandler;

impl MessagingExceptionHandler for PropagatingExceptionHandler {
    fn handle_exception(&self, error: &mut MessagingError, event: &Event) -> Event {
        let error_type = error.error_type().cloned().unwrap_or(ErrorType::UNKNOWN);
        Event::builder_from(event)
            .error(EventError::from_cause(error_type, error.cause().clone()))
            .build()
    }
}

/// Handler that recovers from the error and continues with the original event.
#[derive(Debug, Default, Clone, Copy)]
pub struct ContinuingExceptionHandler;

impl MessagingExceptionHandler for ContinuingExceptionHandler {
    fn handle_exception(&self, error: &mut MessagingError, event: &Event) -> Event {
        error.set_handled(true);
        Event::builder_from(event).clear_error().build()
    }
}

/// Normalises a messaging error before it is reported.
pub trait MessagingExceptionResolver: Send + Sync {
    fn resolve(&self, error: MessagingError, locator: &dyn ErrorTypeLocator) -> MessagingError;
}

/// Fills in the error type and the event error when they are missing.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultMessagingExceptionResolver;

impl MessagingExceptionResolver for DefaultMessagingExceptionResolver {
    fn resolve(&self, mut error: MessagingError, locator: &dyn ErrorTypeLocator) -> MessagingError {
        let error_type = match error.error_type.clone() {
            Some(t) => t,
            None => {
                let t = locator.lookup(&error.cause);
                error.error_type = Some(t.clone());
                t
            }
        };
        if error.event.error().is_none() {
            error.event = Event::builder_from(&error.event)
                .error(EventError::from_cause(error_type, error.cause.clone()))
                .build();
        }
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DefaultErrorTypeLocator, Message};
    use serde_json::json;

    fn event() -> Event {
        let ctx = EventContext::new("orders", "orders/listener", None, None);
        Event::builder(ctx).message(Message::of(json!("payload"))).build()
    }

    #[test]
    fn test_result_event_prefers_processed() {
        let original = event();
        let mut err = MessagingError::new(original.clone(), anyhow::anyhow!("boom"));
        assert_eq!(err.result_event().message().payload, json!("payload"));

        let processed = Event::builder_from(&original)
            .message(Message::of(json!("handled")))
            .build();
        err.set_processed_event(processed);
        assert_eq!(err.result_event().message().payload, json!("handled"));
        assert_eq!(err.event().message().payload, json!("payload"));
    }

    #[test]
    fn test_caused_by_walks_chain() {
        let cause = anyhow::Error::new(SourceRemoteConnectionError("reset".into()))
            .context("while writing response");
        let err = MessagingError::new(event(), cause);
        assert!(err.caused_by::<SourceRemoteConnectionError>().is_some());
        assert!(err.is_remote_connection_failure());
        assert!(err.caused_by::<BackPressureError>().is_none());
    }

    #[test]
    fn test_source_error_to_messaging_error() {
        let source = SourceError::new(
            SourceErrorStage::ResponseSend,
            event(),
            anyhow::anyhow!("socket closed"),
        );
        let err = source.to_messaging_error();

        assert_eq!(err.error_type(), Some(&ErrorType::SOURCE_RESPONSE_SEND));
        assert_eq!(
            err.event().error().unwrap().error_type,
            ErrorType::SOURCE_RESPONSE_SEND
        );
        assert_eq!(err.message(), "socket closed");
    }

    #[test]
    fn test_source_error_stage_parse() {
        for stage in [
            SourceErrorStage::ResponseGenerate,
            SourceErrorStage::ResponseSend,
            SourceErrorStage::ErrorResponseGenerate,
            SourceErrorStage::ErrorResponseSend,
        ] {
            assert_eq!(SourceErrorStage::parse(stage.as_str()).unwrap(), stage);
        }
        assert!(SourceErrorStage::parse("nope").is_err());
        assert!(SourceErrorStage::ErrorResponseSend.is_error_response());
        assert!(!SourceErrorStage::ResponseGenerate.is_error_response());
    }

    #[test]
    fn test_continuing_handler_marks_handled() {
        let ev = event();
        let mut err = MessagingError::new(ev.clone(), anyhow::anyhow!("boom"));
        let out = ContinuingExceptionHandler.handle_exception(&mut err, &ev);
        assert!(err.is_handled());
        assert!(out.error().is_none());

        let mut err = MessagingError::new(ev.clone(), anyhow::anyhow!("boom"));
        let out = PropagatingExceptionHandler.handle_exception(&mut err, &ev);
        assert!(!err.is_handled());
        assert_eq!(out.error().unwrap().error_type, ErrorType::UNKNOWN);
    }

    #[test]
    fn test_resolver_fills_missing_error_type() {
        let locator = DefaultErrorTypeLocator::new();
        let err = MessagingError::new(
            event(),
            BackPressureError::new("orders", BackPressureReason::EventsAccumulated),
        );

        let resolved = DefaultMessagingExceptionResolver.resolve(err, &locator);
        assert_eq!(resolved.error_type(), Some(&ErrorType::FLOW_BACK_PRESSURE));
        assert_eq!(
            resolved.event().error().unwrap().error_type,
            ErrorType::FLOW_BACK_PRESSURE
        );
    }

    #[test]
    fn test_error_event_uses_locator() {
        let locator = DefaultErrorTypeLocator::new();
        let err = MessagingError::new(event(), anyhow::anyhow!("plain failure"));
        let error_event = err.error_event(&locator);
        let error = error_event.error().unwrap();
        assert_eq!(error.error_type, ErrorType::UNKNOWN);
        assert_eq!(error.description, "plain failure");
    }
}
