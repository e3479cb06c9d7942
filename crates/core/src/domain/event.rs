use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use super::context::EventContext;
use super::error_type::ErrorType;
use super::message::Message;

/// Error attached to an event after a failure was handled or mapped.
#[derive(Clone)]
pub struct EventError {
    pub error_type: ErrorType,
    pub description: String,
    pub cause: Option<Arc<anyhow::Error>>,
}

impl EventError {
    pub fn new(error_type: ErrorType, description: impl Into<String>) -> Self {
        Self {
            error_type,
            description: description.into(),
            cause: None,
        }
    }

    pub fn from_cause(error_type: ErrorType, cause: Arc<anyhow::Error>) -> Self {
        Self {
            error_type,
            description: cause.to_string(),
            cause: Some(cause),
        }
    }
}

impl fmt::Debug for EventError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventError")
            .field("error_type", &self.error_type.to_string())
            .field("description", &self.description)
            .finish()
    }
}

/// Immutable data envelope travelling through the pipeline.
///
/// Events are cheap to clone; the context is shared between every event
/// built from the same inbound message. Use [`Event::builder_from`] to derive
/// a modified copy.
#[derive(Debug, Clone)]
pub struct Event {
    context: EventContext,
    message: Message,
    error: Option<EventError>,
    parameters: BTreeMap<String, Value>,
}

impl Event {
    pub fn builder(context: EventContext) -> EventBuilder {
        EventBuilder {
            context,
            message: Message::default(),
            error: None,
            parameters: BTreeMap::new(),
        }
    }

    pub fn builder_from(event: &Event) -> EventBuilder {
        EventBuilder {
            context: event.context.clone(),
            message: event.message.clone(),
            error: event.error.clone(),
            parameters: event.parameters.clone(),
        }
    }

    pub fn context(&self) -> &EventContext {
        &self.context
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn error(&self) -> Option<&EventError> {
        self.error.as_ref()
    }

    /// Policy pointcut parameters attached by the policy manager.
    pub fn parameters(&self) -> &BTreeMap<String, Value> {
        &self.parameters
    }

    pub fn parameter(&self, key: &str) -> Option<&Value> {
        self.parameters.get(key)
    }

    pub fn id(&self) -> Uuid {
        self.context.id()
    }

    pub fn correlation_id(&self) -> &str {
        self.context.correlation_id()
    }
}

pub struct EventBuilder {
    context: EventContext,
    message: Message,
    error: Option<EventError>,
    parameters: BTreeMap<String, Value>,
}

impl EventBuilder {
    pub fn message(mut self, message: Message) -> Self {
        self.message = message;
        self
    }

    pub fn error(mut self, error: EventError) -> Self {
        self.error = Some(error);
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.error = None;
        self
    }

    pub fn parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn parameters(mut self, parameters: BTreeMap<String, Value>) -> Self {
        self.parameters.extend(parameters);
        self
    }

    pub fn context(mut self, context: EventContext) -> Self {
        self.context = context;
        self
    }

    pub fn build(self) -> Event {
        Event {
            context: self.context,
            message: self.message,
            error: self.error,
            parameters: self.parameters,
        }
    }
}
