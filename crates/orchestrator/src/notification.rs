//! Best-effort connector notifications.

use std::sync::Arc;

use tracing::{trace, warn};

use conduit_core::{ErrorType, Event};
use events::{MessageRef, Notification, NotificationEnvelope, NotificationSink};

use crate::template::NotificationFunction;

/// Fires pipeline notifications, never failing the caller.
#[derive(Clone, Default)]
pub struct NotificationHelper {
    sink: Option<Arc<dyn NotificationSink>>,
}

impl NotificationHelper {
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self { sink: Some(sink) }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    pub fn fire(&self, notification: Notification) {
        let Some(sink) = &self.sink else {
            return;
        };
        let event_id = notification.event_id();
        match sink.fire(NotificationEnvelope::new(notification)) {
            Ok(receivers) => trace!(event_id = ?event_id, receivers, "Notification fired"),
            Err(e) => warn!(event_id = ?event_id, error = %e, "Failed to fire notification"),
        }
    }

    pub fn message_received(&self, event: &Event) {
        self.fire(Notification::MessageReceived {
            message: message_ref(event),
        });
    }

    pub fn message_response(&self, event: &Event) {
        self.fire(Notification::MessageResponse {
            message: message_ref(event),
        });
    }

    pub fn message_error_response(&self, event: &Event, error_type: Option<&ErrorType>) {
        self.fire(Notification::MessageErrorResponse {
            message: message_ref(event),
            error_type: error_type.map(ToString::to_string),
        });
    }

    /// Fire the notifications a template derives from the received event.
    pub fn fire_custom(&self, event: &Event, functions: &[NotificationFunction]) {
        if self.sink.is_none() {
            return;
        }
        for custom in functions.iter().filter_map(|f| f(event)) {
            self.fire(Notification::Custom {
                message: message_ref(event),
                action: custom.action,
                data: custom.data,
            });
        }
    }

    pub fn error(&self, message: impl Into<String>, context: Option<String>) {
        self.fire(Notification::Error {
            message: message.into(),
            context,
        });
    }
}

impl std::fmt::Debug for NotificationHelper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationHelper")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

pub fn message_ref(event: &Event) -> MessageRef {
    let context = event.context();
    MessageRef {
        event_id: event.id(),
        correlation_id: context.correlation_id().to_string(),
        flow: context.flow_name().to_string(),
        source: context.source_location().to_string(),
    }
}
