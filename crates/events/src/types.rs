//! Notification types fired by the message-processing pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Envelope wrapping all notifications with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEnvelope {
    /// Unique notification ID
    pub id: Uuid,
    /// When the notification was fired
    pub timestamp: DateTime<Utc>,
    /// The actual notification
    pub notification: Notification,
}

impl NotificationEnvelope {
    /// Create a new envelope with auto-generated ID and timestamp
    pub fn new(notification: Notification) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            notification,
        }
    }
}

/// Identifies the message a notification refers to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRef {
    pub event_id: Uuid,
    pub correlation_id: String,
    pub flow: String,
    pub source: String,
}

/// Connector action a notification reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectorAction {
    MessageReceived,
    MessageResponse,
    MessageErrorResponse,
}

impl ConnectorAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MessageReceived => "MESSAGE_RECEIVED",
            Self::MessageResponse => "MESSAGE_RESPONSE",
            Self::MessageErrorResponse => "MESSAGE_ERROR_RESPONSE",
        }
    }
}

/// All notifications fired by the pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    /// A source handed a message to a flow
    #[serde(rename = "message.received")]
    MessageReceived {
        #[serde(flatten)]
        message: MessageRef,
    },

    /// A success response is about to be sent
    #[serde(rename = "message.response")]
    MessageResponse {
        #[serde(flatten)]
        message: MessageRef,
    },

    /// An error response is about to be sent
    #[serde(rename = "message.error_response")]
    MessageErrorResponse {
        #[serde(flatten)]
        message: MessageRef,
        error_type: Option<String>,
    },

    /// Source-specific notification produced by a template
    #[serde(rename = "custom")]
    Custom {
        #[serde(flatten)]
        message: MessageRef,
        action: String,
        data: Value,
    },

    // System events
    /// Generic error event
    #[serde(rename = "error")]
    Error {
        message: String,
        context: Option<String>,
    },
}

impl Notification {
    /// Get the message this notification refers to, if any
    pub fn message(&self) -> Option<&MessageRef> {
        match self {
            Notification::MessageReceived { message } => Some(message),
            Notification::MessageResponse { message } => Some(message),
            Notification::MessageErrorResponse { message, .. } => Some(message),
            Notification::Custom { message, .. } => Some(message),
            Notification::Error { .. } => None,
        }
    }

    /// Get the event ID associated with this notification, if any
    pub fn event_id(&self) -> Option<Uuid> {
        self.message().map(|m| m.event_id)
    }

    /// Connector action for the three pipeline notifications
    pub fn action(&self) -> Option<ConnectorAction> {
        match self {
            Notification::MessageReceived { .. } => Some(ConnectorAction::MessageReceived),
            Notification::MessageResponse { .. } => Some(ConnectorAction::MessageResponse),
            Notification::MessageErrorResponse { .. } => {
                Some(ConnectorAction::MessageErrorResponse)
            }
            _ => None,
        }
    }
}
