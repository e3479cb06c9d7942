mod context;
mod error_type;
mod event;
mod exception;
mod message;

pub use context::{CompletionSignal, ContextOutcome, EventContext};
pub use error_type::{DefaultErrorTypeLocator, ErrorType, ErrorTypeLocator, ErrorTypeMapping};
pub use event::{Event, EventBuilder, EventError};
pub use exception::{
    BackPressureError, BackPressureReason, ContinuingExceptionHandler,
    DefaultMessagingExceptionResolver, MessagingError, MessagingExceptionHandler,
    MessagingExceptionResolver, PropagatingExceptionHandler, SourceError, SourceErrorStage,
    SourceRemoteConnectionError,
};
pub use message::{Attributes, Message};
