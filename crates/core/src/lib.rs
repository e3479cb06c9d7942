//! Core domain types for the Conduit message-processing pipeline.
//!
//! Everything that flows between a message source, the phase engine and the
//! mediator lives here: the immutable [`Event`] envelope and its
//! [`EventContext`], the one-shot [`CompletionSignal`] used to report that a
//! response was fully written, and the error taxonomy ([`MessagingError`],
//! [`SourceError`], [`BackPressureError`]) together with the contracts used to
//! classify and handle those errors.

pub mod domain;
pub mod error;

pub use domain::*;
pub use error::{CoreError, Result};
