use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::domain::exception::{
    BackPressureError, MessagingError, SourceError, SourceRemoteConnectionError,
};
use crate::error::CoreError;

/// Namespaced error type identifying the class of a failure (e.g. `CONDUIT:FLOW_BACK_PRESSURE`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ErrorType {
    namespace: Cow<'static, str>,
    identifier: Cow<'static, str>,
}

impl ErrorType {
    pub const BUILTIN_NAMESPACE: &'static str = "CONDUIT";

    pub const UNKNOWN: ErrorType = ErrorType::builtin("UNKNOWN");
    pub const SOURCE_RESPONSE_GENERATE: ErrorType = ErrorType::builtin("SOURCE_RESPONSE_GENERATE");
    pub const SOURCE_RESPONSE_SEND: ErrorType = ErrorType::builtin("SOURCE_RESPONSE_SEND");
    pub const SOURCE_ERROR_RESPONSE_GENERATE: ErrorType =
        ErrorType::builtin("SOURCE_ERROR_RESPONSE_GENERATE");
    pub const SOURCE_ERROR_RESPONSE_SEND: ErrorType =
        ErrorType::builtin("SOURCE_ERROR_RESPONSE_SEND");
    pub const SOURCE_REMOTE_CONNECTION: ErrorType = ErrorType::builtin("SOURCE_REMOTE_CONNECTION");
    pub const FLOW_BACK_PRESSURE: ErrorType = ErrorType::builtin("FLOW_BACK_PRESSURE");

    const fn builtin(identifier: &'static str) -> Self {
        Self {
            namespace: Cow::Borrowed(Self::BUILTIN_NAMESPACE),
            identifier: Cow::Borrowed(identifier),
        }
    }

    pub fn new(namespace: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            namespace: Cow::Owned(namespace.into().to_uppercase()),
            identifier: Cow::Owned(identifier.into().to_uppercase()),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Whether this type was raised while producing or sending a success response.
    pub fn is_source_response(&self) -> bool {
        *self == Self::SOURCE_RESPONSE_GENERATE || *self == Self::SOURCE_RESPONSE_SEND
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.identifier)
    }
}

impl FromStr for ErrorType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((ns, id)) if !ns.is_empty() && !id.is_empty() && !id.contains(':') => {
                Ok(ErrorType::new(ns, id))
            }
            _ => Err(CoreError::InvalidErrorType(s.to_string())),
        }
    }
}

/// Maps an arbitrary failure cause to the error type it represents.
pub trait ErrorTypeLocator: Send + Sync {
    fn lookup(&self, cause: &anyhow::Error) -> ErrorType;
}

/// A custom cause-to-type rule consulted before the built-in ones.
pub type ErrorTypeMapping = Arc<dyn Fn(&anyhow::Error) -> Option<ErrorType> + Send + Sync>;

/// Locator that walks the cause chain and recognises the pipeline's own errors.
#[derive(Default, Clone)]
pub struct DefaultErrorTypeLocator {
    mappings: Vec<ErrorTypeMapping>,
}

impl DefaultErrorTypeLocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mapping(
        mut self,
        mapping: impl Fn(&anyhow::Error) -> Option<ErrorType> + Send + Sync + 'static,
    ) -> Self {
        self.mappings.push(Arc::new(mapping));
        self
    }
}

impl ErrorTypeLocator for DefaultErrorTypeLocator {
    fn lookup(&self, cause: &anyhow::Error) -> ErrorType {
        if let Some(found) = self.mappings.iter().find_map(|m| m(cause)) {
            return found;
        }

        for err in cause.chain() {
            if err.downcast_ref::<BackPressureError>().is_some() {
                return ErrorType::FLOW_BACK_PRESSURE;
            }
            if err.downcast_ref::<SourceRemoteConnectionError>().is_some() {
                return ErrorType::SOURCE_REMOTE_CONNECTION;
            }
            if let Some(source) = err.downcast_ref::<SourceError>() {
                return source.stage().error_type();
            }
            if let Some(messaging) = err.downcast_ref::<MessagingError>() {
                if let Some(error_type) = messaging.error_type() {
                    return error_type.clone();
                }
            }
        }

        ErrorType::UNKNOWN
    }
}

impl fmt::Debug for DefaultErrorTypeLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultErrorTypeLocator")
            .field("mappings", &self.mappings.len())
            .finish()
    }
}
