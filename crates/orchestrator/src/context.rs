//! Per-message processing context supplied by the caller.

use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, Span};

use conduit_core::{
    BackPressureError, DefaultErrorTypeLocator, DefaultMessagingExceptionResolver, Event,
    ErrorTypeLocator, MessagingExceptionHandler, MessagingExceptionResolver,
};
use execution::{TransactionConfig, TransactionCoordinator};

use crate::error::ProcessingError;

/// The inbound endpoint a message came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageSource {
    location: String,
}

impl MessageSource {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
        }
    }

    pub fn location(&self) -> &str {
        &self.location
    }
}

/// The flow a message is routed through.
pub trait FlowConstruct: Send + Sync {
    fn name(&self) -> &str;

    fn exception_listener(&self) -> Arc<dyn MessagingExceptionHandler>;

    /// Fails when the flow cannot accept `event` right now.
    fn check_backpressure(&self, _event: &Event) -> Result<(), BackPressureError> {
        Ok(())
    }
}

/// Runs flow work off the caller's task.
pub trait FlowExecutor: Send + Sync {
    /// Schedule `work`, failing immediately when no capacity is left.
    fn execute(&self, work: Box<dyn FnOnce() + Send>) -> Result<(), ProcessingError>;
}

/// Flow executor backed by the blocking pool with a fixed number of slots.
#[derive(Debug, Clone)]
pub struct BoundedFlowExecutor {
    semaphore: Arc<Semaphore>,
    handle: Handle,
    max_concurrency: usize,
}

impl BoundedFlowExecutor {
    pub fn new(handle: Handle, max_concurrency: usize) -> Self {
        let max_concurrency = max_concurrency.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrency)),
            handle,
            max_concurrency,
        }
    }

    /// Bind to the ambient runtime, if there is one.
    pub fn from_current(max_concurrency: usize) -> Option<Self> {
        Handle::try_current()
            .ok()
            .map(|handle| Self::new(handle, max_concurrency))
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

impl FlowExecutor for BoundedFlowExecutor {
    fn execute(&self, work: Box<dyn FnOnce() + Send>) -> Result<(), ProcessingError> {
        let permit = self.semaphore.clone().try_acquire_owned().map_err(|_| {
            ProcessingError::scheduler_busy(format!(
                "all {} flow executor slots are in use",
                self.max_concurrency
            ))
        })?;

        debug!(available = self.semaphore.available_permits(), "Scheduling flow work");
        self.handle.spawn_blocking(move || {
            let _permit = permit;
            work();
        });
        Ok(())
    }
}

/// What phases need to know about the message being processed.
pub trait MessageProcessContext: Send + Sync {
    fn message_source(&self) -> &MessageSource;

    fn flow_construct(&self) -> Arc<dyn FlowConstruct>;

    fn transaction_config(&self) -> Option<&TransactionConfig>;

    fn transaction_coordinator(&self) -> Arc<TransactionCoordinator>;

    /// Span every phase of this message runs in.
    fn execution_span(&self) -> Span {
        info_span!(
            "message_processing",
            flow = %self.flow_construct().name(),
            source = %self.message_source().location()
        )
    }

    fn error_type_locator(&self) -> Arc<dyn ErrorTypeLocator>;

    fn exception_resolver(&self) -> Arc<dyn MessagingExceptionResolver>;

    fn supports_asynchronous_processing(&self) -> bool {
        false
    }

    fn flow_executor(&self) -> Option<Arc<dyn FlowExecutor>> {
        None
    }
}

#[derive(Clone)]
pub struct DefaultMessageProcessContext {
    source: MessageSource,
    flow: Arc<dyn FlowConstruct>,
    transaction_config: Option<TransactionConfig>,
    coordinator: Arc<TransactionCoordinator>,
    locator: Arc<dyn ErrorTypeLocator>,
    resolver: Arc<dyn MessagingExceptionResolver>,
    executor: Option<Arc<dyn FlowExecutor>>,
}

impl DefaultMessageProcessContext {
    pub fn new(source: MessageSource, flow: Arc<dyn FlowConstruct>) -> Self {
        Self {
            source,
            flow,
            transaction_config: None,
            coordinator: Arc::new(TransactionCoordinator::new()),
            locator: Arc::new(DefaultErrorTypeLocator::new()),
            resolver: Arc::new(DefaultMessagingExceptionResolver),
            executor: None,
        }
    }

    pub fn with_transaction_config(mut self, config: TransactionConfig) -> Self {
        self.transaction_config = Some(config);
        self
    }

    pub fn with_coordinator(mut self, coordinator: Arc<TransactionCoordinator>) -> Self {
        self.coordinator = coordinator;
        self
    }

    pub fn with_error_type_locator(mut self, locator: Arc<dyn ErrorTypeLocator>) -> Self {
        self.locator = locator;
        self
    }

    pub fn with_exception_resolver(mut self, resolver: Arc<dyn MessagingExceptionResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Process flows on `executor` instead of inline.
    pub fn with_flow_executor(mut self, executor: Arc<dyn FlowExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }
}

impl MessageProcessContext for DefaultMessageProcessContext {
    fn message_source(&self) -> &MessageSource {
        &self.source
    }

    fn flow_construct(&self) -> Arc<dyn FlowConstruct> {
        self.flow.clone()
    }

    fn transaction_config(&self) -> Option<&TransactionConfig> {
        self.transaction_config.as_ref()
    }

    fn transaction_coordinator(&self) -> Arc<TransactionCoordinator> {
        self.coordinator.clone()
    }

    fn error_type_locator(&self) -> Arc<dyn ErrorTypeLocator> {
        self.locator.clone()
    }

    fn exception_resolver(&self) -> Arc<dyn MessagingExceptionResolver> {
        self.resolver.clone()
    }

    fn supports_asynchronous_processing(&self) -> bool {
        self.executor.is_some()
    }

    fn flow_executor(&self) -> Option<Arc<dyn FlowExecutor>> {
        self.executor.clone()
    }
}
