//! Source policies wrapping flow execution.
//!
//! A policy receives the event and a [`FlowExecutionProcessor`] and reports
//! exactly one [`SourcePolicyResult`] through its callback.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::runtime::Handle;
use tracing::{debug, error, warn};

use conduit_core::{Attributes, Event, EventBuilder, MessagingError};

use crate::context::{FlowConstruct, MessageSource};
use crate::template::{
    CompletableCallback, FlowProcessTemplate, ParametersFunction, ResponseParameters,
};

/// Response parameters computed on demand.
pub type ParametersSupplier = Box<dyn FnOnce() -> ResponseParameters + Send>;

pub struct SourcePolicySuccessResult {
    pub result: Event,
    pub response_parameters: ParametersSupplier,
    /// Used when sending the success response fails.
    pub error_response_parameters: ParametersFunction,
}

impl SourcePolicySuccessResult {
    pub fn new(
        result: Event,
        response_parameters: ParametersSupplier,
        error_response_parameters: ParametersFunction,
    ) -> Self {
        Self {
            result,
            response_parameters,
            error_response_parameters,
        }
    }
}

pub struct SourcePolicyFailureResult {
    pub messaging_error: MessagingError,
    pub error_response_parameters: ParametersSupplier,
}

impl SourcePolicyFailureResult {
    pub fn new(messaging_error: MessagingError, error_response_parameters: ParametersSupplier) -> Self {
        Self {
            messaging_error,
            error_response_parameters,
        }
    }

    pub fn without_parameters(messaging_error: MessagingError) -> Self {
        Self::new(messaging_error, Box::new(ResponseParameters::new))
    }
}

/// Outcome of policy and flow execution for one message.
pub enum SourcePolicyResult {
    Failure(SourcePolicyFailureResult),
    Success(SourcePolicySuccessResult),
}

impl SourcePolicyResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Consume the result with the continuation matching its variant.
    pub fn apply<R>(
        self,
        on_failure: impl FnOnce(SourcePolicyFailureResult) -> R,
        on_success: impl FnOnce(SourcePolicySuccessResult) -> R,
    ) -> R {
        match self {
            Self::Failure(failure) => on_failure(failure),
            Self::Success(success) => on_success(success),
        }
    }
}

impl std::fmt::Debug for SourcePolicyResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Failure(failure) => f
                .debug_tuple("Failure")
                .field(&failure.messaging_error)
                .finish(),
            Self::Success(success) => f.debug_tuple("Success").field(&success.result).finish(),
        }
    }
}

pub trait SourcePolicy: Send + Sync {
    fn process(
        &self,
        event: Event,
        template: Arc<dyn FlowProcessTemplate>,
        callback: Box<dyn CompletableCallback<SourcePolicyResult>>,
    );
}

pub trait PolicyManager: Send + Sync {
    fn create_source_policy_instance(
        &self,
        source: &MessageSource,
        event: &Event,
        processor: FlowExecutionProcessor,
        template: Arc<dyn FlowProcessTemplate>,
    ) -> anyhow::Result<Arc<dyn SourcePolicy>>;

    /// Copy policy pointcut parameters from the source attributes onto the event.
    fn add_source_pointcut_parameters_into_event(
        &self,
        _source: &MessageSource,
        _attributes: &Attributes,
        builder: EventBuilder,
    ) -> EventBuilder {
        builder
    }
}

/// Routes an event through the flow in a child context.
///
/// Flow failures are handed to the flow's exception listener; the parent
/// context's outcome is left to the caller.
#[derive(Clone)]
pub struct FlowExecutionProcessor {
    template: Arc<dyn FlowProcessTemplate>,
    flow: Arc<dyn FlowConstruct>,
}

impl FlowExecutionProcessor {
    pub fn new(template: Arc<dyn FlowProcessTemplate>, flow: Arc<dyn FlowConstruct>) -> Self {
        Self { template, flow }
    }

    pub async fn process(&self, event: Event) -> Result<Event, MessagingError> {
        let parent = event.context().clone();
        let child = parent.child();
        let routed = Event::builder_from(&event).context(child.clone()).build();

        match self.template.route_event_async(routed).await {
            Ok(result) => {
                child.success();
                Ok(Event::builder_from(&result).context(parent).build())
            }
            Err(mut error) => {
                child.error(error.message());
                debug!(
                    flow = %self.flow.name(),
                    correlation_id = %parent.correlation_id(),
                    error = %error,
                    "Flow raised a messaging error"
                );
                let failed = error.event().clone();
                let processed = self
                    .flow
                    .exception_listener()
                    .handle_exception(&mut error, &failed);
                error.set_processed_event(processed);

                if error.is_handled() {
                    Ok(Event::builder_from(error.result_event())
                        .context(parent)
                        .build())
                } else {
                    Err(error.in_context(&parent))
                }
            }
        }
    }
}

/// Policy manager applying no policies.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPolicyManager;

impl PolicyManager for NoPolicyManager {
    fn create_source_policy_instance(
        &self,
        _source: &MessageSource,
        _event: &Event,
        processor: FlowExecutionProcessor,
        _template: Arc<dyn FlowProcessTemplate>,
    ) -> anyhow::Result<Arc<dyn SourcePolicy>> {
        Ok(Arc::new(NoSourcePolicy::new(processor)))
    }
}

/// Runs the flow directly on the ambient runtime.
pub struct NoSourcePolicy {
    processor: FlowExecutionProcessor,
}

impl NoSourcePolicy {
    pub fn new(processor: FlowExecutionProcessor) -> Self {
        Self { processor }
    }
}

impl SourcePolicy for NoSourcePolicy {
    fn process(
        &self,
        event: Event,
        template: Arc<dyn FlowProcessTemplate>,
        callback: Box<dyn CompletableCallback<SourcePolicyResult>>,
    ) {
        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                warn!(error = %e, "No runtime available to route the event");
                callback.error(anyhow::anyhow!("no async runtime available: {e}"));
                return;
            }
        };

        let processor = self.processor.clone();
        handle.spawn(async move {
            let routed = AssertUnwindSafe(processor.process(event)).catch_unwind().await;
            let Ok(routed) = routed else {
                error!("Flow panicked while routing the event");
                callback.error(anyhow::anyhow!("flow panicked while routing the event"));
                return;
            };
            let result = match routed {
                Ok(result) => {
                    let successful = template.successful_execution_response_parameters();
                    let for_response = result.clone();
                    SourcePolicyResult::Success(SourcePolicySuccessResult::new(
                        result,
                        Box::new(move || successful(&for_response)),
                        template.failed_execution_response_parameters(),
                    ))
                }
                Err(error) => {
                    let failed = template.failed_execution_response_parameters();
                    let for_response = error.result_event().clone();
                    SourcePolicyResult::Failure(SourcePolicyFailureResult::new(
                        error,
                        Box::new(move || failed(&for_response)),
                    ))
                }
            };
            callback.complete(result);
        });
    }
}
