//! Flow process mediator.
//!
//! For a single inbound message the mediator builds the event, runs the flow
//! through the source policy, delivers the success or error response and
//! reports exactly one outcome to the phase notifier. Two drivers share the
//! per-message steps defined here:
//!
//! - [`FlowProcessMediator`] chains [`CompletableCallback`]s
//! - [`AsyncFlowProcessMediator`] awaits the same steps
//!
//! Both keep the same ordering: received notification, backpressure check,
//! policy, response, terminate, completion.

mod callback;
mod reactive;

pub use callback::FlowProcessMediator;
pub use reactive::AsyncFlowProcessMediator;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use conduit_core::{
    BackPressureError, CompletionSignal, ErrorType, Event, EventContext, EventError,
    MessagingError, SourceError, SourceErrorStage,
};

use crate::context::{FlowConstruct, MessageProcessContext, MessageSource};
use crate::error::{source_failure, ProcessingError};
use crate::notification::NotificationHelper;
use crate::notifier::PhaseResultNotifier;
use crate::policy::{
    FlowExecutionProcessor, NoPolicyManager, PolicyManager, SourcePolicy,
    SourcePolicyFailureResult, SourcePolicyResult,
};
use crate::template::{always, CompletableCallback, FlowProcessTemplate, ResponseParameters};

/// Which mediator drives module flows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediatorStyle {
    #[default]
    Callback,
    Async,
}

impl MediatorStyle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Callback => "callback",
            Self::Async => "async",
        }
    }
}

/// Hooks around response delivery for a message source.
///
/// Interceptors wrap the send in registration order, so the last registered
/// interceptor is the outermost: its `before_response` runs first and its
/// `after_response` runs last.
pub trait SourceInterceptor: Send + Sync {
    fn before_response(
        &self,
        _source: &MessageSource,
        _event: &Event,
        _parameters: &mut ResponseParameters,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn after_response(&self, _source: &MessageSource, _event: &Event, _error: Option<&anyhow::Error>) {
    }

    /// Called once the message reached its terminal outcome.
    fn after_terminated(&self, _source: &MessageSource, _context: &EventContext) {}
}

/// Settings shared by every message a mediator processes.
#[derive(Clone)]
pub(crate) struct MediatorCore {
    policy_manager: Arc<dyn PolicyManager>,
    notifications: NotificationHelper,
    interceptors: Vec<Arc<dyn SourceInterceptor>>,
    generate_correlation_id: bool,
}

/// Configures either mediator style.
#[derive(Clone)]
pub struct MediatorBuilder {
    core: MediatorCore,
}

impl MediatorBuilder {
    pub fn new(policy_manager: Arc<dyn PolicyManager>) -> Self {
        Self {
            core: MediatorCore {
                policy_manager,
                notifications: NotificationHelper::disabled(),
                interceptors: Vec::new(),
                generate_correlation_id: false,
            },
        }
    }

    pub fn with_notifications(mut self, notifications: NotificationHelper) -> Self {
        self.core.notifications = notifications;
        self
    }

    pub fn with_source_interceptor(mut self, interceptor: Arc<dyn SourceInterceptor>) -> Self {
        self.core.interceptors.push(interceptor);
        self
    }

    /// Generate a correlation id when the source supplies none.
    pub fn generate_correlation_ids(mut self, generate: bool) -> Self {
        self.core.generate_correlation_id = generate;
        self
    }

    pub fn build_callback(self) -> FlowProcessMediator {
        FlowProcessMediator::from_core(Arc::new(self.core))
    }

    pub fn build_async(self) -> AsyncFlowProcessMediator {
        AsyncFlowProcessMediator::from_core(Arc::new(self.core))
    }
}

impl Default for MediatorBuilder {
    fn default() -> Self {
        Self::new(Arc::new(NoPolicyManager))
    }
}

impl MediatorCore {
    /// Build the event and the per-message context, then create the policy.
    ///
    /// A policy creation failure is returned with the context so the caller
    /// can run the failure path in its own style.
    fn prepare(
        self: &Arc<Self>,
        template: Arc<dyn FlowProcessTemplate>,
        context: Arc<dyn MessageProcessContext>,
        notifier: Arc<dyn PhaseResultNotifier>,
    ) -> (Arc<PhaseContext>, anyhow::Result<Arc<dyn SourcePolicy>>) {
        let source = context.message_source().clone();
        let flow = context.flow_construct();
        let completion = CompletionSignal::new();
        let event = self.create_event(template.as_ref(), &source, flow.as_ref(), &completion);
        debug!(
            event_id = %event.id(),
            correlation_id = %event.correlation_id(),
            "Event created"
        );

        let processor = FlowExecutionProcessor::new(template.clone(), flow.clone());
        let policy = self.policy_manager.create_source_policy_instance(
            &source,
            &event,
            processor,
            template.clone(),
        );

        let ctx = Arc::new(PhaseContext {
            core: self.clone(),
            template,
            source,
            context,
            notifier,
            flow,
            completion,
            event,
            terminated: AtomicBool::new(false),
        });
        (ctx, policy)
    }

    fn create_event(
        &self,
        template: &dyn FlowProcessTemplate,
        source: &MessageSource,
        flow: &dyn FlowConstruct,
        completion: &CompletionSignal,
    ) -> Event {
        let adapter = template.source_message();
        let correlation_id = adapter.correlation_id.or_else(|| {
            self.generate_correlation_id
                .then(|| Uuid::new_v4().to_string())
        });
        let event_context = EventContext::new(
            flow.name(),
            source.location(),
            correlation_id,
            Some(completion.clone()),
        );
        let builder = Event::builder(event_context).message(adapter.message.clone());
        self.policy_manager
            .add_source_pointcut_parameters_into_event(source, &adapter.message.attributes, builder)
            .build()
    }
}

/// Completes the response completion when dropped.
struct CompleteOnDrop<'a>(&'a CompletionSignal);

impl Drop for CompleteOnDrop<'_> {
    fn drop(&mut self) {
        self.0.complete();
    }
}

/// State of one message travelling through the mediator.
pub(crate) struct PhaseContext {
    core: Arc<MediatorCore>,
    template: Arc<dyn FlowProcessTemplate>,
    source: MessageSource,
    context: Arc<dyn MessageProcessContext>,
    notifier: Arc<dyn PhaseResultNotifier>,
    flow: Arc<dyn FlowConstruct>,
    completion: CompletionSignal,
    event: Event,
    terminated: AtomicBool,
}

impl PhaseContext {
    fn on_message_received(&self) {
        let notifications = &self.core.notifications;
        notifications.message_received(&self.event);
        notifications.fire_custom(&self.event, &self.template.notification_functions());
    }

    /// Map a refused admission into the ordinary failure result.
    fn check_backpressure(&self) -> Result<(), SourcePolicyResult> {
        self.flow.check_backpressure(&self.event).map_err(|e| {
            debug!(event_id = %self.event.id(), reason = %e.reason, "Flow applied backpressure");
            self.event.context().error(e.to_string());
            self.map_backpressure(e)
        })
    }

    fn map_backpressure(&self, error: BackPressureError) -> SourcePolicyResult {
        let flow = error.flow.clone();
        let cause = Arc::new(anyhow::Error::new(error));
        let error_event = Event::builder_from(&self.event)
            .error(EventError::from_cause(
                ErrorType::FLOW_BACK_PRESSURE,
                cause.clone(),
            ))
            .build();
        let messaging_error = MessagingError::from_shared(error_event.clone(), cause)
            .with_error_type(ErrorType::FLOW_BACK_PRESSURE)
            .with_failing_component(flow);
        let failed = self.template.failed_execution_response_parameters();
        SourcePolicyResult::Failure(SourcePolicyFailureResult::new(
            messaging_error,
            Box::new(move || failed(&error_event)),
        ))
    }

    fn policy_callback_error(&self, error: anyhow::Error) -> SourcePolicyResult {
        warn!(event_id = %self.event.id(), error = %error, "Source policy failed");
        SourcePolicyResult::Failure(SourcePolicyFailureResult::without_parameters(
            MessagingError::new(self.event.clone(), error),
        ))
    }

    /// Resolve a policy creation failure into the error to report.
    fn policy_creation_error(&self, error: anyhow::Error) -> (MessagingError, ResponseParameters) {
        warn!(event_id = %self.event.id(), error = %error, "Failed to create source policy");
        let error = self.context.exception_resolver().resolve(
            MessagingError::new(self.event.clone(), error),
            self.context.error_type_locator().as_ref(),
        );
        let parameters = (self.template.failed_execution_response_parameters())(&self.event);
        (error, parameters)
    }

    fn policy_creation_finished(&self, error: MessagingError) {
        let _complete = CompleteOnDrop(&self.completion);
        self.event.context().error(error.message());
        self.notifier.phase_failure(error.into());
    }

    /// Send the success response through the source interceptors.
    ///
    /// Failures reach `callback` as a [`SourceError`] of the generate or send stage.
    fn send_response(
        self: &Arc<Self>,
        event: &Event,
        mut parameters: ResponseParameters,
        callback: Box<dyn CompletableCallback<()>>,
    ) {
        for interceptor in self.core.interceptors.iter().rev() {
            if let Err(e) = interceptor.before_response(&self.source, event, &mut parameters) {
                let error = SourceError::new(SourceErrorStage::ResponseGenerate, event.clone(), e);
                callback.error(anyhow::Error::new(error));
                return;
            }
        }

        let ctx = self.clone();
        let sent = event.clone();
        self.template.send_response_to_client(
            event,
            parameters,
            always(move |result| match result {
                Ok(()) => {
                    ctx.after_response(&sent, None);
                    callback.complete(());
                }
                Err(e) => {
                    ctx.after_response(&sent, Some(&e));
                    let error = source_failure(SourceErrorStage::ResponseSend, &sent, e);
                    callback.error(anyhow::Error::new(error));
                }
            }),
        );
    }

    /// Send an error response unless the client connection is already gone.
    fn send_error_response(
        self: &Arc<Self>,
        error: &MessagingError,
        mut parameters: ResponseParameters,
        callback: Box<dyn CompletableCallback<()>>,
    ) {
        if error.is_remote_connection_failure() {
            debug!(event_id = %error.event().id(), "Remote connection lost, skipping error response");
            callback.complete(());
            return;
        }

        let event = error.event().clone();
        for interceptor in self.core.interceptors.iter().rev() {
            if let Err(e) = interceptor.before_response(&self.source, &event, &mut parameters) {
                let failure = SourceError::new(SourceErrorStage::ErrorResponseGenerate, event, e)
                    .with_original(error.clone());
                callback.error(anyhow::Error::new(failure));
                return;
            }
        }

        let ctx = self.clone();
        let original = error.clone();
        self.template.send_failure_response_to_client(
            error,
            parameters,
            always(move |result| match result {
                Ok(()) => {
                    ctx.after_response(&event, None);
                    callback.complete(());
                }
                Err(e) => {
                    ctx.after_response(&event, Some(&e));
                    let failure = source_failure(SourceErrorStage::ErrorResponseSend, &event, e)
                        .with_original(original);
                    callback.error(anyhow::Error::new(failure));
                }
            }),
        );
    }

    fn after_response(&self, event: &Event, error: Option<&anyhow::Error>) {
        for interceptor in &self.core.interceptors {
            interceptor.after_response(&self.source, event, error);
        }
    }

    /// Route a failed success response to the flow's exception listener.
    ///
    /// The listener's result is discarded; the returned error is what the
    /// error response reports.
    fn route_source_error(&self, error: SourceError) -> MessagingError {
        warn!(
            event_id = %self.event.id(),
            stage = %error.stage(),
            error = %error,
            "Failed to send response"
        );
        let mut messaging_error = error.to_messaging_error();
        let failed = messaging_error.event().clone();
        self.flow
            .exception_listener()
            .handle_exception(&mut messaging_error, &failed);
        messaging_error
    }

    /// Report the terminal outcome to the template, at most once.
    fn terminate(&self, result: Result<Event, MessagingError>) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            debug!(event_id = %self.event.id(), "Message already terminated");
            return;
        }

        let locator = self.context.error_type_locator();
        let result = result.map_err(|mut error| {
            let processed = error.error_event(locator.as_ref());
            error.set_processed_event(processed);
            error
        });
        if let Err(e) = self.template.after_phase_execution(result) {
            warn!(event_id = %self.event.id(), error = %e, "After phase execution failed");
        }
        for interceptor in &self.core.interceptors {
            interceptor.after_terminated(&self.source, self.event.context());
        }
    }

    fn terminate_with_failure(&self, error: &ProcessingError) {
        let failure = match error {
            ProcessingError::Messaging(e) => e.clone(),
            ProcessingError::Source(e) => e.to_messaging_error(),
            other => MessagingError::new(self.event.clone(), anyhow::anyhow!(other.to_string())),
        };
        self.terminate(Err(failure));
    }

    /// Report the outcome to the notifier, completing the response completion last.
    fn finish(&self, error: Option<ProcessingError>) {
        let _complete = CompleteOnDrop(&self.completion);
        match error {
            None => {
                self.event.context().success();
                self.notifier.phase_successfully();
            }
            Some(error) => {
                self.event.context().error(error.to_string());
                self.terminate_with_failure(&error);
                self.notifier.phase_failure(error);
            }
        }
    }
}

impl Drop for PhaseContext {
    fn drop(&mut self) {
        if self.completion.complete() {
            warn!(event_id = %self.event.id(), "Message dropped before it finished");
        }
    }
}
