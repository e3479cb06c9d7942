use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, error, warn, Span};

use conduit_core::{Event, MessagingError, SourceErrorStage};
use execution::{error_handling_execution_template, ExecutionOptions};

use crate::context::MessageProcessContext;
use crate::engine::MessageProcessPhase;
use crate::error::{source_failure, ProcessingError};
use crate::notifier::PhaseResultNotifier;
use crate::phases::FLOW_PROCESSING_ORDER;
use crate::template::{
    CapabilitySet, FlowProcessingTemplate, MessageProcessTemplate, RequestResponseTemplate,
    TemplateCapability,
};

/// Routes the message synchronously inside the error-handling execution template.
///
/// When the context supports asynchronous processing the routing runs on the
/// context's flow executor; a saturated executor fails the phase immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct FlowProcessingPhase;

impl MessageProcessPhase for FlowProcessingPhase {
    fn name(&self) -> &'static str {
        "flow_processing"
    }

    fn order(&self) -> i32 {
        FLOW_PROCESSING_ORDER
    }

    fn required_capabilities(&self) -> CapabilitySet {
        CapabilitySet::of(&[TemplateCapability::FlowProcessing])
    }

    fn run_phase(
        &self,
        template: Arc<dyn MessageProcessTemplate>,
        context: Arc<dyn MessageProcessContext>,
        notifier: Arc<dyn PhaseResultNotifier>,
    ) {
        let Some(flow) = template.clone().as_flow_processing() else {
            notifier.phase_failure(ProcessingError::UnsupportedTemplate("flow processing"));
            return;
        };
        let response = template.as_request_response();

        let executor = context
            .flow_executor()
            .filter(|_| context.supports_asynchronous_processing());
        let Some(executor) = executor else {
            process(flow.as_ref(), response.as_deref(), context.as_ref(), notifier.as_ref());
            return;
        };

        let span = Span::current();
        let work_notifier = notifier.clone();
        let work = Box::new(move || {
            let _entered = span.enter();
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                process(
                    flow.as_ref(),
                    response.as_deref(),
                    context.as_ref(),
                    work_notifier.as_ref(),
                )
            }));
            // A phase that already notified ignores this failure.
            if outcome.is_err() {
                error!("Flow processing panicked on the flow executor");
                work_notifier.phase_failure(ProcessingError::Other(anyhow::anyhow!(
                    "flow processing panicked"
                )));
            }
        });
        if let Err(e) = executor.execute(work) {
            warn!(error = %e, "Flow executor rejected the message");
            notifier.phase_failure(e);
        }
    }
}

fn process(
    flow: &dyn FlowProcessingTemplate,
    response: Option<&dyn RequestResponseTemplate>,
    context: &dyn MessageProcessContext,
    notifier: &dyn PhaseResultNotifier,
) {
    let event = match flow.event() {
        Ok(event) => event,
        Err(e) => {
            notifier.phase_failure(ProcessingError::Other(e));
            return;
        }
    };

    let config = context.transaction_config().cloned().unwrap_or_default();
    let execution = error_handling_execution_template(
        context.transaction_coordinator(),
        config,
        context.flow_construct().exception_listener(),
        ExecutionOptions::processing_on_exception(),
    );

    debug!(event_id = %event.id(), "Routing event");
    let result = execution.execute(|| {
        let event = flow.before_route_event(event)?;
        let routed = flow.route_event(event)?;
        Ok(flow.after_route_event(routed)?)
    });

    match result.map_err(ProcessingError::from) {
        Ok(event) => respond(flow, response, &event, notifier),
        Err(ProcessingError::Messaging(error)) => {
            let error = context
                .exception_resolver()
                .resolve(error, context.error_type_locator().as_ref());
            respond_failure(flow, response, error, notifier);
        }
        Err(other) => notifier.phase_failure(other),
    }
}

fn respond(
    flow: &dyn FlowProcessingTemplate,
    response: Option<&dyn RequestResponseTemplate>,
    event: &Event,
    notifier: &dyn PhaseResultNotifier,
) {
    flow.after_successful_processing_flow(event);
    if let Some(response) = response {
        if let Err(e) = response.send_response_to_client(event) {
            warn!(event_id = %event.id(), error = %e, "Failed to send response");
            let failure = source_failure(SourceErrorStage::ResponseSend, event, e);
            notifier.phase_failure(failure.into());
            return;
        }
    }
    notifier.phase_successfully();
}

fn respond_failure(
    flow: &dyn FlowProcessingTemplate,
    response: Option<&dyn RequestResponseTemplate>,
    error: MessagingError,
    notifier: &dyn PhaseResultNotifier,
) {
    debug!(event_id = %error.event().id(), error = %error, "Flow failed");
    flow.after_failure_processing_flow(&error);
    if let Some(response) = response {
        if let Err(e) = response.send_failure_response_to_client(&error) {
            warn!(event_id = %error.event().id(), error = %e, "Failed to send error response");
            let failure = source_failure(SourceErrorStage::ErrorResponseSend, error.event(), e)
                .with_original(error);
            notifier.phase_failure(failure.into());
            return;
        }
    }
    notifier.phase_failure(error.into());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use conduit_core::{
        ContinuingExceptionHandler, EventContext, Message, MessagingExceptionHandler,
        PropagatingExceptionHandler,
    };
    use serde_json::json;

    use crate::context::{DefaultMessageProcessContext, FlowConstruct, FlowExecutor, MessageSource};

    type Log = Arc<Mutex<Vec<String>>>;

    #[derive(Clone, Copy, PartialEq)]
    enum Route {
        Ok,
        Fail,
        Panic,
    }

    struct Template {
        route: Route,
        fail_send: bool,
        log: Log,
    }

    impl Template {
        fn record(&self, entry: impl Into<String>) {
            self.log.lock().unwrap().push(entry.into());
        }
    }

    impl MessageProcessTemplate for Template {
        fn capabilities(&self) -> CapabilitySet {
            CapabilitySet::of(&[
                TemplateCapability::FlowProcessing,
                TemplateCapability::RequestResponse,
            ])
        }

        fn as_flow_processing(self: Arc<Self>) -> Option<Arc<dyn FlowProcessingTemplate>> {
            Some(self)
        }

        fn as_request_response(self: Arc<Self>) -> Option<Arc<dyn RequestResponseTemplate>> {
            Some(self)
        }
    }

    impl FlowProcessingTemplate for Template {
        fn event(&self) -> anyhow::Result<Event> {
            let ctx = EventContext::new("orders", "orders/listener", None, None);
            Ok(Event::builder(ctx).message(Message::of(json!("in"))).build())
        }

        fn route_event(&self, event: Event) -> Result<Event, MessagingError> {
            self.record("route");
            match self.route {
                Route::Ok => Ok(Event::builder_from(&event)
                    .message(Message::of(json!("out")))
                    .build()),
                Route::Fail => Err(MessagingError::new(event, anyhow::anyhow!("flow failed"))),
                Route::Panic => panic!("flow panicked"),
            }
        }
    }

    impl RequestResponseTemplate for Template {
        fn send_response_to_client(&self, event: &Event) -> anyhow::Result<()> {
            self.record(format!("response {}", event.message().payload));
            if self.fail_send {
                anyhow::bail!("socket closed");
            }
            Ok(())
        }

        fn send_failure_response_to_client(&self, error: &MessagingError) -> anyhow::Result<()> {
            self.record(format!("failure response {}", error.message()));
            if self.fail_send {
                anyhow::bail!("socket closed");
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct Notifier {
        log: Mutex<Vec<String>>,
    }

    impl PhaseResultNotifier for Notifier {
        fn phase_successfully(&self) {
            self.log.lock().unwrap().push("success".into());
        }

        fn phase_failure(&self, reason: ProcessingError) {
            let kind = match reason {
                ProcessingError::Messaging(_) => "messaging",
                ProcessingError::Source(_) => "source",
                ProcessingError::SchedulerBusy(_) => "busy",
                _ => "other",
            };
            self.log.lock().unwrap().push(format!("failure {kind}"));
        }

        fn phase_consumed_message(&self) {
            self.log.lock().unwrap().push("consumed".into());
        }
    }

    struct Flow(Arc<dyn MessagingExceptionHandler>);

    impl FlowConstruct for Flow {
        fn name(&self) -> &str {
            "orders"
        }

        fn exception_listener(&self) -> Arc<dyn MessagingExceptionHandler> {
            self.0.clone()
        }
    }

    struct Saturated;

    impl FlowExecutor for Saturated {
        fn execute(&self, _work: Box<dyn FnOnce() + Send>) -> Result<(), ProcessingError> {
            Err(ProcessingError::scheduler_busy("no slots"))
        }
    }

    struct Inline;

    impl FlowExecutor for Inline {
        fn execute(&self, work: Box<dyn FnOnce() + Send>) -> Result<(), ProcessingError> {
            work();
            Ok(())
        }
    }

    fn run(
        route: Route,
        fail_send: bool,
        listener: Arc<dyn MessagingExceptionHandler>,
        executor: Option<Arc<dyn FlowExecutor>>,
    ) -> (Vec<String>, Vec<String>) {
        let log = Log::default();
        let template = Arc::new(Template {
            route,
            fail_send,
            log: log.clone(),
        });
        let mut context =
            DefaultMessageProcessContext::new(MessageSource::new("orders/listener"), Arc::new(Flow(listener)));
        if let Some(executor) = executor {
            context = context.with_flow_executor(executor);
        }
        let notifier = Arc::new(Notifier::default());

        FlowProcessingPhase.run_phase(template, Arc::new(context), notifier.clone());

        let template_log = log.lock().unwrap().clone();
        let notifier_log = notifier.log.lock().unwrap().clone();
        (template_log, notifier_log)
    }

    #[test]
    fn test_success_sends_response() {
        let (template, notifier) = run(Route::Ok, false, Arc::new(PropagatingExceptionHandler), None);
        assert_eq!(template, vec!["route", "response \"out\""]);
        assert_eq!(notifier, vec!["success"]);
    }

    #[test]
    fn test_messaging_error_sends_failure_response() {
        let (template, notifier) =
            run(Route::Fail, false, Arc::new(PropagatingExceptionHandler), None);
        assert_eq!(template, vec!["route", "failure response flow failed"]);
        assert_eq!(notifier, vec!["failure messaging"]);
    }

    #[test]
    fn test_handled_error_continues_as_success() {
        let (template, notifier) =
            run(Route::Fail, false, Arc::new(ContinuingExceptionHandler), None);
        assert_eq!(template, vec!["route", "response \"in\""]);
        assert_eq!(notifier, vec!["success"]);
    }

    #[test]
    fn test_response_send_failure_is_source_error() {
        let (_, notifier) = run(Route::Ok, true, Arc::new(PropagatingExceptionHandler), None);
        assert_eq!(notifier, vec!["failure source"]);

        let (_, notifier) = run(Route::Fail, true, Arc::new(PropagatingExceptionHandler), None);
        assert_eq!(notifier, vec!["failure source"]);
    }

    #[test]
    fn test_saturated_executor_reports_busy() {
        let (template, notifier) = run(
            Route::Ok,
            false,
            Arc::new(PropagatingExceptionHandler),
            Some(Arc::new(Saturated)),
        );
        assert!(template.is_empty());
        assert_eq!(notifier, vec!["failure busy"]);
    }

    #[test]
    fn test_panic_on_executor_fails_phase() {
        let (template, notifier) = run(
            Route::Panic,
            false,
            Arc::new(PropagatingExceptionHandler),
            Some(Arc::new(Inline)),
        );
        assert_eq!(template, vec!["route"]);
        assert_eq!(notifier, vec!["failure other"]);
    }
}
