use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use conduit_core::{
    BackPressureError, BackPressureReason, CompletionSignal, ErrorType, Event, Message,
    MessagingError, MessagingExceptionHandler, PropagatingExceptionHandler,
};
use events::{Notification, NotificationBus};
use orchestrator::{
    CapabilitySet, CompletableCallback, DefaultMessageProcessContext, EndPhaseTemplate,
    ExecutionOutcome, FlowConstruct, FlowExecutionProcessor, FlowProcessTemplate,
    MediatorBuilder, MediatorStyle, MessageProcessPhase, MessageProcessTemplate, MessageSource,
    ModuleFlowProcessingPhase, NoPolicyManager, NotificationHelper, ParametersFunction,
    PhaseExecutionEngine, PolicyManager, ProcessingError, ResponseParameters, SourceInterceptor,
    SourcePolicy, SourcePolicyResult, SourceResultAdapter, SystemExceptionHandler,
    TemplateCapability, ValidationPhase, ValidationTemplate,
};

const STYLES: [MediatorStyle; 2] = [MediatorStyle::Callback, MediatorStyle::Async];

type Log = Arc<Mutex<Vec<String>>>;

fn push(log: &Log, entry: impl Into<String>) {
    log.lock().unwrap().push(entry.into());
}

fn count(entries: &[String], prefix: &str) -> usize {
    entries.iter().filter(|e| e.starts_with(prefix)).count()
}

#[derive(Default, Clone)]
struct Script {
    invalid: bool,
    route_failure: Option<ErrorType>,
    fail_route: bool,
    panic_route: bool,
    fail_response: bool,
    fail_error_response: bool,
    backpressure: bool,
}

struct RecordingTemplate {
    script: Script,
    log: Log,
    completion: Mutex<Option<CompletionSignal>>,
}

impl RecordingTemplate {
    fn new(script: Script, log: Log) -> Arc<Self> {
        Arc::new(Self {
            script,
            log,
            completion: Mutex::new(None),
        })
    }

    fn completion(&self) -> Option<CompletionSignal> {
        self.completion.lock().unwrap().clone()
    }
}

impl MessageProcessTemplate for RecordingTemplate {
    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet::of(&[
            TemplateCapability::Validation,
            TemplateCapability::FlowProcess,
            TemplateCapability::EndPhase,
        ])
    }

    fn as_validation(self: Arc<Self>) -> Option<Arc<dyn ValidationTemplate>> {
        Some(self)
    }

    fn as_flow_process(self: Arc<Self>) -> Option<Arc<dyn FlowProcessTemplate>> {
        Some(self)
    }

    fn as_end_phase(self: Arc<Self>) -> Option<Arc<dyn EndPhaseTemplate>> {
        Some(self)
    }
}

impl ValidationTemplate for RecordingTemplate {
    fn validate_message(&self) -> bool {
        !self.script.invalid
    }

    fn discard_invalid_message(&self) -> anyhow::Result<()> {
        push(&self.log, "discard");
        Ok(())
    }
}

#[async_trait]
impl FlowProcessTemplate for RecordingTemplate {
    fn source_message(&self) -> SourceResultAdapter {
        SourceResultAdapter::new(Message::of(json!({"order": 42})))
    }

    async fn route_event_async(&self, event: Event) -> Result<Event, MessagingError> {
        push(&self.log, "route");
        if self.script.panic_route {
            panic!("flow panicked");
        }
        if self.script.fail_route {
            let error = MessagingError::new(event, anyhow::anyhow!("flow failed"));
            return Err(match &self.script.route_failure {
                Some(error_type) => error.with_error_type(error_type.clone()),
                None => error,
            });
        }
        Ok(Event::builder_from(&event)
            .message(Message::of(json!("processed")))
            .build())
    }

    fn send_response_to_client(
        &self,
        event: &Event,
        _parameters: ResponseParameters,
        callback: Box<dyn CompletableCallback<()>>,
    ) {
        push(&self.log, format!("response {}", event.message().payload));
        if self.script.fail_response {
            callback.error(anyhow::anyhow!("socket closed"));
        } else {
            callback.complete(());
        }
    }

    fn send_failure_response_to_client(
        &self,
        error: &MessagingError,
        parameters: ResponseParameters,
        callback: Box<dyn CompletableCallback<()>>,
    ) {
        let error_type = error
            .error_type()
            .map(|t| t.identifier().to_string())
            .unwrap_or_else(|| "UNTYPED".to_string());
        let status = parameters.get("status").cloned().unwrap_or(json!(null));
        push(&self.log, format!("failure response {error_type} {status}"));
        let mut completion = self.completion.lock().unwrap();
        if completion.is_none() {
            *completion = error
                .event()
                .context()
                .root_context()
                .response_completion()
                .cloned();
        }
        drop(completion);
        if self.script.fail_error_response {
            callback.error(anyhow::anyhow!("socket closed"));
        } else {
            callback.complete(());
        }
    }

    fn after_phase_execution(&self, result: Result<Event, MessagingError>) -> anyhow::Result<()> {
        let event = match &result {
            Ok(event) => {
                push(&self.log, "terminate ok");
                event.clone()
            }
            Err(error) => {
                push(&self.log, "terminate error");
                error.event().clone()
            }
        };
        *self.completion.lock().unwrap() = event
            .context()
            .root_context()
            .response_completion()
            .cloned();
        Ok(())
    }

    fn failed_execution_response_parameters(&self) -> ParametersFunction {
        Arc::new(|_| ResponseParameters::from([("status".to_string(), json!(500))]))
    }
}

impl EndPhaseTemplate for RecordingTemplate {
    fn message_processing_ended(&self) {
        push(&self.log, "ended");
    }
}

struct RecordingListener {
    log: Log,
}

impl MessagingExceptionHandler for RecordingListener {
    fn handle_exception(&self, error: &mut MessagingError, event: &Event) -> Event {
        push(&self.log, "listener");
        PropagatingExceptionHandler.handle_exception(error, event)
    }
}

struct RecordingFlow {
    listener: Arc<RecordingListener>,
    backpressure: bool,
}

impl FlowConstruct for RecordingFlow {
    fn name(&self) -> &str {
        "orders"
    }

    fn exception_listener(&self) -> Arc<dyn MessagingExceptionHandler> {
        self.listener.clone()
    }

    fn check_backpressure(&self, _event: &Event) -> Result<(), BackPressureError> {
        if self.backpressure {
            return Err(BackPressureError::new(
                "orders",
                BackPressureReason::MaxConcurrencyExceeded,
            ));
        }
        Ok(())
    }
}

struct RecordingHandler {
    log: Log,
}

impl SystemExceptionHandler for RecordingHandler {
    fn handle_exception(&self, _error: &ProcessingError) {
        push(&self.log, "system error");
    }
}

struct Run {
    outcome: ExecutionOutcome,
    entries: Vec<String>,
    completion: Option<CompletionSignal>,
}

fn module_phase(style: MediatorStyle, builder: MediatorBuilder) -> ModuleFlowProcessingPhase {
    match style {
        MediatorStyle::Callback => ModuleFlowProcessingPhase::callback(builder.build_callback()),
        MediatorStyle::Async => ModuleFlowProcessingPhase::asynchronous(builder.build_async()),
    }
}

async fn run_with(style: MediatorStyle, script: Script, builder: MediatorBuilder) -> Run {
    let log = Log::default();
    let template = RecordingTemplate::new(script.clone(), log.clone());
    let flow = Arc::new(RecordingFlow {
        listener: Arc::new(RecordingListener { log: log.clone() }),
        backpressure: script.backpressure,
    });
    let context = DefaultMessageProcessContext::new(MessageSource::new("orders/listener"), flow);

    let phases: Vec<Arc<dyn MessageProcessPhase>> = vec![
        Arc::new(ValidationPhase),
        Arc::new(module_phase(style, builder)),
    ];
    let engine = PhaseExecutionEngine::new(phases, Arc::new(RecordingHandler { log: log.clone() }));

    let handle = engine.process(template.clone(), Arc::new(context));
    let outcome = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("message did not finish");

    let entries = log.lock().unwrap().clone();
    Run {
        outcome,
        entries,
        completion: template.completion(),
    }
}

async fn run(style: MediatorStyle, script: Script) -> Run {
    run_with(style, script, MediatorBuilder::new(Arc::new(NoPolicyManager))).await
}

#[tokio::test]
async fn test_successful_flow_sends_response() {
    for style in STYLES {
        let run = run(style, Script::default()).await;

        assert_eq!(run.outcome, ExecutionOutcome::Succeeded, "{style:?}");
        assert_eq!(
            run.entries,
            vec!["route", "response \"processed\"", "terminate ok", "ended"],
            "{style:?}"
        );
        assert!(run.completion.unwrap().is_completed());
    }
}

#[tokio::test]
async fn test_failing_flow_sends_error_response() {
    for style in STYLES {
        let script = Script {
            fail_route: true,
            ..Default::default()
        };
        let run = run(style, script).await;

        assert_eq!(run.outcome, ExecutionOutcome::Succeeded, "{style:?}");
        assert_eq!(
            run.entries,
            vec![
                "route",
                "listener",
                "failure response UNTYPED 500",
                "terminate error",
                "ended"
            ],
            "{style:?}"
        );
        assert!(run.completion.unwrap().is_completed());
    }
}

#[tokio::test]
async fn test_backpressure_skips_policy() {
    for style in STYLES {
        let script = Script {
            backpressure: true,
            ..Default::default()
        };
        let run = run(style, script).await;

        assert_eq!(run.outcome, ExecutionOutcome::Succeeded, "{style:?}");
        assert_eq!(count(&run.entries, "route"), 0, "{style:?}");
        assert_eq!(
            run.entries,
            vec![
                "failure response FLOW_BACK_PRESSURE 500",
                "terminate error",
                "ended"
            ],
            "{style:?}"
        );
        assert!(run.completion.unwrap().is_completed());
    }
}

#[tokio::test]
async fn test_backpressure_matches_flow_failure_response_path() {
    let response_path = |entries: &[String]| -> Vec<String> {
        entries
            .iter()
            .filter(|e| e.starts_with("failure response") || e.starts_with("terminate"))
            .cloned()
            .collect()
    };

    for style in STYLES {
        let backpressure = run(
            style,
            Script {
                backpressure: true,
                ..Default::default()
            },
        )
        .await;
        let failing = run(
            style,
            Script {
                fail_route: true,
                route_failure: Some(ErrorType::FLOW_BACK_PRESSURE),
                ..Default::default()
            },
        )
        .await;

        assert_eq!(backpressure.outcome, failing.outcome, "{style:?}");
        assert_eq!(
            response_path(&backpressure.entries),
            response_path(&failing.entries),
            "{style:?}"
        );
    }
}

#[tokio::test]
async fn test_response_send_failure_retries_as_error_response() {
    for style in STYLES {
        let script = Script {
            fail_response: true,
            ..Default::default()
        };
        let run = run(style, script).await;

        assert_eq!(run.outcome, ExecutionOutcome::Succeeded, "{style:?}");
        assert_eq!(
            run.entries,
            vec![
                "route",
                "response \"processed\"",
                "listener",
                "failure response SOURCE_RESPONSE_SEND 500",
                "terminate error",
                "ended"
            ],
            "{style:?}"
        );
    }
}

#[tokio::test]
async fn test_failed_error_response_fails_phase() {
    for style in STYLES {
        let script = Script {
            fail_response: true,
            fail_error_response: true,
            ..Default::default()
        };
        let run = run(style, script).await;

        assert!(
            matches!(run.outcome, ExecutionOutcome::Failed(_)),
            "{style:?}: {:?}",
            run.outcome
        );
        assert_eq!(count(&run.entries, "failure response"), 1, "{style:?}");
        assert_eq!(count(&run.entries, "terminate"), 1, "{style:?}");
        assert_eq!(count(&run.entries, "system error"), 1, "{style:?}");
        assert_eq!(run.entries.last().map(String::as_str), Some("ended"));
        assert!(run.completion.unwrap().is_completed());
    }
}

#[tokio::test]
async fn test_invalid_message_is_consumed() {
    for style in STYLES {
        let script = Script {
            invalid: true,
            ..Default::default()
        };
        let run = run(style, script).await;

        assert_eq!(run.outcome, ExecutionOutcome::Consumed, "{style:?}");
        assert_eq!(run.entries, vec!["discard", "ended"], "{style:?}");
    }
}

#[tokio::test]
async fn test_every_path_terminates_and_ends_once() {
    let scripts = vec![
        Script::default(),
        Script {
            fail_route: true,
            ..Default::default()
        },
        Script {
            backpressure: true,
            ..Default::default()
        },
        Script {
            fail_response: true,
            ..Default::default()
        },
        Script {
            fail_route: true,
            fail_error_response: true,
            ..Default::default()
        },
        Script {
            fail_response: true,
            fail_error_response: true,
            ..Default::default()
        },
        Script {
            invalid: true,
            ..Default::default()
        },
    ];

    for style in STYLES {
        for script in &scripts {
            let run = run(style, script.clone()).await;
            assert_eq!(count(&run.entries, "ended"), 1, "{style:?}: {:?}", run.entries);
            if !script.invalid {
                assert_eq!(count(&run.entries, "terminate"), 1, "{style:?}: {:?}", run.entries);
                let completion = run.completion.expect("terminated without a completion");
                assert!(completion.is_completed());
                assert!(!completion.complete());
            }
        }
    }
}

#[tokio::test]
async fn test_panicking_flow_still_sends_error_response() {
    for style in STYLES {
        let script = Script {
            panic_route: true,
            ..Default::default()
        };
        let run = run(style, script).await;

        assert_eq!(run.outcome, ExecutionOutcome::Succeeded, "{style:?}");
        assert_eq!(
            run.entries,
            vec![
                "route",
                "failure response UNTYPED null",
                "terminate error",
                "ended"
            ],
            "{style:?}"
        );
        assert!(run.completion.unwrap().is_completed());
    }
}

struct Tagging {
    name: &'static str,
    log: Log,
}

impl SourceInterceptor for Tagging {
    fn before_response(
        &self,
        _source: &MessageSource,
        _event: &Event,
        parameters: &mut ResponseParameters,
    ) -> anyhow::Result<()> {
        push(&self.log, format!("before {}", self.name));
        parameters.insert(self.name.to_string(), json!(true));
        Ok(())
    }

    fn after_response(
        &self,
        _source: &MessageSource,
        _event: &Event,
        error: Option<&anyhow::Error>,
    ) {
        push(&self.log, format!("after {} {}", self.name, error.is_some()));
    }
}

#[tokio::test]
async fn test_source_interceptors_wrap_response() {
    for style in STYLES {
        let log = Log::default();
        let builder = MediatorBuilder::new(Arc::new(NoPolicyManager))
            .with_source_interceptor(Arc::new(Tagging {
                name: "inner",
                log: log.clone(),
            }))
            .with_source_interceptor(Arc::new(Tagging {
                name: "outer",
                log: log.clone(),
            }));

        let run = run_with(style, Script::default(), builder).await;
        assert_eq!(run.outcome, ExecutionOutcome::Succeeded);

        let hooks = log.lock().unwrap().clone();
        assert_eq!(
            hooks,
            vec!["before outer", "before inner", "after inner false", "after outer false"],
            "{style:?}"
        );
    }
}

#[tokio::test]
async fn test_notifications_fired_on_bus() {
    for style in STYLES {
        let bus = NotificationBus::new();
        let mut rx = bus.listen();
        let builder = MediatorBuilder::new(Arc::new(NoPolicyManager))
            .with_notifications(NotificationHelper::new(Arc::new(bus.clone())));

        let run = run_with(style, Script::default(), builder).await;
        assert_eq!(run.outcome, ExecutionOutcome::Succeeded);

        let received = rx.recv().await.unwrap();
        assert!(matches!(
            received.notification,
            Notification::MessageReceived { .. }
        ));
        let response = rx.recv().await.unwrap();
        assert!(matches!(
            response.notification,
            Notification::MessageResponse { .. }
        ));
    }
}

struct FailingPolicyManager;

impl PolicyManager for FailingPolicyManager {
    fn create_source_policy_instance(
        &self,
        _source: &MessageSource,
        _event: &Event,
        _processor: FlowExecutionProcessor,
        _template: Arc<dyn FlowProcessTemplate>,
    ) -> anyhow::Result<Arc<dyn SourcePolicy>> {
        anyhow::bail!("policy unavailable")
    }
}

#[tokio::test]
async fn test_policy_creation_failure_responds_and_fails() {
    for style in STYLES {
        let hooks = Log::default();
        let builder = MediatorBuilder::new(Arc::new(FailingPolicyManager)).with_source_interceptor(
            Arc::new(Tagging {
                name: "outer",
                log: hooks.clone(),
            }),
        );

        let run = run_with(style, Script::default(), builder).await;

        assert!(
            matches!(run.outcome, ExecutionOutcome::Failed(_)),
            "{style:?}: {:?}",
            run.outcome
        );
        assert_eq!(count(&run.entries, "failure response"), 1, "{style:?}");
        assert_eq!(count(&run.entries, "route"), 0, "{style:?}");
        assert_eq!(count(&run.entries, "terminate"), 0, "{style:?}");
        assert_eq!(count(&run.entries, "ended"), 1, "{style:?}");
        assert_eq!(run.entries.last().map(String::as_str), Some("ended"));
        assert!(hooks.lock().unwrap().is_empty(), "{style:?}");
        assert!(run.completion.unwrap().is_completed());
    }
}

struct DroppingPolicy;

impl SourcePolicy for DroppingPolicy {
    fn process(
        &self,
        _event: Event,
        _template: Arc<dyn FlowProcessTemplate>,
        callback: Box<dyn CompletableCallback<SourcePolicyResult>>,
    ) {
        drop(callback);
    }
}

struct DroppingPolicyManager;

impl PolicyManager for DroppingPolicyManager {
    fn create_source_policy_instance(
        &self,
        _source: &MessageSource,
        _event: &Event,
        _processor: FlowExecutionProcessor,
        _template: Arc<dyn FlowProcessTemplate>,
    ) -> anyhow::Result<Arc<dyn SourcePolicy>> {
        Ok(Arc::new(DroppingPolicy))
    }
}

#[tokio::test]
async fn test_dropped_policy_callback_sends_error_response() {
    for style in STYLES {
        let builder = MediatorBuilder::new(Arc::new(DroppingPolicyManager));
        let run = run_with(style, Script::default(), builder).await;

        assert_eq!(run.outcome, ExecutionOutcome::Succeeded, "{style:?}");
        assert_eq!(
            run.entries,
            vec!["failure response UNTYPED null", "terminate error", "ended"],
            "{style:?}"
        );
        assert!(run.completion.unwrap().is_completed());
    }
}
