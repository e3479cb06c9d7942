//! Phase execution engine.
//!
//! The engine walks a message through an ordered list of phases. It only
//! advances when the running phase reports back through its
//! [`PhaseResultNotifier`]; there is no polling. Whatever the outcome, the
//! end phase runs exactly once per message.

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use tracing::{debug, error, warn, Span};

use conduit_core::CompletionSignal;

use crate::context::MessageProcessContext;
use crate::error::ProcessingError;
use crate::notifier::{PhaseResultNotifier, SystemExceptionHandler};
use crate::phases::EndProcessPhase;
use crate::template::{CapabilitySet, MessageProcessTemplate};

/// One stage of the pipeline.
pub trait MessageProcessPhase: Send + Sync {
    fn name(&self) -> &'static str;

    /// Position in the pipeline; lower runs first.
    fn order(&self) -> i32;

    fn required_capabilities(&self) -> CapabilitySet;

    fn supports_template(&self, template: &dyn MessageProcessTemplate) -> bool {
        template
            .capabilities()
            .contains_all(self.required_capabilities())
    }

    /// Run the phase, eventually calling exactly one notifier method.
    ///
    /// The call may return before the phase finished; asynchronous phases
    /// notify from wherever their work completes.
    fn run_phase(
        &self,
        template: Arc<dyn MessageProcessTemplate>,
        context: Arc<dyn MessageProcessContext>,
        notifier: Arc<dyn PhaseResultNotifier>,
    );
}

/// How the pipeline ended for one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Succeeded,
    Failed(String),
    Consumed,
}

impl ExecutionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed(_) => "failed",
            Self::Consumed => "consumed",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

impl fmt::Display for ExecutionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(reason) => write!(f, "failed: {reason}"),
            other => f.write_str(other.as_str()),
        }
    }
}

pub struct PhaseExecutionEngine {
    phases: Arc<Vec<Arc<dyn MessageProcessPhase>>>,
    end_phase: Arc<dyn MessageProcessPhase>,
    exception_handler: Arc<dyn SystemExceptionHandler>,
}

impl PhaseExecutionEngine {
    /// Create an engine over `phases`, sorted by their order.
    pub fn new(
        mut phases: Vec<Arc<dyn MessageProcessPhase>>,
        exception_handler: Arc<dyn SystemExceptionHandler>,
    ) -> Self {
        phases.sort_by_key(|phase| phase.order());
        Self {
            phases: Arc::new(phases),
            end_phase: Arc::new(EndProcessPhase),
            exception_handler,
        }
    }

    pub fn with_end_phase(mut self, end_phase: Arc<dyn MessageProcessPhase>) -> Self {
        self.end_phase = end_phase;
        self
    }

    pub fn phase_names(&self) -> Vec<&'static str> {
        self.phases.iter().map(|phase| phase.name()).collect()
    }

    /// Start processing one message.
    pub fn process(
        &self,
        template: Arc<dyn MessageProcessTemplate>,
        context: Arc<dyn MessageProcessContext>,
    ) -> PhaseExecutionHandle {
        let span = context.execution_span();
        let execution = Arc::new(PhaseExecution {
            phases: self.phases.clone(),
            end_phase: self.end_phase.clone(),
            exception_handler: self.exception_handler.clone(),
            template,
            context,
            ended: AtomicBool::new(false),
            outcome: OnceLock::new(),
            done: CompletionSignal::new(),
            span,
        });
        execution.run_from(0);
        PhaseExecutionHandle { execution }
    }
}

impl fmt::Debug for PhaseExecutionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhaseExecutionEngine")
            .field("phases", &self.phase_names())
            .field("end_phase", &self.end_phase.name())
            .finish()
    }
}

/// Observes the execution of one message.
#[derive(Clone)]
pub struct PhaseExecutionHandle {
    execution: Arc<PhaseExecution>,
}

impl PhaseExecutionHandle {
    /// Wait until the end phase was processed.
    pub async fn wait(&self) -> ExecutionOutcome {
        self.execution.done.wait().await;
        self.outcome()
            .unwrap_or_else(|| ExecutionOutcome::Failed("no outcome recorded".to_string()))
    }

    pub fn is_finished(&self) -> bool {
        self.execution.done.is_completed()
    }

    pub fn outcome(&self) -> Option<ExecutionOutcome> {
        self.execution.outcome.get().cloned()
    }
}

struct PhaseExecution {
    phases: Arc<Vec<Arc<dyn MessageProcessPhase>>>,
    end_phase: Arc<dyn MessageProcessPhase>,
    exception_handler: Arc<dyn SystemExceptionHandler>,
    template: Arc<dyn MessageProcessTemplate>,
    context: Arc<dyn MessageProcessContext>,
    ended: AtomicBool,
    outcome: OnceLock<ExecutionOutcome>,
    done: CompletionSignal,
    span: Span,
}

impl PhaseExecution {
    /// Run the first phase at or after `index` supporting the template.
    fn run_from(self: &Arc<Self>, index: usize) {
        let next = self
            .phases
            .iter()
            .enumerate()
            .skip(index)
            .find(|(_, phase)| phase.supports_template(self.template.as_ref()));

        match next {
            Some((index, phase)) => self.run(index, phase.clone()),
            None => self.end(ExecutionOutcome::Succeeded),
        }
    }

    fn run(self: &Arc<Self>, index: usize, phase: Arc<dyn MessageProcessPhase>) {
        let _entered = self.span.enter();
        debug!(phase = phase.name(), index, "Running phase");

        let notifier = Arc::new(StepNotifier {
            execution: self.clone(),
            index,
            phase: phase.name(),
            notified: AtomicBool::new(false),
        });
        let result = catch_unwind(AssertUnwindSafe(|| {
            phase.run_phase(
                self.template.clone(),
                self.context.clone(),
                notifier.clone(),
            )
        }));

        if let Err(panic) = result {
            let reason = panic_message(panic.as_ref());
            error!(phase = phase.name(), reason = %reason, "Phase panicked");
            notifier.phase_failure(ProcessingError::Other(anyhow::anyhow!(
                "phase {} panicked: {reason}",
                phase.name()
            )));
        }
    }

    fn end(self: &Arc<Self>, outcome: ExecutionOutcome) {
        if self.ended.swap(true, Ordering::SeqCst) {
            debug!("End phase already processed");
            return;
        }
        let _entered = self.span.enter();
        debug!(outcome = %outcome, "Processing end phase");
        let _ = self.outcome.set(outcome);

        if self.end_phase.supports_template(self.template.as_ref()) {
            let result = catch_unwind(AssertUnwindSafe(|| {
                self.end_phase.run_phase(
                    self.template.clone(),
                    self.context.clone(),
                    Arc::new(EndPhaseNotifier),
                )
            }));
            if let Err(panic) = result {
                error!(reason = %panic_message(panic.as_ref()), "End phase panicked");
            }
        }
        self.done.complete();
    }
}

/// Notifier handed to one phase run; only its first notification counts.
struct StepNotifier {
    execution: Arc<PhaseExecution>,
    index: usize,
    phase: &'static str,
    notified: AtomicBool,
}

impl StepNotifier {
    fn claim(&self, notification: &str) -> bool {
        if self.notified.swap(true, Ordering::SeqCst) {
            warn!(
                phase = self.phase,
                notification,
                "Phase already reported its result, ignoring"
            );
            return false;
        }
        true
    }
}

impl PhaseResultNotifier for StepNotifier {
    fn phase_successfully(&self) {
        if self.claim("success") {
            self.execution.run_from(self.index + 1);
        }
    }

    fn phase_failure(&self, reason: ProcessingError) {
        if self.claim("failure") {
            debug!(phase = self.phase, error = %reason, "Phase failed");
            self.execution.exception_handler.handle_exception(&reason);
            self.execution
                .end(ExecutionOutcome::Failed(reason.to_string()));
        }
    }

    fn phase_consumed_message(&self) {
        if self.claim("consumed") {
            self.execution.end(ExecutionOutcome::Consumed);
        }
    }
}

/// The end phase has nothing left to advance to.
struct EndPhaseNotifier;

impl PhaseResultNotifier for EndPhaseNotifier {
    fn phase_successfully(&self) {}

    fn phase_failure(&self, reason: ProcessingError) {
        warn!(error = %reason, "End phase reported a failure");
    }

    fn phase_consumed_message(&self) {}
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
