use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::{warn, Instrument, Span};

use crate::context::MessageProcessContext;
use crate::engine::MessageProcessPhase;
use crate::error::ProcessingError;
use crate::mediator::{AsyncFlowProcessMediator, FlowProcessMediator, MediatorStyle};
use crate::notifier::PhaseResultNotifier;
use crate::phases::FLOW_PROCESSING_ORDER;
use crate::template::{CapabilitySet, MessageProcessTemplate, TemplateCapability};

enum Mediator {
    Callback(FlowProcessMediator),
    Async(AsyncFlowProcessMediator),
}

/// Hands flow-process templates to the configured mediator.
///
/// The phase returns as soon as the mediator took the message; the mediator
/// reports the outcome to the notifier once the response went out.
pub struct ModuleFlowProcessingPhase {
    mediator: Mediator,
}

impl ModuleFlowProcessingPhase {
    pub fn callback(mediator: FlowProcessMediator) -> Self {
        Self {
            mediator: Mediator::Callback(mediator),
        }
    }

    /// Requires a tokio runtime at run time; without one the phase fails.
    pub fn asynchronous(mediator: AsyncFlowProcessMediator) -> Self {
        Self {
            mediator: Mediator::Async(mediator),
        }
    }

    pub fn style(&self) -> MediatorStyle {
        match self.mediator {
            Mediator::Callback(_) => MediatorStyle::Callback,
            Mediator::Async(_) => MediatorStyle::Async,
        }
    }
}

impl MessageProcessPhase for ModuleFlowProcessingPhase {
    fn name(&self) -> &'static str {
        "module_flow_processing"
    }

    fn order(&self) -> i32 {
        FLOW_PROCESSING_ORDER
    }

    fn required_capabilities(&self) -> CapabilitySet {
        CapabilitySet::of(&[TemplateCapability::FlowProcess])
    }

    fn run_phase(
        &self,
        template: Arc<dyn MessageProcessTemplate>,
        context: Arc<dyn MessageProcessContext>,
        notifier: Arc<dyn PhaseResultNotifier>,
    ) {
        let Some(template) = template.as_flow_process() else {
            notifier.phase_failure(ProcessingError::UnsupportedTemplate("flow process"));
            return;
        };

        match &self.mediator {
            Mediator::Callback(mediator) => mediator.process(template, context, notifier),
            Mediator::Async(mediator) => {
                let Ok(handle) = Handle::try_current() else {
                    warn!("No tokio runtime available for the async mediator");
                    notifier.phase_failure(ProcessingError::Other(anyhow::anyhow!(
                        "no tokio runtime available for the async mediator"
                    )));
                    return;
                };
                let mediator = mediator.clone();
                handle.spawn(
                    async move { mediator.process(template, context, notifier).await }
                        .instrument(Span::current()),
                );
            }
        }
    }
}
