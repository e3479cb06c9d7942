use std::sync::Arc;

use tracing::debug;

use crate::context::MessageProcessContext;
use crate::engine::MessageProcessPhase;
use crate::notifier::PhaseResultNotifier;
use crate::template::{CapabilitySet, MessageProcessTemplate, TemplateCapability};

/// Terminal phase; the engine runs it at most once per message.
#[derive(Debug, Default, Clone, Copy)]
pub struct EndProcessPhase;

impl MessageProcessPhase for EndProcessPhase {
    fn name(&self) -> &'static str {
        "end"
    }

    fn order(&self) -> i32 {
        i32::MAX
    }

    fn required_capabilities(&self) -> CapabilitySet {
        CapabilitySet::of(&[TemplateCapability::EndPhase])
    }

    fn run_phase(
        &self,
        template: Arc<dyn MessageProcessTemplate>,
        _context: Arc<dyn MessageProcessContext>,
        notifier: Arc<dyn PhaseResultNotifier>,
    ) {
        if let Some(end) = template.as_end_phase() {
            debug!("Message processing ended");
            end.message_processing_ended();
        }
        notifier.phase_successfully();
    }
}
