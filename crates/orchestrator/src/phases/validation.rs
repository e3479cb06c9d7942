use std::sync::Arc;

use tracing::{debug, warn};

use crate::context::MessageProcessContext;
use crate::engine::MessageProcessPhase;
use crate::error::ProcessingError;
use crate::notifier::PhaseResultNotifier;
use crate::phases::VALIDATION_ORDER;
use crate::template::{CapabilitySet, MessageProcessTemplate, TemplateCapability};

/// Discards messages the template reports as invalid.
#[derive(Debug, Default, Clone, Copy)]
pub struct ValidationPhase;

impl MessageProcessPhase for ValidationPhase {
    fn name(&self) -> &'static str {
        "validation"
    }

    fn order(&self) -> i32 {
        VALIDATION_ORDER
    }

    fn required_capabilities(&self) -> CapabilitySet {
        CapabilitySet::of(&[TemplateCapability::Validation])
    }

    fn run_phase(
        &self,
        template: Arc<dyn MessageProcessTemplate>,
        _context: Arc<dyn MessageProcessContext>,
        notifier: Arc<dyn PhaseResultNotifier>,
    ) {
        let Some(validation) = template.as_validation() else {
            notifier.phase_failure(ProcessingError::UnsupportedTemplate("validation"));
            return;
        };

        if validation.validate_message() {
            notifier.phase_successfully();
            return;
        }

        debug!("Message is invalid, discarding");
        match validation.discard_invalid_message() {
            Ok(()) => notifier.phase_consumed_message(),
            Err(e) => {
                warn!(error = %e, "Failed to discard invalid message");
                notifier.phase_failure(ProcessingError::Other(e));
            }
        }
    }
}
