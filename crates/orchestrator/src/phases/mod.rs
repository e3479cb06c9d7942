//! Phase implementations for the message-processing pipeline.
//!
//! - [`ValidationPhase`] - Rejects invalid messages before routing
//! - [`FlowProcessingPhase`] - Routes synchronously through a transactional template
//! - [`ModuleFlowProcessingPhase`] - Hosts the flow process mediator
//! - [`EndProcessPhase`] - Tells the template that processing ended

mod end;
mod flow_processing;
mod module_flow_processing;
mod validation;

pub use end::EndProcessPhase;
pub use flow_processing::FlowProcessingPhase;
pub use module_flow_processing::ModuleFlowProcessingPhase;
pub use validation::ValidationPhase;

/// Order of the validation phase.
pub const VALIDATION_ORDER: i32 = 0;

/// Order shared by the flow-executing phases.
pub const FLOW_PROCESSING_ORDER: i32 = 10;
