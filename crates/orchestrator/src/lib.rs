//! Message-processing pipeline.
//!
//! A message source hands each inbound message to a [`PhaseExecutionEngine`]
//! as a [`MessageProcessTemplate`] plus a [`MessageProcessContext`]. The engine
//! runs the phases supporting the template in order (validation, flow
//! processing or module flow processing) and always finishes with the end
//! phase. Module flows go through a flow process mediator, which applies the
//! source policy and delivers the response.

pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod logging;
pub mod mediator;
pub mod notification;
pub mod notifier;
pub mod phases;
pub mod policy;
pub mod template;

pub use config::ProcessingConfig;
pub use context::{
    BoundedFlowExecutor, DefaultMessageProcessContext, FlowConstruct, FlowExecutor,
    MessageProcessContext, MessageSource,
};
pub use engine::{ExecutionOutcome, MessageProcessPhase, PhaseExecutionEngine, PhaseExecutionHandle};
pub use error::{ConfigError, ProcessingError, Result};
pub use mediator::{
    AsyncFlowProcessMediator, FlowProcessMediator, MediatorBuilder, MediatorStyle,
    SourceInterceptor,
};
pub use notification::NotificationHelper;
pub use notifier::{LoggingSystemExceptionHandler, PhaseResultNotifier, SystemExceptionHandler};
pub use phases::{EndProcessPhase, FlowProcessingPhase, ModuleFlowProcessingPhase, ValidationPhase};
pub use policy::{
    FlowExecutionProcessor, NoPolicyManager, PolicyManager, SourcePolicy,
    SourcePolicyFailureResult, SourcePolicyResult, SourcePolicySuccessResult,
};
pub use template::{
    always, callback, oneshot_callback, CapabilitySet, CompletableCallback, CustomNotification,
    EndPhaseTemplate, FlowProcessTemplate, FlowProcessingTemplate, MessageProcessTemplate,
    ParametersFunction, RequestResponseTemplate, ResponseParameters, SourceResultAdapter,
    TemplateCapability, ValidationTemplate,
};
