use std::sync::Arc;

use tracing::debug;

use conduit_core::{MessagingError, SourceErrorStage};

use super::{MediatorBuilder, MediatorCore, PhaseContext};
use crate::context::MessageProcessContext;
use crate::error::{source_failure, ProcessingError};
use crate::notifier::PhaseResultNotifier;
use crate::policy::{
    PolicyManager, SourcePolicyFailureResult, SourcePolicyResult, SourcePolicySuccessResult,
};
use crate::template::{always, callback, CompletableCallback, FlowProcessTemplate};

/// Mediator driving each message through explicit completion callbacks.
///
/// `process` returns as soon as the policy took the event; the outcome is
/// reported to the notifier from whichever callback finishes the message.
#[derive(Clone)]
pub struct FlowProcessMediator {
    core: Arc<MediatorCore>,
}

impl FlowProcessMediator {
    pub fn new(policy_manager: Arc<dyn PolicyManager>) -> Self {
        MediatorBuilder::new(policy_manager).build_callback()
    }

    pub fn builder(policy_manager: Arc<dyn PolicyManager>) -> MediatorBuilder {
        MediatorBuilder::new(policy_manager)
    }

    pub(crate) fn from_core(core: Arc<MediatorCore>) -> Self {
        Self { core }
    }

    pub fn process(
        &self,
        template: Arc<dyn FlowProcessTemplate>,
        context: Arc<dyn MessageProcessContext>,
        notifier: Arc<dyn PhaseResultNotifier>,
    ) {
        let (ctx, policy) = self.core.prepare(template, context, notifier);
        let policy = match policy {
            Ok(policy) => policy,
            Err(e) => {
                let (error, parameters) = ctx.policy_creation_error(e);
                let next = ctx.clone();
                let reported = error.clone();
                ctx.template.send_failure_response_to_client(
                    &error,
                    parameters,
                    always(move |_| next.policy_creation_finished(reported)),
                );
                return;
            }
        };

        ctx.on_message_received();
        if let Err(backpressure) = ctx.check_backpressure() {
            dispatch_response(ctx, backpressure);
            return;
        }

        debug!(event_id = %ctx.event.id(), "Handing event to source policy");
        let on_complete = ctx.clone();
        let on_error = ctx.clone();
        policy.process(
            ctx.event.clone(),
            ctx.template.clone(),
            callback(
                move |result| dispatch_response(on_complete, result),
                move |e| {
                    let failure = on_error.policy_callback_error(e);
                    dispatch_response(on_error, failure)
                },
            ),
        );
    }
}

fn dispatch_response(ctx: Arc<PhaseContext>, result: SourcePolicyResult) {
    result.apply(
        |failure| policy_failure(&ctx, failure),
        |success| policy_success(&ctx, success),
    )
}

fn policy_success(ctx: &Arc<PhaseContext>, success: SourcePolicySuccessResult) {
    let SourcePolicySuccessResult {
        result,
        response_parameters,
        error_response_parameters,
    } = success;
    ctx.core.notifications.message_response(&result);

    let next = ctx.clone();
    let sent = result.clone();
    ctx.send_response(
        &result,
        response_parameters(),
        always(move |outcome| match outcome {
            Ok(()) => {
                next.terminate(Ok(sent));
                next.finish(None);
            }
            Err(e) => {
                let error = next
                    .route_source_error(source_failure(SourceErrorStage::ResponseSend, &sent, e));
                let parameters = error_response_parameters(error.event());
                let sent = error_response_sent(next.clone(), error.clone());
                next.send_error_response(&error, parameters, sent);
            }
        }),
    );
}

fn policy_failure(ctx: &Arc<PhaseContext>, failure: SourcePolicyFailureResult) {
    let SourcePolicyFailureResult {
        messaging_error,
        error_response_parameters,
    } = failure;
    ctx.core
        .notifications
        .message_error_response(messaging_error.event(), messaging_error.error_type());

    let sent = error_response_sent(ctx.clone(), messaging_error.clone());
    ctx.send_error_response(&messaging_error, error_response_parameters(), sent);
}

/// Terminate with `error` once the error response went out; a failed error
/// response ends the message as a failure.
fn error_response_sent(
    ctx: Arc<PhaseContext>,
    error: MessagingError,
) -> Box<dyn CompletableCallback<()>> {
    always(move |outcome| match outcome {
        Ok(()) => {
            ctx.terminate(Err(error));
            ctx.finish(None);
        }
        Err(e) => ctx.finish(Some(ProcessingError::from_failure(e))),
    })
}
