use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use tracing::debug;

use conduit_core::{Event, MessagingError, SourceErrorStage};

use super::{MediatorBuilder, MediatorCore, PhaseContext};
use crate::context::MessageProcessContext;
use crate::error::{source_failure, ProcessingError};
use crate::notifier::PhaseResultNotifier;
use crate::policy::{
    PolicyManager, SourcePolicyFailureResult, SourcePolicyResult, SourcePolicySuccessResult,
};
use crate::template::{oneshot_callback, FlowProcessTemplate, ResponseParameters};

/// Mediator awaiting each step of a message.
///
/// `process` resolves once the outcome was reported to the notifier and the
/// response completion was completed.
#[derive(Clone)]
pub struct AsyncFlowProcessMediator {
    core: Arc<MediatorCore>,
}

impl AsyncFlowProcessMediator {
    pub fn new(policy_manager: Arc<dyn PolicyManager>) -> Self {
        MediatorBuilder::new(policy_manager).build_async()
    }

    pub fn builder(policy_manager: Arc<dyn PolicyManager>) -> MediatorBuilder {
        MediatorBuilder::new(policy_manager)
    }

    pub(crate) fn from_core(core: Arc<MediatorCore>) -> Self {
        Self { core }
    }

    pub async fn process(
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
                let (callback, sent) = oneshot_callback();
                ctx.template
                    .send_failure_response_to_client(&error, parameters, callback);
                let _ = sent.await;
                ctx.policy_creation_finished(error);
                return;
            }
        };

        ctx.on_message_received();
        let result = match ctx.check_backpressure() {
            Err(backpressure) => backpressure,
            Ok(()) => {
                debug!(event_id = %ctx.event.id(), "Handing event to source policy");
                let (callback, result) = oneshot_callback();
                policy.process(ctx.event.clone(), ctx.template.clone(), callback);
                match result.await {
                    Ok(Ok(result)) => result,
                    Ok(Err(e)) => ctx.policy_callback_error(e),
                    Err(_) => ctx.policy_callback_error(anyhow::anyhow!(
                        "source policy dropped its callback"
                    )),
                }
            }
        };

        dispatch_response(&ctx, result).await;
    }
}

fn dispatch_response(ctx: &Arc<PhaseContext>, result: SourcePolicyResult) -> BoxFuture<'_, ()> {
    result.apply(
        |failure| policy_failure(ctx, failure).boxed(),
        |success| policy_success(ctx, success).boxed(),
    )
}

async fn policy_success(ctx: &Arc<PhaseContext>, success: SourcePolicySuccessResult) {
    let SourcePolicySuccessResult {
        result,
        response_parameters,
        error_response_parameters,
    } = success;
    ctx.core.notifications.message_response(&result);

    match send_response(ctx, &result, response_parameters()).await {
        Ok(()) => {
            ctx.terminate(Ok(result));
            ctx.finish(None);
        }
        Err(e) => {
            let error =
                ctx.route_source_error(source_failure(SourceErrorStage::ResponseSend, &result, e));
            let parameters = error_response_parameters(error.event());
            send_error_response_and_finish(ctx, error, parameters).await;
        }
    }
}

async fn policy_failure(ctx: &Arc<PhaseContext>, failure: SourcePolicyFailureResult) {
    let SourcePolicyFailureResult {
        messaging_error,
        error_response_parameters,
    } = failure;
    ctx.core
        .notifications
        .message_error_response(messaging_error.event(), messaging_error.error_type());

    send_error_response_and_finish(ctx, messaging_error, error_response_parameters()).await;
}

async fn send_error_response_and_finish(
    ctx: &Arc<PhaseContext>,
    error: MessagingError,
    parameters: ResponseParameters,
) {
    match send_error_response(ctx, &error, parameters).await {
        Ok(()) => {
            ctx.terminate(Err(error));
            ctx.finish(None);
        }
        Err(e) => ctx.finish(Some(ProcessingError::from_failure(e))),
    }
}

async fn send_response(
    ctx: &Arc<PhaseContext>,
    event: &Event,
    parameters: ResponseParameters,
) -> anyhow::Result<()> {
    let (callback, sent) = oneshot_callback();
    ctx.send_response(event, parameters, callback);
    sent.await
        .unwrap_or_else(|_| Err(anyhow::anyhow!("response callback was dropped")))
}

async fn send_error_response(
    ctx: &Arc<PhaseContext>,
    error: &MessagingError,
    parameters: ResponseParameters,
) -> anyhow::Result<()> {
    let (callback, sent) = oneshot_callback();
    ctx.send_error_response(error, parameters, callback);
    sent.await
        .unwrap_or_else(|_| Err(anyhow::anyhow!("error response callback was dropped")))
}
