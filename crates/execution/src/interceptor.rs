//! Composable execution interceptors.
//!
//! Each interceptor owns the next one in the chain and decides whether and
//! how to delegate. [`CallbackExecutor`] terminates every chain.

use std::sync::Arc;
use tracing::{debug, warn};

use conduit_core::{Event, MessagingExceptionHandler};

use crate::coordinator::TransactionCoordinator;
use crate::error::{ExecutionError, Result, TransactionError};
use crate::transaction::{TransactionAction, TransactionConfig};

/// The work an execution template runs.
pub type ExecutionCallback<'a, T> = Box<dyn FnOnce() -> Result<T> + 'a>;

/// Per-execution bookkeeping shared by the interceptors of one chain.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionContext {
    /// Set only by the frame that began a transaction.
    pub transaction_started: bool,
}

pub trait ExecutionInterceptor<T>: Send + Sync {
    fn execute<'a>(&self, callback: ExecutionCallback<'a, T>, ctx: &mut ExecutionContext)
        -> Result<T>;
}

/// Transaction state the transactional interceptors operate on.
#[derive(Debug, Clone)]
pub struct TransactionScope {
    pub coordinator: Arc<TransactionCoordinator>,
    pub config: TransactionConfig,
    /// Process transactions when the callback raised a messaging error.
    pub process_on_exception: bool,
    /// Roll back on a messaging error even when another frame began the transaction.
    pub must_resolve_any_transaction: bool,
}

impl TransactionScope {
    fn action(&self) -> TransactionAction {
        self.config.action
    }
}

pub struct CallbackExecutor;

impl<T> ExecutionInterceptor<T> for CallbackExecutor {
    fn execute<'a>(
        &self,
        callback: ExecutionCallback<'a, T>,
        _ctx: &mut ExecutionContext,
    ) -> Result<T> {
        callback()
    }
}

/// Joins an externally managed transaction for the duration of the execution.
pub struct ExternalTransactionInterceptor<T> {
    scope: TransactionScope,
    next: Box<dyn ExecutionInterceptor<T>>,
}

impl<T> ExternalTransactionInterceptor<T> {
    pub fn new(scope: TransactionScope, next: Box<dyn ExecutionInterceptor<T>>) -> Self {
        Self { scope, next }
    }
}

impl<T> ExecutionInterceptor<T> for ExternalTransactionInterceptor<T> {
    fn execute<'a>(
        &self,
        callback: ExecutionCallback<'a, T>,
        ctx: &mut ExecutionContext,
    ) -> Result<T> {
        let coordinator = &self.scope.coordinator;
        let factory = match &self.scope.config.factory {
            Some(factory)
                if self.scope.config.interact_with_external
                    && factory.supports_external()
                    && !coordinator.has_transaction() =>
            {
                factory
            }
            _ => return self.next.execute(callback, ctx),
        };

        match factory.join_external()? {
            Some(transaction) => {
                debug!(transaction_id = %transaction.id(), "Joining external transaction");
                let _binding = coordinator.bind_scoped(transaction)?;
                self.next.execute(callback, ctx)
            }
            None => self.next.execute(callback, ctx),
        }
    }
}

/// Suspends an active XA transaction for actions that must run without one.
pub struct SuspendXaTransactionInterceptor<T> {
    scope: TransactionScope,
    next: Box<dyn ExecutionInterceptor<T>>,
}

impl<T> SuspendXaTransactionInterceptor<T> {
    pub fn new(scope: TransactionScope, next: Box<dyn ExecutionInterceptor<T>>) -> Self {
        Self { scope, next }
    }
}

impl<T> ExecutionInterceptor<T> for SuspendXaTransactionInterceptor<T> {
    fn execute<'a>(
        &self,
        callback: ExecutionCallback<'a, T>,
        ctx: &mut ExecutionContext,
    ) -> Result<T> {
        let coordinator = &self.scope.coordinator;
        let suspend = self.scope.action().suspends_xa()
            && coordinator.current().is_some_and(|tx| tx.is_xa());
        if !suspend {
            return self.next.execute(callback, ctx);
        }

        let suspended = coordinator.suspend_scoped()?;
        match self.next.execute(callback, ctx) {
            Err(ExecutionError::Messaging(e)) if !self.scope.process_on_exception => {
                suspended.keep_suspended();
                Err(ExecutionError::Messaging(e))
            }
            result => {
                suspended.resume()?;
                result
            }
        }
    }
}

/// Rejects executions whose action contradicts the current transaction state.
pub struct ValidateTransactionalStateInterceptor<T> {
    scope: TransactionScope,
    next: Box<dyn ExecutionInterceptor<T>>,
}

impl<T> ValidateTransactionalStateInterceptor<T> {
    pub fn new(scope: TransactionScope, next: Box<dyn ExecutionInterceptor<T>>) -> Self {
        Self { scope, next }
    }
}

impl<T> ExecutionInterceptor<T> for ValidateTransactionalStateInterceptor<T> {
    fn execute<'a>(
        &self,
        callback: ExecutionCallback<'a, T>,
        ctx: &mut ExecutionContext,
    ) -> Result<T> {
        let current = self.scope.coordinator.current();
        let action = self.scope.action();

        let violation = match (action, &current) {
            (TransactionAction::Never, Some(tx)) => Some(format!(
                "transaction {} is active but the action is {action}",
                tx.id()
            )),
            (TransactionAction::AlwaysJoin, None) => Some(format!(
                "no transaction is active but the action is {action}"
            )),
            (TransactionAction::AlwaysBegin, Some(tx)) if !tx.is_xa() => Some(format!(
                "cannot begin a transaction inside non-XA transaction {}",
                tx.id()
            )),
            _ => None,
        };

        match violation {
            Some(reason) => {
                warn!(action = %action, reason = %reason, "Illegal transaction state");
                Err(ExecutionError::IllegalTransactionState(reason))
            }
            None => self.next.execute(callback, ctx),
        }
    }
}

/// Detaches the current transaction for `NotSupported` executions.
pub struct IsolateCurrentTransactionInterceptor<T> {
    scope: TransactionScope,
    next: Box<dyn ExecutionInterceptor<T>>,
}

impl<T> IsolateCurrentTransactionInterceptor<T> {
    pub fn new(scope: TransactionScope, next: Box<dyn ExecutionInterceptor<T>>) -> Self {
        Self { scope, next }
    }
}

impl<T> ExecutionInterceptor<T> for IsolateCurrentTransactionInterceptor<T> {
    fn execute<'a>(
        &self,
        callback: ExecutionCallback<'a, T>,
        ctx: &mut ExecutionContext,
    ) -> Result<T> {
        let coordinator = &self.scope.coordinator;
        if self.scope.action() != TransactionAction::NotSupported || !coordinator.has_transaction()
        {
            return self.next.execute(callback, ctx);
        }

        let _isolated = coordinator.isolate_scoped()?;
        self.next.execute(callback, ctx)
    }
}

/// Begins a transaction when the action asks for one and resolves it afterwards.
pub struct BeginAndResolveTransactionInterceptor<T> {
    scope: TransactionScope,
    next: Box<dyn ExecutionInterceptor<T>>,
}

impl<T> BeginAndResolveTransactionInterceptor<T> {
    pub fn new(scope: TransactionScope, next: Box<dyn ExecutionInterceptor<T>>) -> Self {
        Self { scope, next }
    }

    fn begin(&self, ctx: &mut ExecutionContext) -> Result<bool> {
        let coordinator = &self.scope.coordinator;
        let begin = match self.scope.action() {
            TransactionAction::AlwaysBegin => true,
            TransactionAction::BeginOrJoin => !coordinator.has_transaction(),
            _ => false,
        };
        if !begin {
            return Ok(false);
        }

        let config = &self.scope.config;
        let factory = config
            .factory
            .as_ref()
            .ok_or_else(|| TransactionError::NoFactory(config.action.to_string()))?;
        coordinator.begin(factory.as_ref(), config.timeout(), config.rollback_on_timeout)?;
        ctx.transaction_started = true;
        Ok(true)
    }
}

impl<T> ExecutionInterceptor<T> for BeginAndResolveTransactionInterceptor<T> {
    fn execute<'a>(
        &self,
        callback: ExecutionCallback<'a, T>,
        ctx: &mut ExecutionContext,
    ) -> Result<T> {
        let started = self.begin(ctx)?;
        let coordinator = &self.scope.coordinator;

        match self.next.execute(callback, ctx) {
            Ok(value) => {
                if started {
                    coordinator.resolve_current()?;
                }
                Ok(value)
            }
            Err(ExecutionError::Messaging(e)) => {
                let rollback = self.scope.process_on_exception
                    && (started || self.scope.must_resolve_any_transaction)
                    && coordinator.has_transaction();
                if rollback {
                    if let Err(tx_err) = coordinator.rollback_current() {
                        warn!(error = %tx_err, "Rollback after messaging error failed");
                    }
                }
                Err(ExecutionError::Messaging(e))
            }
            Err(other) => {
                if started && coordinator.has_transaction() {
                    if let Err(tx_err) = coordinator.rollback_current() {
                        warn!(error = %tx_err, "Rollback after execution error failed");
                    }
                }
                Err(other)
            }
        }
    }
}

/// Hands messaging errors to the flow's exception listener.
///
/// The listener's result is recorded as the processed event of the error,
/// which is then returned to the caller.
pub struct HandleExceptionInterceptor<T> {
    handler: Arc<dyn MessagingExceptionHandler>,
    next: Box<dyn ExecutionInterceptor<T>>,
}

impl<T> HandleExceptionInterceptor<T> {
    pub fn new(
        handler: Arc<dyn MessagingExceptionHandler>,
        next: Box<dyn ExecutionInterceptor<T>>,
    ) -> Self {
        Self { handler, next }
    }
}

impl<T> ExecutionInterceptor<T> for HandleExceptionInterceptor<T> {
    fn execute<'a>(
        &self,
        callback: ExecutionCallback<'a, T>,
        ctx: &mut ExecutionContext,
    ) -> Result<T> {
        match self.next.execute(callback, ctx) {
            Err(ExecutionError::Messaging(mut e)) => {
                let event = e.event().clone();
                debug!(event_id = %event.id(), error = %e, "Handling messaging error");
                let processed = self.handler.handle_exception(&mut e, &event);
                e.set_processed_event(processed);
                Err(ExecutionError::Messaging(e))
            }
            other => other,
        }
    }
}

/// Turns a handled messaging error into its processed event.
pub struct RethrowExceptionInterceptor {
    next: Box<dyn ExecutionInterceptor<Event>>,
}

impl RethrowExceptionInterceptor {
    pub fn new(next: Box<dyn ExecutionInterceptor<Event>>) -> Self {
        Self { next }
    }
}

impl ExecutionInterceptor<Event> for RethrowExceptionInterceptor {
    fn execute<'a>(
        &self,
        callback: ExecutionCallback<'a, Event>,
        ctx: &mut ExecutionContext,
    ) -> Result<Event> {
        match self.next.execute(callback, ctx) {
            Err(ExecutionError::Messaging(e)) if e.is_handled() => Ok(e.result_event().clone()),
            other => other,
        }
    }
}
