//! Execution templates assembled from interceptor layers.

use std::sync::Arc;

use conduit_core::{Event, MessagingExceptionHandler};

use crate::coordinator::TransactionCoordinator;
use crate::error::Result;
use crate::interceptor::{
    BeginAndResolveTransactionInterceptor, CallbackExecutor, ExecutionContext,
    ExecutionInterceptor, ExternalTransactionInterceptor, HandleExceptionInterceptor,
    IsolateCurrentTransactionInterceptor, RethrowExceptionInterceptor,
    SuspendXaTransactionInterceptor, TransactionScope, ValidateTransactionalStateInterceptor,
};
use crate::transaction::TransactionConfig;

type Layer<T> = Box<dyn FnOnce(Box<dyn ExecutionInterceptor<T>>) -> Box<dyn ExecutionInterceptor<T>>>;

/// Flags controlling how transactions are treated on messaging errors.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionOptions {
    pub process_on_exception: bool,
    pub must_resolve_any_transaction: bool,
}

impl ExecutionOptions {
    pub fn processing_on_exception() -> Self {
        Self {
            process_on_exception: true,
            must_resolve_any_transaction: false,
        }
    }
}

/// Builds an interceptor chain from layers listed outermost first.
///
/// Each layer receives the chain built so far and wraps it; layers are
/// applied right-to-left on top of a [`CallbackExecutor`].
pub struct ExecutionTemplateBuilder<T> {
    layers: Vec<Layer<T>>,
}

impl<T: 'static> ExecutionTemplateBuilder<T> {
    pub fn new() -> Self {
        Self { layers: Vec::new() }
    }

    pub fn layer<F, I>(mut self, wrap: F) -> Self
    where
        F: FnOnce(Box<dyn ExecutionInterceptor<T>>) -> I + 'static,
        I: ExecutionInterceptor<T> + 'static,
    {
        self.layers.push(Box::new(move |next: Box<dyn ExecutionInterceptor<T>>| {
            Box::new(wrap(next)) as Box<dyn ExecutionInterceptor<T>>
        }));
        self
    }

    /// Add the transaction layers, outermost first: external, suspend-XA,
    /// validate, isolate, begin-and-resolve.
    pub fn transactional(self, scope: &TransactionScope) -> Self {
        let external = scope.clone();
        let suspend = scope.clone();
        let validate = scope.clone();
        let isolate = scope.clone();
        let begin = scope.clone();
        self.layer(move |next| ExternalTransactionInterceptor::new(external, next))
            .layer(move |next| SuspendXaTransactionInterceptor::new(suspend, next))
            .layer(move |next| ValidateTransactionalStateInterceptor::new(validate, next))
            .layer(move |next| IsolateCurrentTransactionInterceptor::new(isolate, next))
            .layer(move |next| BeginAndResolveTransactionInterceptor::new(begin, next))
    }

    pub fn build(self) -> ExecutionTemplate<T> {
        let mut chain: Box<dyn ExecutionInterceptor<T>> = Box::new(CallbackExecutor);
        for layer in self.layers.into_iter().rev() {
            chain = layer(chain);
        }
        ExecutionTemplate { chain }
    }
}

impl<T: 'static> Default for ExecutionTemplateBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A composed interceptor chain ready to run callbacks.
pub struct ExecutionTemplate<T> {
    chain: Box<dyn ExecutionInterceptor<T>>,
}

impl<T> ExecutionTemplate<T> {
    pub fn execute<'a, F>(&self, callback: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + 'a,
    {
        let mut ctx = ExecutionContext::default();
        self.execute_in(callback, &mut ctx)
    }

    pub fn execute_in<'a, F>(&self, callback: F, ctx: &mut ExecutionContext) -> Result<T>
    where
        F: FnOnce() -> Result<T> + 'a,
    {
        self.chain.execute(Box::new(callback), ctx)
    }
}

/// Template applying only the transaction layers.
pub fn transactional_execution_template<T: 'static>(
    coordinator: Arc<TransactionCoordinator>,
    config: TransactionConfig,
    options: ExecutionOptions,
) -> ExecutionTemplate<T> {
    let scope = TransactionScope {
        coordinator,
        config,
        process_on_exception: options.process_on_exception,
        must_resolve_any_transaction: options.must_resolve_any_transaction,
    };
    ExecutionTemplateBuilder::new().transactional(&scope).build()
}

/// Template running routing callbacks with full error handling.
///
/// Messaging errors go to `handler`; errors the handler marked as handled
/// are turned back into the handler's event.
pub fn error_handling_execution_template(
    coordinator: Arc<TransactionCoordinator>,
    config: TransactionConfig,
    handler: Arc<dyn MessagingExceptionHandler>,
    options: ExecutionOptions,
) -> ExecutionTemplate<Event> {
    let scope = TransactionScope {
        coordinator,
        config,
        process_on_exception: options.process_on_exception,
        must_resolve_any_transaction: options.must_resolve_any_transaction,
    };
    ExecutionTemplateBuilder::new()
        .layer(RethrowExceptionInterceptor::new)
        .layer(move |next| HandleExceptionInterceptor::new(handler, next))
        .transactional(&scope)
        .build()
}
