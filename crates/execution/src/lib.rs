//! Transactional execution of flow callbacks.
//!
//! An execution template is a chain of [`ExecutionInterceptor`]s assembled by
//! [`ExecutionTemplateBuilder`]. The interceptors apply the configured
//! [`TransactionAction`] against an explicit [`TransactionCoordinator`] and,
//! for error-handling templates, hand messaging errors to the flow's
//! exception listener.

pub mod coordinator;
pub mod error;
pub mod interceptor;
pub mod template;
pub mod transaction;

pub use coordinator::{
    ExternalBinding, IsolatedTransaction, SuspendedTransaction, TransactionCoordinator,
};
pub use error::{ExecutionError, Result, TransactionError};
pub use interceptor::{
    BeginAndResolveTransactionInterceptor, CallbackExecutor, ExecutionCallback, ExecutionContext,
    ExecutionInterceptor, ExternalTransactionInterceptor, HandleExceptionInterceptor,
    IsolateCurrentTransactionInterceptor, RethrowExceptionInterceptor,
    SuspendXaTransactionInterceptor, TransactionScope, ValidateTransactionalStateInterceptor,
};
pub use template::{
    error_handling_execution_template, transactional_execution_template, ExecutionOptions,
    ExecutionTemplate, ExecutionTemplateBuilder,
};
pub use transaction::{Transaction, TransactionAction, TransactionConfig, TransactionFactory};
