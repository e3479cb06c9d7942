//! Explicit coordination of the transaction bound to an execution.
//!
//! A [`TransactionCoordinator`] holds the current transaction together with
//! the stacks of suspended and isolated ones. Suspension, isolation and
//! external binding are undone by guards, so the frame that changed the
//! binding is the one that restores it.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::TransactionError;
use crate::transaction::{Transaction, TransactionFactory};

struct Binding {
    transaction: Arc<dyn Transaction>,
    deadline: Option<Instant>,
    rollback_on_timeout: bool,
}

impl Binding {
    fn unmanaged(transaction: Arc<dyn Transaction>) -> Self {
        Self {
            transaction,
            deadline: None,
            rollback_on_timeout: false,
        }
    }

    fn timed_out(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

#[derive(Default)]
struct CoordinatorState {
    current: Option<Binding>,
    suspended: Vec<Binding>,
    isolated: Vec<Binding>,
}

#[derive(Default)]
pub struct TransactionCoordinator {
    state: Mutex<CoordinatorState>,
}

impl TransactionCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn current(&self) -> Option<Arc<dyn Transaction>> {
        self.state().current.as_ref().map(|b| b.transaction.clone())
    }

    pub fn has_transaction(&self) -> bool {
        self.state().current.is_some()
    }

    pub fn suspended_count(&self) -> usize {
        self.state().suspended.len()
    }

    pub fn isolated_count(&self) -> usize {
        self.state().isolated.len()
    }

    /// Create a transaction from `factory`, begin it and bind it as current.
    pub fn begin(
        &self,
        factory: &dyn TransactionFactory,
        timeout: Option<Duration>,
        rollback_on_timeout: bool,
    ) -> Result<Arc<dyn Transaction>, TransactionError> {
        if let Some(current) = self.current() {
            return Err(TransactionError::AlreadyBound(current.id().to_string()));
        }

        let transaction = factory.create()?;
        transaction.begin()?;

        let mut state = self.state();
        if let Some(current) = &state.current {
            let id = current.transaction.id().to_string();
            drop(state);
            transaction.rollback()?;
            return Err(TransactionError::AlreadyBound(id));
        }
        state.current = Some(Binding {
            transaction: transaction.clone(),
            deadline: timeout.map(|t| Instant::now() + t),
            rollback_on_timeout,
        });

        debug!(
            transaction_id = %transaction.id(),
            xa = transaction.is_xa(),
            "Transaction begun"
        );
        Ok(transaction)
    }

    /// Bind an already started transaction as current.
    pub fn bind(&self, transaction: Arc<dyn Transaction>) -> Result<(), TransactionError> {
        let mut state = self.state();
        if let Some(current) = &state.current {
            return Err(TransactionError::AlreadyBound(
                current.transaction.id().to_string(),
            ));
        }
        debug!(transaction_id = %transaction.id(), "Transaction bound");
        state.current = Some(Binding::unmanaged(transaction));
        Ok(())
    }

    /// Remove the current binding without resolving it.
    pub fn unbind(&self) -> Option<Arc<dyn Transaction>> {
        let binding = self.state().current.take()?;
        debug!(transaction_id = %binding.transaction.id(), "Transaction unbound");
        Some(binding.transaction)
    }

    /// Bind `transaction` for the lifetime of the returned guard.
    pub fn bind_scoped(
        &self,
        transaction: Arc<dyn Transaction>,
    ) -> Result<ExternalBinding<'_>, TransactionError> {
        self.bind(transaction)?;
        Ok(ExternalBinding { coordinator: self })
    }

    /// Unbind and resolve the current transaction.
    ///
    /// Rolls back when the transaction is rollback-only, or when it timed out
    /// and was begun with rollback-on-timeout.
    pub fn resolve_current(&self) -> Result<(), TransactionError> {
        let binding = self
            .state()
            .current
            .take()
            .ok_or(TransactionError::NotBound)?;
        let tx = &binding.transaction;

        if binding.timed_out() {
            if binding.rollback_on_timeout {
                warn!(transaction_id = %tx.id(), "Transaction timed out, rolling back");
                return tx.rollback();
            }
            warn!(transaction_id = %tx.id(), "Transaction timed out, resolving anyway");
        }

        if tx.is_rollback_only() {
            debug!(transaction_id = %tx.id(), "Rolling back rollback-only transaction");
        } else {
            debug!(transaction_id = %tx.id(), "Committing transaction");
        }
        tx.resolve()
    }

    /// Unbind and roll back the current transaction.
    pub fn rollback_current(&self) -> Result<(), TransactionError> {
        let binding = self
            .state()
            .current
            .take()
            .ok_or(TransactionError::NotBound)?;
        debug!(transaction_id = %binding.transaction.id(), "Rolling back transaction");
        binding.transaction.rollback()
    }

    /// Suspend the current transaction and push it on the suspended stack.
    pub fn suspend_current(&self) -> Result<Arc<dyn Transaction>, TransactionError> {
        let mut state = self.state();
        let binding = state.current.take().ok_or(TransactionError::NotBound)?;
        if let Err(e) = binding.transaction.suspend() {
            state.current = Some(binding);
            return Err(e);
        }
        let transaction = binding.transaction.clone();
        debug!(transaction_id = %transaction.id(), "Transaction suspended");
        state.suspended.push(binding);
        Ok(transaction)
    }

    /// Resume the most recently suspended transaction and bind it again.
    pub fn resume(&self) -> Result<(), TransactionError> {
        let mut state = self.state();
        if let Some(current) = &state.current {
            return Err(TransactionError::AlreadyBound(
                current.transaction.id().to_string(),
            ));
        }
        let binding = state
            .suspended
            .pop()
            .ok_or(TransactionError::NothingSuspended)?;
        if let Err(e) = binding.transaction.resume() {
            state.suspended.push(binding);
            return Err(e);
        }
        debug!(transaction_id = %binding.transaction.id(), "Transaction resumed");
        state.current = Some(binding);
        Ok(())
    }

    /// Detach the current transaction without rolling it back.
    pub fn isolate_current(&self) -> Result<(), TransactionError> {
        let mut state = self.state();
        let binding = state.current.take().ok_or(TransactionError::NotBound)?;
        debug!(transaction_id = %binding.transaction.id(), "Transaction isolated");
        state.isolated.push(binding);
        Ok(())
    }

    /// Re-bind the most recently isolated transaction.
    pub fn restore(&self) -> Result<(), TransactionError> {
        let mut state = self.state();
        if let Some(current) = &state.current {
            return Err(TransactionError::AlreadyBound(
                current.transaction.id().to_string(),
            ));
        }
        let binding = state
            .isolated
            .pop()
            .ok_or(TransactionError::NothingIsolated)?;
        debug!(transaction_id = %binding.transaction.id(), "Transaction restored");
        state.current = Some(binding);
        Ok(())
    }

    /// Suspend the current transaction until the guard is dropped or resumed.
    pub fn suspend_scoped(&self) -> Result<SuspendedTransaction<'_>, TransactionError> {
        self.suspend_current()?;
        Ok(SuspendedTransaction {
            coordinator: self,
            armed: true,
        })
    }

    /// Isolate the current transaction until the guard is dropped.
    pub fn isolate_scoped(&self) -> Result<IsolatedTransaction<'_>, TransactionError> {
        self.isolate_current()?;
        Ok(IsolatedTransaction { coordinator: self })
    }
}

impl std::fmt::Debug for TransactionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("TransactionCoordinator")
            .field(
                "current",
                &state.current.as_ref().map(|b| b.transaction.id().to_string()),
            )
            .field("suspended", &state.suspended.len())
            .field("isolated", &state.isolated.len())
            .finish()
    }
}

/// Resumes a suspended transaction on drop.
pub struct SuspendedTransaction<'a> {
    coordinator: &'a TransactionCoordinator,
    armed: bool,
}

impl SuspendedTransaction<'_> {
    /// Resume now, reporting failures.
    pub fn resume(mut self) -> Result<(), TransactionError> {
        self.armed = false;
        self.coordinator.resume()
    }

    /// Leave the transaction on the suspended stack.
    pub fn keep_suspended(mut self) {
        self.armed = false;
    }
}

impl Drop for SuspendedTransaction<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = self.coordinator.resume() {
                warn!(error = %e, "Failed to resume suspended transaction");
            }
        }
    }
}

/// Restores an isolated transaction on drop.
pub struct IsolatedTransaction<'a> {
    coordinator: &'a TransactionCoordinator,
}

impl Drop for IsolatedTransaction<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.coordinator.restore() {
            warn!(error = %e, "Failed to restore isolated transaction");
        }
    }
}

/// Unbinds an externally managed transaction on drop.
pub struct ExternalBinding<'a> {
    coordinator: &'a TransactionCoordinator,
}

impl Drop for ExternalBinding<'_> {
    fn drop(&mut self) {
        self.coordinator.unbind();
    }
}
