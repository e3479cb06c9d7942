//! Transaction model consumed by the execution interceptors.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::TransactionError;

/// A unit of work bound to the current execution.
pub trait Transaction: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;

    /// Whether this transaction spans several resources and can be suspended.
    fn is_xa(&self) -> bool;

    fn begin(&self) -> Result<(), TransactionError>;

    fn commit(&self) -> Result<(), TransactionError>;

    fn rollback(&self) -> Result<(), TransactionError>;

    fn is_rollback_only(&self) -> bool;

    fn set_rollback_only(&self);

    fn suspend(&self) -> Result<(), TransactionError> {
        Ok(())
    }

    fn resume(&self) -> Result<(), TransactionError> {
        Ok(())
    }

    /// Commit, or roll back when the transaction was marked rollback-only.
    fn resolve(&self) -> Result<(), TransactionError> {
        if self.is_rollback_only() {
            self.rollback()
        } else {
            self.commit()
        }
    }
}

/// Creates transactions for a transactional resource.
pub trait TransactionFactory: Send + Sync + fmt::Debug {
    fn create(&self) -> Result<Arc<dyn Transaction>, TransactionError>;

    /// Whether an externally managed transaction can be joined.
    fn supports_external(&self) -> bool {
        false
    }

    /// Join the externally managed transaction, if there is one.
    fn join_external(&self) -> Result<Option<Arc<dyn Transaction>>, TransactionError> {
        Ok(None)
    }
}

/// What an execution does about transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionAction {
    /// Run without a transaction; an active XA transaction is suspended.
    #[default]
    None,
    /// Always begin a new transaction.
    AlwaysBegin,
    /// Join the active transaction or begin one.
    BeginOrJoin,
    /// Require an active transaction.
    AlwaysJoin,
    /// Join the active transaction when there is one.
    JoinIfPossible,
    /// Fail when a transaction is active.
    Never,
    /// Leave the current state untouched.
    Indifferent,
    /// Run outside the active transaction without rolling it back.
    NotSupported,
}

impl TransactionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::AlwaysBegin => "always_begin",
            Self::BeginOrJoin => "begin_or_join",
            Self::AlwaysJoin => "always_join",
            Self::JoinIfPossible => "join_if_possible",
            Self::Never => "never",
            Self::Indifferent => "indifferent",
            Self::NotSupported => "not_supported",
        }
    }

    pub fn parse(s: &str) -> Result<Self, TransactionError> {
        match s {
            "none" => Ok(Self::None),
            "always_begin" => Ok(Self::AlwaysBegin),
            "begin_or_join" => Ok(Self::BeginOrJoin),
            "always_join" => Ok(Self::AlwaysJoin),
            "join_if_possible" => Ok(Self::JoinIfPossible),
            "never" => Ok(Self::Never),
            "indifferent" => Ok(Self::Indifferent),
            "not_supported" => Ok(Self::NotSupported),
            other => Err(TransactionError::InvalidAction(other.to_string())),
        }
    }

    /// Actions that must not run inside an XA transaction.
    pub fn suspends_xa(&self) -> bool {
        matches!(self, Self::None | Self::AlwaysBegin)
    }

    /// Whether this action may begin a transaction.
    pub fn may_begin(&self) -> bool {
        matches!(self, Self::AlwaysBegin | Self::BeginOrJoin)
    }
}

impl fmt::Display for TransactionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transaction settings of a message source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransactionConfig {
    #[serde(default)]
    pub action: TransactionAction,
    /// Transaction timeout in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub rollback_on_timeout: bool,
    #[serde(default)]
    pub interact_with_external: bool,
    #[serde(skip)]
    pub factory: Option<Arc<dyn TransactionFactory>>,
}

impl TransactionConfig {
    pub fn new(action: TransactionAction) -> Self {
        Self {
            action,
            ..Default::default()
        }
    }

    pub fn with_factory(mut self, factory: Arc<dyn TransactionFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration, rollback_on_timeout: bool) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self.rollback_on_timeout = rollback_on_timeout;
        self
    }

    pub fn with_external(mut self, interact_with_external: bool) -> Self {
        self.interact_with_external = interact_with_external;
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Whether executions under this config take part in transactions at all.
    pub fn is_transacted(&self) -> bool {
        self.factory.is_some()
            && !matches!(
                self.action,
                TransactionAction::None | TransactionAction::Never | TransactionAction::NotSupported
            )
    }
}
