use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use events::NotificationBus;
use execution::TransactionConfig;

use crate::context::{BoundedFlowExecutor, DefaultMessageProcessContext, FlowConstruct, MessageSource};
use crate::engine::{MessageProcessPhase, PhaseExecutionEngine};
use crate::error::ConfigError;
use crate::mediator::{MediatorBuilder, MediatorStyle};
use crate::notification::NotificationHelper;
use crate::notifier::SystemExceptionHandler;
use crate::phases::{FlowProcessingPhase, ModuleFlowProcessingPhase, ValidationPhase};
use crate::policy::PolicyManager;

const CONFIG_DIR: &str = ".conduit";
const CONFIG_FILE: &str = "config.json";

/// Flow executor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorSettings {
    /// Messages routed concurrently before the executor rejects work
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

fn default_max_concurrency() -> usize {
    16
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
        }
    }
}

/// Connector notification settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationSettings {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Capacity of the notification bus
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

fn default_enabled() -> bool {
    true
}

fn default_capacity() -> usize {
    1000
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            capacity: default_capacity(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CorrelationSettings {
    /// Generate a correlation id when the source supplies none
    #[serde(default)]
    pub generate_when_missing: bool,
}

/// Processing configuration stored in .conduit/config.json
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessingConfig {
    #[serde(default)]
    pub mediator_style: MediatorStyle,
    /// Default transaction settings for sources that configure none
    #[serde(default)]
    pub transaction: TransactionConfig,
    #[serde(default)]
    pub executor: ExecutorSettings,
    #[serde(default)]
    pub notifications: NotificationSettings,
    #[serde(default)]
    pub correlation: CorrelationSettings,
}

impl ProcessingConfig {
    /// Read config from the base directory
    pub async fn read(base_path: &Path) -> Self {
        let config_path = base_path.join(CONFIG_DIR).join(CONFIG_FILE);

        if !fs::try_exists(&config_path).await.unwrap_or(false) {
            debug!(path = %config_path.display(), "Config file does not exist, using defaults");
            return Self::default();
        }

        match fs::read_to_string(&config_path).await {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(config) => {
                    debug!(path = %config_path.display(), "Config loaded successfully");
                    config
                }
                Err(e) => {
                    warn!(path = %config_path.display(), error = %e, "Failed to parse config, using defaults");
                    Self::default()
                }
            },
            Err(e) => {
                warn!(path = %config_path.display(), error = %e, "Failed to read config file, using defaults");
                Self::default()
            }
        }
    }

    /// Write config to the base directory
    pub async fn write(&self, base_path: &Path) -> Result<(), ConfigError> {
        let config_dir = base_path.join(CONFIG_DIR);
        let config_path = config_dir.join(CONFIG_FILE);

        fs::create_dir_all(&config_dir).await?;
        let content = serde_json::to_string_pretty(self)?;
        fs::write(&config_path, content).await?;
        debug!(path = %config_path.display(), "Config saved successfully");

        Ok(())
    }

    /// Notification helper publishing on `bus`, or a disabled one.
    pub fn notification_helper(&self, bus: &NotificationBus) -> NotificationHelper {
        if self.notifications.enabled {
            NotificationHelper::new(Arc::new(bus.clone()))
        } else {
            NotificationHelper::disabled()
        }
    }

    pub fn notification_bus(&self) -> NotificationBus {
        NotificationBus::with_backlog(self.notifications.capacity)
    }

    pub fn flow_executor(&self, handle: Handle) -> BoundedFlowExecutor {
        BoundedFlowExecutor::new(handle, self.executor.max_concurrency)
    }

    /// Context for a source, carrying the default transaction settings.
    pub fn message_process_context(
        &self,
        source: MessageSource,
        flow: Arc<dyn FlowConstruct>,
    ) -> DefaultMessageProcessContext {
        DefaultMessageProcessContext::new(source, flow)
            .with_transaction_config(self.transaction.clone())
    }

    /// Module flow phase driven by the configured mediator style.
    pub fn module_flow_phase(
        &self,
        policy_manager: Arc<dyn PolicyManager>,
        notifications: NotificationHelper,
    ) -> ModuleFlowProcessingPhase {
        let builder = MediatorBuilder::new(policy_manager)
            .with_notifications(notifications)
            .generate_correlation_ids(self.correlation.generate_when_missing);
        match self.mediator_style {
            MediatorStyle::Callback => ModuleFlowProcessingPhase::callback(builder.build_callback()),
            MediatorStyle::Async => ModuleFlowProcessingPhase::asynchronous(builder.build_async()),
        }
    }

    /// Engine with the validation, flow processing and module flow phases.
    pub fn build_engine(
        &self,
        policy_manager: Arc<dyn PolicyManager>,
        notifications: NotificationHelper,
        exception_handler: Arc<dyn SystemExceptionHandler>,
    ) -> PhaseExecutionEngine {
        let phases: Vec<Arc<dyn MessageProcessPhase>> = vec![
            Arc::new(ValidationPhase),
            Arc::new(FlowProcessingPhase),
            Arc::new(self.module_flow_phase(policy_manager, notifications)),
        ];
        PhaseExecutionEngine::new(phases, exception_handler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use execution::TransactionAction;
    use tempfile::TempDir;

    use crate::notifier::LoggingSystemExceptionHandler;
    use crate::policy::NoPolicyManager;

    #[tokio::test]
    async fn test_config_default() {
        let config = ProcessingConfig::default();
        assert_eq!(config.mediator_style, MediatorStyle::Callback);
        assert_eq!(config.transaction.action, TransactionAction::None);
        assert_eq!(config.executor.max_concurrency, 16);
        assert!(config.notifications.enabled);
        assert_eq!(config.notifications.capacity, 1000);
        assert!(!config.correlation.generate_when_missing);
    }

    #[tokio::test]
    async fn test_config_read_nonexistent() {
        let temp_dir = TempDir::new().unwrap();
        let config = ProcessingConfig::read(temp_dir.path()).await;
        assert_eq!(config.mediator_style, MediatorStyle::Callback);
    }

    #[tokio::test]
    async fn test_config_read_invalid_falls_back() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join(".conduit");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("config.json"), "{ not json").unwrap();

        let config = ProcessingConfig::read(temp_dir.path()).await;
        assert_eq!(config.executor.max_concurrency, 16);
    }

    #[tokio::test]
    async fn test_config_partial_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join(".conduit");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("config.json"),
            r#"{"mediator_style": "async", "transaction": {"action": "always_begin"}}"#,
        )
        .unwrap();

        let config = ProcessingConfig::read(temp_dir.path()).await;
        assert_eq!(config.mediator_style, MediatorStyle::Async);
        assert_eq!(config.transaction.action, TransactionAction::AlwaysBegin);
        assert_eq!(config.notifications.capacity, 1000);
    }

    #[tokio::test]
    async fn test_config_write_and_read() {
        let temp_dir = TempDir::new().unwrap();

        let mut config = ProcessingConfig::default();
        config.mediator_style = MediatorStyle::Async;
        config.executor.max_concurrency = 4;
        config.notifications.enabled = false;
        config.correlation.generate_when_missing = true;
        config.transaction = TransactionConfig::new(TransactionAction::BeginOrJoin);

        config.write(temp_dir.path()).await.unwrap();

        let loaded = ProcessingConfig::read(temp_dir.path()).await;
        assert_eq!(loaded.mediator_style, MediatorStyle::Async);
        assert_eq!(loaded.executor.max_concurrency, 4);
        assert!(!loaded.notifications.enabled);
        assert!(loaded.correlation.generate_when_missing);
        assert_eq!(loaded.transaction.action, TransactionAction::BeginOrJoin);
    }

    #[tokio::test]
    async fn test_build_engine_follows_style() {
        let mut config = ProcessingConfig::default();
        config.mediator_style = MediatorStyle::Async;
        let bus = config.notification_bus();

        let phase = config.module_flow_phase(Arc::new(NoPolicyManager), config.notification_helper(&bus));
        assert_eq!(phase.style(), MediatorStyle::Async);

        let engine = config.build_engine(
            Arc::new(NoPolicyManager),
            config.notification_helper(&bus),
            Arc::new(LoggingSystemExceptionHandler::new()),
        );
        assert_eq!(
            engine.phase_names(),
            vec!["validation", "flow_processing", "module_flow_processing"]
        );
    }

    #[test]
    fn test_context_carries_default_transaction() {
        use crate::context::MessageProcessContext;
        use conduit_core::{MessagingExceptionHandler, PropagatingExceptionHandler};

        struct Flow;

        impl FlowConstruct for Flow {
            fn name(&self) -> &str {
                "orders"
            }

            fn exception_listener(&self) -> Arc<dyn MessagingExceptionHandler> {
                Arc::new(PropagatingExceptionHandler)
            }
        }

        let mut config = ProcessingConfig::default();
        config.transaction = TransactionConfig::new(TransactionAction::AlwaysJoin);
        let context = config.message_process_context(MessageSource::new("orders/listener"), Arc::new(Flow));
        assert_eq!(
            context.transaction_config().map(|c| c.action),
            Some(TransactionAction::AlwaysJoin)
        );
    }

    #[test]
    fn test_disabled_notifications() {
        let mut config = ProcessingConfig::default();
        config.notifications.enabled = false;
        let bus = NotificationBus::new();
        assert!(!config.notification_helper(&bus).is_enabled());
    }
}
