// ! Structured logging for the plugin host
// !
// ! Module installs the tracing subscriber and provides structured error
// ! logging with categorization and plugin context.

use serde_json::Value;
use std::collections::HashMap;
use tracing::{Level, error, info, span, warn};

use crate::core::error::{LoadError, PluginError, SourceError};

#[cfg(feature = "tracing-subscriber")]
use crate::core::config::{LogFormat, LoggingConfig};

/// Install the global tracing subscriber
///
/// `RUST_LOG` overrides the configured level. Calling this twice is harmless;
/// the second call reports an error that can be ignored.
#[cfg(feature = "tracing-subscriber")]
pub fn init(config: &LoggingConfig) -> crate::core::error::PluginResult<()> {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| PluginError::Config(format!("invalid log level '{}': {e}", config.level)))?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    let result = match config.format {
        LogFormat::Full => builder.try_init(),
        LogFormat::Compact => builder.compact().try_init(),
    };
    result.map_err(|e| PluginError::Internal(format!("failed to install subscriber: {e}")))
}

/// Log level for error reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorLogLevel {
    /// Critical errors that require immediate attention
    Critical,
    /// Errors that affect functionality but system can continue
    Error,
    /// Warnings about potential issues
    Warning,
    /// Informational error context
    Info,
}

impl From<&PluginError> for ErrorLogLevel {
    fn from(error: &PluginError) -> Self {
        match error {
            PluginError::Internal(_) => ErrorLogLevel::Critical,

            // Plugin code misbehaved; the host survived
            PluginError::RuntimeFault(_)
            | PluginError::Registry(_)
            | PluginError::Load(LoadError::OpenFailed(_))
            | PluginError::Load(LoadError::InitializationFailed(_))
            | PluginError::Source(SourceError::BuildFailed(_)) => ErrorLogLevel::Error,

            PluginError::Timeout { .. }
            | PluginError::Unload(_)
            | PluginError::Io(_)
            | PluginError::Source(SourceError::Unavailable(_))
            | PluginError::Source(SourceError::TimedOut(_))
            | PluginError::Source(SourceError::PathTraversal(_)) => ErrorLogLevel::Warning,

            // Caller mistakes
            _ => ErrorLogLevel::Info,
        }
    }
}

/// Extended error context for logging
#[derive(Debug, Clone)]
pub struct ErrorContext {
    /// Operation being performed when error occurred
    pub operation: String,
    /// Plugin the operation targeted, if known
    pub plugin_id: Option<String>,
    /// Source kind (local, archive, remote)
    pub source: Option<String>,
    /// Additional context data
    pub extra: HashMap<String, Value>,
}

impl ErrorContext {
    /// Create a new error context
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            plugin_id: None,
            source: None,
            extra: HashMap::new(),
        }
    }

    /// Set plugin id
    pub fn with_plugin(mut self, plugin_id: impl Into<String>) -> Self {
        self.plugin_id = Some(plugin_id.into());
        self
    }

    /// Set source kind
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Add extra context data
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

/// Log an error at a level derived from its kind
pub fn log_plugin_error(error: &PluginError, context: &ErrorContext) {
    let kind = error.kind();
    let category = error.category();
    let plugin_id = context.plugin_id.as_deref().unwrap_or("-");
    let source = context.source.as_deref().unwrap_or("-");

    match ErrorLogLevel::from(error) {
        ErrorLogLevel::Critical => error!(
            target: "plugin_errors",
            error_kind = kind,
            error_category = category,
            operation = context.operation.as_str(),
            plugin_id,
            source,
            extra = ?context.extra,
            "CRITICAL plugin host error: {}",
            error
        ),
        ErrorLogLevel::Error => error!(
            target: "plugin_errors",
            error_kind = kind,
            error_category = category,
            operation = context.operation.as_str(),
            plugin_id,
            source,
            extra = ?context.extra,
            "Plugin operation failed: {}",
            error
        ),
        ErrorLogLevel::Warning => warn!(
            target: "plugin_errors",
            error_kind = kind,
            error_category = category,
            operation = context.operation.as_str(),
            plugin_id,
            source,
            extra = ?context.extra,
            "Plugin operation degraded: {}",
            error
        ),
        ErrorLogLevel::Info => info!(
            target: "plugin_errors",
            error_kind = kind,
            error_category = category,
            operation = context.operation.as_str(),
            plugin_id,
            source,
            "Plugin request rejected: {}",
            error
        ),
    }
}

/// Create a logging span for a lifecycle operation
pub fn operation_span(operation: &str, generation: u64) -> tracing::Span {
    span!(
        Level::INFO,
        "plugin_operation",
        operation = operation,
        generation = generation,
        plugin_id = tracing::field::Empty,
    )
}
