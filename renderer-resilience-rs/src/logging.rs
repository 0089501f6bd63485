//! # Structured Logging
//!
//! Installs the process-wide `tracing` subscriber used by the supervision
//! pipeline. Every breaker transition, fallback and recovery is logged with
//! `subject` and `backend` fields so that one subject's history can be
//! filtered out of a busy log.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::NonBlocking;
use tracing_appender::rolling::RollingFileAppender;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Layer, Registry};

use crate::types::{Error, Result};

// Flag to track if logging has been initialized
static LOGGING_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Configuration for the logging system
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// The log level to use (trace, debug, info, warn, error)
    pub level: String,
    /// Name written into the log file and startup line
    pub service_name: String,
    /// Whether to output logs to a file
    pub file_output: bool,
    /// The directory to store log files in
    pub log_dir: Option<String>,
    /// Whether to use JSON formatting
    pub json_format: bool,
    /// Custom fields logged once at startup
    pub custom_fields: HashMap<String, serde_json::Value>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            service_name: "renderer-resilience".to_string(),
            file_output: false,
            log_dir: None,
            json_format: false,
            custom_fields: HashMap::new(),
        }
    }
}

/// Initializes the structured logging system
pub fn init_logging(config: Option<LoggingConfig>) -> Result<()> {
    // Don't re-initialize if already done
    if LOGGING_INITIALIZED.swap(true, Ordering::SeqCst) {
        return Ok(());
    }

    let config = config.unwrap_or_default();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("renderer_resilience={},warn", config.level)));

    // JSON and text layers have different concrete types, so both are boxed
    let console_layer: Box<dyn Layer<Registry> + Send + Sync> = if config.json_format {
        fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_target(true)
            .boxed()
    } else {
        fmt::layer().with_target(true).with_thread_names(true).boxed()
    };

    let file_layer: Option<Box<dyn Layer<Registry> + Send + Sync>> = match (config.file_output, &config.log_dir) {
        (true, Some(log_dir)) => {
            let file_appender = RollingFileAppender::new(
                tracing_appender::rolling::Rotation::DAILY,
                log_dir,
                format!("{}.log", config.service_name),
            );
            let (non_blocking, guard) = NonBlocking::new(file_appender);

            // The guard flushes on drop; logging lives for the whole process
            Box::leak(Box::new(guard));

            Some(fmt::layer().with_writer(non_blocking).with_ansi(false).boxed())
        }
        _ => None,
    };

    let subscriber = Registry::default()
        .with(console_layer.and_then(file_layer))
        .with(filter);

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        LOGGING_INITIALIZED.store(false, Ordering::SeqCst);
        return Err(Error::Initialization(format!("Failed to set global subscriber: {}", e)));
    }

    tracing::info!(
        service = %config.service_name,
        level = %config.level,
        json = config.json_format,
        custom_fields = ?config.custom_fields,
        "Structured logging initialized"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LoggingConfig::default();
        assert_eq!(config.level, "info");
        assert!(!config.file_output);
        assert!(config.log_dir.is_none());
    }

    #[test]
    fn test_config_deserializes_partially() {
        let config: LoggingConfig = serde_json::from_str(r#"{"level":"debug","json_format":true}"#).unwrap();
        assert_eq!(config.level, "debug");
        assert!(config.json_format);
        assert_eq!(config.service_name, "renderer-resilience");
    }
}
