//! # Failure Taxonomy and Crate Errors
//!
//! This module defines the closed set of failure kinds that a rendering
//! backend can report, their severities and explanatory templates, and the
//! error type returned by the supervision API itself.
//!
//! Backend failures are data flowing through the pipeline; `Error` is only
//! produced when the host misuses the API or configuration is invalid.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A type alias for Result with the error type defaulting to our Error
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The severity level of a classified failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    /// Degrades a single capability, the backend stays usable
    Minor,
    /// Interrupts rendering until a retry or recovery succeeds
    Major,
    /// The backend cannot render this content at all
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Minor => write!(f, "MINOR"),
            Severity::Major => write!(f, "MAJOR"),
            Severity::Critical => write!(f, "CRITICAL"),
        }
    }
}

impl Default for Severity {
    fn default() -> Self {
        Severity::Major
    }
}

/// Categorizes backend failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Fetching a remote resource failed
    Network,
    /// A resource could not be loaded or imported
    Loading,
    /// Asset data is corrupted or in an unsupported format
    Parsing,
    /// The device ran out of memory
    Memory,
    /// Input did not pass validation
    Validation,
    /// Animation playback failed
    Animation,
    /// A material or shader failed to compile or bind
    Material,
    /// A texture or image could not be decoded or uploaded
    Texture,
    /// Geometry buffers are malformed
    Geometry,
    /// Anything the classifier does not recognise
    Generic,
}

impl ErrorKind {
    /// Every kind, in classification order
    pub const ALL: [ErrorKind; 10] = [
        ErrorKind::Network,
        ErrorKind::Parsing,
        ErrorKind::Memory,
        ErrorKind::Animation,
        ErrorKind::Material,
        ErrorKind::Texture,
        ErrorKind::Geometry,
        ErrorKind::Validation,
        ErrorKind::Loading,
        ErrorKind::Generic,
    ];

    /// Fixed explanatory template shown to operators and telemetry
    pub fn explain(&self) -> &'static str {
        match self {
            ErrorKind::Network => "connectivity issue",
            ErrorKind::Loading => "resource could not be loaded",
            ErrorKind::Parsing => "corrupted or unsupported asset",
            ErrorKind::Memory => "device memory exhausted",
            ErrorKind::Validation => "invalid or incomplete input",
            ErrorKind::Animation => "animation playback failure",
            ErrorKind::Material => "material or shader failure",
            ErrorKind::Texture => "texture could not be decoded or uploaded",
            ErrorKind::Geometry => "malformed geometry data",
            ErrorKind::Generic => "unexpected rendering failure",
        }
    }

    /// Severity of a failure of this kind
    pub fn severity(&self) -> Severity {
        match self {
            ErrorKind::Animation | ErrorKind::Material | ErrorKind::Texture => Severity::Minor,
            ErrorKind::Parsing | ErrorKind::Validation | ErrorKind::Geometry => Severity::Critical,
            _ => Severity::Major,
        }
    }

    /// Stable lowercase label used in metrics and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::Loading => "loading",
            ErrorKind::Parsing => "parsing",
            ErrorKind::Memory => "memory",
            ErrorKind::Validation => "validation",
            ErrorKind::Animation => "animation",
            ErrorKind::Material => "material",
            ErrorKind::Texture => "texture",
            ErrorKind::Geometry => "geometry",
            ErrorKind::Generic => "generic",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Network => write!(f, "Network Error"),
            ErrorKind::Loading => write!(f, "Loading Error"),
            ErrorKind::Parsing => write!(f, "Parsing Error"),
            ErrorKind::Memory => write!(f, "Memory Error"),
            ErrorKind::Validation => write!(f, "Validation Error"),
            ErrorKind::Animation => write!(f, "Animation Error"),
            ErrorKind::Material => write!(f, "Material Error"),
            ErrorKind::Texture => write!(f, "Texture Error"),
            ErrorKind::Geometry => write!(f, "Geometry Error"),
            ErrorKind::Generic => write!(f, "Generic Error"),
        }
    }
}

/// A failure reported by a rendering backend
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReport {
    /// Raw failure text as produced by the backend
    pub message: String,
    /// Stack trace of the failure, if the backend captured one
    pub stack: Option<String>,
    /// Component stack or other location context
    pub context: Option<String>,
}

impl FailureReport {
    /// Creates a report from the raw failure text
    pub fn new<S: Into<String>>(message: S) -> Self {
        Self {
            message: message.into(),
            stack: None,
            context: None,
        }
    }

    /// Attaches a stack trace
    pub fn stack<S: Into<String>>(mut self, stack: S) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Attaches location context
    pub fn context<S: Into<String>>(mut self, context: S) -> Self {
        self.context = Some(context.into());
        self
    }
}

/// Errors returned by the supervision API
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Configuration could not be loaded or is inconsistent
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A subsystem failed to initialise
    #[error("Initialization error: {0}")]
    Initialization(String),

    /// The subject was never registered
    #[error("Unknown subject: {0}")]
    UnknownSubject(String),

    /// A fallback chain had no always-available terminal backend
    #[error("Fallback chain has no always-available backend")]
    EmptyChain,

    /// A recovery was requested for a strategy that does not recover in place
    #[error("Strategy {0} does not recover in place")]
    NotRecoverable(String),

    /// A recovery strategy body failed
    #[error("Recovery failed: {0}")]
    Recovery(String),
}

impl Error {
    /// Shorthand for a recovery failure
    pub fn recovery<S: Into<String>>(message: S) -> Self {
        Error::Recovery(message.into())
    }
}

impl From<::config::ConfigError> for Error {
    fn from(err: ::config::ConfigError) -> Self {
        Error::Configuration(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_kind_has_template() {
        for kind in ErrorKind::ALL {
            assert!(!kind.explain().is_empty());
        }
        assert_eq!(ErrorKind::Network.explain(), "connectivity issue");
        assert_eq!(ErrorKind::Parsing.explain(), "corrupted or unsupported asset");
    }

    #[test]
    fn test_failure_report_builder() {
        let report = FailureReport::new("texture upload failed")
            .stack("at upload (gl.js:10)")
            .context("<Scene>");

        assert_eq!(report.message, "texture upload failed");
        assert_eq!(report.stack.as_deref(), Some("at upload (gl.js:10)"));
        assert_eq!(report.context.as_deref(), Some("<Scene>"));
    }

    #[test]
    fn test_error_display() {
        let err = Error::UnknownSubject("hero".to_string());
        assert_eq!(err.to_string(), "Unknown subject: hero");
    }
}
