// Error types for the download pipeline

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Every failure the pipeline can report to a caller.
///
/// Configuration problems (`MissingUrl`, `InvalidMode`, `InvalidOption`) are
/// detected before any engine activity and map to client errors. Everything
/// else is a server-side failure.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Request carried no source URL
    #[error("Missing URL")]
    MissingUrl,

    /// Mode string is not one of the supported job modes
    #[error("Invalid mode: {0}")]
    InvalidMode(String),

    /// A mode-specific option is missing or malformed
    #[error("Invalid option '{option}': {reason}")]
    InvalidOption { option: String, reason: String },

    /// Programmatic format selection found no usable stream pair
    #[error("Format selection failed: {0}")]
    Selection(String),

    /// The extraction engine reported a failure
    #[error(transparent)]
    Engine(#[from] EngineFailure),

    /// No final artifact path could be determined
    #[error("Could not resolve artifact: {0}")]
    Resolution(String),

    /// Service configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl DownloadError {
    pub fn invalid_option(option: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidOption {
            option: option.into(),
            reason: reason.into(),
        }
    }

    /// Whether the failure was caused by the request itself.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::MissingUrl | Self::InvalidMode(_) | Self::InvalidOption { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, DownloadError>;

/// Rough classification of an engine message, used for logging only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineFailureKind {
    /// Network timeout while talking to the source site
    NetworkTimeout,
    /// Source site refused the request (429, bot detection, ...)
    Blocked,
    /// Engine binary could not be started
    ToolNotFound,
    /// URL is not handled by any extractor
    UnsupportedUrl,
    /// Engine output could not be parsed
    ParseError,
    /// Job was cancelled or exceeded its time limit
    Interrupted,
    Other,
}

impl fmt::Display for EngineFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::NetworkTimeout => "network-timeout",
            Self::Blocked => "blocked",
            Self::ToolNotFound => "tool-not-found",
            Self::UnsupportedUrl => "unsupported-url",
            Self::ParseError => "parse-error",
            Self::Interrupted => "interrupted",
            Self::Other => "other",
        };
        f.write_str(label)
    }
}

/// Failure raised by the extraction engine. The message is kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct EngineFailure {
    pub kind: EngineFailureKind,
    pub message: String,
}

impl EngineFailure {
    pub fn new(kind: EngineFailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn tool_not_found(program: &str, err: &std::io::Error) -> Self {
        Self::new(
            EngineFailureKind::ToolNotFound,
            format!("Failed to start {}: {}", program, err),
        )
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(EngineFailureKind::ParseError, message)
    }
}

impl From<String> for EngineFailure {
    fn from(s: String) -> Self {
        let lower = s.to_lowercase();

        let kind = if lower.contains("timed out") || lower.contains("timeout") {
            EngineFailureKind::NetworkTimeout
        } else if lower.contains("429") || lower.contains("sign in to confirm") || lower.contains("blocked") {
            EngineFailureKind::Blocked
        } else if lower.contains("command not found") || lower.contains("no such file") {
            EngineFailureKind::ToolNotFound
        } else if lower.contains("unsupported url") || lower.contains("invalid url") {
            EngineFailureKind::UnsupportedUrl
        } else if lower.contains("json") || lower.contains("parse") {
            EngineFailureKind::ParseError
        } else {
            EngineFailureKind::Other
        };

        Self { kind, message: s }
    }
}

impl From<&str> for EngineFailure {
    fn from(s: &str) -> Self {
        Self::from(s.to_string())
    }
}

/// A best-effort cleanup step that did not succeed. Logged, never returned as an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionWarning {
    pub path: PathBuf,
    pub message: String,
}

impl fmt::Display for RetentionWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "could not remove {}: {}", self.path.display(), self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_engine_messages() {
        let cases = [
            ("ERROR: [youtube] abc: Read timed out.", EngineFailureKind::NetworkTimeout),
            ("ERROR: HTTP Error 429: Too Many Requests", EngineFailureKind::Blocked),
            ("ERROR: Unsupported URL: https://example.com/", EngineFailureKind::UnsupportedUrl),
            ("ERROR: unable to extract player response", EngineFailureKind::Other),
        ];

        for (message, expected) in cases {
            let failure = EngineFailure::from(message);
            assert_eq!(failure.kind, expected, "{message}");
            assert_eq!(failure.message, message);
        }
    }

    #[test]
    fn engine_message_is_not_rewritten() {
        let err: DownloadError = EngineFailure::from("ERROR: Video unavailable").into();
        assert_eq!(err.to_string(), "ERROR: Video unavailable");
        assert!(!err.is_client_error());
    }

    #[test]
    fn configuration_errors_are_client_errors() {
        assert!(DownloadError::MissingUrl.is_client_error());
        assert!(DownloadError::InvalidMode("zip".into()).is_client_error());
        assert!(DownloadError::invalid_option("min_duration", "not an integer").is_client_error());
        assert!(!DownloadError::Selection("no audio".into()).is_client_error());
        assert!(!DownloadError::Resolution("no path".into()).is_client_error());
    }
}
