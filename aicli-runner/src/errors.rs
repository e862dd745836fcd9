//! Error types for the AICLI runner
//!
//! Errors are designed to be informative and actionable: parse failures
//! carry the offending input, process failures carry the exit code and a
//! stderr tail.

use thiserror::Error;

/// Main error type for runner operations
#[derive(Error, Debug)]
pub enum RunnerError {
    /// AICLI executable was not found
    #[error("AICLI CLI not found. Install the assistant CLI and ensure it is on PATH.\n\nSearched candidates:\n{searched}")]
    CliNotFound {
        /// Candidate names/paths that were probed
        searched: String,
    },

    /// Process-related errors
    #[error("Process error: {0}")]
    ProcessError(#[from] std::io::Error),

    /// Child process exited with a non-zero code
    #[error("AICLI process exited with code {code}: {stderr_tail}")]
    ProcessExited {
        /// Exit code reported by the child
        code: i32,
        /// Last captured lines of stderr
        stderr_tail: String,
    },

    /// Child process produced no output at all
    #[error("AICLI process produced empty output")]
    EmptyOutput,

    /// Output was present but no JSON object could be recovered
    #[error("AICLI output contained no valid JSON objects")]
    NoValidJson,

    /// Output ended mid-string, typically a killed process
    #[error("AICLI output appears truncated: {detail}")]
    TruncatedOutput {
        /// The parse error that revealed the truncation
        detail: String,
    },

    /// Output ended mid-structure
    #[error("AICLI output ended unexpectedly: {detail}")]
    UnexpectedEnd {
        /// The parse error that revealed the early end
        detail: String,
    },

    /// Input failed validation before reaching the child
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Failed to parse a message from the stream
    #[error("Failed to parse message: {error}\nRaw message: {raw}")]
    MessageParseError {
        /// Parse error description
        error: String,
        /// Raw input that failed to parse
        raw: String,
    },

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Interactive session failed to initialize
    #[error("Session initialization failed: {0}")]
    SessionInitFailed(String),

    /// Session not found
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// The stream reported a fatal error
    #[error("Stream error: {0}")]
    StreamFailure(String),

    /// Timeout waiting for a response
    #[error("Timeout waiting for response after {seconds} seconds")]
    Timeout {
        /// Number of seconds waited before timing out
        seconds: u64,
    },

    /// Channel send error
    #[error("Failed to send message through channel")]
    ChannelSendError,

    /// Channel receive error
    #[error("Channel closed unexpectedly")]
    ChannelClosed,

    /// Invalid state transition
    #[error("Invalid state: {message}")]
    InvalidState {
        /// Description of the invalid state
        message: String,
    },
}

/// Result type alias for runner operations
pub type Result<T> = std::result::Result<T, RunnerError>;

impl RunnerError {
    /// Create a new MessageParseError
    pub fn parse_error(error: impl Into<String>, raw: impl Into<String>) -> Self {
        Self::MessageParseError {
            error: error.into(),
            raw: raw.into(),
        }
    }

    /// Create a new Validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a new Timeout error
    pub fn timeout(seconds: u64) -> Self {
        Self::Timeout { seconds }
    }

    /// Create a new InvalidState error
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Check if the error is recoverable by retrying the request
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::ChannelClosed
                | Self::TruncatedOutput { .. }
                | Self::UnexpectedEnd { .. }
                | Self::ProcessExited { .. }
        )
    }

    /// Check if the error is a configuration issue
    pub fn is_config_error(&self) -> bool {
        matches!(self, Self::CliNotFound { .. } | Self::Validation(_))
    }
}

// Implement From for common channel errors
impl<T> From<tokio::sync::mpsc::error::SendError<T>> for RunnerError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Self::ChannelSendError
    }
}

impl From<tokio::sync::broadcast::error::RecvError> for RunnerError {
    fn from(_: tokio::sync::broadcast::error::RecvError) -> Self {
        Self::ChannelClosed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RunnerError::CliNotFound {
            searched: "claude\naicli".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("AICLI CLI not found"));
        assert!(msg.contains("claude"));
    }

    #[test]
    fn test_process_exited_display() {
        let err = RunnerError::ProcessExited {
            code: 2,
            stderr_tail: "fatal: bad flag".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("exited with code 2"));
        assert!(msg.contains("fatal: bad flag"));
    }

    #[test]
    fn test_is_recoverable() {
        assert!(RunnerError::timeout(30).is_recoverable());
        assert!(RunnerError::ChannelClosed.is_recoverable());
        assert!(!RunnerError::validation("bad prompt").is_recoverable());
    }

    #[test]
    fn test_is_config_error() {
        assert!(RunnerError::validation("x").is_config_error());
        assert!(RunnerError::CliNotFound {
            searched: "y".into()
        }
        .is_config_error());
        assert!(!RunnerError::timeout(30).is_config_error());
    }
}
