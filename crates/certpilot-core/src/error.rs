//! Error types for the certificate lifecycle engine
//!
//! Every fallible operation in the workspace reports one of these kinds.
//! The installer crate reuses this type so the scheduler can persist and
//! broadcast failures without knowing which component produced them.

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the engine
#[derive(Error, Debug)]
pub enum Error {
    /// Unreachable endpoint or non-2xx response from a plain HTTP endpoint
    #[error("Network error: {0}")]
    Network(String),

    /// Malformed JSON/XML/text response
    #[error("Parse error: {0}")]
    Parse(String),

    /// Expected artifact is absent (binary in archive, cache, certificate file)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Malformed stored configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Another agent run is already active
    #[error("An agent process is already running")]
    AlreadyRunning,

    /// `stop` was called while no agent run is active
    #[error("No agent process running")]
    NoProcess,

    /// Command other than `obtain`/`renew`
    #[error("Unknown command: {0}")]
    InvalidCommand(String),

    /// The agent exited with a non-zero status without being cancelled
    ///
    /// The output captured up to the failure travels with the error so
    /// callers can persist it.
    #[error("Agent exited with error: {reason}")]
    Process {
        /// Exit cause reported by the operating system
        reason: String,
        /// Combined stdout/stderr captured before the failure
        output: String,
    },

    /// The device answered with a SOAP fault
    #[error("{message}")]
    ProtocolFault {
        /// Reason text, with the detail text appended when present
        message: String,
    },

    /// The device answered with a status other than 200
    #[error("Request returned status {status}")]
    HttpStatus {
        /// HTTP status code
        status: u16,
    },

    /// Private key encoding the installer cannot convert
    #[error("Unsupported key type: {0}")]
    UnsupportedKey(String),

    /// Filesystem or pipe error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a network error
    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }

    /// Create a parse error
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    /// Create a "not found" error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a protocol fault from the device
    pub fn protocol_fault(message: impl Into<String>) -> Self {
        Self::ProtocolFault {
            message: message.into(),
        }
    }

    /// Create an unsupported key error
    pub fn unsupported_key(msg: impl Into<String>) -> Self {
        Self::UnsupportedKey(msg.into())
    }

    /// Wrap this error with a context prefix, keeping its kind
    ///
    /// Kinds that carry structured data (process output, status codes)
    /// are returned unchanged.
    pub fn context(self, ctx: &str) -> Self {
        match self {
            Self::Network(m) => Self::Network(format!("{ctx}: {m}")),
            Self::Parse(m) => Self::Parse(format!("{ctx}: {m}")),
            Self::NotFound(m) => Self::NotFound(format!("{ctx}: {m}")),
            Self::Config(m) => Self::Config(format!("{ctx}: {m}")),
            Self::ProtocolFault { message } => Self::ProtocolFault {
                message: format!("{ctx}: {message}"),
            },
            Self::UnsupportedKey(m) => Self::UnsupportedKey(format!("{ctx}: {m}")),
            Self::Other(m) => Self::Other(format!("{ctx}: {m}")),
            other => other,
        }
    }

    /// Output captured by a failed agent run, if any
    pub fn process_output(&self) -> Option<&str> {
        match self {
            Self::Process { output, .. } => Some(output),
            _ => None,
        }
    }
}

/// Helper for converting anyhow::Error to our Error type
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::Network(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_keeps_kind() {
        let err = Error::protocol_fault("Invalid ID").context("failed to upload certificate");
        assert!(matches!(err, Error::ProtocolFault { .. }));
        assert_eq!(
            err.to_string(),
            "failed to upload certificate: Invalid ID"
        );
    }

    #[test]
    fn process_output_is_exposed() {
        let err = Error::Process {
            reason: "exit status: 1".to_string(),
            output: "line\n".to_string(),
        };
        assert_eq!(err.process_output(), Some("line\n"));
        assert_eq!(Error::NoProcess.process_output(), None);
    }
}
