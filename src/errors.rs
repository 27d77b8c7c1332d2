use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while rotating interface and tunnel identity
#[derive(Error, Debug)]
pub enum ShiftError {
    /// Bad MAC address or interface name syntax
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Interface could not be found
    #[error("Interface not found: {0}")]
    InterfaceNotFound(String),

    /// Interface exists but could not be queried
    #[error("Failed to query interface {iface}: {reason}")]
    InterfaceQuery { iface: String, reason: String },

    /// Every MAC application mechanism failed
    #[error("Failed to apply MAC {mac} to {iface}: {reason}")]
    Apply {
        iface: String,
        mac: String,
        reason: String,
    },

    /// VPN backend failed to start
    #[error("{backend} failed to start: {reason}")]
    Start { backend: String, reason: String },

    /// VPN backend failed to stop
    #[error("{backend} failed to stop: {reason}")]
    Stop { backend: String, reason: String },

    /// Public IP lookup failed
    #[error("Public IP lookup failed: {0}")]
    Fetch(String),

    /// Reading or writing a primary MAC record failed
    #[error("Primary MAC record {path:?}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// External tool is not installed
    #[error("Command not found: {0}")]
    ToolNotFound(String),

    /// Command exited with a non-zero status
    #[error("Command `{command}` failed ({code:?}): {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    /// Configuration is invalid
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Insufficient permissions
    #[error("Insufficient permissions (try running as root)")]
    InsufficientPermissions,

    /// IO error
    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),

    /// Unknown error
    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl ShiftError {
    /// True when the error means the interface itself is missing
    pub fn is_not_found(&self) -> bool {
        matches!(self, ShiftError::InterfaceNotFound(_))
    }
}

/// Shorthand result type for rotation operations
pub type ShiftResult<T> = Result<T, ShiftError>;

/// Convert anyhow errors to ShiftError
impl From<anyhow::Error> for ShiftError {
    fn from(err: anyhow::Error) -> Self {
        ShiftError::Unknown(err.to_string())
    }
}
