use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Coarse error taxonomy. Callers branch on this, not on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    InvalidArgument,
    ExternalToolFailure,
    Timeout,
    Cancelled,
    PlatformUnsupported,
    ResourceInUse,
    Unhealthy,
    Io,
}

/// Core error types for bridge operations
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("File not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("Python script not found: {}", .0.display())]
    ScriptNotFound(PathBuf),

    #[error("Python executable not found for environment '{env}' at {path}")]
    InterpreterNotFound { env: String, path: String },

    #[error("Environment '{0}' not found")]
    EnvironmentNotFound(String),

    #[error("Unable to locate conda or mamba{}", .distro.as_ref().map(|d| format!(" in WSL distro {d}")).unwrap_or_default())]
    PackageManagerNotFound { distro: Option<String> },

    #[error("WSL distro '{0}' not found")]
    DistroNotFound(String),

    #[error("No WSL distro specified and no default WSL distro found")]
    NoDefaultDistro,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Port {0} is out of range, must be between 1 and 65535")]
    PortOutOfRange(u32),

    #[error("Failed to launch '{program}': {source}")]
    LaunchFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{command}' exited with code {exit_code}: {stderr}")]
    ToolFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("Script failed with exit code {exit_code}: {stderr}")]
    ScriptFailed { exit_code: i32, stderr: String },

    #[error("Unexpected output from '{command}': {detail}")]
    UnexpectedOutput { command: String, detail: String },

    #[error("Failed to warm up WSL distro '{distro}' after {attempts} attempts")]
    WarmUpFailed { distro: String, attempts: u32 },

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),

    #[error("Port {0} is already in use and cannot be reserved")]
    PortInUse(u16),

    #[error("Python service failed to become healthy after {attempts} attempts")]
    ServiceUnhealthy { attempts: u32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl BridgeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::FileNotFound(_)
            | BridgeError::ScriptNotFound(_)
            | BridgeError::InterpreterNotFound { .. }
            | BridgeError::EnvironmentNotFound(_)
            | BridgeError::PackageManagerNotFound { .. }
            | BridgeError::DistroNotFound(_)
            | BridgeError::NoDefaultDistro => ErrorKind::NotFound,
            BridgeError::InvalidArgument(_) | BridgeError::PortOutOfRange(_) => {
                ErrorKind::InvalidArgument
            }
            BridgeError::LaunchFailed { .. }
            | BridgeError::ToolFailed { .. }
            | BridgeError::ScriptFailed { .. }
            | BridgeError::UnexpectedOutput { .. }
            | BridgeError::WarmUpFailed { .. } => ErrorKind::ExternalToolFailure,
            BridgeError::Timeout(_) => ErrorKind::Timeout,
            BridgeError::Cancelled => ErrorKind::Cancelled,
            BridgeError::UnsupportedPlatform(_) => ErrorKind::PlatformUnsupported,
            BridgeError::PortInUse(_) => ErrorKind::ResourceInUse,
            BridgeError::ServiceUnhealthy { .. } => ErrorKind::Unhealthy,
            BridgeError::Io(_) | BridgeError::Other(_) => ErrorKind::Io,
        }
    }

    /// Check if this error is worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BridgeError::Timeout(_)
                | BridgeError::ToolFailed { .. }
                | BridgeError::UnexpectedOutput { .. }
                | BridgeError::ServiceUnhealthy { .. }
        )
    }

    /// Check if this error indicates a permanent failure
    pub fn is_permanent(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::InvalidArgument | ErrorKind::PlatformUnsupported | ErrorKind::Cancelled
        )
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        BridgeError::InvalidArgument(message.into())
    }
}

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            BridgeError::ScriptNotFound("x.py".into()).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(BridgeError::NoDefaultDistro.kind(), ErrorKind::NotFound);
        assert_eq!(
            BridgeError::PortOutOfRange(0).kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(BridgeError::PortInUse(80).kind(), ErrorKind::ResourceInUse);
        assert_eq!(
            BridgeError::ServiceUnhealthy { attempts: 3 }.kind(),
            ErrorKind::Unhealthy
        );
        assert_eq!(
            BridgeError::Timeout(Duration::from_secs(1)).kind(),
            ErrorKind::Timeout
        );
        assert_eq!(BridgeError::Cancelled.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn test_timeout_and_cancel_are_distinct() {
        let timeout = BridgeError::Timeout(Duration::from_millis(50));
        let cancelled = BridgeError::Cancelled;
        assert_ne!(timeout.kind(), cancelled.kind());
        assert!(timeout.is_retryable());
        assert!(!cancelled.is_retryable());
        assert!(cancelled.is_permanent());
    }

    #[test]
    fn test_error_display_carries_context() {
        let error = BridgeError::ToolFailed {
            command: "conda info --json".to_string(),
            exit_code: 2,
            stderr: "boom".to_string(),
        };
        let display = format!("{error}");
        assert!(display.contains("conda info --json"));
        assert!(display.contains("code 2"));
        assert!(display.contains("boom"));

        let error = BridgeError::PackageManagerNotFound {
            distro: Some("Ubuntu".to_string()),
        };
        assert!(format!("{error}").contains("Ubuntu"));
        let error = BridgeError::PackageManagerNotFound { distro: None };
        assert_eq!(format!("{error}"), "Unable to locate conda or mamba");
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk");
        let error: BridgeError = io.into();
        assert_eq!(error.kind(), ErrorKind::Io);
    }
}
