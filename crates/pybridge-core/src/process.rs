use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

/// Unique identifier for a process
pub type ProcessId = u32;

/// Captured outcome of a finished process. A non-zero exit code is data, not an error.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecutionResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecutionResult {
    pub fn new(exit_code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// First non-empty trimmed line of stdout
    pub fn first_line(&self) -> Option<&str> {
        self.stdout
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
    }
}

/// How captured bytes are turned into text. Chosen per command, never guessed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputEncoding {
    #[default]
    Utf8,
    /// `wsl -l -v` writes UTF-16LE
    Utf16Le,
}

/// A program invocation: argument list, optional timeout and output encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Option<Duration>,
    pub encoding: OutputEncoding,
}

impl CommandRequest {
    pub fn new<S: ToString, I: IntoIterator<Item = S>>(program: impl Into<String>, args: I) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(|s| s.to_string()).collect(),
            timeout: None,
            encoding: OutputEncoding::Utf8,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_encoding(mut self, encoding: OutputEncoding) -> Self {
        self.encoding = encoding;
        self
    }
}

impl fmt::Display for CommandRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&crate::escape::render_native_command(&self.program, &self.args))
    }
}

/// Result of a process termination operation
#[derive(Debug, Clone, PartialEq)]
pub enum TerminationResult {
    /// Process was successfully terminated
    Success,
    /// Process was not found (already exited)
    ProcessNotFound,
    /// Permission denied (insufficient privileges)
    AccessDenied,
    /// Operation failed with specific error message
    Failed(String),
}

impl TerminationResult {
    /// Whether the process is known to be gone afterwards
    pub fn is_gone(&self) -> bool {
        matches!(
            self,
            TerminationResult::Success | TerminationResult::ProcessNotFound
        )
    }
}

/// Platform seam for spawning and tearing down process trees
#[async_trait]
pub trait ProcessControl: Send + Sync {
    /// Platform name for logging and debugging
    fn platform_name(&self) -> &'static str;

    /// Apply platform spawn flags (process group, hidden console, ...)
    fn prepare(&self, command: &mut tokio::process::Command);

    /// Check whether a PID still refers to a live process
    fn is_alive(&self, pid: ProcessId) -> bool;

    /// Find all descendants of a process, deepest first
    async fn find_child_processes(&self, pid: ProcessId) -> Vec<ProcessId>;

    /// Forcefully terminate a process and all of its descendants
    async fn terminate_tree(&self, root_pid: ProcessId) -> TerminationResult;

    /// Best-effort synchronous kill for use from `Drop`
    fn emergency_kill(&self, pid: ProcessId);
}

/// Factory trait for creating platform-specific process controls
pub trait ProcessControlFactory {
    /// The type of process control this factory creates
    type Control: ProcessControl;

    /// Create a process control for the current platform
    fn create_process_control() -> Self::Control;

    /// Get the platform name for logging and debugging
    fn platform_name() -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_line_skips_blank_lines() {
        let result = ExecutionResult::new(0, "\n  \n /opt/conda/bin/conda \nsecond\n", "");
        assert_eq!(result.first_line(), Some("/opt/conda/bin/conda"));
        assert!(result.success());
        assert_eq!(ExecutionResult::new(1, "", "").first_line(), None);
    }

    #[test]
    fn test_command_request_display_quotes_spaces() {
        let request = CommandRequest::new("C:\\Program Files\\conda.exe", ["info", "--json"]);
        assert_eq!(
            request.to_string(),
            "\"C:\\Program Files\\conda.exe\" info --json"
        );
    }

    #[test]
    fn test_termination_result_is_gone() {
        assert!(TerminationResult::Success.is_gone());
        assert!(TerminationResult::ProcessNotFound.is_gone());
        assert!(!TerminationResult::AccessDenied.is_gone());
        assert!(!TerminationResult::Failed("x".into()).is_gone());
    }
}
