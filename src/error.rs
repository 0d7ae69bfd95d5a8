use thiserror::Error;

#[derive(Debug, Error)]
pub enum GaleError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("failed to execute command: {0}")]
    ExecutionFailed(String),

    #[error("command timed out after {timeout_seconds}s")]
    CommandTimeout {
        timeout_seconds: u64,
        /// Output captured before the kill. The caller renders this alongside
        /// the timeout classification; it is never silently discarded.
        partial_stdout: String,
        partial_stderr: String,
        duration_seconds: f64,
    },

    #[error("process not found: {0}")]
    ProcessNotFound(String),

    #[error("process control failed for {id}: {message}")]
    ProcessControl { id: String, message: String },

    #[error("output retrieval failed: {0}")]
    OutputRetrieval(String),

    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),
}

impl GaleError {
    /// Stable kind label, preserved across the MCP boundary so clients can
    /// distinguish bad input from genuine failures.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "invalid_argument",
            Self::PermissionDenied(_) => "permission_denied",
            Self::ExecutionFailed(_) => "execution_failed",
            Self::CommandTimeout { .. } => "command_timeout",
            Self::ProcessNotFound(_) => "process_not_found",
            Self::ProcessControl { .. } => "process_control",
            Self::OutputRetrieval(_) => "output_retrieval",
            Self::Storage(_) => "storage",
        }
    }

    /// Produce a sanitized error message safe for returning to MCP clients.
    /// Does not leak host paths from I/O errors.
    pub fn user_message(&self) -> String {
        match self {
            Self::InvalidArgument(msg) => format!("invalid argument: {msg}"),
            Self::PermissionDenied(msg) => format!("permission denied: {msg}"),
            Self::ExecutionFailed(msg) => format!("failed to execute command: {msg}"),
            Self::CommandTimeout {
                timeout_seconds, ..
            } => format!("command timed out after {timeout_seconds}s"),
            Self::ProcessNotFound(id) => format!("process not found: {id}"),
            Self::ProcessControl { id, message } => {
                format!("cannot control process {id}: {message}")
            }
            Self::OutputRetrieval(msg) => format!("output retrieval failed: {msg}"),
            Self::Storage(_) => "log storage I/O error".to_string(),
        }
    }
}
