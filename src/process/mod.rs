//! Process Manager: owns the OS-level lifecycle of spawned children, pumps
//! their output into the Output Store, and keeps the in-memory registry.

pub mod manager;

pub use manager::ProcessManager;

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Lifecycle state of a supervised process. Every state except `Running` is
/// terminal and sticky.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Running,
    Completed,
    Failed,
    Terminated,
    Error,
}

impl ProcessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Terminated => "terminated",
            Self::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Spawn parameters for a managed process.
#[derive(Debug, Clone, Default)]
pub struct StartSpec {
    /// Program plus arguments. Never interpreted by a shell.
    pub argv: Vec<String>,
    /// Absolute path used as the child's cwd. Must exist.
    pub working_directory: PathBuf,
    pub description: String,
    pub labels: Vec<String>,
    /// Written to the child's stdin once, then the stream is closed.
    pub stdin: Option<Vec<u8>>,
    pub timeout_seconds: Option<u64>,
    /// Merged on top of the server environment.
    pub env_overlay: HashMap<String, String>,
    /// Codec label for decoding child output; server default when `None`.
    pub encoding: Option<String>,
}

/// In-memory metadata for one started process. Created by the Process
/// Manager, mutated only by the supervising task, observed by everyone else
/// through snapshot copies.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessRecord {
    pub id: String,
    pub argv: Vec<String>,
    pub working_directory: PathBuf,
    pub description: String,
    pub labels: Vec<String>,
    pub encoding: String,
    pub timeout_seconds: Option<u64>,
    pub status: ProcessStatus,
    pub started_at_us: i64,
    pub ended_at_us: Option<i64>,
    pub exit_code: Option<i32>,
    pub error_message: Option<String>,
}

impl ProcessRecord {
    pub fn started_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_micros(self.started_at_us).unwrap_or_default()
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at_us.and_then(DateTime::from_timestamp_micros)
    }

    /// Subset match: every requested label must be present on the record.
    pub fn has_labels(&self, requested: &[String]) -> bool {
        requested.iter().all(|l| self.labels.contains(l))
    }

    /// One-line rendering of the command for listings and log headers.
    pub fn command_line(&self) -> String {
        self.argv.join(" ")
    }
}

/// Per-id outcome of a `clean` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "detail")]
pub enum CleanOutcome {
    Cleaned,
    /// Still running; stop it first.
    InUse,
    NotFound,
    Failed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_with_labels(labels: &[&str]) -> ProcessRecord {
        ProcessRecord {
            id: "p1".to_string(),
            argv: vec!["true".to_string()],
            working_directory: PathBuf::from("/tmp"),
            description: String::new(),
            labels: labels.iter().map(|s| s.to_string()).collect(),
            encoding: "utf-8".to_string(),
            timeout_seconds: None,
            status: ProcessStatus::Running,
            started_at_us: 0,
            ended_at_us: None,
            exit_code: None,
            error_message: None,
        }
    }

    #[test]
    fn label_match_is_subset() {
        let record = record_with_labels(&["a", "b"]);
        assert!(record.has_labels(&[]));
        assert!(record.has_labels(&["a".to_string()]));
        assert!(record.has_labels(&["a".to_string(), "b".to_string()]));
        assert!(!record.has_labels(&["c".to_string()]));
    }

    #[test]
    fn terminal_states_are_everything_but_running() {
        assert!(!ProcessStatus::Running.is_terminal());
        for status in [
            ProcessStatus::Completed,
            ProcessStatus::Failed,
            ProcessStatus::Terminated,
            ProcessStatus::Error,
        ] {
            assert!(status.is_terminal());
        }
    }
}
