use std::collections::HashMap;

use schemars::JsonSchema;
use serde::Deserialize;

use crate::executor::GrepMode;
use crate::process::ProcessStatus;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ExecuteRequest {
    /// Program name. Must be on the server's command allow-list.
    pub command: String,
    /// Argument vector. Never interpreted by a shell.
    pub args: Option<Vec<String>>,
    /// Absolute working directory for the child process
    pub directory: String,
    /// Text written to the child's stdin once, then closed
    pub stdin: Option<String>,
    /// Timeout in seconds (default 15). Partial output is returned on expiry.
    pub timeout: Option<u64>,
    /// Environment variables merged on top of the server environment
    pub envs: Option<HashMap<String, String>>,
    /// Codec label for decoding output (default: server encoding)
    pub encoding: Option<String>,
    /// Keep only the last N lines of each stream in the result (default 500)
    pub limit_lines: Option<usize>,
}

impl ExecuteRequest {
    pub fn argv(&self) -> Vec<String> {
        let mut argv = vec![self.command.clone()];
        argv.extend(self.args.clone().unwrap_or_default());
        argv
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct BgStartRequest {
    /// Program name. Must be on the server's command allow-list.
    pub command: String,
    /// Argument vector. Never interpreted by a shell.
    pub args: Option<Vec<String>>,
    /// Absolute working directory for the child process
    pub directory: String,
    /// Human-readable purpose, shown in listings and log headers
    pub description: String,
    /// Tags for filtering in `command_ps_list`
    pub labels: Option<Vec<String>>,
    /// Text written to the child's stdin once, then closed
    pub stdin: Option<String>,
    /// Environment variables merged on top of the server environment
    pub envs: Option<HashMap<String, String>>,
    /// Codec label for decoding output (default: server encoding)
    pub encoding: Option<String>,
    /// Optional timeout in seconds; background processes run unbounded
    /// without one
    pub timeout: Option<u64>,
}

impl BgStartRequest {
    pub fn argv(&self) -> Vec<String> {
        let mut argv = vec![self.command.clone()];
        argv.extend(self.args.clone().unwrap_or_default());
        argv
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct PsListRequest {
    /// Only return processes carrying all of these labels
    pub labels: Option<Vec<String>>,
    /// Only return processes in this state
    pub status: Option<ProcessStatus>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct PsStopRequest {
    /// Process id from `command_bg_start` or `command_ps_list`
    pub pid: String,
    /// Kill immediately instead of the graceful terminate-then-kill sequence
    pub force: Option<bool>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct PsLogsRequest {
    /// Process id from `command_bg_start` or `command_ps_list`
    pub pid: String,
    /// Return only the last N entries per channel (after grep filtering)
    pub tail: Option<usize>,
    /// Lower timestamp bound, RFC 3339 or "YYYY-mm-dd HH:MM:SS" (inclusive)
    pub since: Option<String>,
    /// Upper timestamp bound, same formats (exclusive)
    pub until: Option<String>,
    /// Include stdout entries (default true)
    pub with_stdout: Option<bool>,
    /// Include stderr entries (default true)
    pub with_stderr: Option<bool>,
    /// Prefix each line with its capture timestamp
    pub add_time_prefix: Option<bool>,
    /// strftime format for the timestamp prefix
    pub time_prefix_format: Option<String>,
    /// If the process is still running and the result looks partial, wait up
    /// to this many seconds for more output (default 1; 0 never waits)
    pub follow_seconds: Option<f64>,
    /// Maximum lines per output chunk (default 500)
    pub limit_lines: Option<usize>,
    /// Regex filter applied to each line
    pub grep: Option<String>,
    /// "line" keeps whole matching lines; "content" keeps only the matched
    /// substrings
    pub grep_mode: Option<GrepMode>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct PsCleanRequest {
    /// Process ids to remove. Each must be in a terminal state.
    pub pids: Vec<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct PsDetailRequest {
    /// Process id from `command_bg_start` or `command_ps_list`
    pub pid: String,
}
