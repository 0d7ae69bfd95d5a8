//! Command Executor: policy layer and user-facing facade over the Process
//! Manager and the Output Store.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::format::{Item, StrftimeItems};
use chrono::DateTime;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::GaleError;
use crate::output::{Channel, FileOutputStore, OutputEntry, ReadQuery};
use crate::process::{CleanOutcome, ProcessManager, ProcessRecord, ProcessStatus, StartSpec};

pub const DEFAULT_SYNC_TIMEOUT_SECONDS: u64 = 15;
pub const DEFAULT_LIMIT_LINES: usize = 500;
pub const DEFAULT_FOLLOW_SECONDS: f64 = 1.0;
pub const DEFAULT_TIME_PREFIX_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// How `grep` trims matched lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum GrepMode {
    /// Yield whole matching lines.
    #[default]
    Line,
    /// Yield only the matched substring of each line (`grep -o`).
    Content,
}

/// Outcome of a synchronous `execute`.
#[derive(Debug, Clone, Serialize)]
pub struct CommandResult {
    pub process_id: String,
    pub status: ProcessStatus,
    pub exit_code: Option<i32>,
    pub duration_seconds: f64,
    /// Tail-truncated to `limit_lines`; a marker line notes dropped output.
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, Default)]
pub struct ExecuteParams {
    pub argv: Vec<String>,
    pub working_directory: PathBuf,
    pub stdin: Option<Vec<u8>>,
    pub timeout_seconds: Option<u64>,
    pub env_overlay: HashMap<String, String>,
    pub encoding: Option<String>,
    pub limit_lines: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct BackgroundParams {
    pub argv: Vec<String>,
    pub working_directory: PathBuf,
    pub description: String,
    pub labels: Vec<String>,
    pub stdin: Option<Vec<u8>>,
    pub timeout_seconds: Option<u64>,
    pub env_overlay: HashMap<String, String>,
    pub encoding: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LogsParams {
    pub id: String,
    pub with_stdout: bool,
    pub with_stderr: bool,
    pub since: Option<String>,
    pub until: Option<String>,
    pub tail: Option<usize>,
    pub follow_seconds: Option<f64>,
    pub grep: Option<String>,
    pub grep_mode: GrepMode,
    pub add_time_prefix: bool,
    pub time_prefix_format: Option<String>,
    pub limit_lines: Option<usize>,
}

/// Log retrieval result: one header chunk plus line chunks of at most
/// `limit_lines` lines each.
#[derive(Debug, Clone, Serialize)]
pub struct LogsResult {
    pub header: String,
    pub chunks: Vec<String>,
    pub line_count: usize,
}

pub struct CommandExecutor {
    config: Config,
    manager: Arc<ProcessManager>,
    store: Arc<FileOutputStore>,
}

impl CommandExecutor {
    pub fn new(config: Config, manager: Arc<ProcessManager>) -> Self {
        let store = manager.store().clone();
        Self {
            config,
            manager,
            store,
        }
    }

    pub fn manager(&self) -> &Arc<ProcessManager> {
        &self.manager
    }

    /// Allow-list check on argv[0]: exact match, no path or shell resolution.
    fn check_policy(&self, argv: &[String]) -> Result<(), GaleError> {
        let Some(program) = argv.first() else {
            return Err(GaleError::InvalidArgument("argv must not be empty".into()));
        };
        if !self.config.command_allowed(program) {
            return Err(GaleError::InvalidArgument(format!(
                "command not allowed: {program}"
            )));
        }
        Ok(())
    }

    /// Run a command to completion and capture its full output. On timeout
    /// the partial output captured before the kill is returned inside the
    /// error.
    pub async fn execute(&self, params: ExecuteParams) -> Result<CommandResult, GaleError> {
        self.check_policy(&params.argv)?;
        let timeout_seconds = params.timeout_seconds.unwrap_or(DEFAULT_SYNC_TIMEOUT_SECONDS);
        if timeout_seconds == 0 {
            return Err(GaleError::InvalidArgument(
                "timeout must be a positive number of seconds".into(),
            ));
        }
        let limit_lines = params.limit_lines.unwrap_or(DEFAULT_LIMIT_LINES);
        let start = Instant::now();

        let id = self
            .manager
            .start(StartSpec {
                argv: params.argv,
                working_directory: params.working_directory,
                description: "synchronous execution".to_string(),
                labels: Vec::new(),
                stdin: params.stdin,
                timeout_seconds: Some(timeout_seconds),
                env_overlay: params.env_overlay,
                encoding: params.encoding,
            })
            .await?;

        let record = self.manager.wait(&id).await?;
        let stdout = self.collect_channel(&id, Channel::Stdout, limit_lines).await?;
        let stderr = self.collect_channel(&id, Channel::Stderr, limit_lines).await?;
        let duration_seconds = start.elapsed().as_secs_f64();

        if timed_out(&record) {
            return Err(GaleError::CommandTimeout {
                timeout_seconds,
                partial_stdout: stdout,
                partial_stderr: stderr,
                duration_seconds,
            });
        }

        Ok(CommandResult {
            process_id: id,
            status: record.status,
            exit_code: record.exit_code,
            duration_seconds,
            stdout,
            stderr,
        })
    }

    /// Spawn without waiting; returns the process id. No default timeout —
    /// background processes run unbounded unless the caller sets one.
    pub async fn start_background(&self, params: BackgroundParams) -> Result<String, GaleError> {
        self.check_policy(&params.argv)?;
        if let Some(0) = params.timeout_seconds {
            return Err(GaleError::InvalidArgument(
                "timeout must be a positive number of seconds".into(),
            ));
        }
        self.manager
            .start(StartSpec {
                argv: params.argv,
                working_directory: params.working_directory,
                description: params.description,
                labels: params.labels,
                stdin: params.stdin,
                timeout_seconds: params.timeout_seconds,
                env_overlay: params.env_overlay,
                encoding: params.encoding,
            })
            .await
    }

    pub async fn list(
        &self,
        status: Option<ProcessStatus>,
        labels: &[String],
    ) -> Vec<ProcessRecord> {
        self.manager.list(status, labels).await
    }

    pub async fn detail(&self, id: &str) -> Result<ProcessRecord, GaleError> {
        self.manager.detail(id).await
    }

    pub async fn stop(&self, id: &str, force: bool) -> Result<ProcessRecord, GaleError> {
        self.manager.stop(id, force, None).await
    }

    pub async fn clean(&self, ids: &[String]) -> Result<BTreeMap<String, CleanOutcome>, GaleError> {
        if ids.is_empty() {
            return Err(GaleError::InvalidArgument("ids must not be empty".into()));
        }
        Ok(self.manager.clean(ids).await)
    }

    /// Retrieve logs with filtering, bounded follow, and chunked rendering.
    pub async fn logs(&self, params: LogsParams) -> Result<LogsResult, GaleError> {
        let record = self.manager.detail(&params.id).await?;
        let limit_lines = match params.limit_lines {
            Some(0) => {
                return Err(GaleError::InvalidArgument(
                    "limit_lines must be positive".into(),
                ));
            }
            Some(n) => n,
            None => DEFAULT_LIMIT_LINES,
        };

        let since_us = params.since.as_deref().map(parse_timestamp).transpose()?;
        let until_us = params.until.as_deref().map(parse_timestamp).transpose()?;
        let grep = params
            .grep
            .as_deref()
            .map(|pattern| {
                Regex::new(pattern).map_err(|e| {
                    GaleError::InvalidArgument(format!("invalid grep pattern: {e}"))
                })
            })
            .transpose()?;
        let prefix_format = params
            .time_prefix_format
            .as_deref()
            .unwrap_or(DEFAULT_TIME_PREFIX_FORMAT);
        if params.add_time_prefix {
            validate_time_format(prefix_format)?;
        }

        let mut channels = Vec::new();
        if params.with_stdout {
            channels.push(Channel::Stdout);
        }
        if params.with_stderr {
            channels.push(Channel::Stderr);
        }

        let follow = Duration::from_secs_f64(
            params
                .follow_seconds
                .unwrap_or(DEFAULT_FOLLOW_SECONDS)
                .max(0.0),
        );
        let deadline = Instant::now() + follow;

        let mut entries = self
            .gather(&params.id, &channels, since_us, until_us, params.tail, grep.as_ref(), params.grep_mode)
            .await?;

        // Bounded follow: while the process is still running and the result
        // looks partial, wait for more entries to arrive. Never blocks past
        // the deadline and never blocks when follow is zero. A process seen
        // non-running still gets one final read, since its last output lands
        // in the store before the record turns terminal.
        while looks_partial(&entries, params.tail, &channels) && Instant::now() < deadline {
            let running = self.manager.status_of(&params.id).await? == ProcessStatus::Running;
            if running {
                let remaining = deadline.saturating_duration_since(Instant::now());
                tokio::time::sleep(remaining.min(Duration::from_millis(100))).await;
            }
            entries = self
                .gather(&params.id, &channels, since_us, until_us, params.tail, grep.as_ref(), params.grep_mode)
                .await?;
            if !running {
                break;
            }
        }

        // Interleave by timestamp. Within one channel order is exact; across
        // channels wall-clock is the only guarantee there is.
        entries.sort_by_key(|e| e.ts_us);

        let tag_channel = channels.len() > 1;
        let lines: Vec<String> = entries
            .iter()
            .map(|e| {
                let mut line = String::new();
                if params.add_time_prefix {
                    let ts = DateTime::from_timestamp_micros(e.ts_us).unwrap_or_default();
                    line.push_str(&format!("[{}] ", ts.format(prefix_format)));
                }
                if tag_channel {
                    line.push_str(&format!("[{}] ", e.channel.as_str()));
                }
                line.push_str(&e.line);
                line
            })
            .collect();

        let chunks = lines
            .chunks(limit_lines)
            .map(|chunk| chunk.join("\n"))
            .collect();

        // Refetch so the header shows a terminal state reached during follow.
        let record = self.manager.detail(&params.id).await.unwrap_or(record);

        Ok(LogsResult {
            header: render_header(&record),
            line_count: lines.len(),
            chunks,
        })
    }

    /// One filtered read pass over the selected channels. When a grep is
    /// active the tail bound applies after filtering, so the store is read
    /// untailed and cut here.
    async fn gather(
        &self,
        id: &str,
        channels: &[Channel],
        since_us: Option<i64>,
        until_us: Option<i64>,
        tail: Option<usize>,
        grep: Option<&Regex>,
        grep_mode: GrepMode,
    ) -> Result<Vec<OutputEntry>, GaleError> {
        let query = ReadQuery {
            since_us,
            until_us,
            tail: if grep.is_some() { None } else { tail },
        };
        let mut entries = Vec::new();
        for channel in channels {
            let mut channel_entries = self.store.read(id, *channel, &query).await?;
            if let Some(regex) = grep {
                channel_entries = apply_grep(channel_entries, regex, grep_mode);
                if let Some(tail) = tail
                    && channel_entries.len() > tail
                {
                    channel_entries.drain(..channel_entries.len() - tail);
                }
            }
            entries.extend(channel_entries);
        }
        Ok(entries)
    }

    async fn collect_channel(
        &self,
        id: &str,
        channel: Channel,
        limit_lines: usize,
    ) -> Result<String, GaleError> {
        let entries = self
            .store
            .read(id, channel, &ReadQuery::default())
            .await
            .map_err(|e| match e {
                GaleError::ProcessNotFound(id) => GaleError::ProcessNotFound(id),
                other => GaleError::OutputRetrieval(other.to_string()),
            })?;
        let total = entries.len();
        let mut lines: Vec<String> = entries.into_iter().map(|e| e.line).collect();
        let mut truncated = 0;
        if total > limit_lines {
            truncated = total - limit_lines;
            lines.drain(..truncated);
        }
        let mut text = String::new();
        if truncated > 0 {
            text.push_str(&format!("[... {truncated} earlier lines omitted ...]\n"));
        }
        text.push_str(&lines.join("\n"));
        Ok(text)
    }
}

fn timed_out(record: &ProcessRecord) -> bool {
    record.status == ProcessStatus::Terminated
        && record
            .error_message
            .as_deref()
            .is_some_and(|m| m.starts_with("timeout"))
}

/// Partial means: nothing at all yet, or fewer entries than the requested
/// per-channel tail could still deliver.
fn looks_partial(entries: &[OutputEntry], tail: Option<usize>, channels: &[Channel]) -> bool {
    if channels.is_empty() {
        return false;
    }
    match tail {
        Some(tail) => entries.len() < tail.saturating_mul(channels.len()),
        None => entries.is_empty(),
    }
}

fn apply_grep(entries: Vec<OutputEntry>, regex: &Regex, mode: GrepMode) -> Vec<OutputEntry> {
    match mode {
        GrepMode::Line => entries
            .into_iter()
            .filter(|e| regex.is_match(&e.line))
            .collect(),
        GrepMode::Content => entries
            .into_iter()
            .flat_map(|e| {
                regex
                    .find_iter(&e.line)
                    .map(|m| OutputEntry {
                        ts_us: e.ts_us,
                        channel: e.channel,
                        line: m.as_str().to_string(),
                    })
                    .collect::<Vec<_>>()
            })
            .collect(),
    }
}

fn render_header(record: &ProcessRecord) -> String {
    let mut header = format!(
        "process {} [{}]\ncommand: {}",
        record.id,
        record.status.as_str(),
        record.command_line(),
    );
    if !record.description.is_empty() {
        header.push_str(&format!("\ndescription: {}", record.description));
    }
    if let Some(code) = record.exit_code {
        header.push_str(&format!("\nexit code: {code}"));
    }
    if let Some(ref message) = record.error_message {
        header.push_str(&format!("\nerror: {message}"));
    }
    header
}

/// Accepts RFC 3339 or a plain `YYYY-mm-dd HH:MM:SS` (treated as UTC).
fn parse_timestamp(raw: &str) -> Result<i64, GaleError> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.timestamp_micros());
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(raw, format) {
            return Ok(naive.and_utc().timestamp_micros());
        }
    }
    Err(GaleError::InvalidArgument(format!(
        "unrecognized timestamp: {raw}"
    )))
}

/// chrono reports bad strftime specifiers lazily at render time; reject them
/// up front so the caller gets an argument error instead of mangled output.
fn validate_time_format(format: &str) -> Result<(), GaleError> {
    if StrftimeItems::new(format).any(|item| matches!(item, Item::Error)) {
        return Err(GaleError::InvalidArgument(format!(
            "invalid time_prefix_format: {format}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(ts_us: i64, line: &str) -> OutputEntry {
        OutputEntry {
            ts_us,
            channel: Channel::Stdout,
            line: line.to_string(),
        }
    }

    #[test]
    fn grep_line_mode_keeps_whole_lines() {
        let regex = Regex::new("^.{2,}$").unwrap();
        let entries = vec![
            entry(1, "a"),
            entry(2, "bb"),
            entry(3, "ccc"),
            entry(4, "dd"),
            entry(5, "eee"),
        ];
        let filtered = apply_grep(entries, &regex, GrepMode::Line);
        let lines: Vec<&str> = filtered.iter().map(|e| e.line.as_str()).collect();
        assert_eq!(lines, ["bb", "ccc", "dd", "eee"]);
    }

    #[test]
    fn grep_content_mode_extracts_matches() {
        let regex = Regex::new(r"error=(\d+)").unwrap();
        let entries = vec![entry(1, "x error=42 y"), entry(2, "error=7")];
        let filtered = apply_grep(entries, &regex, GrepMode::Content);
        let lines: Vec<&str> = filtered.iter().map(|e| e.line.as_str()).collect();
        assert_eq!(lines, ["error=42", "error=7"]);
    }

    #[test]
    fn parse_timestamp_accepts_rfc3339_and_naive() {
        assert!(parse_timestamp("2026-08-01T10:00:00Z").is_ok());
        assert!(parse_timestamp("2026-08-01 10:00:00").is_ok());
        assert!(parse_timestamp("2026-08-01 10:00:00.25").is_ok());
        assert!(parse_timestamp("yesterday").is_err());
    }

    #[test]
    fn time_format_validation_rejects_bad_specifiers() {
        assert!(validate_time_format("%H:%M:%S").is_ok());
        assert!(validate_time_format("%Q%!").is_err());
    }
}
