//! Output Store: persists and queries the timestamped, line-oriented output
//! of each supervised process, one log per `(process_id, channel)` pair. It
//! knows nothing about processes beyond the opaque id it is given.

pub mod store;

pub use store::FileOutputStore;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Which child stream a log record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Stdout,
    Stderr,
}

impl Channel {
    pub const ALL: [Channel; 2] = [Channel::Stdout, Channel::Stderr];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }

    /// File name backing this channel under the per-process log directory.
    pub fn file_name(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout.log",
            Self::Stderr => "stderr.log",
        }
    }
}

/// One log record. Timestamps are wall-clock microseconds, assigned when the
/// reader task enqueues the line, and non-decreasing within one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputEntry {
    pub ts_us: i64,
    pub channel: Channel,
    pub line: String,
}

/// Timestamp filter and tail bound for a read. `since`/`until` form a
/// half-open interval `[since, until)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadQuery {
    pub since_us: Option<i64>,
    pub until_us: Option<i64>,
    pub tail: Option<usize>,
}

impl ReadQuery {
    pub fn matches(&self, ts_us: i64) -> bool {
        if let Some(since) = self.since_us
            && ts_us < since
        {
            return false;
        }
        if let Some(until) = self.until_us
            && ts_us >= until
        {
            return false;
        }
        true
    }
}

/// Current wall-clock time in microseconds since the Unix epoch.
pub fn now_us() -> i64 {
    chrono::Utc::now().timestamp_micros()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_query_interval_is_half_open() {
        let q = ReadQuery {
            since_us: Some(10),
            until_us: Some(20),
            tail: None,
        };
        assert!(!q.matches(9));
        assert!(q.matches(10));
        assert!(q.matches(19));
        assert!(!q.matches(20));
    }

    #[test]
    fn read_query_unbounded_matches_everything() {
        let q = ReadQuery::default();
        assert!(q.matches(i64::MIN));
        assert!(q.matches(0));
        assert!(q.matches(i64::MAX));
    }
}
