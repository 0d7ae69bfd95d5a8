use std::env;
use std::path::PathBuf;

pub const DEFAULT_RETENTION_SECONDS: u64 = 3600;

#[derive(Debug, Clone)]
pub struct Config {
    /// Program names permitted as argv[0]. Exact match, no path resolution.
    /// Empty means no commands may be executed.
    pub allowed_commands: Vec<String>,
    /// Directory prefixes the filesystem tools may touch. Empty means no
    /// filesystem access.
    pub allowed_dirs: Vec<PathBuf>,
    /// How long terminal process records (and their logs) are kept.
    pub retention_seconds: u64,
    /// Codec label used to decode child output when the caller gives none.
    pub default_encoding: String,
    /// On-disk root for per-process output logs.
    pub output_storage_path: PathBuf,
}

impl Config {
    pub fn from_env() -> Self {
        let allowed_commands = parse_list(env::var("ALLOWED_COMMANDS").ok().as_deref());
        if allowed_commands.is_empty() {
            tracing::warn!("ALLOWED_COMMANDS not set or empty — no commands are allowed");
        }

        let allowed_dirs: Vec<PathBuf> = parse_list(env::var("ALLOWED_DIRS").ok().as_deref())
            .into_iter()
            .map(PathBuf::from)
            .collect();
        if allowed_dirs.is_empty() {
            tracing::warn!("ALLOWED_DIRS not set or empty — filesystem tools are disabled");
        }

        let retention_seconds = env::var("PROCESS_RETENTION_SECONDS")
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(DEFAULT_RETENTION_SECONDS);

        let default_encoding = env::var("DEFAULT_ENCODING")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "utf-8".to_string());

        let output_storage_path = env::var("OUTPUT_STORAGE_PATH")
            .ok()
            .map(PathBuf::from)
            .filter(|p| p.is_absolute())
            .unwrap_or_else(|| env::temp_dir().join("gale-output"));

        Config {
            allowed_commands,
            allowed_dirs,
            retention_seconds,
            default_encoding,
            output_storage_path,
        }
    }

    pub fn command_allowed(&self, program: &str) -> bool {
        self.allowed_commands.iter().any(|c| c == program)
    }
}

/// Split a comma-separated env value, tolerating whitespace and empty items.
fn parse_list(raw: Option<&str>) -> Vec<String> {
    raw.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::parse_list;

    #[test]
    fn parse_list_tolerates_whitespace_and_empties() {
        assert_eq!(
            parse_list(Some(" echo , ls ,,cat ")),
            vec!["echo", "ls", "cat"]
        );
        assert!(parse_list(Some("")).is_empty());
        assert!(parse_list(None).is_empty());
    }
}
