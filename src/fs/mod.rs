//! Path-checked filesystem access. Every operand must resolve (symlinks
//! included) inside one of the configured allowed directories; anything else
//! is a permission error before any I/O happens.

use std::collections::VecDeque;
use std::path::{Component, PathBuf};

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::error::GaleError;

const MAX_SEARCH_RESULTS: usize = 1000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    #[default]
    Overwrite,
    Append,
}

#[derive(Debug, Clone, Serialize)]
pub struct DirEntryInfo {
    pub name: String,
    pub kind: &'static str,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileInfo {
    pub path: PathBuf,
    pub kind: &'static str,
    pub size_bytes: u64,
    pub readonly: bool,
    pub permissions: String,
    pub modified: Option<DateTime<Utc>>,
    pub created: Option<DateTime<Utc>>,
}

pub struct FsTools {
    allowed_dirs: Vec<PathBuf>,
}

impl FsTools {
    pub fn new(allowed_dirs: Vec<PathBuf>) -> Self {
        Self { allowed_dirs }
    }

    pub fn allowed_dirs(&self) -> &[PathBuf] {
        &self.allowed_dirs
    }

    /// Resolve a caller path to its canonical form and require it to live
    /// under an allowed directory. A missing leaf is resolved through its
    /// parent so writes to new files still get the symlink-safe check.
    async fn resolve(&self, raw: &str) -> Result<PathBuf, GaleError> {
        let path = PathBuf::from(raw);
        if !path.is_absolute() {
            return Err(GaleError::InvalidArgument(format!(
                "path must be absolute: {raw}"
            )));
        }
        if path
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(GaleError::PermissionDenied(format!(
                "path traversal is not allowed: {raw}"
            )));
        }

        let resolved = match tokio::fs::canonicalize(&path).await {
            Ok(resolved) => resolved,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let parent = path
                    .parent()
                    .ok_or_else(|| GaleError::InvalidArgument(format!("invalid path: {raw}")))?;
                let file_name = path.file_name().ok_or_else(|| {
                    GaleError::InvalidArgument(format!("path has no file name: {raw}"))
                })?;
                let parent = tokio::fs::canonicalize(parent).await.map_err(|_| {
                    GaleError::InvalidArgument(format!(
                        "parent directory does not exist: {}",
                        parent.display()
                    ))
                })?;
                parent.join(file_name)
            }
            Err(e) => return Err(e.into()),
        };

        for allowed in &self.allowed_dirs {
            let Ok(allowed) = tokio::fs::canonicalize(allowed).await else {
                continue;
            };
            if resolved.starts_with(&allowed) {
                return Ok(resolved);
            }
        }
        Err(GaleError::PermissionDenied(format!(
            "path is outside the allowed directories: {raw}"
        )))
    }

    /// Read a text file, optionally bounded to the first `head` or last
    /// `tail` lines.
    pub async fn read_file(
        &self,
        path: &str,
        head: Option<usize>,
        tail: Option<usize>,
    ) -> Result<String, GaleError> {
        if head.is_some() && tail.is_some() {
            return Err(GaleError::InvalidArgument(
                "head and tail are mutually exclusive".into(),
            ));
        }
        let path = self.resolve(path).await?;
        let file = tokio::fs::File::open(&path).await?;
        let mut lines = BufReader::new(file).lines();

        let mut kept: VecDeque<String> = VecDeque::new();
        while let Some(line) = lines.next_line().await? {
            match (head, tail) {
                (Some(head), _) => {
                    kept.push_back(line);
                    if kept.len() == head {
                        break;
                    }
                }
                (_, Some(tail)) => {
                    if kept.len() == tail {
                        kept.pop_front();
                    }
                    kept.push_back(line);
                }
                _ => kept.push_back(line),
            }
        }
        Ok(Vec::from(kept).join("\n"))
    }

    pub async fn write_file(
        &self,
        path: &str,
        content: &str,
        mode: WriteMode,
    ) -> Result<(), GaleError> {
        let path = self.resolve(path).await?;
        match mode {
            WriteMode::Overwrite => tokio::fs::write(&path, content).await?,
            WriteMode::Append => {
                let mut file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .await?;
                file.write_all(content.as_bytes()).await?;
                file.flush().await?;
            }
        }
        Ok(())
    }

    pub async fn list_directory(&self, path: &str) -> Result<Vec<DirEntryInfo>, GaleError> {
        let path = self.resolve(path).await?;
        let mut dir = tokio::fs::read_dir(&path).await?;
        let mut entries = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let meta = entry.metadata().await?;
            entries.push(DirEntryInfo {
                name: entry.file_name().to_string_lossy().to_string(),
                kind: kind_of(&meta),
                size_bytes: meta.len(),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    pub async fn create_directory(&self, path: &str) -> Result<(), GaleError> {
        let path = self.resolve(path).await?;
        tokio::fs::create_dir_all(&path).await?;
        Ok(())
    }

    /// Rename; both endpoints must pass the allow-list check.
    pub async fn move_file(&self, source: &str, destination: &str) -> Result<(), GaleError> {
        let source = self.resolve(source).await?;
        let destination = self.resolve(destination).await?;
        tokio::fs::rename(&source, &destination).await?;
        Ok(())
    }

    pub async fn delete_file(&self, path: &str, recursive: bool) -> Result<(), GaleError> {
        let path = self.resolve(path).await?;
        let meta = tokio::fs::metadata(&path).await?;
        if meta.is_dir() {
            if !recursive {
                return Err(GaleError::InvalidArgument(format!(
                    "{} is a directory; pass recursive to delete it",
                    path.display()
                )));
            }
            tokio::fs::remove_dir_all(&path).await?;
        } else {
            tokio::fs::remove_file(&path).await?;
        }
        Ok(())
    }

    /// Recursive case-insensitive substring match on entry names. Hidden
    /// entries are skipped. Results are capped at a fixed bound.
    pub async fn search_files(&self, root: &str, pattern: &str) -> Result<Vec<PathBuf>, GaleError> {
        if pattern.is_empty() {
            return Err(GaleError::InvalidArgument("pattern must not be empty".into()));
        }
        let root = self.resolve(root).await?;
        let needle = pattern.to_lowercase();

        let mut matches = Vec::new();
        let mut pending = vec![root];
        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::debug!(dir = %dir.display(), "search skipping unreadable dir: {e}");
                    continue;
                }
            };
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().to_string();
                if name.starts_with('.') {
                    continue;
                }
                let entry_path = entry.path();
                if name.to_lowercase().contains(&needle) {
                    matches.push(entry_path.clone());
                    if matches.len() >= MAX_SEARCH_RESULTS {
                        return Ok(matches);
                    }
                }
                if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                    pending.push(entry_path);
                }
            }
        }
        matches.sort();
        Ok(matches)
    }

    pub async fn get_file_info(&self, path: &str) -> Result<FileInfo, GaleError> {
        let path = self.resolve(path).await?;
        let meta = tokio::fs::metadata(&path).await?;
        Ok(FileInfo {
            kind: kind_of(&meta),
            size_bytes: meta.len(),
            readonly: meta.permissions().readonly(),
            permissions: permissions_string(&meta),
            modified: meta.modified().ok().map(DateTime::<Utc>::from),
            created: meta.created().ok().map(DateTime::<Utc>::from),
            path,
        })
    }
}

fn kind_of(meta: &std::fs::Metadata) -> &'static str {
    if meta.is_dir() {
        "dir"
    } else if meta.is_symlink() {
        "symlink"
    } else if meta.is_file() {
        "file"
    } else {
        "other"
    }
}

fn permissions_string(meta: &std::fs::Metadata) -> String {
    use std::os::unix::fs::PermissionsExt;
    format!("{:03o}", meta.permissions().mode() & 0o777)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn relative_paths_are_rejected() {
        let tools = FsTools::new(vec![PathBuf::from("/tmp")]);
        let err = tools.read_file("relative/path.txt", None, None).await;
        assert!(matches!(err, Err(GaleError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn parent_components_are_rejected() {
        let tools = FsTools::new(vec![PathBuf::from("/tmp")]);
        let err = tools.read_file("/tmp/../etc/passwd", None, None).await;
        assert!(matches!(err, Err(GaleError::PermissionDenied(_))));
    }

    #[tokio::test]
    async fn paths_outside_allow_list_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let tools = FsTools::new(vec![dir.path().to_path_buf()]);
        let err = tools.read_file("/etc/hostname", None, None).await;
        assert!(matches!(err, Err(GaleError::PermissionDenied(_))));
    }
}
