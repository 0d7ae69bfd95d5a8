use schemars::JsonSchema;
use serde::Deserialize;

use crate::fs::WriteMode;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ReadFileRequest {
    /// Absolute path inside an allowed directory
    pub path: String,
    /// Return only the first N lines
    pub head: Option<usize>,
    /// Return only the last N lines
    pub tail: Option<usize>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct WriteFileRequest {
    /// Absolute path inside an allowed directory
    pub path: String,
    /// File content
    pub content: String,
    /// "overwrite" (default) or "append"
    pub mode: Option<WriteMode>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ListDirectoryRequest {
    /// Absolute path inside an allowed directory
    pub path: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CreateDirectoryRequest {
    /// Absolute path inside an allowed directory
    pub path: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct MoveFileRequest {
    /// Absolute source path inside an allowed directory
    pub source: String,
    /// Absolute destination path inside an allowed directory
    pub destination: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct DeleteFileRequest {
    /// Absolute path inside an allowed directory
    pub path: String,
    /// Required to delete a directory and its contents
    pub recursive: Option<bool>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SearchFilesRequest {
    /// Absolute directory to search under
    pub path: String,
    /// Case-insensitive substring matched against entry names
    pub pattern: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct FileInfoRequest {
    /// Absolute path inside an allowed directory
    pub path: String,
}
