use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{CallToolResult, Implementation, ServerCapabilities, ServerInfo};
use rmcp::{tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler};

use crate::config::Config;
use crate::error::GaleError;
use crate::executor::{CommandExecutor, ExecuteParams, BackgroundParams, LogsParams};
use crate::fs::FsTools;
use crate::output::FileOutputStore;
use crate::process::{ProcessManager, ProcessRecord};
use crate::response::ToolResponse;
use crate::tools::command::{
    BgStartRequest, ExecuteRequest, PsCleanRequest, PsDetailRequest, PsListRequest,
    PsLogsRequest, PsStopRequest,
};
use crate::tools::fs::{
    CreateDirectoryRequest, DeleteFileRequest, FileInfoRequest, ListDirectoryRequest,
    MoveFileRequest, ReadFileRequest, SearchFilesRequest, WriteFileRequest,
};

/// Which tool families this server instance publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerFlavor {
    Command,
    Filesystem,
    Unified,
}

impl ServerFlavor {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Command => "gale-command-server",
            Self::Filesystem => "gale-filesystem-server",
            Self::Unified => "gale-unified-server",
        }
    }
}

#[derive(Clone)]
pub struct OsServer {
    executor: Arc<CommandExecutor>,
    fs: Arc<FsTools>,
    flavor: ServerFlavor,
    tool_router: ToolRouter<Self>,
}

impl OsServer {
    pub fn command_server(config: Config) -> Self {
        Self::build(config, ServerFlavor::Command)
    }

    pub fn filesystem_server(config: Config) -> Self {
        Self::build(config, ServerFlavor::Filesystem)
    }

    pub fn unified_server(config: Config) -> Self {
        Self::build(config, ServerFlavor::Unified)
    }

    fn build(config: Config, flavor: ServerFlavor) -> Self {
        let store = Arc::new(FileOutputStore::new(config.output_storage_path.clone()));
        let manager = Arc::new(ProcessManager::new(
            store,
            &config.default_encoding,
            config.retention_seconds,
        ));
        manager.spawn_retention_sweeper();
        let fs = Arc::new(FsTools::new(config.allowed_dirs.clone()));
        let executor = Arc::new(CommandExecutor::new(config, manager));
        let tool_router = match flavor {
            ServerFlavor::Command => Self::command_tools(),
            ServerFlavor::Filesystem => Self::fs_tools(),
            ServerFlavor::Unified => Self::command_tools() + Self::fs_tools(),
        };
        Self {
            executor,
            fs,
            flavor,
            tool_router,
        }
    }

    pub fn flavor(&self) -> ServerFlavor {
        self.flavor
    }

    /// Force-stop running processes with a bounded deadline and release the
    /// output store. Called by the transport layer on shutdown.
    pub async fn shutdown(&self) {
        self.executor.manager().shutdown().await;
    }
}

fn record_json(record: &ProcessRecord) -> serde_json::Value {
    serde_json::json!({
        "pid": record.id,
        "command": record.argv,
        "directory": record.working_directory,
        "description": record.description,
        "labels": record.labels,
        "status": record.status.as_str(),
        "encoding": record.encoding,
        "timeout_seconds": record.timeout_seconds,
        "started_at": record.started_at().to_rfc3339(),
        "ended_at": record.ended_at().map(|t| t.to_rfc3339()),
        "exit_code": record.exit_code,
        "error_message": record.error_message,
    })
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, McpError> {
    serde_json::to_string(value).map_err(|e| McpError::internal_error(e.to_string(), None))
}

#[tool_router(router = command_tools, vis = "pub")]
impl OsServer {
    #[tool(
        name = "command_execute",
        description = "Run an allow-listed command synchronously and capture its output. Blocks until the command exits or the timeout (default 15s) expires; on timeout the partial output is still returned. For long-running work use `command_bg_start` instead."
    )]
    async fn command_execute(
        &self,
        Parameters(req): Parameters<ExecuteRequest>,
    ) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        let params = ExecuteParams {
            argv: req.argv(),
            working_directory: PathBuf::from(&req.directory),
            stdin: req.stdin.map(String::into_bytes),
            timeout_seconds: req.timeout,
            env_overlay: req.envs.unwrap_or_default(),
            encoding: req.encoding,
            limit_lines: req.limit_lines,
        };

        let response = match self.executor.execute(params).await {
            Ok(result) => ToolResponse::success(
                to_json(&result)?,
                "command_execute",
                start.elapsed().as_secs_f64(),
            ),
            Err(e) => {
                tracing::warn!("command_execute failed: {e}");
                if let GaleError::CommandTimeout {
                    timeout_seconds,
                    ref partial_stdout,
                    ref partial_stderr,
                    duration_seconds,
                } = e
                {
                    let body = serde_json::json!({
                        "timed_out": true,
                        "timeout_seconds": timeout_seconds,
                        "duration_seconds": duration_seconds,
                        "stdout": partial_stdout,
                        "stderr": partial_stderr,
                    });
                    ToolResponse::error_with_content(
                        &e,
                        body.to_string(),
                        "command_execute",
                        start.elapsed().as_secs_f64(),
                    )
                } else {
                    ToolResponse::error(&e, "command_execute", start.elapsed().as_secs_f64())
                }
            }
        };
        Ok(response.into_call_tool_result())
    }

    #[tool(
        name = "command_bg_start",
        description = "Start an allow-listed command in the background and return its process id immediately. Inspect it later with `command_ps_list`, `command_ps_logs`, and `command_ps_detail`."
    )]
    async fn command_bg_start(
        &self,
        Parameters(req): Parameters<BgStartRequest>,
    ) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        let params = BackgroundParams {
            argv: req.argv(),
            working_directory: PathBuf::from(&req.directory),
            description: req.description,
            labels: req.labels.unwrap_or_default(),
            stdin: req.stdin.map(String::into_bytes),
            timeout_seconds: req.timeout,
            env_overlay: req.envs.unwrap_or_default(),
            encoding: req.encoding,
        };
        let response = match self.executor.start_background(params).await {
            Ok(pid) => ToolResponse::success(
                serde_json::json!({ "pid": pid }).to_string(),
                "command_bg_start",
                start.elapsed().as_secs_f64(),
            ),
            Err(e) => {
                tracing::warn!("command_bg_start failed: {e}");
                ToolResponse::error(&e, "command_bg_start", start.elapsed().as_secs_f64())
            }
        };
        Ok(response.into_call_tool_result())
    }

    #[tool(
        name = "command_ps_list",
        description = "List managed background and synchronous processes, optionally filtered by status and labels (a process must carry all requested labels).",
        annotations(read_only_hint = true)
    )]
    async fn command_ps_list(
        &self,
        Parameters(req): Parameters<PsListRequest>,
    ) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        let labels = req.labels.unwrap_or_default();
        let records = self.executor.list(req.status, &labels).await;
        let body: Vec<serde_json::Value> = records.iter().map(record_json).collect();
        let response = ToolResponse::success(
            to_json(&body)?,
            "command_ps_list",
            start.elapsed().as_secs_f64(),
        );
        Ok(response.into_call_tool_result())
    }

    #[tool(
        name = "command_ps_stop",
        description = "Stop a running process. Graceful by default (terminate signal, 2s grace, then kill); set force for an immediate kill. Stopping an already-finished process is a no-op."
    )]
    async fn command_ps_stop(
        &self,
        Parameters(req): Parameters<PsStopRequest>,
    ) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        let response = match self
            .executor
            .stop(&req.pid, req.force.unwrap_or(false))
            .await
        {
            Ok(record) => ToolResponse::success(
                record_json(&record).to_string(),
                "command_ps_stop",
                start.elapsed().as_secs_f64(),
            ),
            Err(e) => {
                tracing::warn!(pid = %req.pid, "command_ps_stop failed: {e}");
                ToolResponse::error(&e, "command_ps_stop", start.elapsed().as_secs_f64())
            }
        };
        Ok(response.into_call_tool_result())
    }

    #[tool(
        name = "command_ps_logs",
        description = "Read the captured output of a process. Supports channel selection, time bounds, tail, regex grep (line or content mode), timestamp prefixes, and a short bounded wait for new output while the process is running.",
        annotations(read_only_hint = true)
    )]
    async fn command_ps_logs(
        &self,
        Parameters(req): Parameters<PsLogsRequest>,
    ) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        let params = LogsParams {
            id: req.pid.clone(),
            with_stdout: req.with_stdout.unwrap_or(true),
            with_stderr: req.with_stderr.unwrap_or(true),
            since: req.since,
            until: req.until,
            tail: req.tail,
            follow_seconds: req.follow_seconds,
            grep: req.grep,
            grep_mode: req.grep_mode.unwrap_or_default(),
            add_time_prefix: req.add_time_prefix.unwrap_or(false),
            time_prefix_format: req.time_prefix_format,
            limit_lines: req.limit_lines,
        };
        let response = match self.executor.logs(params).await {
            Ok(result) => ToolResponse::success(
                to_json(&result)?,
                "command_ps_logs",
                start.elapsed().as_secs_f64(),
            ),
            Err(e) => {
                tracing::warn!(pid = %req.pid, "command_ps_logs failed: {e}");
                ToolResponse::error(&e, "command_ps_logs", start.elapsed().as_secs_f64())
            }
        };
        Ok(response.into_call_tool_result())
    }

    #[tool(
        name = "command_ps_clean",
        description = "Remove finished processes from the registry and delete their logs. Returns a per-id outcome map; running processes are reported in-use and left untouched."
    )]
    async fn command_ps_clean(
        &self,
        Parameters(req): Parameters<PsCleanRequest>,
    ) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        let response = match self.executor.clean(&req.pids).await {
            Ok(outcomes) => ToolResponse::success(
                to_json(&outcomes)?,
                "command_ps_clean",
                start.elapsed().as_secs_f64(),
            ),
            Err(e) => {
                tracing::warn!("command_ps_clean failed: {e}");
                ToolResponse::error(&e, "command_ps_clean", start.elapsed().as_secs_f64())
            }
        };
        Ok(response.into_call_tool_result())
    }

    #[tool(
        name = "command_ps_detail",
        description = "Full record for one process: command, status, timestamps, exit code, and any error message.",
        annotations(read_only_hint = true)
    )]
    async fn command_ps_detail(
        &self,
        Parameters(req): Parameters<PsDetailRequest>,
    ) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        let response = match self.executor.detail(&req.pid).await {
            Ok(record) => ToolResponse::success(
                record_json(&record).to_string(),
                "command_ps_detail",
                start.elapsed().as_secs_f64(),
            ),
            Err(e) => {
                tracing::warn!(pid = %req.pid, "command_ps_detail failed: {e}");
                ToolResponse::error(&e, "command_ps_detail", start.elapsed().as_secs_f64())
            }
        };
        Ok(response.into_call_tool_result())
    }
}

#[tool_router(router = fs_tools, vis = "pub")]
impl OsServer {
    #[tool(
        name = "fs_read_file",
        description = "Read a text file from an allowed directory, optionally only the first `head` or last `tail` lines.",
        annotations(read_only_hint = true)
    )]
    async fn fs_read_file(
        &self,
        Parameters(req): Parameters<ReadFileRequest>,
    ) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        let response = match self.fs.read_file(&req.path, req.head, req.tail).await {
            Ok(content) => {
                ToolResponse::success(content, "fs_read_file", start.elapsed().as_secs_f64())
            }
            Err(e) => ToolResponse::error(&e, "fs_read_file", start.elapsed().as_secs_f64()),
        };
        Ok(response.into_call_tool_result())
    }

    #[tool(
        name = "fs_write_file",
        description = "Write or append text to a file inside an allowed directory."
    )]
    async fn fs_write_file(
        &self,
        Parameters(req): Parameters<WriteFileRequest>,
    ) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        let mode = req.mode.unwrap_or_default();
        let response = match self.fs.write_file(&req.path, &req.content, mode).await {
            Ok(()) => ToolResponse::success(
                format!("wrote {} bytes to {}", req.content.len(), req.path),
                "fs_write_file",
                start.elapsed().as_secs_f64(),
            ),
            Err(e) => ToolResponse::error(&e, "fs_write_file", start.elapsed().as_secs_f64()),
        };
        Ok(response.into_call_tool_result())
    }

    #[tool(
        name = "fs_list_directory",
        description = "List the entries of a directory inside an allowed directory.",
        annotations(read_only_hint = true)
    )]
    async fn fs_list_directory(
        &self,
        Parameters(req): Parameters<ListDirectoryRequest>,
    ) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        let response = match self.fs.list_directory(&req.path).await {
            Ok(entries) => ToolResponse::success(
                to_json(&entries)?,
                "fs_list_directory",
                start.elapsed().as_secs_f64(),
            ),
            Err(e) => ToolResponse::error(&e, "fs_list_directory", start.elapsed().as_secs_f64()),
        };
        Ok(response.into_call_tool_result())
    }

    #[tool(
        name = "fs_create_directory",
        description = "Create a directory (and missing parents) inside an allowed directory."
    )]
    async fn fs_create_directory(
        &self,
        Parameters(req): Parameters<CreateDirectoryRequest>,
    ) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        let response = match self.fs.create_directory(&req.path).await {
            Ok(()) => ToolResponse::success(
                format!("created {}", req.path),
                "fs_create_directory",
                start.elapsed().as_secs_f64(),
            ),
            Err(e) => ToolResponse::error(&e, "fs_create_directory", start.elapsed().as_secs_f64()),
        };
        Ok(response.into_call_tool_result())
    }

    #[tool(
        name = "fs_move_file",
        description = "Move or rename a file or directory; both paths must be inside allowed directories."
    )]
    async fn fs_move_file(
        &self,
        Parameters(req): Parameters<MoveFileRequest>,
    ) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        let response = match self.fs.move_file(&req.source, &req.destination).await {
            Ok(()) => ToolResponse::success(
                format!("moved {} to {}", req.source, req.destination),
                "fs_move_file",
                start.elapsed().as_secs_f64(),
            ),
            Err(e) => ToolResponse::error(&e, "fs_move_file", start.elapsed().as_secs_f64()),
        };
        Ok(response.into_call_tool_result())
    }

    #[tool(
        name = "fs_delete_file",
        description = "Delete a file inside an allowed directory. Directories require `recursive: true`."
    )]
    async fn fs_delete_file(
        &self,
        Parameters(req): Parameters<DeleteFileRequest>,
    ) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        let response = match self
            .fs
            .delete_file(&req.path, req.recursive.unwrap_or(false))
            .await
        {
            Ok(()) => ToolResponse::success(
                format!("deleted {}", req.path),
                "fs_delete_file",
                start.elapsed().as_secs_f64(),
            ),
            Err(e) => ToolResponse::error(&e, "fs_delete_file", start.elapsed().as_secs_f64()),
        };
        Ok(response.into_call_tool_result())
    }

    #[tool(
        name = "fs_search_files",
        description = "Recursively search an allowed directory for entries whose name contains a substring (case-insensitive). Hidden entries are skipped.",
        annotations(read_only_hint = true)
    )]
    async fn fs_search_files(
        &self,
        Parameters(req): Parameters<SearchFilesRequest>,
    ) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        let response = match self.fs.search_files(&req.path, &req.pattern).await {
            Ok(paths) => ToolResponse::success(
                to_json(&paths)?,
                "fs_search_files",
                start.elapsed().as_secs_f64(),
            ),
            Err(e) => ToolResponse::error(&e, "fs_search_files", start.elapsed().as_secs_f64()),
        };
        Ok(response.into_call_tool_result())
    }

    #[tool(
        name = "fs_get_file_info",
        description = "Size, kind, permissions, and timestamps for a path inside an allowed directory.",
        annotations(read_only_hint = true)
    )]
    async fn fs_get_file_info(
        &self,
        Parameters(req): Parameters<FileInfoRequest>,
    ) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        let response = match self.fs.get_file_info(&req.path).await {
            Ok(info) => ToolResponse::success(
                to_json(&info)?,
                "fs_get_file_info",
                start.elapsed().as_secs_f64(),
            ),
            Err(e) => ToolResponse::error(&e, "fs_get_file_info", start.elapsed().as_secs_f64()),
        };
        Ok(response.into_call_tool_result())
    }

    #[tool(
        name = "fs_list_allowed_directories",
        description = "List the directories the filesystem tools may access.",
        annotations(read_only_hint = true)
    )]
    async fn fs_list_allowed_directories(&self) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        let dirs: Vec<String> = self
            .fs
            .allowed_dirs()
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        let response = ToolResponse::success(
            to_json(&dirs)?,
            "fs_list_allowed_directories",
            start.elapsed().as_secs_f64(),
        );
        Ok(response.into_call_tool_result())
    }
}

#[tool_handler]
impl ServerHandler for OsServer {
    fn get_info(&self) -> ServerInfo {
        let instructions = match self.flavor {
            ServerFlavor::Command => COMMAND_INSTRUCTIONS.to_string(),
            ServerFlavor::Filesystem => FS_INSTRUCTIONS.to_string(),
            ServerFlavor::Unified => format!("{COMMAND_INSTRUCTIONS}\n\n{FS_INSTRUCTIONS}"),
        };
        ServerInfo {
            server_info: Implementation {
                name: self.flavor.name().to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            },
            instructions: Some(instructions),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

const COMMAND_INSTRUCTIONS: &str = "Command execution over an allow-list of program names.\n\n\
    Tools:\n\
    - `command_execute`: run synchronously, capture stdout/stderr (default timeout 15s; partial output survives a timeout).\n\
    - `command_bg_start`: start in the background, returns a pid immediately.\n\
    - `command_ps_list`: list managed processes, filter by status/labels.\n\
    - `command_ps_logs`: query captured output (tail, time bounds, regex grep, follow).\n\
    - `command_ps_stop`: graceful or forced stop.\n\
    - `command_ps_detail`: full record for one pid.\n\
    - `command_ps_clean`: drop finished records and their logs.\n\n\
    Command lines are a program plus an argument vector; there is no shell, so pipelines, \
    redirections, and globbing are not available. Finished records are kept for a retention \
    window, then swept together with their logs.";

const FS_INSTRUCTIONS: &str = "Filesystem access restricted to an allow-list of directories.\n\n\
    Tools:\n\
    - `fs_read_file` / `fs_write_file`: text I/O (head/tail bounds, overwrite or append).\n\
    - `fs_list_directory`, `fs_create_directory`, `fs_move_file`, `fs_delete_file`.\n\
    - `fs_search_files`: recursive name search.\n\
    - `fs_get_file_info`: size, kind, permissions, timestamps.\n\
    - `fs_list_allowed_directories`: see what is accessible.\n\n\
    All paths must be absolute and resolve inside an allowed directory; symlinks are followed \
    before the check.";
