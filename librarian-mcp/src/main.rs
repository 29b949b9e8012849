//! # librarian-mcp
//!
//! MCP server exposing the Librarian index, its filesystem tools, and its
//! TaskBoard to an AI coding assistant over stdio.
//!
//! ## Architecture
//!
//! - **Process-agnostic allow-list**: every path argument is validated
//!   against a fixed set of roots established at startup (`librarian::path_guard`).
//! - **In-memory registry**: `initialize_librarian`/`generate_librarian` build
//!   and persist `.ai_reference/`; `query_component`/`find_implementation`
//!   answer from the in-memory mirror kept fresh by the watcher loop.
//! - **TaskBoard**: long-running asks (`deep_analysis`) run on a small
//!   worker pool with priority dequeue and cooperative cancellation.
//!
//! ## Usage
//!
//! ```bash
//! librarian-mcp --allow /path/to/project --allow /another/project
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::ServerInfo;
use rmcp::{ServerHandler, ServiceExt, tool, tool_handler, tool_router};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use librarian::config::Config;
use librarian::error::{ErrorKind, LibrarianError, LibrarianResult};
use librarian::registry::Registry;
use librarian::taskboard::{CancelToken, Priority, TaskBoard, TaskHandler, TaskStatus};
use librarian::watcher::StopFlag;
use librarian::{fs_ops, index, path_guard, query, session::Session};
use librarian::AllowList;

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "librarian-mcp")]
#[command(about = "MCP server for the Librarian persistent code index")]
#[command(version)]
struct Args {
    /// Directory root the server may read/write. May be repeated.
    #[arg(long = "allow", value_name = "ROOT")]
    allow: Vec<PathBuf>,

    /// Path to a librarian.toml config file (optional).
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Where to persist the active-project session across restarts.
    #[arg(long, value_name = "PATH")]
    session_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[arg(long)]
    scan_period_seconds: Option<u64>,

    #[arg(long)]
    taskboard_workers: Option<usize>,

    #[arg(long)]
    taskboard_default_timeout_seconds: Option<u64>,

    #[arg(long)]
    max_script_index_bytes: Option<u64>,

    #[arg(long)]
    context_lines: Option<usize>,

    #[arg(long)]
    allow_cross_device_move: bool,
}

/// Environment variable carrying a path-separator-delimited allow-list,
/// consulted when `--allow` is absent (§6).
const ALLOWED_ROOTS_ENV: &str = "LIBRARIAN_ALLOWED_ROOTS";

fn default_session_path() -> PathBuf {
    std::env::temp_dir().join("librarian-mcp").join("session.json")
}

// ============================================================================
// Tool parameter types
// ============================================================================

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct ProjectPathParams {
    /// Absolute or relative path to the project root.
    project_path: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct ComponentQueryParams {
    project_path: String,
    /// A bare top-level name, or "ClassName.method".
    component_name: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct FindImplParams {
    project_path: String,
    /// Case-insensitive substring to search for.
    search_text: String,
    /// Optional glob or bare extension filter (e.g. "*.py" or "py").
    #[serde(default)]
    file_pattern: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct PathParams {
    path: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct ReadMultipleParams {
    paths: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct WriteFileParams {
    path: String,
    content: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct EditSpec {
    old_text: String,
    new_text: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct EditFileParams {
    path: String,
    edits: Vec<EditSpec>,
    #[serde(default)]
    dry_run: bool,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct DirectoryTreeParams {
    path: String,
    #[serde(default)]
    max_depth: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct MoveFileParams {
    source: String,
    destination: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct SearchFilesParams {
    path: String,
    pattern: String,
    #[serde(default)]
    exclude_patterns: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct SubmitTaskParams {
    project_path: String,
    task_type: String,
    #[serde(default)]
    parameters: serde_json::Value,
    #[serde(default)]
    priority: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct TaskIdParams {
    project_path: String,
    task_id: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct ListTasksParams {
    project_path: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    task_type: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct ThinkParams {
    query: String,
    #[serde(default)]
    priority: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct DeepAnalysisParams {
    project_path: String,
    query: String,
    #[serde(default)]
    priority: Option<String>,
}

// ============================================================================
// Response helpers
// ============================================================================

fn ok_json(value: serde_json::Value) -> String {
    serde_json::to_string_pretty(&value)
        .unwrap_or_else(|e| format!("{{\"kind\":\"internal\",\"message\":\"failed to serialize response: {e}\"}}"))
}

fn ok_text(message: impl Into<String>) -> String {
    ok_json(serde_json::json!({ "message": message.into() }))
}

fn err_json(e: LibrarianError) -> String {
    ok_json(serde_json::json!({ "kind": e.kind, "message": e.message }))
}

fn parse_priority(raw: Option<&str>) -> LibrarianResult<Priority> {
    match raw.map(str::to_lowercase).as_deref() {
        None => Ok(Priority::Medium),
        Some("low") => Ok(Priority::Low),
        Some("medium") => Ok(Priority::Medium),
        Some("high") => Ok(Priority::High),
        Some(other) => Err(LibrarianError::invalid_argument(format!(
            "unknown priority '{other}', expected low/medium/high"
        ))),
    }
}

fn parse_status(raw: Option<&str>) -> LibrarianResult<Option<TaskStatus>> {
    match raw.map(str::to_lowercase).as_deref() {
        None => Ok(None),
        Some("pending") => Ok(Some(TaskStatus::Pending)),
        Some("running") => Ok(Some(TaskStatus::Running)),
        Some("completed") => Ok(Some(TaskStatus::Completed)),
        Some("failed") => Ok(Some(TaskStatus::Failed)),
        Some("timeout") => Ok(Some(TaskStatus::Timeout)),
        Some("cancelled") | Some("canceled") => Ok(Some(TaskStatus::Cancelled)),
        Some(other) => Err(LibrarianError::invalid_argument(format!("unknown status '{other}'"))),
    }
}

// ============================================================================
// Server state
// ============================================================================

#[derive(Clone)]
struct LibrarianServer {
    allow: Arc<AllowList>,
    registry: Registry,
    taskboard: TaskBoard,
    config: Arc<Config>,
    tool_router: rmcp::handler::server::router::tool::ToolRouter<Self>,
}

impl LibrarianServer {
    fn new(allow: Arc<AllowList>, registry: Registry, taskboard: TaskBoard, config: Arc<Config>) -> Self {
        Self {
            allow,
            registry,
            taskboard,
            config,
            tool_router: Self::tool_router(),
        }
    }

    fn guard_dir(&self, raw: &str) -> Result<PathBuf, LibrarianError> {
        let guarded = path_guard::resolve(&self.allow, raw)?;
        if !guarded.canonical.is_dir() {
            return Err(LibrarianError::not_found(format!(
                "'{}' is not a directory",
                guarded.canonical.display()
            )));
        }
        Ok(guarded.canonical)
    }
}

// ============================================================================
// MCP Tool Implementations
// ============================================================================

#[tool_router]
impl LibrarianServer {
    // ---- Librarian tools (spec.md §4.F) ----

    #[tool(
        name = "check_project_access",
        description = "Verify that project_path resolves under the allow-list and is readable and writable. Does not initialize anything."
    )]
    async fn check_project_access(&self, Parameters(params): Parameters<ProjectPathParams>) -> String {
        match path_guard::resolve_for_write(&self.allow, &params.project_path) {
            Ok(guarded) if guarded.canonical.is_dir() => {
                ok_text(format!("'{}' is accessible (readable and writable)", guarded.canonical.display()))
            }
            Ok(guarded) => err_json(LibrarianError::not_found(format!(
                "'{}' is not a directory",
                guarded.canonical.display()
            ))),
            Err(e) => err_json(e),
        }
    }

    #[tool(
        name = "initialize_librarian",
        description = "Create the .ai_reference/ skeleton for a project, insert it into the active set, and run the first full index. Idempotent."
    )]
    async fn initialize_librarian(&self, Parameters(params): Parameters<ProjectPathParams>) -> String {
        let root = match self.guard_dir(&params.project_path) {
            Ok(p) => p,
            Err(e) => return err_json(e),
        };
        if let Err(e) = index::ensure_skeleton(&root) {
            return err_json(e);
        }
        match self.registry.reindex(&root, self.config.max_script_index_bytes).await {
            Ok((files, components)) => ok_json(serde_json::json!({
                "project_path": root.display().to_string(),
                "files_indexed": files,
                "components_identified": components,
                "message": format!(
                    "Initialized librarian for '{}': {files} files indexed, {components} components identified.",
                    root.display()
                ),
            })),
            Err(e) => err_json(e),
        }
    }

    #[tool(
        name = "generate_librarian",
        description = "Force a full re-index of a project that already has .ai_reference/. Returns files_indexed and components_identified."
    )]
    async fn generate_librarian(&self, Parameters(params): Parameters<ProjectPathParams>) -> String {
        let root = match self.guard_dir(&params.project_path) {
            Ok(p) => p,
            Err(e) => return err_json(e),
        };
        if !index::ai_reference_dir(&root).exists() {
            return err_json(LibrarianError::not_found(
                "project has no .ai_reference/; call initialize_librarian first",
            ));
        }
        match self.registry.reindex(&root, self.config.max_script_index_bytes).await {
            Ok((files, components)) => ok_json(serde_json::json!({
                "files_indexed": files,
                "components_identified": components,
            })),
            Err(e) => err_json(e),
        }
    }

    #[tool(
        name = "query_component",
        description = "Exact, case-sensitive lookup in the component registry. component_name may be a bare top-level name or 'ClassName.method'."
    )]
    async fn query_component(&self, Parameters(params): Parameters<ComponentQueryParams>) -> String {
        let root = match self.guard_dir(&params.project_path) {
            Ok(p) => p,
            Err(e) => return err_json(e),
        };
        match query::query_component(&self.registry, &root, &params.component_name).await {
            Ok(matches) => ok_json(serde_json::json!({
                "component_name": params.component_name,
                "count": matches.len(),
                "matches": matches,
            })),
            Err(e) => err_json(e),
        }
    }

    #[tool(
        name = "find_implementation",
        description = "Case-insensitive substring search across the project, optionally filtered by file_pattern (e.g. '*.py'). Returns up to 200 files / 1000 matches with surrounding context."
    )]
    async fn find_implementation(&self, Parameters(params): Parameters<FindImplParams>) -> String {
        let root = match self.guard_dir(&params.project_path) {
            Ok(p) => p,
            Err(e) => return err_json(e),
        };
        match query::find_implementation(
            &root,
            &params.search_text,
            params.file_pattern.as_deref(),
            self.config.context_lines,
        ) {
            Ok(result) => ok_json(serde_json::json!({
                "search_text": params.search_text,
                "count": result.matches.len(),
                "truncated": result.truncated,
                "matches": result.matches,
            })),
            Err(e) => err_json(e),
        }
    }

    // ---- Filesystem tools ----

    #[tool(name = "read_file", description = "Read a file as UTF-8, or return a binary-file stub.")]
    async fn read_file(&self, Parameters(params): Parameters<PathParams>) -> String {
        match fs_ops::read_file(&self.allow, &params.path) {
            Ok(content) => ok_json(serde_json::json!({ "path": params.path, "content": content })),
            Err(e) => err_json(e),
        }
    }

    #[tool(name = "read_multiple_files", description = "Read several files at once; each path's error (if any) is reported independently.")]
    async fn read_multiple_files(&self, Parameters(params): Parameters<ReadMultipleParams>) -> String {
        let results = fs_ops::read_multiple_files(&self.allow, &params.paths);
        ok_json(serde_json::json!({ "results": results }))
    }

    #[tool(name = "write_file", description = "Write content to a file, creating parent directories and writing atomically.")]
    async fn write_file(&self, Parameters(params): Parameters<WriteFileParams>) -> String {
        match fs_ops::write_file(&self.allow, &params.path, &params.content) {
            Ok(()) => ok_text(format!("wrote {} bytes to '{}'", params.content.len(), params.path)),
            Err(e) => err_json(e),
        }
    }

    #[tool(
        name = "edit_file",
        description = "Apply an ordered list of {old_text, new_text} substitutions; each old_text must match exactly once at application time. Returns a unified diff."
    )]
    async fn edit_file(&self, Parameters(params): Parameters<EditFileParams>) -> String {
        let edits: Vec<fs_ops::Edit> = params
            .edits
            .into_iter()
            .map(|e| fs_ops::Edit { old_text: e.old_text, new_text: e.new_text })
            .collect();
        match fs_ops::edit_file(&self.allow, &params.path, &edits, params.dry_run) {
            Ok(outcome) => ok_json(serde_json::json!({
                "applied": outcome.applied,
                "diff": outcome.diff,
            })),
            Err(e) => err_json(e),
        }
    }

    #[tool(name = "create_directory", description = "Create a directory and any missing parents (mkdir -p semantics).")]
    async fn create_directory(&self, Parameters(params): Parameters<PathParams>) -> String {
        match fs_ops::create_directory(&self.allow, &params.path) {
            Ok(()) => ok_text(format!("created '{}'", params.path)),
            Err(e) => err_json(e),
        }
    }

    #[tool(name = "list_directory", description = "List a directory's entries, sorted, tagged [DIR]/[FILE].")]
    async fn list_directory(&self, Parameters(params): Parameters<PathParams>) -> String {
        match fs_ops::list_directory(&self.allow, &params.path) {
            Ok(entries) => ok_json(serde_json::json!({
                "entries": entries.iter().map(|e| serde_json::json!({
                    "name": e.name,
                    "tag": if e.is_dir { "[DIR]" } else { "[FILE]" },
                })).collect::<Vec<_>>(),
            })),
            Err(e) => err_json(e),
        }
    }

    #[tool(
        name = "directory_tree",
        description = "Bounded recursive directory tree (hidden and __pycache__ entries hidden); optional max_depth."
    )]
    async fn directory_tree(&self, Parameters(params): Parameters<DirectoryTreeParams>) -> String {
        match fs_ops::directory_tree(&self.allow, &params.path, params.max_depth) {
            Ok(tree) => ok_json(serde_json::to_value(tree).unwrap_or(serde_json::Value::Null)),
            Err(e) => err_json(e),
        }
    }

    #[tool(
        name = "move_file",
        description = "Move/rename a file, creating the destination's parent directory. Cross-device moves are rejected unless configured to allow a copy+unlink fallback."
    )]
    async fn move_file(&self, Parameters(params): Parameters<MoveFileParams>) -> String {
        match fs_ops::move_file(
            &self.allow,
            &params.source,
            &params.destination,
            self.config.allow_cross_device_move,
        ) {
            Ok(()) => ok_text(format!("moved '{}' to '{}'", params.source, params.destination)),
            Err(e) => err_json(e),
        }
    }

    #[tool(
        name = "search_files",
        description = "Case-insensitive substring match on file/directory names beneath path; exclude_patterns prune matching directory names from the walk."
    )]
    async fn search_files(&self, Parameters(params): Parameters<SearchFilesParams>) -> String {
        match fs_ops::search_files(&self.allow, &params.path, &params.pattern, &params.exclude_patterns) {
            Ok(hits) => ok_json(serde_json::json!({ "count": hits.len(), "hits": hits })),
            Err(e) => err_json(e),
        }
    }

    #[tool(name = "get_file_info", description = "Size, ctime/mtime/atime, permission bits, and type for a path.")]
    async fn get_file_info(&self, Parameters(params): Parameters<PathParams>) -> String {
        match fs_ops::get_file_info(&self.allow, &params.path) {
            Ok(info) => ok_json(serde_json::to_value(info).unwrap_or(serde_json::Value::Null)),
            Err(e) => err_json(e),
        }
    }

    #[tool(name = "list_allowed_directories", description = "List the allow-list roots this process may read/write.")]
    async fn list_allowed_directories(&self) -> String {
        let roots = fs_ops::list_allowed_directories(&self.allow);
        ok_json(serde_json::json!({
            "roots": roots.iter().map(|p| p.display().to_string()).collect::<Vec<_>>(),
        }))
    }

    // ---- TaskBoard tools ----

    #[tool(
        name = "submit_background_task",
        description = "Enqueue a long-running analysis job. Returns a task id. Unknown task_type fails immediately."
    )]
    async fn submit_background_task(&self, Parameters(params): Parameters<SubmitTaskParams>) -> String {
        let root = match path_guard::resolve(&self.allow, &params.project_path) {
            Ok(g) => g.canonical,
            Err(e) => return err_json(e),
        };
        let priority = match parse_priority(params.priority.as_deref()) {
            Ok(p) => p,
            Err(e) => return err_json(e),
        };
        let mut task_params = params.parameters;
        if let serde_json::Value::Object(ref mut map) = task_params {
            map.insert("project_path".to_string(), serde_json::Value::String(root.display().to_string()));
        } else {
            task_params = serde_json::json!({ "project_path": root.display().to_string() });
        }
        match self.taskboard.submit(params.task_type, task_params, priority).await {
            Ok(task_id) => ok_json(serde_json::json!({ "task_id": task_id })),
            Err(e) => err_json(e),
        }
    }

    #[tool(name = "get_task_status", description = "Current status snapshot for a task.")]
    async fn get_task_status(&self, Parameters(params): Parameters<TaskIdParams>) -> String {
        if let Err(e) = path_guard::resolve(&self.allow, &params.project_path) {
            return err_json(e);
        }
        match self.taskboard.status(&params.task_id).await {
            Ok(snapshot) => ok_json(serde_json::to_value(snapshot).unwrap_or(serde_json::Value::Null)),
            Err(e) => err_json(e),
        }
    }

    #[tool(
        name = "get_task_result",
        description = "Result for a completed task, or a status message if it has not finished."
    )]
    async fn get_task_result(&self, Parameters(params): Parameters<TaskIdParams>) -> String {
        if let Err(e) = path_guard::resolve(&self.allow, &params.project_path) {
            return err_json(e);
        }
        match self.taskboard.result(&params.task_id).await {
            Ok(snapshot) if snapshot.status == TaskStatus::Completed => {
                ok_json(serde_json::json!({ "status": snapshot.status, "result": snapshot.result }))
            }
            Ok(snapshot) => ok_json(serde_json::json!({
                "status": snapshot.status,
                "message": "task has not completed yet",
                "error": snapshot.error,
            })),
            Err(e) => err_json(e),
        }
    }

    #[tool(
        name = "cancel_task",
        description = "Request cancellation. A pending task is cancelled immediately; a running task observes the request cooperatively. A no-op on terminal tasks."
    )]
    async fn cancel_task(&self, Parameters(params): Parameters<TaskIdParams>) -> String {
        if let Err(e) = path_guard::resolve(&self.allow, &params.project_path) {
            return err_json(e);
        }
        match self.taskboard.cancel(&params.task_id).await {
            Ok(snapshot) => ok_json(serde_json::to_value(snapshot).unwrap_or(serde_json::Value::Null)),
            Err(e) => err_json(e),
        }
    }

    #[tool(name = "list_tasks", description = "List tasks, optionally filtered by status and/or task_type.")]
    async fn list_tasks(&self, Parameters(params): Parameters<ListTasksParams>) -> String {
        if let Err(e) = path_guard::resolve(&self.allow, &params.project_path) {
            return err_json(e);
        }
        let status = match parse_status(params.status.as_deref()) {
            Ok(s) => s,
            Err(e) => return err_json(e),
        };
        let tasks = self.taskboard.list(status, params.task_type.as_deref()).await;
        ok_json(serde_json::json!({ "count": tasks.len(), "tasks": tasks }))
    }

    #[tool(
        name = "think",
        description = "Synchronous reflection stub: formats and returns the query as a reflection marker. For deep, long-running analysis use deep_analysis instead."
    )]
    async fn think(&self, Parameters(params): Parameters<ThinkParams>) -> String {
        match parse_priority(params.priority.as_deref()) {
            Ok(priority) => ok_json(serde_json::json!({
                "query": params.query,
                "priority": priority,
                "reflection": format!("[reflection] {}", params.query),
            })),
            Err(e) => err_json(e),
        }
    }

    #[tool(
        name = "deep_analysis",
        description = "Asynchronous counterpart to think: submits a TaskBoard job that re-runs find_implementation across the project with full context and returns a task id."
    )]
    async fn deep_analysis(&self, Parameters(params): Parameters<DeepAnalysisParams>) -> String {
        let root = match path_guard::resolve(&self.allow, &params.project_path) {
            Ok(g) => g.canonical,
            Err(e) => return err_json(e),
        };
        let priority = match parse_priority(params.priority.as_deref()) {
            Ok(p) => p,
            Err(e) => return err_json(e),
        };
        let parameters = serde_json::json!({
            "project_path": root.display().to_string(),
            "query": params.query,
        });
        match self.taskboard.submit("deep_analysis", parameters, priority).await {
            Ok(task_id) => ok_json(serde_json::json!({ "task_id": task_id })),
            Err(e) => err_json(e),
        }
    }
}

// ============================================================================
// Server Handler Implementation
// ============================================================================

#[tool_handler(router = self.tool_router)]
impl ServerHandler for LibrarianServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: Default::default(),
            capabilities: rmcp::model::ServerCapabilities {
                tools: Some(rmcp::model::ToolsCapability::default()),
                ..Default::default()
            },
            server_info: rmcp::model::Implementation {
                name: "librarian".to_string(),
                title: Some("Librarian MCP Server".to_string()),
                version: env!("CARGO_PKG_VERSION").to_string(),
                icons: None,
                website_url: Some("https://github.com/Loctree/loctree-ast".to_string()),
            },
            instructions: Some(
                "A persistent, auto-refreshing index of your source tree. Call \
                 initialize_librarian(project_path) once per project, then use \
                 query_component/find_implementation instead of re-reading files to \
                 locate definitions and call sites. Filesystem tools (read_file, \
                 write_file, edit_file, ...) are scoped to the configured allow-list. \
                 Use think for a quick reflection, deep_analysis for a backgrounded, \
                 full-context search you can poll with get_task_status/get_task_result."
                    .into(),
            ),
        }
    }
}

// ============================================================================
// Deep-analysis TaskBoard handler
// ============================================================================

fn deep_analysis_handler(context_lines: usize) -> TaskHandler {
    Arc::new(move |parameters, cancel: CancelToken| {
        Box::pin(async move {
            if cancel.is_cancelled() {
                return Err(LibrarianError::new(ErrorKind::Cancelled, "cancelled before starting"));
            }
            let project_path = parameters
                .get("project_path")
                .and_then(|v| v.as_str())
                .ok_or_else(|| LibrarianError::invalid_argument("missing project_path"))?;
            let query_text = parameters
                .get("query")
                .and_then(|v| v.as_str())
                .ok_or_else(|| LibrarianError::invalid_argument("missing query"))?;

            let root = PathBuf::from(project_path);
            let result = query::find_implementation(&root, query_text, None, context_lines.max(10))?;

            if cancel.is_cancelled() {
                return Err(LibrarianError::new(ErrorKind::Cancelled, "cancelled after search"));
            }

            Ok(serde_json::json!({
                "query": query_text,
                "count": result.matches.len(),
                "truncated": result.truncated,
                "matches": result.matches,
            }))
        })
    })
}

// ============================================================================
// Process lifecycle
// ============================================================================

fn install_panic_hook() {
    std::panic::set_hook(Box::new(|panic_info| {
        let msg = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };

        if msg.contains("Broken pipe") || msg.contains("os error 32") {
            eprintln!("[librarian-mcp] client disconnected (broken pipe), shutting down");
        } else {
            let location = panic_info
                .location()
                .map(|loc| format!(" at {}:{}:{}", loc.file(), loc.line(), loc.column()))
                .unwrap_or_default();
            eprintln!("[librarian-mcp] panic{location}: {msg}");
        }
        std::process::exit(1);
    }));
}

#[cfg(unix)]
fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

#[cfg(not(unix))]
fn ignore_sigpipe() {}

/// Startup: resolve configuration, build the allow-list, reinstate the
/// previous session's active projects, and spin up the watcher and
/// TaskBoard. Returns everything `run_server` needs plus the session path
/// and stop flag so shutdown can persist state cleanly.
async fn startup(args: &Args) -> Result<(LibrarianServer, StopFlag, PathBuf)> {
    let config = if let Some(path) = &args.config {
        Config::load_from_path(path)
    } else {
        Config::default()
    };

    let allowed_roots = config.resolve_allowed_roots(args.allow.clone(), ALLOWED_ROOTS_ENV);
    let allow = Arc::new(AllowList::new(allowed_roots).context("failed to build allow-list")?);

    let mut config = config;
    config.scan_period_seconds = args.scan_period_seconds.unwrap_or(config.scan_period_seconds);
    config.taskboard_workers = args.taskboard_workers.unwrap_or(config.taskboard_workers);
    config.taskboard_default_timeout_seconds = args
        .taskboard_default_timeout_seconds
        .unwrap_or(config.taskboard_default_timeout_seconds);
    config.max_script_index_bytes = args.max_script_index_bytes.unwrap_or(config.max_script_index_bytes);
    config.context_lines = args.context_lines.unwrap_or(config.context_lines);
    config.allow_cross_device_move = args.allow_cross_device_move || config.allow_cross_device_move;
    let config = Arc::new(config);

    let session_path = args.session_file.clone().unwrap_or_else(default_session_path);
    let mut session = Session::load(&session_path);
    session.retain_existing();

    let registry = Registry::new();
    for root in session.active_projects.clone() {
        if allow.contains(&root) {
            match registry.reindex(&root, config.max_script_index_bytes).await {
                Ok((files, components)) => {
                    info!("reinstated '{}': {files} files, {components} components", root.display());
                }
                Err(e) => warn!("failed to reinstate '{}': {}", root.display(), e.message),
            }
        } else {
            warn!("session root '{}' is no longer within the allow-list, dropping", root.display());
        }
    }

    let taskboard = TaskBoard::new(Duration::from_secs(config.taskboard_default_timeout_seconds))
        .with_handler("deep_analysis", deep_analysis_handler(config.context_lines));
    taskboard.spawn_workers(config.taskboard_workers);

    let stop = StopFlag::new();
    tokio::spawn(librarian::watcher::run(
        registry.clone(),
        stop.clone(),
        Duration::from_secs(config.scan_period_seconds),
        config.max_script_index_bytes,
    ));

    let server = LibrarianServer::new(allow, registry, taskboard, config);
    Ok((server, stop, session_path))
}

/// Shutdown: stop the watcher, drain the TaskBoard, and persist the active
/// project set. Returns `Err` only for an unexpected I/O failure (exit 2).
async fn shutdown(server: &LibrarianServer, stop: &StopFlag, session_path: &Path) -> Result<()> {
    stop.signal();
    server.taskboard.shutdown();

    let active_roots = server.registry.active_roots().await;
    let mut session = Session::load(session_path);
    session.active_projects = active_roots.clone();
    let now = chrono_unix_seconds();
    for root in active_roots {
        session.last_update.insert(root, now);
    }

    if let Some(parent) = session_path.parent() {
        std::fs::create_dir_all(parent).context("failed to create session directory")?;
    }
    session.save(session_path).map_err(|e| anyhow::anyhow!("{}", e.message))?;
    Ok(())
}

fn chrono_unix_seconds() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

async fn run_server() -> Result<ExitCode> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.parse().unwrap_or_default()),
        )
        .init();

    info!("starting librarian-mcp v{}", env!("CARGO_PKG_VERSION"));

    let (server, stop, session_path) = match startup(&args).await {
        Ok(v) => v,
        Err(e) => {
            eprintln!("[librarian-mcp] startup failed: {e:#}");
            return Ok(ExitCode::from(1));
        }
    };

    info!("server ready, listening on stdio");

    let service = server.clone().serve(rmcp::transport::stdio()).await?;
    tokio::select! {
        result = service.waiting() => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c, shutting down");
        }
    }

    match shutdown(&server, &stop, &session_path).await {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(e) => {
            eprintln!("[librarian-mcp] shutdown failed: {e:#}");
            Ok(ExitCode::from(2))
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    ignore_sigpipe();
    install_panic_hook();

    match run_server().await {
        Ok(code) => code,
        Err(e) => {
            let err_str = format!("{e:?}");
            if err_str.contains("Broken pipe") || err_str.contains("os error 32") {
                eprintln!("[librarian-mcp] client disconnected, shutting down");
                ExitCode::SUCCESS
            } else {
                eprintln!("[librarian-mcp] error: {e:#}");
                ExitCode::FAILURE
            }
        }
    }
}
