use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{Value, json};

use super::Capability;
use super::file_read::{display_path, enforce_workspace_path_policy};
use crate::error::{CapabilityError, CapabilityErrorKind};

pub const FILE_WRITE_CAPABILITY: &str = "file_write";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Create,
    Overwrite,
    Append,
}

impl WriteMode {
    pub fn label(self) -> &'static str {
        match self {
            WriteMode::Create => "create",
            WriteMode::Overwrite => "overwrite",
            WriteMode::Append => "append",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileWriteRequest {
    pub path: String,
    pub mode: WriteMode,
    pub content: String,
}

fn invalid(message: impl Into<String>) -> CapabilityError {
    CapabilityError::new(
        FILE_WRITE_CAPABILITY,
        CapabilityErrorKind::InvalidRequest,
        message,
    )
}

fn io_failure(message: impl Into<String>) -> CapabilityError {
    CapabilityError::invocation(FILE_WRITE_CAPABILITY, message)
}

pub fn parse_write_mode(args: &Value) -> Result<WriteMode, CapabilityError> {
    let mode = args
        .get("mode")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or("overwrite")
        .to_ascii_lowercase();

    match mode.as_str() {
        "create" => Ok(WriteMode::Create),
        "overwrite" | "update" => Ok(WriteMode::Overwrite),
        "append" => Ok(WriteMode::Append),
        _ => Err(invalid("mode must be one of: create, overwrite, append")),
    }
}

pub fn parse_file_write_request(args: &Value) -> Result<FileWriteRequest, CapabilityError> {
    let path = args
        .get("path")
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default()
        .to_string();
    if path.is_empty() {
        return Err(invalid("'path' is required for file_write"));
    }
    let mode = parse_write_mode(args)?;
    let content = args
        .get("content")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| invalid("'content' is required for file_write"))?;

    Ok(FileWriteRequest {
        path,
        mode,
        content,
    })
}

/// Canonicalizes the deepest existing ancestor and re-attaches the rest, so
/// not-yet-created files still resolve under the workspace.
pub fn resolve_write_path(
    workspace_root: &Path,
    requested_path: &str,
) -> Result<PathBuf, CapabilityError> {
    let requested = PathBuf::from(requested_path);
    let absolute = if requested.is_absolute() {
        requested
    } else {
        workspace_root.join(requested)
    };

    let mut existing = absolute.as_path();
    while !existing.exists() {
        existing = existing.parent().ok_or_else(|| {
            invalid(format!(
                "path '{}' has no resolvable parent",
                requested_path
            ))
        })?;
    }

    let canonical_existing = existing
        .canonicalize()
        .map_err(|_| invalid(format!("path '{}' could not be resolved", requested_path)))?;
    let suffix = absolute
        .strip_prefix(existing)
        .map_err(|_| invalid(format!("path '{}' could not be normalized", requested_path)))?;

    if suffix
        .components()
        .any(|component| matches!(component, std::path::Component::ParentDir))
    {
        return Err(invalid(format!(
            "path '{}' escapes through a missing directory",
            requested_path
        )));
    }

    if suffix.as_os_str().is_empty() {
        return Ok(canonical_existing);
    }
    Ok(canonical_existing.join(suffix))
}

/// Workspace-scoped writer. Parent directories are created as needed.
pub struct FileWriteCapability {
    workspace_root: PathBuf,
}

impl FileWriteCapability {
    pub fn new(workspace_root: PathBuf) -> Self {
        Self { workspace_root }
    }

    pub fn write(&self, args: &Value) -> Result<Value, CapabilityError> {
        let request = parse_file_write_request(args)?;
        let root = self.workspace_root.canonicalize().map_err(|_| {
            io_failure(format!(
                "workspace root '{}' could not be resolved",
                self.workspace_root.display()
            ))
        })?;

        let resolved = resolve_write_path(&root, &request.path)?;
        enforce_workspace_path_policy(FILE_WRITE_CAPABILITY, &request.path, &resolved, &root)?;
        if resolved.is_dir() {
            return Err(invalid(format!("path '{}' is a directory", request.path)));
        }
        if request.mode == WriteMode::Create && resolved.exists() {
            return Err(invalid(format!("file '{}' already exists", request.path)));
        }

        if let Some(parent) = resolved.parent() {
            std::fs::create_dir_all(parent).map_err(|err| {
                io_failure(format!(
                    "failed to create parent directories for '{}': {err}",
                    request.path
                ))
            })?;
        }

        match request.mode {
            WriteMode::Create | WriteMode::Overwrite => {
                std::fs::write(&resolved, request.content.as_bytes())
            }
            WriteMode::Append => OpenOptions::new()
                .create(true)
                .append(true)
                .open(&resolved)
                .and_then(|mut file| file.write_all(request.content.as_bytes())),
        }
        .map_err(|err| io_failure(format!("failed to write '{}': {err}", request.path)))?;

        tracing::debug!(
            path = %resolved.display(),
            mode = request.mode.label(),
            bytes = request.content.len(),
            "file_write completed"
        );

        Ok(json!({
            "status": "ok",
            "kind": "file_write",
            "path": display_path(&resolved, &root),
            "mode": request.mode.label(),
            "bytes_written": request.content.len()
        }))
    }
}

#[async_trait]
impl Capability for FileWriteCapability {
    fn name(&self) -> &str {
        FILE_WRITE_CAPABILITY
    }

    fn description(&self) -> &str {
        "Writes text to a workspace file. Args: path (required), content (required), mode (create|overwrite|append, default overwrite)."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string" },
                "content": { "type": "string" },
                "mode": { "type": "string", "enum": ["create", "overwrite", "append"] }
            },
            "required": ["path", "content"]
        })
    }

    async fn invoke(&self, request: Value) -> Result<Value, CapabilityError> {
        self.write(&request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_refuses_existing_files() {
        let dir = tempdir().expect("temp directory should create");
        let capability = FileWriteCapability::new(dir.path().to_path_buf());

        let out = capability
            .write(&json!({ "path": "plans/schedule.md", "content": "week 1", "mode": "create" }))
            .expect("create should succeed");
        assert_eq!(out["path"], "./plans/schedule.md");
        assert_eq!(
            std::fs::read_to_string(dir.path().join("plans/schedule.md")).unwrap(),
            "week 1"
        );

        let err = capability
            .write(&json!({ "path": "plans/schedule.md", "content": "again", "mode": "create" }))
            .expect_err("second create must fail");
        assert!(err.message.contains("already exists"));
    }

    #[test]
    fn append_extends_and_overwrite_replaces() {
        let dir = tempdir().expect("temp directory should create");
        let capability = FileWriteCapability::new(dir.path().to_path_buf());

        capability
            .write(&json!({ "path": "log.txt", "content": "a" }))
            .expect("overwrite");
        capability
            .write(&json!({ "path": "log.txt", "content": "b", "mode": "append" }))
            .expect("append");
        assert_eq!(std::fs::read_to_string(dir.path().join("log.txt")).unwrap(), "ab");

        capability
            .write(&json!({ "path": "log.txt", "content": "c", "mode": "overwrite" }))
            .expect("overwrite");
        assert_eq!(std::fs::read_to_string(dir.path().join("log.txt")).unwrap(), "c");
    }

    #[test]
    fn policy_blocks_denied_segments_and_escapes() {
        let dir = tempdir().expect("temp directory should create");
        let capability = FileWriteCapability::new(dir.path().to_path_buf());

        let err = capability
            .write(&json!({ "path": ".crewline/config.toml", "content": "x" }))
            .expect_err("denied segment");
        assert_eq!(err.kind, CapabilityErrorKind::InvalidRequest);

        let err = capability
            .write(&json!({ "path": "../outside.txt", "content": "x" }))
            .expect_err("escape");
        assert_eq!(err.kind, CapabilityErrorKind::InvalidRequest);
    }

    #[test]
    fn rejects_unknown_mode_and_missing_content() {
        assert!(parse_write_mode(&json!({ "mode": "patch" })).is_err());
        let err = parse_file_write_request(&json!({ "path": "a.txt" })).expect_err("content");
        assert!(err.message.contains("content"));
    }
}
