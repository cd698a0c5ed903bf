use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{Value, json};

use super::Capability;
use crate::error::{CapabilityError, CapabilityErrorKind};

pub const FILE_READ_CAPABILITY: &str = "file_read";
pub const FILE_READ_DEFAULT_MAX_BYTES: usize = 8192;
pub const FILE_READ_MAX_BYTES_LIMIT: usize = 65536;
pub const FILE_READ_DEFAULT_MAX_LINES: usize = 200;
pub const FILE_READ_MAX_LINES_LIMIT: usize = 2000;
pub const FILE_READ_DEFAULT_MAX_ENTRIES: usize = 100;
pub const FILE_READ_MAX_ENTRIES_LIMIT: usize = 500;
pub const DENIED_SEGMENTS: &[&str] = &[".git", ".crewline"];
pub const DENIED_FILE_NAMES: &[&str] =
    &[".env", ".env.local", ".env.development", ".env.production"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileReadRequest {
    pub path: String,
    pub start_line: usize,
    pub max_lines: usize,
    pub max_bytes: usize,
    pub max_entries: usize,
}

fn invalid(message: impl Into<String>) -> CapabilityError {
    CapabilityError::new(
        FILE_READ_CAPABILITY,
        CapabilityErrorKind::InvalidRequest,
        message,
    )
}

pub fn parse_usize_arg(
    capability: &str,
    args: &Value,
    key: &str,
    default: usize,
    min: usize,
    max: usize,
) -> Result<usize, CapabilityError> {
    let Some(raw_value) = args.get(key) else {
        return Ok(default);
    };
    let parsed = raw_value
        .as_u64()
        .and_then(|value| usize::try_from(value).ok())
        .ok_or_else(|| {
            CapabilityError::new(
                capability,
                CapabilityErrorKind::InvalidRequest,
                format!("'{key}' must be a positive integer"),
            )
        })?;
    if parsed < min || parsed > max {
        return Err(CapabilityError::new(
            capability,
            CapabilityErrorKind::InvalidRequest,
            format!("'{key}' must be between {min} and {max}"),
        ));
    }
    Ok(parsed)
}

pub fn parse_file_read_request(args: &Value) -> Result<FileReadRequest, CapabilityError> {
    let path = args
        .get("path")
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default()
        .to_string();
    if path.is_empty() {
        return Err(invalid("'path' is required for file_read"));
    }

    let cap = FILE_READ_CAPABILITY;
    Ok(FileReadRequest {
        path,
        start_line: parse_usize_arg(cap, args, "start_line", 1, 1, 1_000_000)?,
        max_lines: parse_usize_arg(
            cap,
            args,
            "max_lines",
            FILE_READ_DEFAULT_MAX_LINES,
            1,
            FILE_READ_MAX_LINES_LIMIT,
        )?,
        max_bytes: parse_usize_arg(
            cap,
            args,
            "max_bytes",
            FILE_READ_DEFAULT_MAX_BYTES,
            1,
            FILE_READ_MAX_BYTES_LIMIT,
        )?,
        max_entries: parse_usize_arg(
            cap,
            args,
            "max_entries",
            FILE_READ_DEFAULT_MAX_ENTRIES,
            1,
            FILE_READ_MAX_ENTRIES_LIMIT,
        )?,
    })
}

/// Rejects paths outside the workspace, inside denied directories, or
/// naming secret files.
pub fn enforce_workspace_path_policy(
    capability: &str,
    requested_path: &str,
    resolved: &Path,
    workspace_root: &Path,
) -> Result<(), CapabilityError> {
    let denied = |message: String| {
        CapabilityError::new(capability, CapabilityErrorKind::InvalidRequest, message)
    };

    if !resolved.starts_with(workspace_root) {
        return Err(denied(format!(
            "path '{}' is outside workspace root '{}'",
            requested_path,
            workspace_root.display()
        )));
    }

    let relative = resolved.strip_prefix(workspace_root).unwrap_or(resolved);
    for component in relative.components() {
        let segment = component.as_os_str().to_string_lossy();
        if DENIED_SEGMENTS
            .iter()
            .any(|blocked| segment.eq_ignore_ascii_case(blocked))
        {
            return Err(denied(format!(
                "path '{}': segment '{}' is blocked by policy",
                requested_path, segment
            )));
        }
    }

    if let Some(name) = resolved.file_name().and_then(|value| value.to_str())
        && DENIED_FILE_NAMES
            .iter()
            .any(|blocked| name.eq_ignore_ascii_case(blocked))
    {
        return Err(denied(format!(
            "path '{}': filename '{}' is blocked by policy",
            requested_path, name
        )));
    }

    Ok(())
}

pub fn display_path(path: &Path, workspace_root: &Path) -> String {
    path.strip_prefix(workspace_root)
        .map(|relative| {
            if relative.as_os_str().is_empty() {
                ".".to_string()
            } else {
                format!("./{}", relative.display())
            }
        })
        .unwrap_or_else(|_| path.display().to_string())
}

/// Workspace-scoped reader for files and directory listings.
pub struct FileReadCapability {
    workspace_root: PathBuf,
}

impl FileReadCapability {
    pub fn new(workspace_root: PathBuf) -> Self {
        Self { workspace_root }
    }

    fn canonical_root(&self) -> Result<PathBuf, CapabilityError> {
        self.workspace_root.canonicalize().map_err(|_| {
            CapabilityError::invocation(
                FILE_READ_CAPABILITY,
                format!(
                    "workspace root '{}' could not be resolved",
                    self.workspace_root.display()
                ),
            )
        })
    }

    pub fn read(&self, args: &Value) -> Result<Value, CapabilityError> {
        let request = parse_file_read_request(args)?;
        let root = self.canonical_root()?;

        let requested = PathBuf::from(&request.path);
        let absolute = if requested.is_absolute() {
            requested
        } else {
            root.join(requested)
        };
        if !absolute.exists() {
            return Err(invalid(format!("path '{}' does not exist", request.path)));
        }
        let resolved = absolute
            .canonicalize()
            .map_err(|_| invalid(format!("path '{}' could not be resolved", request.path)))?;
        enforce_workspace_path_policy(FILE_READ_CAPABILITY, &request.path, &resolved, &root)?;

        let shown = display_path(&resolved, &root);
        if resolved.is_file() {
            return file_payload(&resolved, &shown, &request);
        }
        if resolved.is_dir() {
            return directory_payload(&resolved, &shown, &request);
        }
        Err(invalid(format!(
            "file_read supports only files and directories (path '{}')",
            request.path
        )))
    }
}

fn file_payload(
    resolved: &Path,
    shown: &str,
    request: &FileReadRequest,
) -> Result<Value, CapabilityError> {
    let data = std::fs::read(resolved).map_err(|err| {
        CapabilityError::invocation(
            FILE_READ_CAPABILITY,
            format!("failed to read file '{shown}': {err}"),
        )
    })?;

    let bytes_to_use = data.len().min(request.max_bytes);
    let truncated_by_bytes = data.len() > bytes_to_use;
    let content = String::from_utf8_lossy(&data[..bytes_to_use]).to_string();
    let lines = content.lines().collect::<Vec<&str>>();

    let start_index = request.start_line.saturating_sub(1).min(lines.len());
    let end_index = start_index.saturating_add(request.max_lines).min(lines.len());
    let omitted_lines = lines.len().saturating_sub(end_index);

    Ok(json!({
        "status": "ok",
        "kind": "file",
        "path": shown,
        "start_line": request.start_line,
        "line_count": end_index - start_index,
        "omitted_lines": omitted_lines,
        "truncated": truncated_by_bytes || omitted_lines > 0,
        "content": lines[start_index..end_index].join("\n")
    }))
}

fn directory_payload(
    resolved: &Path,
    shown: &str,
    request: &FileReadRequest,
) -> Result<Value, CapabilityError> {
    let mut entries = std::fs::read_dir(resolved)
        .map_err(|err| {
            CapabilityError::invocation(
                FILE_READ_CAPABILITY,
                format!("failed to read directory '{shown}': {err}"),
            )
        })?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let file_type = entry.file_type().ok()?;
            let kind = if file_type.is_dir() {
                "dir"
            } else if file_type.is_file() {
                "file"
            } else {
                "other"
            };
            Some((entry.file_name().to_string_lossy().to_string(), kind))
        })
        .collect::<Vec<(String, &str)>>();
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let total_entries = entries.len();
    entries.truncate(request.max_entries);

    Ok(json!({
        "status": "ok",
        "kind": "directory",
        "path": shown,
        "entry_count": total_entries,
        "truncated": total_entries > request.max_entries,
        "entries": entries
            .into_iter()
            .map(|(name, kind)| json!({ "name": name, "kind": kind }))
            .collect::<Vec<Value>>()
    }))
}

#[async_trait]
impl Capability for FileReadCapability {
    fn name(&self) -> &str {
        FILE_READ_CAPABILITY
    }

    fn description(&self) -> &str {
        "Reads a workspace file or lists a directory. Args: path (required), start_line, max_lines, max_bytes, max_entries."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string" },
                "start_line": { "type": "integer", "minimum": 1 },
                "max_lines": { "type": "integer", "minimum": 1, "maximum": FILE_READ_MAX_LINES_LIMIT },
                "max_bytes": { "type": "integer", "minimum": 1, "maximum": FILE_READ_MAX_BYTES_LIMIT },
                "max_entries": { "type": "integer", "minimum": 1, "maximum": FILE_READ_MAX_ENTRIES_LIMIT }
            },
            "required": ["path"]
        })
    }

    async fn invoke(&self, request: Value) -> Result<Value, CapabilityError> {
        self.read(&request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn reads_line_window_from_file() {
        let dir = tempdir().expect("temp directory should create");
        std::fs::write(dir.path().join("brief.md"), "one\ntwo\nthree\nfour\n").unwrap();
        let capability = FileReadCapability::new(dir.path().to_path_buf());

        let out = capability
            .read(&json!({ "path": "brief.md", "start_line": 2, "max_lines": 2 }))
            .expect("read should succeed");
        assert_eq!(out["content"], "two\nthree");
        assert_eq!(out["omitted_lines"], 1);
        assert_eq!(out["truncated"], true);
        assert_eq!(out["path"], "./brief.md");
    }

    #[test]
    fn lists_directory_entries_sorted() {
        let dir = tempdir().expect("temp directory should create");
        std::fs::write(dir.path().join("b.txt"), "b").unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        std::fs::create_dir(dir.path().join("notes")).unwrap();
        let capability = FileReadCapability::new(dir.path().to_path_buf());

        let out = capability.read(&json!({ "path": "." })).expect("listing");
        assert_eq!(out["kind"], "directory");
        assert_eq!(out["entries"][0]["name"], "a.txt");
        assert_eq!(out["entries"][2]["kind"], "dir");
    }

    #[test]
    fn blocks_secret_files_and_escapes() {
        let dir = tempdir().expect("temp directory should create");
        std::fs::write(dir.path().join(".env"), "OPENAI_API_KEY=x").unwrap();
        let capability = FileReadCapability::new(dir.path().to_path_buf());

        let err = capability.read(&json!({ "path": ".env" })).expect_err(".env denied");
        assert_eq!(err.kind, CapabilityErrorKind::InvalidRequest);

        let err = capability
            .read(&json!({ "path": "../" }))
            .expect_err("parent escape denied");
        assert!(err.message.contains("outside workspace"));
    }

    #[test]
    fn rejects_out_of_range_arguments() {
        let err = parse_file_read_request(&json!({ "path": "a", "max_lines": 0 }))
            .expect_err("zero lines invalid");
        assert!(err.message.contains("max_lines"));
    }
}
