use std::collections::{BTreeSet, HashMap};
use std::fs::OpenOptions;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde_json::{Value, json};

use crate::config::RuntimeConfig;

pub fn unix_ms_now() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

#[derive(Debug, Clone)]
pub struct TelemetrySink {
    pub enabled: bool,
    pub path: PathBuf,
    pub run_id: String,
    pub command: String,
    pub profile: String,
    pub file_lock: Arc<std::sync::Mutex<()>>,
}

impl TelemetrySink {
    pub fn new(cfg: &RuntimeConfig, command: String) -> Self {
        let run_id = format!("run-{}-{}", unix_ms_now(), std::process::id());
        Self {
            enabled: cfg.telemetry_enabled,
            path: PathBuf::from(&cfg.telemetry_path),
            run_id,
            command,
            profile: cfg.profile.clone(),
            file_lock: Arc::new(std::sync::Mutex::new(())),
        }
    }

    pub fn emit(&self, event: &str, payload: Value) {
        if !self.enabled {
            return;
        }

        let mut record = serde_json::Map::new();
        record.insert("ts_unix_ms".to_string(), json!(unix_ms_now()));
        record.insert("event".to_string(), json!(event));
        record.insert("run_id".to_string(), json!(self.run_id));
        record.insert("command".to_string(), json!(self.command));
        record.insert("profile".to_string(), json!(self.profile));

        if let Some(map) = payload.as_object() {
            for (key, value) in map {
                record.insert(key.clone(), value.clone());
            }
        }

        let value = Value::Object(record);
        if let Err(err) = self.append_event_line(&value) {
            tracing::warn!(
                event = event,
                path = %self.path.display(),
                error = %err,
                "telemetry write failed"
            );
        }
    }

    fn append_event_line(&self, value: &Value) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).with_context(|| {
                format!(
                    "failed to create telemetry directory '{}'",
                    parent.display()
                )
            })?;
        }

        let _guard = self.file_lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open telemetry path '{}'", self.path.display()))?;

        serde_json::to_writer(&mut file, value).with_context(|| {
            format!("failed to serialize telemetry event for '{}'", self.command)
        })?;
        writeln!(file).context("failed to write telemetry newline")
    }
}

#[derive(Debug, Default)]
pub struct TelemetrySummary {
    pub total_lines: usize,
    pub parsed_events: usize,
    pub parse_errors: usize,
    pub unique_runs: BTreeSet<String>,
    pub command_counts: HashMap<String, usize>,
    pub command_completed: usize,
    pub command_failed: usize,
    pub run_started: usize,
    pub run_completed: usize,
    pub run_aborted: usize,
    pub task_completed: usize,
    pub task_failed: usize,
    pub workflow_runs: HashMap<String, usize>,
    pub error_kinds: HashMap<String, usize>,
    pub last_event_ts_unix_ms: Option<u128>,
}

pub fn summarize_telemetry_lines(lines: Vec<String>, limit: usize) -> TelemetrySummary {
    let mut summary = TelemetrySummary::default();
    let max_events = limit.max(1);
    summary.total_lines = lines.len();

    for line in lines.into_iter().rev().take(max_events) {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let parsed = match serde_json::from_str::<Value>(line) {
            Ok(value) => value,
            Err(_) => {
                summary.parse_errors += 1;
                continue;
            }
        };

        summary.parsed_events += 1;

        if let Some(run_id) = parsed.get("run_id").and_then(Value::as_str)
            && !run_id.is_empty()
        {
            summary.unique_runs.insert(run_id.to_string());
        }

        if let Some(command) = parsed.get("command").and_then(Value::as_str)
            && !command.is_empty()
        {
            *summary
                .command_counts
                .entry(command.to_string())
                .or_insert(0) += 1;
        }

        if let Some(ts) = parsed.get("ts_unix_ms").and_then(Value::as_u64) {
            let ts_u128 = ts as u128;
            summary.last_event_ts_unix_ms = Some(
                summary
                    .last_event_ts_unix_ms
                    .map(|existing| existing.max(ts_u128))
                    .unwrap_or(ts_u128),
            );
        }

        let event = parsed
            .get("event")
            .and_then(Value::as_str)
            .unwrap_or_default();
        match event {
            "command.completed" => summary.command_completed += 1,
            "command.failed" => summary.command_failed += 1,
            "run.started" => {
                summary.run_started += 1;
                if let Some(workflow) = parsed.get("workflow_id").and_then(Value::as_str) {
                    *summary
                        .workflow_runs
                        .entry(workflow.to_string())
                        .or_insert(0) += 1;
                }
            }
            "run.completed" => summary.run_completed += 1,
            "run.aborted" => {
                summary.run_aborted += 1;
                if let Some(kind) = parsed.get("error_kind").and_then(Value::as_str) {
                    *summary.error_kinds.entry(kind.to_string()).or_insert(0) += 1;
                }
            }
            "task.completed" => summary.task_completed += 1,
            "task.failed" => summary.task_failed += 1,
            _ => {}
        }
    }

    summary
}

pub fn run_telemetry_report(
    cfg: &RuntimeConfig,
    path_override: Option<String>,
    limit: usize,
) -> Result<()> {
    let path = PathBuf::from(path_override.unwrap_or_else(|| cfg.telemetry_path.clone()));
    if !path.exists() {
        println!("No telemetry file found at '{}'.", path.display());
        return Ok(());
    }

    let file = std::fs::File::open(&path)
        .with_context(|| format!("failed to open telemetry file '{}'", path.display()))?;
    let reader = io::BufReader::new(file);
    let lines = reader
        .lines()
        .collect::<std::result::Result<Vec<String>, std::io::Error>>()
        .with_context(|| format!("failed to read telemetry file '{}'", path.display()))?;

    let summary = summarize_telemetry_lines(lines, limit);
    let mut commands = summary.command_counts.iter().collect::<Vec<_>>();
    commands.sort_by_key(|(name, count)| (std::cmp::Reverse(**count), (*name).clone()));

    println!("Telemetry report");
    println!("Path: {}", path.display());
    println!("Lines in file: {}", summary.total_lines);
    println!(
        "Events analyzed: {} (parse_errors={})",
        summary.parsed_events, summary.parse_errors
    );
    println!("Unique runs: {}", summary.unique_runs.len());
    println!(
        "Command outcomes: completed={} failed={}",
        summary.command_completed, summary.command_failed
    );
    println!(
        "Crew runs: started={} completed={} aborted={}",
        summary.run_started, summary.run_completed, summary.run_aborted
    );
    println!(
        "Tasks: completed={} failed={}",
        summary.task_completed, summary.task_failed
    );

    if !summary.workflow_runs.is_empty() {
        let mut workflows = summary.workflow_runs.iter().collect::<Vec<_>>();
        workflows.sort_by_key(|(name, count)| (std::cmp::Reverse(**count), (*name).clone()));
        println!("Workflows:");
        for (name, count) in workflows.into_iter().take(5) {
            println!("- {}: {}", name, count);
        }
    }

    if !summary.error_kinds.is_empty() {
        let mut kinds = summary.error_kinds.iter().collect::<Vec<_>>();
        kinds.sort();
        let rendered = kinds
            .into_iter()
            .map(|(kind, count)| format!("{kind}={count}"))
            .collect::<Vec<String>>()
            .join(" ");
        println!("Run failures by kind: {rendered}");
    }

    if !commands.is_empty() {
        println!("Top commands:");
        for (name, count) in commands.into_iter().take(5) {
            println!("- {}: {}", name, count);
        }
    }

    if let Some(last_ts) = summary.last_event_ts_unix_ms {
        println!("Last event ts_unix_ms: {last_ts}");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn summary_counts_run_and_task_lifecycle() {
        let lines = vec![
            r#"{"event":"run.started","run_id":"r1","command":"run","workflow_id":"Marketing Campaign","ts_unix_ms":10}"#,
            r#"{"event":"task.completed","run_id":"r1","command":"run","ts_unix_ms":11}"#,
            r#"{"event":"task.failed","run_id":"r1","command":"run","error_kind":"BACKEND","ts_unix_ms":12}"#,
            r#"{"event":"run.aborted","run_id":"r1","command":"run","error_kind":"BACKEND","ts_unix_ms":13}"#,
            "not json",
            "",
            r#"{"event":"command.completed","run_id":"r2","command":"doctor","ts_unix_ms":9}"#,
        ]
        .into_iter()
        .map(str::to_string)
        .collect::<Vec<String>>();

        let summary = summarize_telemetry_lines(lines, 100);
        assert_eq!(summary.parsed_events, 5);
        assert_eq!(summary.parse_errors, 1);
        assert_eq!(summary.unique_runs.len(), 2);
        assert_eq!(summary.run_started, 1);
        assert_eq!(summary.run_aborted, 1);
        assert_eq!(summary.task_completed, 1);
        assert_eq!(summary.task_failed, 1);
        assert_eq!(summary.error_kinds.get("BACKEND"), Some(&1));
        assert_eq!(summary.workflow_runs.get("Marketing Campaign"), Some(&1));
        assert_eq!(summary.command_counts.get("run"), Some(&4));
        assert_eq!(summary.last_event_ts_unix_ms, Some(13));
    }

    #[test]
    fn summary_limit_keeps_most_recent_lines() {
        let lines = (0..10)
            .map(|i| format!(r#"{{"event":"task.completed","ts_unix_ms":{i}}}"#))
            .collect::<Vec<String>>();
        let summary = summarize_telemetry_lines(lines, 3);
        assert_eq!(summary.total_lines, 10);
        assert_eq!(summary.parsed_events, 3);
        assert_eq!(summary.last_event_ts_unix_ms, Some(9));
    }

    #[test]
    fn sink_appends_json_lines_with_run_metadata() {
        let dir = tempdir().expect("temp directory should create");
        let path = dir.path().join("telemetry").join("events.jsonl");
        let cfg = RuntimeConfig {
            telemetry_path: path.to_string_lossy().to_string(),
            ..RuntimeConfig::default()
        };
        let sink = TelemetrySink::new(&cfg, "run".to_string());
        sink.emit("run.started", json!({ "workflow_id": "Marketing Campaign" }));
        sink.emit("run.completed", json!({ "task_count": 4 }));

        let content = std::fs::read_to_string(&path).unwrap();
        let events = content
            .lines()
            .map(|line| serde_json::from_str::<Value>(line).unwrap())
            .collect::<Vec<Value>>();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["event"], "run.started");
        assert_eq!(events[0]["profile"], "default");
        assert_eq!(events[1]["task_count"], 4);
        assert_eq!(events[0]["run_id"], events[1]["run_id"]);
    }

    #[test]
    fn disabled_sink_writes_nothing() {
        let dir = tempdir().expect("temp directory should create");
        let path = dir.path().join("events.jsonl");
        let cfg = RuntimeConfig {
            telemetry_enabled: false,
            telemetry_path: path.to_string_lossy().to_string(),
            ..RuntimeConfig::default()
        };
        TelemetrySink::new(&cfg, "doctor".to_string()).emit("command.completed", json!({}));
        assert!(!path.exists());
    }
}
