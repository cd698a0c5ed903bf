//! Assembles and runs one workflow from the catalog.
//!
//! Everything that can fail on configuration (catalog lookup, inputs,
//! mandatory capabilities, role bindings, backend resolution) is checked
//! before the first task starts.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::json;

use crate::binder::{TaskItem, bind_tasks};
use crate::capability::resolver::CapabilityResolver;
use crate::capability::{CREDENTIAL_KEYS, CapabilityRegistry, Credentials};
use crate::catalog::{Catalog, WorkflowDefinition};
use crate::config::RuntimeConfig;
use crate::error::CrewError;
use crate::memory::{RecallStore, build_recall_strategy};
use crate::orchestrator::{AbortHandle, DurableRecall, SequentialOrchestrator};
use crate::provider::{provider_label, resolve_backend};
use crate::session::SessionContext;
use crate::sink::{ConsoleSink, FanoutSink, TelemetryResultSink};
use crate::telemetry::TelemetrySink;
use crate::worker::{BackendProvider, SharedBackend, WorkerFactory};

/// Parses repeated `--input "Task=text"` values. Later values for the same
/// task replace earlier ones.
pub fn parse_task_inputs(raw: &[String]) -> Result<HashMap<String, String>, CrewError> {
    let mut inputs = HashMap::new();
    for entry in raw {
        let Some((task, text)) = entry.split_once('=') else {
            return Err(CrewError::config(format!(
                "invalid --input '{entry}'. Use TASK=TEXT, for example --input \"Write Ad Copy=Three short ads\""
            )));
        };
        let task = task.trim();
        if task.is_empty() {
            return Err(CrewError::config(format!(
                "invalid --input '{entry}': task name is empty"
            )));
        }
        inputs.insert(task.to_string(), text.trim().to_string());
    }
    Ok(inputs)
}

/// Resolves capabilities, builds one worker per role, and binds every task.
pub fn assemble_tasks(
    definition: &WorkflowDefinition,
    cfg: &RuntimeConfig,
    registry: &CapabilityRegistry,
    credentials: &Credentials,
    backends: &dyn BackendProvider,
    inputs: &HashMap<String, String>,
) -> Result<Vec<TaskItem>, CrewError> {
    definition.validate()?;

    let role_map = cfg.role_capability_map();
    let policy = cfg.capability_policy();
    let pool = registry.instantiate(&role_map.referenced_names(&definition.roles), credentials);
    let resolver = CapabilityResolver::new(&role_map, &pool, &policy);

    let workers = WorkerFactory::new(&cfg.goal_template, &definition.goal_overrides, backends)
        .with_max_tool_rounds(cfg.max_tool_rounds)
        .build(&definition.roles, &resolver)?;
    bind_tasks(definition, inputs, &workers)
}

pub fn build_orchestrator(
    cfg: &RuntimeConfig,
    memory_enabled: bool,
    abort: AbortHandle,
) -> Result<SequentialOrchestrator> {
    let mut orchestrator =
        SequentialOrchestrator::new(Duration::from_secs(cfg.task_timeout_secs.max(1)))
            .with_memory(memory_enabled)
            .with_abort_handle(abort);
    if memory_enabled {
        let store = RecallStore::open(Path::new(&cfg.memory_store_path))?
            .with_capacity(cfg.memory_max_entries);
        tracing::debug!(
            path = cfg.memory_store_path.as_str(),
            entries = store.len(),
            strategy = ?cfg.memory_strategy,
            "recall store opened"
        );
        orchestrator = orchestrator
            .with_recall(DurableRecall::new(store, build_recall_strategy(cfg.memory_strategy)));
    }
    Ok(orchestrator)
}

pub fn load_catalog(cfg: &RuntimeConfig) -> Result<Catalog> {
    Catalog::load(cfg.catalog_path.as_deref().map(Path::new))
}

pub struct RunRequest<'a> {
    pub example: &'a str,
    pub inputs: &'a [String],
    pub memory: bool,
    pub show_task_outputs: bool,
}

pub async fn run_workflow(
    cfg: &RuntimeConfig,
    request: RunRequest<'_>,
    telemetry: &TelemetrySink,
) -> Result<()> {
    let catalog = load_catalog(cfg)?;
    let definition = catalog.get(request.example)?;
    let inputs = parse_task_inputs(request.inputs)?;

    let resolved = resolve_backend(cfg)?;
    let registry = CapabilityRegistry::builtin(PathBuf::from(&cfg.workspace_root));
    let credentials = Credentials::from_env(CREDENTIAL_KEYS);
    let tasks = assemble_tasks(
        definition,
        cfg,
        &registry,
        &credentials,
        &SharedBackend(resolved.backend.clone()),
        &inputs,
    )?;

    let memory_enabled = request.memory || cfg.memory_enabled;
    let abort = AbortHandle::new();
    let orchestrator = build_orchestrator(cfg, memory_enabled, abort.clone())?;

    let mut session = SessionContext::with_memory_window(&definition.id, cfg.memory_window);
    let sink = FanoutSink::new()
        .with(Arc::new(ConsoleSink {
            show_task_outputs: request.show_task_outputs,
        }))
        .with(Arc::new(TelemetryResultSink::new(telemetry.clone())));

    telemetry.emit(
        "run.started",
        json!({
            "crew_run_id": session.run_id(),
            "workflow_id": definition.id,
            "task_count": tasks.len(),
            "provider": provider_label(resolved.provider),
            "model": resolved.model,
            "memory": memory_enabled,
        }),
    );

    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupt received; stopping after the current task.");
            abort.abort();
        }
    });
    let outcome = orchestrator.run(&tasks, &mut session, &sink).await;
    watcher.abort();
    session.reset();

    outcome
        .into_result()
        .with_context(|| format!("workflow '{}' did not complete", definition.id))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn inputs_split_on_first_equals_sign() {
        let inputs = parse_task_inputs(&[
            "Write Ad Copy = Headline: save=more ".to_string(),
            "Write Ad Copy=second".to_string(),
        ])
        .unwrap();
        assert_eq!(inputs.len(), 1);
        assert_eq!(inputs["Write Ad Copy"], "second");

        let inputs = parse_task_inputs(&["A=x=y".to_string()]).unwrap();
        assert_eq!(inputs["A"], "x=y");
    }

    #[test]
    fn malformed_inputs_are_configuration_errors() {
        let err = parse_task_inputs(&["no separator".to_string()]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        let err = parse_task_inputs(&[" =text".to_string()]).unwrap_err();
        assert!(err.to_string().contains("task name is empty"));
    }

    #[test]
    fn orchestrator_opens_recall_store_only_with_memory() {
        let dir = tempfile::tempdir().expect("temp directory should create");
        let store_path = dir.path().join("bad.json");
        std::fs::write(&store_path, "not json").unwrap();
        let cfg = RuntimeConfig {
            memory_store_path: store_path.to_string_lossy().to_string(),
            ..RuntimeConfig::default()
        };
        assert!(build_orchestrator(&cfg, false, AbortHandle::new()).is_ok());
        assert!(build_orchestrator(&cfg, true, AbortHandle::new()).is_err());
    }
}
