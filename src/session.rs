use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::memory::{DEFAULT_MEMORY_WINDOW, MemoryEntry, RunMemory};
use crate::telemetry::unix_ms_now;

static RUN_COUNTER: AtomicU64 = AtomicU64::new(1);

pub fn new_run_id() -> String {
    format!(
        "run-{}-{}-{}",
        unix_ms_now(),
        std::process::id(),
        RUN_COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

/// Lifecycle of one run. `Completed` and `Aborted` are terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Running { index: usize },
    Completed,
    Aborted { failed_index: usize },
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Completed | RunState::Aborted { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            RunState::Pending => "pending",
            RunState::Running { .. } => "running",
            RunState::Completed => "completed",
            RunState::Aborted { .. } => "aborted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskOutput {
    pub task: String,
    pub role: String,
    pub output: String,
}

/// Run-scoped state shared by the orchestrator and the result sink.
#[derive(Debug, Clone)]
pub struct SessionContext {
    run_id: String,
    workflow_id: String,
    started_at: DateTime<Utc>,
    state: RunState,
    outputs: Vec<TaskOutput>,
    memory: RunMemory,
}

impl SessionContext {
    pub fn new(workflow_id: impl Into<String>) -> Self {
        Self::with_memory_window(workflow_id, DEFAULT_MEMORY_WINDOW)
    }

    pub fn with_memory_window(workflow_id: impl Into<String>, window: usize) -> Self {
        Self {
            run_id: new_run_id(),
            workflow_id: workflow_id.into(),
            started_at: Utc::now(),
            state: RunState::Pending,
            outputs: Vec::new(),
            memory: RunMemory::new(window),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn outputs(&self) -> &[TaskOutput] {
        &self.outputs
    }

    pub fn memory(&self) -> &RunMemory {
        &self.memory
    }

    pub(crate) fn set_state(&mut self, state: RunState) {
        tracing::debug!(run_id = self.run_id.as_str(), from = self.state.label(), to = state.label(), "run state changed");
        self.state = state;
    }

    pub(crate) fn record_output(&mut self, output: TaskOutput) -> MemoryEntry {
        let entry = MemoryEntry {
            workflow_id: self.workflow_id.clone(),
            task: output.task.clone(),
            role: output.role.clone(),
            content: output.output.clone(),
            created_at: Utc::now(),
        };
        self.memory.push(entry.clone());
        self.outputs.push(output);
        entry
    }

    /// Drops outputs and memory and starts a fresh run id.
    pub fn reset(&mut self) {
        self.run_id = new_run_id();
        self.started_at = Utc::now();
        self.state = RunState::Pending;
        self.outputs.clear();
        self.memory.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_clears_outputs_and_issues_new_run_id() {
        let mut session = SessionContext::with_memory_window("Marketing Campaign", 2);
        let first_id = session.run_id().to_string();
        session.set_state(RunState::Running { index: 0 });
        session.record_output(TaskOutput {
            task: "Generate Marketing Plan".to_string(),
            role: "Market Researcher".to_string(),
            output: "plan".to_string(),
        });
        assert_eq!(session.outputs().len(), 1);
        assert_eq!(session.memory().len(), 1);

        session.reset();
        assert!(session.outputs().is_empty());
        assert!(session.memory().is_empty());
        assert_eq!(session.state(), &RunState::Pending);
        assert_ne!(session.run_id(), first_id);
    }

    #[test]
    fn terminal_states() {
        assert!(RunState::Completed.is_terminal());
        assert!(RunState::Aborted { failed_index: 1 }.is_terminal());
        assert!(!RunState::Running { index: 0 }.is_terminal());
    }
}
