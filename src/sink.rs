use std::io::Write;
use std::sync::Arc;

use serde_json::json;

use crate::binder::TaskItem;
use crate::error::ErrorKind;
use crate::orchestrator::{RunFailure, RunResult};
use crate::session::{SessionContext, TaskOutput};
use crate::telemetry::TelemetrySink;

/// Receives incremental progress and the terminal outcome of a run.
/// Exactly one of `run_completed` / `run_aborted` is called per run.
pub trait ResultSink: Send + Sync {
    fn task_started(&self, _session: &SessionContext, _index: usize, _item: &TaskItem) {}

    fn task_completed(&self, _session: &SessionContext, _index: usize, _output: &TaskOutput) {}

    fn run_completed(&self, session: &SessionContext, result: &RunResult);

    fn run_aborted(&self, session: &SessionContext, failure: &RunFailure);
}

/// Progress on stderr, final output on stdout.
pub struct ConsoleSink {
    pub show_task_outputs: bool,
}

impl ResultSink for ConsoleSink {
    fn task_started(&self, _session: &SessionContext, index: usize, item: &TaskItem) {
        eprintln!("[{}] {} ({})", index + 1, item.name, item.role());
    }

    fn task_completed(&self, _session: &SessionContext, index: usize, output: &TaskOutput) {
        if self.show_task_outputs {
            eprintln!("--- {} output ---\n{}\n", output.task, output.output);
        } else {
            eprintln!("[{}] {} done", index + 1, output.task);
        }
    }

    fn run_completed(&self, _session: &SessionContext, result: &RunResult) {
        let mut stdout = std::io::stdout().lock();
        let _ = writeln!(stdout, "{}", result.aggregate_output);
    }

    fn run_aborted(&self, _session: &SessionContext, failure: &RunFailure) {
        eprintln!(
            "Run aborted at task '{}' ({}): {}",
            failure.failed_task,
            failure.kind().code(),
            failure.error
        );
        if let Some(last) = failure.partial.per_task_outputs.last() {
            eprintln!(
                "{} task(s) completed before the failure; last output ({}):\n{}",
                failure.partial.per_task_outputs.len(),
                last.task,
                last.output
            );
        }
    }
}

/// Writes run lifecycle events to the telemetry stream.
pub struct TelemetryResultSink {
    telemetry: TelemetrySink,
}

impl TelemetryResultSink {
    pub fn new(telemetry: TelemetrySink) -> Self {
        Self { telemetry }
    }
}

impl ResultSink for TelemetryResultSink {
    fn task_started(&self, session: &SessionContext, index: usize, item: &TaskItem) {
        self.telemetry.emit(
            "task.started",
            json!({
                "crew_run_id": session.run_id(),
                "workflow_id": session.workflow_id(),
                "task_index": index,
                "task": item.name,
                "role": item.role().as_str(),
            }),
        );
    }

    fn task_completed(&self, session: &SessionContext, index: usize, output: &TaskOutput) {
        self.telemetry.emit(
            "task.completed",
            json!({
                "crew_run_id": session.run_id(),
                "workflow_id": session.workflow_id(),
                "task_index": index,
                "task": output.task,
                "output_chars": output.output.chars().count(),
            }),
        );
    }

    fn run_completed(&self, session: &SessionContext, result: &RunResult) {
        self.telemetry.emit(
            "run.completed",
            json!({
                "crew_run_id": session.run_id(),
                "workflow_id": session.workflow_id(),
                "task_count": result.per_task_outputs.len(),
            }),
        );
    }

    fn run_aborted(&self, session: &SessionContext, failure: &RunFailure) {
        // A cancelled run names a task that never started.
        if failure.kind() != ErrorKind::AbortedRun {
            self.telemetry.emit(
                "task.failed",
                json!({
                    "crew_run_id": session.run_id(),
                    "workflow_id": session.workflow_id(),
                    "task_index": failure.failed_index,
                    "task": failure.failed_task,
                    "error_kind": failure.kind().code(),
                }),
            );
        }
        self.telemetry.emit(
            "run.aborted",
            json!({
                "crew_run_id": session.run_id(),
                "workflow_id": session.workflow_id(),
                "failed_task": failure.failed_task,
                "completed_tasks": failure.partial.per_task_outputs.len(),
                "error_kind": failure.kind().code(),
            }),
        );
    }
}

/// Forwards every callback to each inner sink in order.
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn ResultSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl ResultSink for FanoutSink {
    fn task_started(&self, session: &SessionContext, index: usize, item: &TaskItem) {
        for sink in &self.sinks {
            sink.task_started(session, index, item);
        }
    }

    fn task_completed(&self, session: &SessionContext, index: usize, output: &TaskOutput) {
        for sink in &self.sinks {
            sink.task_completed(session, index, output);
        }
    }

    fn run_completed(&self, session: &SessionContext, result: &RunResult) {
        for sink in &self.sinks {
            sink.run_completed(session, result);
        }
    }

    fn run_aborted(&self, session: &SessionContext, failure: &RunFailure) {
        for sink in &self.sinks {
            sink.run_aborted(session, failure);
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum SinkEvent {
        Started(String),
        Completed(String),
        RunCompleted(usize),
        RunAborted { task: String, outputs: usize },
    }

    #[derive(Default)]
    pub struct RecordingSink {
        pub events: Mutex<Vec<SinkEvent>>,
        pub last_result: Mutex<Option<RunResult>>,
        pub last_failure: Mutex<Option<RunFailure>>,
    }

    impl RecordingSink {
        pub fn events(&self) -> Vec<SinkEvent> {
            self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
        }

        fn push(&self, event: SinkEvent) {
            self.events.lock().unwrap_or_else(|e| e.into_inner()).push(event);
        }
    }

    impl ResultSink for RecordingSink {
        fn task_started(&self, _session: &SessionContext, _index: usize, item: &TaskItem) {
            self.push(SinkEvent::Started(item.name.clone()));
        }

        fn task_completed(&self, _session: &SessionContext, _index: usize, output: &TaskOutput) {
            self.push(SinkEvent::Completed(output.task.clone()));
        }

        fn run_completed(&self, _session: &SessionContext, result: &RunResult) {
            self.push(SinkEvent::RunCompleted(result.per_task_outputs.len()));
            *self.last_result.lock().unwrap_or_else(|e| e.into_inner()) = Some(result.clone());
        }

        fn run_aborted(&self, _session: &SessionContext, failure: &RunFailure) {
            self.push(SinkEvent::RunAborted {
                task: failure.failed_task.clone(),
                outputs: failure.partial.per_task_outputs.len(),
            });
            *self.last_failure.lock().unwrap_or_else(|e| e.into_inner()) = Some(failure.clone());
        }
    }
}
