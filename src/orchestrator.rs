//! Sequential execution of bound tasks.
//!
//! Tasks run one at a time in binding order. The first failure (backend
//! error, timeout, malformed capability response) or a cancellation ends the
//! run; completed outputs are kept in the partial result handed to the sink.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::backend::ContextEntry;
use crate::binder::TaskItem;
use crate::error::{BackendError, CrewError, ErrorKind};
use crate::memory::{DEFAULT_RECALL_LIMIT, MemoryEntry, RecallStore, RecallStrategy};
use crate::session::{RunState, SessionContext, TaskOutput};
use crate::sink::ResultSink;

pub const DEFAULT_TASK_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunResult {
    /// Output of the last completed task.
    pub aggregate_output: String,
    pub per_task_outputs: Vec<TaskOutput>,
}

impl RunResult {
    fn from_outputs(outputs: &[TaskOutput]) -> Self {
        Self {
            aggregate_output: outputs
                .last()
                .map(|output| output.output.clone())
                .unwrap_or_default(),
            per_task_outputs: outputs.to_vec(),
        }
    }

    pub fn output_for(&self, task: &str) -> Option<&str> {
        self.per_task_outputs
            .iter()
            .find(|output| output.task == task)
            .map(|output| output.output.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct RunFailure {
    pub partial: RunResult,
    pub failed_task: String,
    pub failed_index: usize,
    pub error: CrewError,
}

impl RunFailure {
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}

#[derive(Debug, Clone)]
pub enum RunOutcome {
    Completed(RunResult),
    Aborted(RunFailure),
}

impl RunOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, RunOutcome::Completed(_))
    }

    pub fn into_result(self) -> Result<RunResult, CrewError> {
        match self {
            RunOutcome::Completed(result) => Ok(result),
            RunOutcome::Aborted(failure) => Err(CrewError::AbortedRun {
                task: failure.failed_task,
                reason: failure.error.to_string(),
            }),
        }
    }
}

/// Stops the orchestrator from starting further tasks. The in-flight task is
/// allowed to finish or time out.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Durable recall shared across runs.
pub struct DurableRecall {
    pub store: Arc<Mutex<RecallStore>>,
    pub strategy: Box<dyn RecallStrategy>,
    pub limit: usize,
}

impl DurableRecall {
    pub fn new(store: RecallStore, strategy: Box<dyn RecallStrategy>) -> Self {
        Self {
            store: Arc::new(Mutex::new(store)),
            strategy,
            limit: DEFAULT_RECALL_LIMIT,
        }
    }
}

pub struct SequentialOrchestrator {
    task_timeout: Duration,
    memory_enabled: bool,
    recall: Option<DurableRecall>,
    abort: AbortHandle,
}

impl Default for SequentialOrchestrator {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_TASK_TIMEOUT_SECS))
    }
}

impl SequentialOrchestrator {
    pub fn new(task_timeout: Duration) -> Self {
        Self {
            task_timeout,
            memory_enabled: false,
            recall: None,
            abort: AbortHandle::new(),
        }
    }

    pub fn with_memory(mut self, enabled: bool) -> Self {
        self.memory_enabled = enabled;
        self
    }

    pub fn with_recall(mut self, recall: DurableRecall) -> Self {
        self.recall = Some(recall);
        self
    }

    pub fn with_abort_handle(mut self, abort: AbortHandle) -> Self {
        self.abort = abort;
        self
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Prior outputs of this run, then durable entries not already present.
    fn context_for(&self, session: &SessionContext, item: &TaskItem) -> Vec<ContextEntry> {
        if !self.memory_enabled {
            return Vec::new();
        }
        let mut seen = session
            .memory()
            .entries()
            .map(|entry| entry.key())
            .collect::<BTreeSet<String>>();
        let mut context = session
            .memory()
            .entries()
            .map(|entry| entry.to_context())
            .collect::<Vec<ContextEntry>>();

        if let Some(recall) = &self.recall {
            let store = recall.store.lock().unwrap_or_else(|e| e.into_inner());
            let recalled = store.recall(
                recall.strategy.as_ref(),
                session.workflow_id(),
                &item.instruction,
                recall.limit,
            );
            for entry in recalled {
                if seen.insert(entry.key()) {
                    let mut ctx = entry.to_context();
                    ctx.label = format!("recalled: {}", ctx.label);
                    context.push(ctx);
                }
            }
        }
        context
    }

    fn remember(&self, entry: MemoryEntry) {
        if !self.memory_enabled {
            return;
        }
        let Some(recall) = &self.recall else {
            return;
        };
        let mut store = recall.store.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(err) = store.remember(entry) {
            tracing::warn!(error = %err, "failed to persist task output to recall store");
        }
    }

    fn abort_run(
        &self,
        session: &mut SessionContext,
        sink: &dyn ResultSink,
        index: usize,
        item: &TaskItem,
        error: CrewError,
    ) -> RunOutcome {
        session.set_state(RunState::Aborted {
            failed_index: index,
        });
        let failure = RunFailure {
            partial: RunResult::from_outputs(session.outputs()),
            failed_task: item.name.clone(),
            failed_index: index,
            error,
        };
        tracing::warn!(
            run_id = session.run_id(),
            task = item.name.as_str(),
            kind = failure.kind().code(),
            error = %failure.error,
            completed = failure.partial.per_task_outputs.len(),
            "run aborted"
        );
        sink.run_aborted(session, &failure);
        RunOutcome::Aborted(failure)
    }

    pub async fn run(
        &self,
        tasks: &[TaskItem],
        session: &mut SessionContext,
        sink: &dyn ResultSink,
    ) -> RunOutcome {
        tracing::info!(
            run_id = session.run_id(),
            workflow = session.workflow_id(),
            tasks = tasks.len(),
            memory = self.memory_enabled,
            "run started"
        );

        for (index, item) in tasks.iter().enumerate() {
            if self.abort.is_aborted() {
                return self.abort_run(
                    session,
                    sink,
                    index,
                    item,
                    CrewError::AbortedRun {
                        task: item.name.clone(),
                        reason: "run was cancelled before this task started".to_string(),
                    },
                );
            }

            session.set_state(RunState::Running { index });
            sink.task_started(session, index, item);
            tracing::info!(
                run_id = session.run_id(),
                index,
                task = item.name.as_str(),
                role = item.role().as_str(),
                "task started"
            );

            let context = self.context_for(session, item);
            let result = match tokio::time::timeout(
                self.task_timeout,
                item.worker.perform(&item.instruction, context),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(CrewError::from(BackendError::Timeout {
                    secs: self.task_timeout.as_secs(),
                })),
            };

            match result {
                Ok(text) => {
                    let output = TaskOutput {
                        task: item.name.clone(),
                        role: item.role().to_string(),
                        output: text,
                    };
                    let entry = session.record_output(output.clone());
                    self.remember(entry);
                    tracing::info!(
                        run_id = session.run_id(),
                        index,
                        task = item.name.as_str(),
                        "task completed"
                    );
                    sink.task_completed(session, index, &output);
                }
                Err(error) => return self.abort_run(session, sink, index, item, error),
            }
        }

        session.set_state(RunState::Completed);
        let result = RunResult::from_outputs(session.outputs());
        tracing::info!(
            run_id = session.run_id(),
            tasks = result.per_task_outputs.len(),
            "run completed"
        );
        sink.run_completed(session, &result);
        RunOutcome::Completed(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, HashMap};

    use crate::backend::BackendReply;
    use crate::backend::testing::ScriptedBackend;
    use crate::binder::bind_tasks;
    use crate::capability::policy::CapabilityPolicy;
    use crate::capability::resolver::{CapabilityResolver, RoleCapabilityMap};
    use crate::capability::{CapabilityRegistry, Credentials};
    use crate::catalog::{TaskBinding, WorkflowDefinition};
    use crate::memory::RecencyWindow;
    use crate::sink::testing::{RecordingSink, SinkEvent};
    use crate::worker::{DEFAULT_GOAL_TEMPLATE, SharedBackend, WorkerFactory};

    fn two_step() -> WorkflowDefinition {
        WorkflowDefinition {
            id: "two-step".to_string(),
            description: "draft then review".to_string(),
            roles: vec!["Writer".into(), "Reviewer".into()],
            tasks: vec!["Draft".to_string(), "Review".to_string()],
            binding: TaskBinding::Positional,
            goal_overrides: BTreeMap::new(),
        }
    }

    fn bound(backend: Arc<ScriptedBackend>) -> Vec<TaskItem> {
        let definition = two_step();
        let map = RoleCapabilityMap::default();
        let pool = CapabilityRegistry::new().instantiate(&BTreeSet::new(), &Credentials::default());
        let policy = CapabilityPolicy::default();
        let resolver = CapabilityResolver::new(&map, &pool, &policy);
        let overrides = BTreeMap::new();
        let shared = SharedBackend(backend);
        let workers = WorkerFactory::new(DEFAULT_GOAL_TEMPLATE, &overrides, &shared)
            .build(&definition.roles, &resolver)
            .unwrap();
        let inputs = HashMap::from([
            ("Draft".to_string(), "launch email".to_string()),
            ("Review".to_string(), "tone check".to_string()),
        ]);
        bind_tasks(&definition, &inputs, &workers).unwrap()
    }

    #[tokio::test]
    async fn memory_disabled_tasks_see_only_their_instruction() {
        let backend = ScriptedBackend::echo();
        let tasks = bound(backend.clone());
        let mut session = SessionContext::new("two-step");
        let sink = RecordingSink::default();

        let outcome = SequentialOrchestrator::default()
            .run(&tasks, &mut session, &sink)
            .await;
        let result = outcome.into_result().unwrap();
        assert_eq!(result.aggregate_output, "Reviewer did: Review: tone check");
        assert_eq!(result.output_for("Draft"), Some("Writer did: Draft: launch email"));
        assert!(backend.recorded().iter().all(|r| r.context.is_empty()));
        assert_eq!(session.state(), &RunState::Completed);
    }

    #[tokio::test]
    async fn memory_enabled_carries_prior_outputs() {
        let backend = ScriptedBackend::echo();
        let tasks = bound(backend.clone());
        let mut session = SessionContext::new("two-step");
        let sink = RecordingSink::default();

        SequentialOrchestrator::default()
            .with_memory(true)
            .run(&tasks, &mut session, &sink)
            .await;
        let recorded = backend.recorded();
        assert!(recorded[0].context.is_empty());
        assert_eq!(recorded[1].context.len(), 1);
        assert_eq!(recorded[1].context[0].text, "Writer did: Draft: launch email");
    }

    #[tokio::test]
    async fn durable_recall_feeds_later_runs() {
        let store = RecallStore::in_memory();
        let orchestrator = SequentialOrchestrator::default()
            .with_memory(true)
            .with_recall(DurableRecall::new(store, Box::new(RecencyWindow)));

        let first = ScriptedBackend::echo();
        let mut session = SessionContext::new("two-step");
        orchestrator
            .run(&bound(first), &mut session, &RecordingSink::default())
            .await;

        let second = ScriptedBackend::echo();
        let mut session = SessionContext::new("two-step");
        orchestrator
            .run(&bound(second.clone()), &mut session, &RecordingSink::default())
            .await;
        let first_call = &second.recorded()[0];
        assert_eq!(first_call.context.len(), 2);
        assert!(first_call.context.iter().all(|c| c.label.starts_with("recalled: ")));
    }

    #[tokio::test]
    async fn cancellation_stops_before_next_task() {
        let abort = AbortHandle::new();
        let trigger = abort.clone();
        let backend = ScriptedBackend::new(move |request| {
            trigger.abort();
            (
                Duration::ZERO,
                Ok(BackendReply::Text(format!("done {}", request.instruction))),
            )
        });
        let tasks = bound(backend.clone());
        let mut session = SessionContext::new("two-step");
        let sink = RecordingSink::default();

        let outcome = SequentialOrchestrator::default()
            .with_abort_handle(abort)
            .run(&tasks, &mut session, &sink)
            .await;
        let RunOutcome::Aborted(failure) = outcome else {
            panic!("expected abort");
        };
        assert_eq!(failure.failed_task, "Review");
        assert_eq!(failure.kind(), ErrorKind::AbortedRun);
        assert_eq!(failure.partial.per_task_outputs.len(), 1);
        assert_eq!(failure.partial.aggregate_output, "done Draft: launch email");
        assert_eq!(backend.recorded().len(), 1);
        assert_eq!(
            sink.events(),
            vec![
                SinkEvent::Started("Draft".to_string()),
                SinkEvent::Completed("Draft".to_string()),
                SinkEvent::RunAborted {
                    task: "Review".to_string(),
                    outputs: 1
                },
            ]
        );
    }

    #[tokio::test]
    async fn backend_error_aborts_with_its_kind() {
        let backend = ScriptedBackend::new(|request| {
            let reply = if request.role == "Reviewer" {
                Err(BackendError::RateLimit("quota".to_string()))
            } else {
                Ok(BackendReply::Text("draft".to_string()))
            };
            (Duration::ZERO, reply)
        });
        let tasks = bound(backend);
        let mut session = SessionContext::new("two-step");
        let sink = RecordingSink::default();

        let outcome = SequentialOrchestrator::default()
            .run(&tasks, &mut session, &sink)
            .await;
        let err = outcome.clone().into_result().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AbortedRun);
        let RunOutcome::Aborted(failure) = outcome else {
            panic!("expected abort");
        };
        assert_eq!(failure.kind(), ErrorKind::Backend);
        assert_eq!(session.state(), &RunState::Aborted { failed_index: 1 });
    }
}
