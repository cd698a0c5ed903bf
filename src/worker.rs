use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::{Value, json};

use crate::backend::{BackendReply, CompletionRequest, ContextEntry, LlmBackend, ToolExchange, ToolSpec};
use crate::capability::Capability;
use crate::capability::resolver::{CapabilityResolver, DroppedCapability};
use crate::catalog::RoleName;
use crate::error::{BackendError, CapabilityErrorKind, CrewError};

pub const DEFAULT_GOAL_TEMPLATE: &str = "Perform {role} tasks.";
pub const DEFAULT_MAX_TOOL_ROUNDS: usize = 4;

pub fn render_goal(template: &str, role: &RoleName) -> String {
    template.replace("{role}", role.as_str())
}

/// A role-labeled LLM worker. Lives for one run.
pub struct Worker {
    role: RoleName,
    goal: String,
    capabilities: Vec<Arc<dyn Capability>>,
    dropped: Vec<DroppedCapability>,
    backend: Arc<dyn LlmBackend>,
    max_tool_rounds: usize,
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("role", &self.role)
            .field("goal", &self.goal)
            .field("capabilities", &self.capability_names())
            .field("backend", &self.backend.name())
            .finish()
    }
}

impl Worker {
    pub fn role(&self) -> &RoleName {
        &self.role
    }

    pub fn goal(&self) -> &str {
        &self.goal
    }

    pub fn capabilities(&self) -> &[Arc<dyn Capability>] {
        &self.capabilities
    }

    pub fn capability_names(&self) -> Vec<&str> {
        self.capabilities.iter().map(|c| c.name()).collect()
    }

    pub fn dropped_capabilities(&self) -> &[DroppedCapability] {
        &self.dropped
    }

    fn capability(&self, name: &str) -> Option<&Arc<dyn Capability>> {
        self.capabilities.iter().find(|c| c.name() == name)
    }

    /// Runs one task to completion, executing tool calls the backend asks
    /// for. The final round is offered without tools so the backend must
    /// answer in text.
    pub async fn perform(
        &self,
        instruction: &str,
        context: Vec<ContextEntry>,
    ) -> Result<String, CrewError> {
        let mut request = CompletionRequest::new(self.role.as_str(), &self.goal, instruction);
        request.context = context;

        for round in 0..=self.max_tool_rounds {
            request.tools = if round < self.max_tool_rounds {
                self.capabilities.iter().map(ToolSpec::from_capability).collect()
            } else {
                Vec::new()
            };

            let calls = match self.backend.complete(&request).await? {
                BackendReply::Text(text) => return Ok(text),
                BackendReply::ToolCalls(calls) if request.tools.is_empty() => {
                    return Err(BackendError::MalformedResponse(format!(
                        "backend requested {} tool call(s) when no tools were offered",
                        calls.len()
                    ))
                    .into());
                }
                BackendReply::ToolCalls(calls) => calls,
            };

            let mut exchanges = Vec::with_capacity(calls.len());
            for call in calls {
                let output = self.invoke_tool(&call.name, call.arguments.clone()).await?;
                exchanges.push(ToolExchange { call, output });
            }
            request.tool_rounds.push(exchanges);
        }

        Err(BackendError::MalformedResponse("tool-call rounds exhausted without text".to_string()).into())
    }

    /// Invocation errors go back to the model as error payloads; a malformed
    /// capability response fails the task.
    async fn invoke_tool(&self, name: &str, arguments: Value) -> Result<Value, CrewError> {
        let Some(capability) = self.capability(name) else {
            tracing::warn!(role = self.role.as_str(), capability = name, "tool call for capability the role does not hold");
            return Ok(json!({
                "status": "error",
                "code": CapabilityErrorKind::Unknown.label(),
                "error": format!("capability '{name}' is not available to {}", self.role),
            }));
        };

        tracing::debug!(role = self.role.as_str(), capability = name, "invoking capability");
        match capability.invoke(arguments).await {
            Ok(output) => Ok(output),
            Err(err) if err.kind == CapabilityErrorKind::MalformedResponse => Err(err.into()),
            Err(err) => {
                tracing::warn!(
                    role = self.role.as_str(),
                    capability = name,
                    kind = err.kind.label(),
                    error = %err.message,
                    "capability invocation failed"
                );
                Ok(json!({
                    "status": "error",
                    "code": err.kind.label(),
                    "error": err.message,
                }))
            }
        }
    }
}

/// Supplies an LLM backend per worker. Failure here aborts the run before
/// any task executes.
pub trait BackendProvider: Send + Sync {
    fn backend_for(&self, role: &RoleName) -> Result<Arc<dyn LlmBackend>, BackendError>;
}

/// Every worker shares one backend client.
pub struct SharedBackend(pub Arc<dyn LlmBackend>);

impl BackendProvider for SharedBackend {
    fn backend_for(&self, _role: &RoleName) -> Result<Arc<dyn LlmBackend>, BackendError> {
        Ok(self.0.clone())
    }
}

pub struct WorkerFactory<'a> {
    goal_template: &'a str,
    goal_overrides: &'a BTreeMap<RoleName, String>,
    backends: &'a dyn BackendProvider,
    max_tool_rounds: usize,
}

impl<'a> WorkerFactory<'a> {
    pub fn new(
        goal_template: &'a str,
        goal_overrides: &'a BTreeMap<RoleName, String>,
        backends: &'a dyn BackendProvider,
    ) -> Self {
        Self {
            goal_template,
            goal_overrides,
            backends,
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
        }
    }

    pub fn with_max_tool_rounds(mut self, max_tool_rounds: usize) -> Self {
        self.max_tool_rounds = max_tool_rounds;
        self
    }

    pub fn goal_for(&self, role: &RoleName) -> String {
        self.goal_overrides
            .get(role)
            .cloned()
            .unwrap_or_else(|| render_goal(self.goal_template, role))
    }

    /// One worker per role, in role order.
    pub fn build(
        &self,
        roles: &[RoleName],
        resolver: &CapabilityResolver<'_>,
    ) -> Result<Vec<Arc<Worker>>, CrewError> {
        let mut workers = Vec::with_capacity(roles.len());
        for role in roles {
            let resolved = resolver.resolve(role)?;
            let backend = self.backends.backend_for(role).map_err(|err| {
                tracing::error!(role = role.as_str(), error = %err, "llm backend unavailable");
                CrewError::from(err)
            })?;
            let worker = Worker {
                role: role.clone(),
                goal: self.goal_for(role),
                capabilities: resolved.capabilities,
                dropped: resolved.dropped,
                backend,
                max_tool_rounds: self.max_tool_rounds,
            };
            tracing::debug!(
                role = role.as_str(),
                capabilities = ?worker.capability_names(),
                dropped = worker.dropped.len(),
                "worker created"
            );
            workers.push(Arc::new(worker));
        }
        Ok(workers)
    }
}
