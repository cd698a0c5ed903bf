//! LLM completion seam.
//!
//! A backend sees one turn at a time: the worker's role and goal, the tools it
//! may call, the task instruction, context carried from memory, and any tool
//! exchanges from earlier rounds of the same task. It answers either with
//! final text or with a batch of tool calls for the worker to execute.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::capability::Capability;
use crate::error::BackendError;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl ToolSpec {
    pub fn from_capability(capability: &Arc<dyn Capability>) -> Self {
        Self {
            name: capability.name().to_string(),
            description: capability.description().to_string(),
            parameters: capability.parameters_schema(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolExchange {
    pub call: ToolCall,
    pub output: Value,
}

/// Text carried into a task from earlier work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContextEntry {
    pub label: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionRequest {
    pub role: String,
    pub goal: String,
    pub tools: Vec<ToolSpec>,
    pub instruction: String,
    pub context: Vec<ContextEntry>,
    /// One inner vec per tool-call round already completed for this task.
    pub tool_rounds: Vec<Vec<ToolExchange>>,
}

impl CompletionRequest {
    pub fn new(role: impl Into<String>, goal: impl Into<String>, instruction: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            goal: goal.into(),
            tools: Vec::new(),
            instruction: instruction.into(),
            context: Vec::new(),
            tool_rounds: Vec::new(),
        }
    }

    pub fn system_prompt(&self) -> String {
        format!(
            "You are the {}. Your goal: {}\nWork only on the task you are given and answer with the finished result.",
            self.role, self.goal
        )
    }

    /// Renders context and instruction into the user turn.
    pub fn user_prompt(&self) -> String {
        if self.context.is_empty() {
            return self.instruction.clone();
        }
        let mut out = String::from("Context from earlier work (use if relevant):\n");
        for (index, entry) in self.context.iter().enumerate() {
            out.push_str(&format!("[{}] {}\n{}\n", index + 1, entry.label, entry.text));
        }
        out.push_str("\nTask:\n");
        out.push_str(&self.instruction);
        out
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BackendReply {
    Text(String),
    ToolCalls(Vec<ToolCall>),
}

#[async_trait]
pub trait LlmBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, request: &CompletionRequest) -> Result<BackendReply, BackendError>;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_prompt_is_bare_instruction_without_context() {
        let request = CompletionRequest::new("Content Writer", "Perform Content Writer tasks.", "Write Ad Copy: spring sale");
        assert_eq!(request.user_prompt(), "Write Ad Copy: spring sale");
        assert!(request.system_prompt().contains("Content Writer"));
    }

    #[test]
    fn user_prompt_numbers_context_entries() {
        let mut request = CompletionRequest::new("Campaign Manager", "goal", "Create Campaign Schedule: Q3");
        request.context.push(ContextEntry {
            label: "Write Ad Copy".to_string(),
            text: "Fresh deals".to_string(),
        });
        let prompt = request.user_prompt();
        assert!(prompt.starts_with("Context from earlier work"));
        assert!(prompt.contains("[1] Write Ad Copy\nFresh deals"));
        assert!(prompt.ends_with("Task:\nCreate Campaign Schedule: Q3"));
    }
}
