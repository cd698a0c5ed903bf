use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Machine-distinguishable error kind surfaced to result sinks and the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Capability,
    Backend,
    AbortedRun,
    Internal,
}

impl ErrorKind {
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::Configuration => "CONFIGURATION",
            ErrorKind::Capability => "CAPABILITY",
            ErrorKind::Backend => "BACKEND",
            ErrorKind::AbortedRun => "ABORTED",
            ErrorKind::Internal => "INTERNAL",
        }
    }

    pub fn hint(self) -> &'static str {
        match self {
            ErrorKind::Configuration => {
                "Check the workflow catalog, task inputs, and --mandatory-capability settings. Run crewline examples show --name <id>."
            }
            ErrorKind::Capability => {
                "Set capability credentials (for example SERPER_API_KEY) or drop the capability from the role mapping."
            }
            ErrorKind::Backend => {
                "Set provider credentials (for example OPENAI_API_KEY), raise --task-timeout-secs, or retry later."
            }
            ErrorKind::AbortedRun => {
                "A task failed or the run was cancelled. Completed task outputs were kept; rerun to continue."
            }
            ErrorKind::Internal => {
                "Retry with RUST_LOG=debug. If it persists, capture logs and open an issue."
            }
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendErrorKind {
    Timeout,
    RateLimit,
    Auth,
    MalformedResponse,
    Transport,
}

impl BackendErrorKind {
    pub fn label(self) -> &'static str {
        match self {
            BackendErrorKind::Timeout => "timeout",
            BackendErrorKind::RateLimit => "rate_limit",
            BackendErrorKind::Auth => "auth",
            BackendErrorKind::MalformedResponse => "malformed_response",
            BackendErrorKind::Transport => "transport",
        }
    }
}

/// Failure of an LLM or transcription call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("backend call timed out after {secs}s")]
    Timeout { secs: u64 },
    #[error("backend rate limit reached: {0}")]
    RateLimit(String),
    #[error("backend rejected credentials: {0}")]
    Auth(String),
    #[error("backend returned a malformed response: {0}")]
    MalformedResponse(String),
    #[error("backend transport failure: {0}")]
    Transport(String),
}

impl BackendError {
    pub fn kind(&self) -> BackendErrorKind {
        match self {
            BackendError::Timeout { .. } => BackendErrorKind::Timeout,
            BackendError::RateLimit(_) => BackendErrorKind::RateLimit,
            BackendError::Auth(_) => BackendErrorKind::Auth,
            BackendError::MalformedResponse(_) => BackendErrorKind::MalformedResponse,
            BackendError::Transport(_) => BackendErrorKind::Transport,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityErrorKind {
    MissingCredential,
    Unknown,
    InvalidRequest,
    Invocation,
    MalformedResponse,
}

impl CapabilityErrorKind {
    pub fn label(self) -> &'static str {
        match self {
            CapabilityErrorKind::MissingCredential => "missing_credential",
            CapabilityErrorKind::Unknown => "unknown",
            CapabilityErrorKind::InvalidRequest => "invalid_request",
            CapabilityErrorKind::Invocation => "invocation",
            CapabilityErrorKind::MalformedResponse => "malformed_response",
        }
    }
}

impl fmt::Display for CapabilityErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Failure to instantiate or invoke a capability.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("capability '{capability}' failed ({kind}): {message}")]
pub struct CapabilityError {
    pub capability: String,
    pub kind: CapabilityErrorKind,
    pub message: String,
}

impl CapabilityError {
    pub fn new(
        capability: impl Into<String>,
        kind: CapabilityErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            capability: capability.into(),
            kind,
            message: message.into(),
        }
    }

    pub fn missing_credential(capability: impl Into<String>, key: &str) -> Self {
        Self::new(
            capability,
            CapabilityErrorKind::MissingCredential,
            format!("credential {key} is not set"),
        )
    }

    pub fn invocation(capability: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(capability, CapabilityErrorKind::Invocation, message)
    }
}

#[derive(Debug, Clone, Error)]
pub enum CrewError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("task '{task}' is unbound: no worker exists for its role '{role}'")]
    UnboundTask { task: String, role: String },
    #[error("mandatory capability '{capability}' is unavailable: {reason}")]
    MandatoryCapability { capability: String, reason: String },
    #[error(transparent)]
    Capability(#[from] CapabilityError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("run aborted at task '{task}': {reason}")]
    AbortedRun { task: String, reason: String },
}

impl CrewError {
    pub fn config(message: impl Into<String>) -> Self {
        CrewError::Configuration(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            CrewError::Configuration(_)
            | CrewError::UnboundTask { .. }
            | CrewError::MandatoryCapability { .. } => ErrorKind::Configuration,
            CrewError::Capability(_) => ErrorKind::Capability,
            CrewError::Backend(_) => ErrorKind::Backend,
            CrewError::AbortedRun { .. } => ErrorKind::AbortedRun,
        }
    }
}

pub fn categorize_error(err: &anyhow::Error) -> ErrorKind {
    for cause in err.chain() {
        if let Some(crew) = cause.downcast_ref::<CrewError>() {
            return crew.kind();
        }
        if cause.downcast_ref::<BackendError>().is_some() {
            return ErrorKind::Backend;
        }
        if cause.downcast_ref::<CapabilityError>().is_some() {
            return ErrorKind::Capability;
        }
    }

    let msg = format!("{err:#}").to_ascii_lowercase();
    if msg.contains("api_key") || msg.contains("provider") {
        return ErrorKind::Backend;
    }
    if msg.contains("catalog")
        || msg.contains("profile")
        || msg.contains("invalid value")
        || msg.contains("--input")
    {
        return ErrorKind::Configuration;
    }
    ErrorKind::Internal
}

pub fn format_cli_error(err: &anyhow::Error, show_sensitive_config: bool) -> String {
    let kind = categorize_error(err);
    format!(
        "[{}] {}\nHint: {}",
        kind.code(),
        render_error_message(err, show_sensitive_config),
        kind.hint()
    )
}

pub fn render_error_message(err: &anyhow::Error, show_sensitive_config: bool) -> String {
    let rendered = format!("{err:#}");
    if show_sensitive_config {
        rendered
    } else {
        redact_sensitive_text(&rendered)
    }
}

const SECRET_PREFIXES: &[&str] = &["sk-", "gsk_", "Bearer "];

/// Masks API-key shaped tokens so they never reach terminals or logs.
pub fn redact_sensitive_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0usize;

    while let Some((offset, prefix)) = next_secret_prefix(&text[cursor..]) {
        let start = cursor + offset;
        out.push_str(&text[cursor..start]);

        let value_start = start + prefix.len();
        let remainder = &text[value_start..];
        let end = remainder
            .find(|ch: char| {
                ch.is_whitespace() || matches!(ch, '"' | '\'' | ',' | ';' | ')' | ']' | '}')
            })
            .unwrap_or(remainder.len());
        if end == 0 {
            out.push_str(prefix);
        } else {
            out.push_str(prefix);
            out.push_str("[REDACTED]");
        }
        cursor = value_start + end;
    }

    out.push_str(&text[cursor..]);
    out
}

fn next_secret_prefix(text: &str) -> Option<(usize, &'static str)> {
    SECRET_PREFIXES
        .iter()
        .filter_map(|prefix| {
            text.match_indices(prefix)
                .map(|(offset, _)| offset)
                .find(|offset| {
                    text[..*offset]
                        .chars()
                        .next_back()
                        .is_none_or(|ch| !ch.is_ascii_alphanumeric())
                })
                .map(|offset| (offset, *prefix))
        })
        .min_by_key(|(offset, _)| *offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crew_error_kinds_map_to_taxonomy() {
        assert_eq!(
            CrewError::UnboundTask {
                task: "Write Ad Copy".to_string(),
                role: "Content Writer".to_string(),
            }
            .kind(),
            ErrorKind::Configuration
        );
        assert_eq!(
            CrewError::from(BackendError::Timeout { secs: 5 }).kind(),
            ErrorKind::Backend
        );
        assert_eq!(
            CrewError::from(CapabilityError::missing_credential("web_search", "SERPER_API_KEY"))
                .kind(),
            ErrorKind::Capability
        );
    }

    #[test]
    fn categorize_error_finds_typed_cause_behind_context() {
        let err = anyhow::Error::new(CrewError::config("workflow 'x' not found"))
            .context("failed to prepare run");
        assert_eq!(categorize_error(&err), ErrorKind::Configuration);

        let err = anyhow::Error::new(BackendError::RateLimit("slow down".to_string()));
        assert_eq!(categorize_error(&err), ErrorKind::Backend);
    }

    #[test]
    fn redacts_api_keys_and_bearer_tokens() {
        let text = "auth failed for key sk-abc123, header 'Bearer tok_9' rejected";
        let redacted = redact_sensitive_text(text);
        assert_eq!(
            redacted,
            "auth failed for key sk-[REDACTED], header 'Bearer [REDACTED]' rejected"
        );
        assert_eq!(redact_sensitive_text("no secrets here"), "no secrets here");
        assert_eq!(redact_sensitive_text("task-2 failed"), "task-2 failed");
    }

    #[test]
    fn format_cli_error_includes_code_and_hint() {
        let err = anyhow::Error::new(CrewError::AbortedRun {
            task: "Write Ad Copy".to_string(),
            reason: "timeout".to_string(),
        });
        let rendered = format_cli_error(&err, false);
        assert!(rendered.starts_with("[ABORTED] run aborted at task 'Write Ad Copy'"));
        assert!(rendered.contains("Hint: "));
    }
}
