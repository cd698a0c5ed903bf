//! Transcript chat.
//!
//! A [`TranscriptionBackend`] turns audio into a [`Transcript`], keeping only
//! the analysis sections requested through [`FeatureFlags`]. A
//! [`TranscriptChat`] then answers questions about that transcript with the
//! regular LLM backend, carrying earlier turns as context.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::backend::{BackendReply, CompletionRequest, ContextEntry, LlmBackend};
use crate::config::RuntimeConfig;
use crate::error::{BackendError, CrewError};
use crate::provider::resolve_backend;

pub const TRANSCRIPT_ROLE: &str = "Transcript Analyst";
pub const TRANSCRIPT_GOAL: &str =
    "Answer questions using only what the transcript and its analysis support.";
pub const DEFAULT_CHAT_HISTORY: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeakerSegment {
    pub speaker: String,
    pub text: String,
    #[serde(default)]
    pub start_ms: Option<u64>,
    #[serde(default)]
    pub end_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentimentSpan {
    pub text: String,
    pub sentiment: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub kind: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chapter {
    pub headline: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub start_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transcript {
    pub text: String,
    #[serde(default)]
    pub speakers: Vec<SpeakerSegment>,
    #[serde(default)]
    pub sentiment: Vec<SentimentSpan>,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub entities: Vec<Entity>,
    #[serde(default)]
    pub chapters: Vec<Chapter>,
    #[serde(default)]
    pub key_phrases: Vec<String>,
}

impl Transcript {
    /// Text plus every analysis section that is present.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if self.speakers.is_empty() {
            out.push_str(self.text.trim());
            out.push('\n');
        } else {
            for segment in &self.speakers {
                out.push_str(&format!("{}: {}\n", segment.speaker, segment.text.trim()));
            }
        }
        if !self.sentiment.is_empty() {
            out.push_str("\nSentiment:\n");
            for span in &self.sentiment {
                out.push_str(&format!("- [{}] {}\n", span.sentiment, span.text.trim()));
            }
        }
        if !self.topics.is_empty() {
            out.push_str(&format!("\nTopics: {}\n", self.topics.join(", ")));
        }
        if !self.entities.is_empty() {
            let rendered = self
                .entities
                .iter()
                .map(|entity| format!("{} ({})", entity.text, entity.kind))
                .collect::<Vec<String>>();
            out.push_str(&format!("\nEntities: {}\n", rendered.join(", ")));
        }
        if !self.chapters.is_empty() {
            out.push_str("\nChapters:\n");
            for chapter in &self.chapters {
                if chapter.summary.trim().is_empty() {
                    out.push_str(&format!("- {}\n", chapter.headline));
                } else {
                    out.push_str(&format!("- {}: {}\n", chapter.headline, chapter.summary.trim()));
                }
            }
        }
        if !self.key_phrases.is_empty() {
            out.push_str(&format!("\nKey phrases: {}\n", self.key_phrases.join(", ")));
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TranscriptFeature {
    SpeakerLabels,
    Sentiment,
    Topics,
    Entities,
    Chapters,
    KeyPhrases,
}

/// Optional analysis requested alongside the plain transcript.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeatureFlags {
    pub speaker_labels: bool,
    pub sentiment: bool,
    pub topics: bool,
    pub entities: bool,
    pub chapters: bool,
    pub key_phrases: bool,
}

impl FeatureFlags {
    pub fn from_features(features: &[TranscriptFeature]) -> Self {
        let mut flags = Self::default();
        for feature in features {
            match feature {
                TranscriptFeature::SpeakerLabels => flags.speaker_labels = true,
                TranscriptFeature::Sentiment => flags.sentiment = true,
                TranscriptFeature::Topics => flags.topics = true,
                TranscriptFeature::Entities => flags.entities = true,
                TranscriptFeature::Chapters => flags.chapters = true,
                TranscriptFeature::KeyPhrases => flags.key_phrases = true,
            }
        }
        flags
    }

    /// Drops every section that was not requested.
    pub fn apply(&self, mut transcript: Transcript) -> Transcript {
        if !self.speaker_labels {
            transcript.speakers.clear();
        }
        if !self.sentiment {
            transcript.sentiment.clear();
        }
        if !self.topics {
            transcript.topics.clear();
        }
        if !self.entities {
            transcript.entities.clear();
        }
        if !self.chapters {
            transcript.chapters.clear();
        }
        if !self.key_phrases {
            transcript.key_phrases.clear();
        }
        transcript
    }
}

#[async_trait]
pub trait TranscriptionBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn transcribe(
        &self,
        audio: &[u8],
        flags: FeatureFlags,
    ) -> Result<Transcript, BackendError>;
}

/// Reads an already-transcribed JSON document in place of audio.
pub struct JsonTranscriptBackend;

#[async_trait]
impl TranscriptionBackend for JsonTranscriptBackend {
    fn name(&self) -> &str {
        "json"
    }

    async fn transcribe(
        &self,
        audio: &[u8],
        flags: FeatureFlags,
    ) -> Result<Transcript, BackendError> {
        let transcript = serde_json::from_slice::<Transcript>(audio).map_err(|err| {
            BackendError::MalformedResponse(format!("transcript JSON is invalid: {err}"))
        })?;
        if transcript.text.trim().is_empty() && transcript.speakers.is_empty() {
            return Err(BackendError::MalformedResponse(
                "transcript has no text".to_string(),
            ));
        }
        Ok(flags.apply(transcript))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatTurn {
    pub question: String,
    pub answer: String,
}

/// One conversation about one transcript.
pub struct TranscriptChat {
    transcript: Transcript,
    backend: Arc<dyn LlmBackend>,
    history: Vec<ChatTurn>,
    history_limit: usize,
    timeout: Duration,
}

impl TranscriptChat {
    pub fn new(transcript: Transcript, backend: Arc<dyn LlmBackend>, timeout: Duration) -> Self {
        Self {
            transcript,
            backend,
            history: Vec::new(),
            history_limit: DEFAULT_CHAT_HISTORY,
            timeout,
        }
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn history(&self) -> &[ChatTurn] {
        &self.history
    }

    pub fn reset(&mut self) {
        self.history.clear();
    }

    fn request_for(&self, question: &str) -> CompletionRequest {
        let mut request = CompletionRequest::new(TRANSCRIPT_ROLE, TRANSCRIPT_GOAL, question);
        request.context.push(ContextEntry {
            label: "transcript".to_string(),
            text: self.transcript.render(),
        });
        let skip = self.history.len().saturating_sub(self.history_limit);
        for turn in self.history.iter().skip(skip) {
            request.context.push(ContextEntry {
                label: format!("earlier question: {}", turn.question),
                text: turn.answer.clone(),
            });
        }
        request
    }

    pub async fn ask(&mut self, question: &str) -> Result<String, CrewError> {
        let question = question.trim();
        if question.is_empty() {
            return Err(CrewError::config("question cannot be empty"));
        }

        let request = self.request_for(question);
        let reply = tokio::time::timeout(self.timeout, self.backend.complete(&request))
            .await
            .map_err(|_| BackendError::Timeout {
                secs: self.timeout.as_secs(),
            })??;
        let answer = match reply {
            BackendReply::Text(text) => text,
            BackendReply::ToolCalls(_) => {
                return Err(BackendError::MalformedResponse(
                    "tool calls are not available in transcript chat".to_string(),
                )
                .into());
            }
        };

        tracing::info!(
            backend = self.backend.name(),
            history = self.history.len(),
            "transcript question answered"
        );
        self.history.push(ChatTurn {
            question: question.to_string(),
            answer: answer.clone(),
        });
        Ok(answer)
    }
}

pub async fn load_transcript(
    backend: &dyn TranscriptionBackend,
    path: &Path,
    flags: FeatureFlags,
    timeout: Duration,
) -> Result<Transcript> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("failed to read transcript file '{}'", path.display()))?;
    let transcript = tokio::time::timeout(timeout, backend.transcribe(&bytes, flags))
        .await
        .unwrap_or(Err(BackendError::Timeout {
            secs: timeout.as_secs(),
        }))
        .map_err(CrewError::from)
        .with_context(|| format!("{} transcription failed for '{}'", backend.name(), path.display()))?;
    Ok(transcript)
}

pub async fn run_transcript_ask(
    cfg: &RuntimeConfig,
    file: &str,
    question: &str,
    features: &[TranscriptFeature],
) -> Result<()> {
    let flags = FeatureFlags::from_features(features);
    let timeout = Duration::from_secs(cfg.task_timeout_secs.max(1));
    let transcript =
        load_transcript(&JsonTranscriptBackend, Path::new(file), flags, timeout).await?;
    let resolved = resolve_backend(cfg)?;
    let mut chat = TranscriptChat::new(transcript, resolved.backend, timeout);
    let answer = chat.ask(question).await?;
    println!("{answer}");
    Ok(())
}
