//! Memory carried between tasks.
//!
//! [`RunMemory`] is the bounded buffer of outputs produced by the current run.
//! [`RecallStore`] is the durable store shared across runs; which entries come
//! back from it is decided by a [`RecallStrategy`].

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::backend::ContextEntry;

pub const DEFAULT_MEMORY_WINDOW: usize = 4;
pub const DEFAULT_RECALL_LIMIT: usize = 3;
pub const DEFAULT_RECALL_CAPACITY: usize = 500;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemoryEntry {
    pub workflow_id: String,
    pub task: String,
    pub role: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl MemoryEntry {
    pub fn key(&self) -> String {
        format!(
            "{:x}",
            md5::compute(format!("{}\u{1f}{}\u{1f}{}", self.workflow_id, self.task, self.content))
        )
    }

    pub fn to_context(&self) -> ContextEntry {
        ContextEntry {
            label: format!("{} ({})", self.task, self.role),
            text: self.content.clone(),
        }
    }
}

pub fn query_terms(query: &str) -> Vec<String> {
    query
        .split_whitespace()
        .map(|token| token.trim_matches(|c: char| !c.is_ascii_alphanumeric()))
        .map(str::to_ascii_lowercase)
        .filter(|token| token.len() > 2)
        .collect::<Vec<String>>()
}

pub trait RecallStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Picks at most `limit` entries for `query`, best first.
    fn recall(&self, query: &str, entries: &[MemoryEntry], limit: usize) -> Vec<MemoryEntry>;
}

/// Most recent entries, regardless of the query.
pub struct RecencyWindow;

impl RecallStrategy for RecencyWindow {
    fn name(&self) -> &'static str {
        "recency"
    }

    fn recall(&self, _query: &str, entries: &[MemoryEntry], limit: usize) -> Vec<MemoryEntry> {
        let mut sorted = entries.to_vec();
        sorted.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        sorted.truncate(limit);
        sorted
    }
}

/// Lexical term overlap; with `semantic-search` a Jaro-Winkler score is added.
pub struct SimilaritySearch {
    pub min_score: usize,
}

impl Default for SimilaritySearch {
    fn default() -> Self {
        Self { min_score: 1 }
    }
}

impl SimilaritySearch {
    fn score(&self, query: &str, terms: &[String], entry: &MemoryEntry) -> usize {
        let body = format!("{} {}", entry.task, entry.content).to_ascii_lowercase();
        let lexical_hits = terms
            .iter()
            .map(|term| body.matches(term.as_str()).count())
            .sum::<usize>();

        #[cfg(feature = "semantic-search")]
        {
            if lexical_hits == 0 {
                return 0;
            }
            let similarity = strsim::jaro_winkler(&query.to_ascii_lowercase(), &body);
            ((similarity * 1000.0) as usize) + (lexical_hits * 25)
        }

        #[cfg(not(feature = "semantic-search"))]
        {
            let _ = query;
            lexical_hits
        }
    }
}

impl RecallStrategy for SimilaritySearch {
    fn name(&self) -> &'static str {
        "similarity"
    }

    fn recall(&self, query: &str, entries: &[MemoryEntry], limit: usize) -> Vec<MemoryEntry> {
        let terms = query_terms(query);
        if terms.is_empty() {
            return Vec::new();
        }
        let mut scored = entries
            .iter()
            .filter_map(|entry| {
                let score = self.score(query, &terms, entry);
                (score >= self.min_score.max(1)).then_some((score, entry))
            })
            .collect::<Vec<(usize, &MemoryEntry)>>();
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.created_at.cmp(&a.1.created_at)));
        scored
            .into_iter()
            .take(limit)
            .map(|(_, entry)| entry.clone())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RecallStrategyKind {
    #[default]
    Recency,
    Similarity,
}

pub fn build_recall_strategy(kind: RecallStrategyKind) -> Box<dyn RecallStrategy> {
    match kind {
        RecallStrategyKind::Recency => Box::new(RecencyWindow),
        RecallStrategyKind::Similarity => Box::new(SimilaritySearch::default()),
    }
}

/// Outputs of the current run, oldest evicted first once `capacity` is hit.
#[derive(Debug, Clone)]
pub struct RunMemory {
    capacity: usize,
    entries: VecDeque<MemoryEntry>,
}

impl RunMemory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: VecDeque::new(),
        }
    }

    pub fn push(&mut self, entry: MemoryEntry) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn entries(&self) -> impl Iterator<Item = &MemoryEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// JSON-backed store keyed by content hash. `path = None` keeps it in memory.
///
/// Holds at most `capacity` entries; the oldest by `created_at` are evicted
/// first.
pub struct RecallStore {
    entries: BTreeMap<String, MemoryEntry>,
    path: Option<PathBuf>,
    capacity: usize,
}

impl RecallStore {
    pub fn in_memory() -> Self {
        Self {
            entries: BTreeMap::new(),
            path: None,
            capacity: DEFAULT_RECALL_CAPACITY,
        }
    }

    pub fn open(path: &Path) -> Result<Self> {
        let entries = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read recall store at '{}'", path.display()))?;
            serde_json::from_str(&content).with_context(|| {
                format!("recall store at '{}' is not valid JSON", path.display())
            })?
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            entries,
            path: Some(path.to_path_buf()),
            capacity: DEFAULT_RECALL_CAPACITY,
        })
    }

    /// Entries already beyond the new capacity are dropped on the next write.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries from other workflows are never recalled.
    pub fn recall(
        &self,
        strategy: &dyn RecallStrategy,
        workflow_id: &str,
        query: &str,
        limit: usize,
    ) -> Vec<MemoryEntry> {
        let candidates = self
            .entries
            .values()
            .filter(|entry| entry.workflow_id == workflow_id)
            .cloned()
            .collect::<Vec<MemoryEntry>>();
        strategy.recall(query, &candidates, limit)
    }

    pub fn remember(&mut self, entry: MemoryEntry) -> Result<()> {
        self.entries.insert(entry.key(), entry);
        let evicted = self.evict_oldest();
        if evicted > 0 {
            tracing::debug!(evicted, capacity = self.capacity, "recall store pruned");
        }
        self.persist()
    }

    fn evict_oldest(&mut self) -> usize {
        let excess = self.entries.len().saturating_sub(self.capacity);
        if excess == 0 {
            return 0;
        }
        let mut by_age = self
            .entries
            .iter()
            .map(|(key, entry)| (entry.created_at, key.clone()))
            .collect::<Vec<(DateTime<Utc>, String)>>();
        by_age.sort();
        for (_, key) in by_age.into_iter().take(excess) {
            self.entries.remove(&key);
        }
        excess
    }

    fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).context("failed to create recall store directory")?;
        }
        let json = serde_json::to_string(&self.entries)
            .context("failed to serialize recall store")?;
        std::fs::write(path, json).context("failed to write recall store")?;
        Ok(())
    }
}
