//! Bounded working memory carried by a loop.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Maximum number of short-term entries kept.
pub const SHORT_TERM_CAPACITY: usize = 10;

/// Maximum number of learned patterns kept.
const MAX_PATTERNS: usize = 50;

/// One remembered interaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub summary: String,
    pub at: DateTime<Utc>,
}

/// Agent memory: a short FIFO of recent interactions plus free-form state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentMemory {
    #[serde(default, deserialize_with = "bounded_entries")]
    short_term: VecDeque<MemoryEntry>,
    #[serde(default)]
    working: HashMap<String, Value>,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    learned_patterns: Vec<String>,
}

impl AgentMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember an interaction, evicting the oldest past capacity.
    pub fn record(&mut self, summary: impl Into<String>) {
        self.short_term.push_back(MemoryEntry {
            summary: summary.into(),
            at: Utc::now(),
        });
        while self.short_term.len() > SHORT_TERM_CAPACITY {
            self.short_term.pop_front();
        }
    }

    /// Recent interactions, oldest first.
    pub fn recent(&self) -> impl Iterator<Item = &MemoryEntry> {
        self.short_term.iter()
    }

    pub fn len(&self) -> usize {
        self.short_term.len()
    }

    pub fn is_empty(&self) -> bool {
        self.short_term.is_empty()
    }

    pub fn set_working(&mut self, key: impl Into<String>, value: Value) {
        self.working.insert(key.into(), value);
    }

    pub fn working(&self, key: &str) -> Option<&Value> {
        self.working.get(key)
    }

    pub fn set_summary(&mut self, summary: impl Into<String>) {
        self.summary = summary.into();
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }

    /// Add a pattern unless already known.
    pub fn learn(&mut self, pattern: impl Into<String>) {
        let pattern = pattern.into();
        if self.learned_patterns.contains(&pattern) {
            return;
        }
        self.learned_patterns.push(pattern);
        if self.learned_patterns.len() > MAX_PATTERNS {
            self.learned_patterns.remove(0);
        }
    }

    pub fn patterns(&self) -> &[String] {
        &self.learned_patterns
    }
}

fn bounded_entries<'de, D>(deserializer: D) -> Result<VecDeque<MemoryEntry>, D::Error>
where
    D: Deserializer<'de>,
{
    let mut entries = VecDeque::<MemoryEntry>::deserialize(deserializer)?;
    while entries.len() > SHORT_TERM_CAPACITY {
        entries.pop_front();
    }
    Ok(entries)
}
