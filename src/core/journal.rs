use std::fs;
use std::path::{Path, PathBuf};

use chrono::{serde::ts_seconds, DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

pub const DEFAULT_MAX_ENTRIES: usize = 1000;
const AUTOSAVE_EVERY: usize = 10;

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("Failed to read journal {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid journal format: {0}")]
    Format(#[from] serde_json::Error),
    #[error("Failed to write journal {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// What kind of request an entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Intent,
    Code,
    Unrecognized,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: Uuid,
    #[serde(with = "ts_seconds")]
    pub timestamp: DateTime<Utc>,
    pub kind: EntryKind,
    pub utterance: String,
    pub intent: Option<String>,
    pub confidence: Option<f64>,
    pub success: bool,
    pub message: String,
    pub duration_ms: u64,
}

impl JournalEntry {
    pub fn new(kind: EntryKind, utterance: &str, success: bool, message: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            kind,
            utterance: utterance.to_string(),
            intent: None,
            confidence: None,
            success,
            message: message.to_string(),
            duration_ms: 0,
        }
    }

    pub fn with_intent(mut self, intent: &str, confidence: f64) -> Self {
        self.intent = Some(intent.to_string());
        self.confidence = Some(confidence);
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalStats {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Flat, recency-ordered record of handled utterances, persisted as a JSON
/// array. Oldest entries fall off once `max_entries` is reached.
#[derive(Debug)]
pub struct Journal {
    file_path: Option<PathBuf>,
    max_entries: usize,
    entries: Vec<JournalEntry>,
}

impl Journal {
    /// Journal backed by `path`. Nothing is read until `load`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            file_path: Some(path.into()),
            max_entries: DEFAULT_MAX_ENTRIES,
            entries: Vec::new(),
        }
    }

    /// Journal that never touches the disk.
    pub fn in_memory() -> Self {
        Self {
            file_path: None,
            max_entries: DEFAULT_MAX_ENTRIES,
            entries: Vec::new(),
        }
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries.max(1);
        self
    }

    pub fn path(&self) -> Option<&Path> {
        self.file_path.as_deref()
    }

    pub fn record(&mut self, entry: JournalEntry) {
        self.entries.push(entry);
        if self.entries.len() > self.max_entries {
            let overflow = self.entries.len() - self.max_entries;
            self.entries.drain(..overflow);
        }

        if self.entries.len() % AUTOSAVE_EVERY == 0 {
            if let Err(err) = self.save() {
                warn!(error = %err, "journal autosave failed");
            }
        }
    }

    pub fn load(&mut self) -> Result<(), JournalError> {
        let Some(path) = &self.file_path else {
            return Ok(());
        };
        if !path.exists() {
            return Ok(());
        }

        let content = fs::read_to_string(path).map_err(|source| JournalError::Read {
            path: path.clone(),
            source,
        })?;
        let mut entries: Vec<JournalEntry> = serde_json::from_str(&content)?;
        if entries.len() > self.max_entries {
            entries.drain(..entries.len() - self.max_entries);
        }
        debug!(entries = entries.len(), path = %path.display(), "journal loaded");
        self.entries = entries;
        Ok(())
    }

    /// Writes through a temporary file and renames it over the journal.
    pub fn save(&self) -> Result<(), JournalError> {
        let Some(path) = &self.file_path else {
            return Ok(());
        };
        let write_err = |source| JournalError::Write {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(write_err)?;
        }
        let json = serde_json::to_string_pretty(&self.entries)?;
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, json).map_err(write_err)?;
        fs::rename(&temp_path, path).map_err(write_err)?;
        Ok(())
    }

    /// Newest first.
    pub fn search(&self, query: &str) -> Vec<&JournalEntry> {
        let query = query.to_lowercase();
        self.entries
            .iter()
            .filter(|entry| {
                entry.utterance.to_lowercase().contains(&query)
                    || entry.message.to_lowercase().contains(&query)
                    || entry
                        .intent
                        .as_ref()
                        .map_or(false, |intent| intent.to_lowercase().contains(&query))
            })
            .rev()
            .collect()
    }

    /// The `n` most recent entries, oldest first.
    pub fn last_n(&self, n: usize) -> &[JournalEntry] {
        let start = self.entries.len().saturating_sub(n);
        &self.entries[start..]
    }

    pub fn get(&self, id: &Uuid) -> Option<&JournalEntry> {
        self.entries.iter().find(|entry| &entry.id == id)
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

    pub fn stats(&self) -> JournalStats {
        let succeeded = self.entries.iter().filter(|e| e.success).count();
        JournalStats {
            total: self.entries.len(),
            succeeded,
            failed: self.entries.len() - succeeded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(utterance: &str, success: bool) -> JournalEntry {
        JournalEntry::new(EntryKind::Intent, utterance, success, "done")
    }

    #[test]
    fn test_cap_drops_oldest() {
        let mut journal = Journal::in_memory().with_max_entries(3);
        for i in 0..5 {
            journal.record(entry(&format!("utterance {}", i), true));
        }
        let kept: Vec<&str> = journal.last_n(10).iter().map(|e| e.utterance.as_str()).collect();
        assert_eq!(kept, vec!["utterance 2", "utterance 3", "utterance 4"]);
    }

    #[test]
    fn test_search_is_newest_first_and_case_insensitive() {
        let mut journal = Journal::in_memory();
        journal.record(entry("Take a screenshot", true).with_intent("take_screenshot", 0.8));
        journal.record(entry("type hello", true));
        journal.record(entry("another SCREENSHOT please", false));

        let hits = journal.search("screenshot");
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].utterance, "another SCREENSHOT please");
        assert_eq!(journal.stats(), JournalStats { total: 3, succeeded: 2, failed: 1 });
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("journal.json");

        let mut journal = Journal::new(&path);
        let first = entry("click at 1,2", true).with_intent("click_coordinates", 1.0);
        let id = first.id;
        journal.record(first);
        journal.record(JournalEntry::new(EntryKind::Code, "print(1)", false, "boom"));
        journal.save().unwrap();
        assert!(!path.with_extension("tmp").exists());

        let mut reloaded = Journal::new(&path);
        reloaded.load().unwrap();
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.get(&id).unwrap().intent.as_deref(), Some("click_coordinates"));
        assert_eq!(reloaded.last_n(1)[0].kind, EntryKind::Code);
    }

    #[test]
    fn test_autosave_every_ten_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.json");
        let mut journal = Journal::new(&path);
        for i in 0..9 {
            journal.record(entry(&i.to_string(), true));
        }
        assert!(!path.exists());
        journal.record(entry("tenth", true));
        assert!(path.exists());
    }

    #[test]
    fn test_load_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.json");
        fs::write(&path, "not json").unwrap();
        assert!(matches!(Journal::new(&path).load(), Err(JournalError::Format(_))));
    }
}
