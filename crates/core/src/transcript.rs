//! Conversation transcript with search and JSON export.

use crate::message::Sender;
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct TranscriptEntry {
    pub id: u64,
    pub sender: Sender,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TranscriptExport<'a> {
    export_date: DateTime<Utc>,
    messages: &'a [TranscriptEntry],
}

/// The messages shown in a conversation, oldest first.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    entries: Vec<TranscriptEntry>,
    next_id: u64,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry and returns its id.
    pub fn record(&mut self, sender: Sender, text: impl Into<String>) -> u64 {
        self.next_id += 1;
        self.entries.push(TranscriptEntry {
            id: self.next_id,
            sender,
            text: text.into(),
            timestamp: Utc::now(),
        });
        self.next_id
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Case-insensitive substring search. An empty query matches nothing.
    pub fn search(&self, query: &str) -> Vec<&TranscriptEntry> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return Vec::new();
        }
        self.entries
            .iter()
            .filter(|e| e.text.to_lowercase().contains(&needle))
            .collect()
    }

    pub fn export_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&TranscriptExport {
            export_date: Utc::now(),
            messages: &self.entries,
        })
    }
}
