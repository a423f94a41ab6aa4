use std::collections::VecDeque;

use crate::records::{HistoryEntry, TranslatedText};

pub const DEFAULT_HISTORY_LIMIT: usize = 100;
pub const DEFAULT_PROMPT_WINDOW: usize = 10;

/// Capped FIFO of translated pairs carried across the images of one batch.
#[derive(Debug, Clone)]
pub struct TranslationHistory {
    entries: VecDeque<HistoryEntry>,
    limit: usize,
}

impl Default for TranslationHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

impl TranslationHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            limit: limit.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn reset(&mut self) {
        self.entries.clear();
    }

    pub fn push(&mut self, entry: HistoryEntry) {
        self.entries.push_back(entry);
        while self.entries.len() > self.limit {
            self.entries.pop_front();
        }
    }

    pub fn extend_from_translations(&mut self, records: &[TranslatedText]) {
        for record in records {
            self.push(HistoryEntry::from(record));
        }
    }

    /// The newest `count` entries, oldest first.
    pub fn recent(&self, count: usize) -> Vec<HistoryEntry> {
        let skip = self.entries.len().saturating_sub(count);
        self.entries.iter().skip(skip).cloned().collect()
    }

    pub fn snapshot(&self) -> Vec<HistoryEntry> {
        self.entries.iter().cloned().collect()
    }
}
