use serde::{Deserialize, Serialize};

use concord_common::env::{LogEntry, LogIndex, Term};

/// The replicated log. Positions are 1-based; index 0 stands for the empty
/// prefix and always has term 0.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RaftLog {
    entries: Vec<LogEntry>,
}

impl RaftLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last_index(&self) -> LogIndex {
        self.entries.len() as LogIndex
    }

    pub fn last_term(&self) -> Term {
        self.entries.last().map_or(0, |e| e.term)
    }

    pub fn get(&self, index: LogIndex) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get((index - 1) as usize)
    }

    /// Term at `index`; `Some(0)` for the sentinel, `None` past the end.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        self.get(index).map(|e| e.term)
    }

    pub fn append_command(&mut self, term: Term, command: Vec<u8>, timestamp: u64) -> LogIndex {
        let index = self.last_index() + 1;
        self.entries.push(LogEntry::new(term, index, command, timestamp));
        index
    }

    /// Appends an entry received from the leader. Its index must follow the
    /// current last index.
    pub(crate) fn push(&mut self, mut entry: LogEntry) -> bool {
        if entry.index != self.last_index() + 1 {
            return false;
        }
        entry.committed = false;
        self.entries.push(entry);
        true
    }

    /// Drops `index` and everything after it.
    pub fn truncate_from(&mut self, index: LogIndex) {
        if index == 0 {
            self.entries.clear();
        } else {
            self.entries.truncate((index - 1) as usize);
        }
    }

    /// Up to `max` entries starting at `from`.
    pub fn entries_from(&self, from: LogIndex, max: usize) -> Vec<LogEntry> {
        let start = from.max(1) as usize - 1;
        self.entries.iter().skip(start).take(max).cloned().collect()
    }

    /// Whether a log ending at (`last_term`, `last_index`) is at least as
    /// up-to-date as this one.
    pub fn is_up_to_date(&self, last_term: Term, last_index: LogIndex) -> bool {
        let my_term = self.last_term();
        last_term > my_term || (last_term == my_term && last_index >= self.last_index())
    }

    /// First index holding `term`, searching back from `from`.
    pub fn first_index_of_term(&self, term: Term, from: LogIndex) -> LogIndex {
        let mut index = from.min(self.last_index());
        while index > 1 && self.term_at(index - 1) == Some(term) {
            index -= 1;
        }
        index
    }

    pub(crate) fn mark_committed(&mut self, from: LogIndex, to: LogIndex) {
        for index in from.max(1)..=to.min(self.last_index()) {
            if let Some(entry) = self.entries.get_mut((index - 1) as usize) {
                entry.committed = true;
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }
}
