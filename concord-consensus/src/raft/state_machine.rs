use std::sync::{Arc, Mutex};

use concord_common::env::{LogEntry, LogIndex};

/// Receives committed entries in index order, each exactly once.
pub trait StateMachine: Send {
    fn apply(&mut self, entry: &LogEntry);
}

/// Keeps every applied command. Clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct AppliedLog {
    applied: Arc<Mutex<Vec<(LogIndex, Vec<u8>)>>>,
}

impl AppliedLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<(LogIndex, Vec<u8>)> {
        self.applied.lock().map(|a| a.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.applied.lock().map(|a| a.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StateMachine for AppliedLog {
    fn apply(&mut self, entry: &LogEntry) {
        if let Ok(mut applied) = self.applied.lock() {
            applied.push((entry.index, entry.command.clone()));
        }
    }
}
