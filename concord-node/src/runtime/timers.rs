use std::collections::HashMap;

use tokio::time::Instant;

use super::coordinator::{TimerCommand, TimerKind};

/// One-shot deadlines, at most one per timer kind.
#[derive(Debug, Default)]
pub struct Timers {
    deadlines: HashMap<TimerKind, Instant>,
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, command: TimerCommand, now: Instant) {
        match command {
            TimerCommand::Arm { timer, after } => {
                self.deadlines.insert(timer, now + after);
            }
            TimerCommand::Cancel(timer) => {
                self.deadlines.remove(&timer);
            }
        }
    }

    /// The earliest pending deadline.
    pub fn next(&self) -> Option<(TimerKind, Instant)> {
        self.deadlines
            .iter()
            .min_by_key(|(_, at)| **at)
            .map(|(kind, at)| (*kind, *at))
    }

    /// Removes and returns every timer due at `now`, earliest first.
    pub fn take_due(&mut self, now: Instant) -> Vec<TimerKind> {
        let mut due: Vec<(TimerKind, Instant)> = self
            .deadlines
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(kind, at)| (*kind, *at))
            .collect();
        due.sort_by_key(|(_, at)| *at);
        for (kind, _) in &due {
            self.deadlines.remove(kind);
        }
        due.into_iter().map(|(kind, _)| kind).collect()
    }

    pub fn is_armed(&self, timer: TimerKind) -> bool {
        self.deadlines.contains_key(&timer)
    }
}
