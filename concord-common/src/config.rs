//! config.rs
//!
//! Tunables shared by the quorum, fault-monitor and replication engines.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConcordError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeoutRange {
    pub min: u64,
    pub max: u64,
}

impl Default for TimeoutRange {
    fn default() -> Self {
        Self { min: 150, max: 300 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Randomized Raft election timeout window.
    pub election_timeout_range_ms: TimeoutRange,
    /// Leader heartbeat (empty AppendEntries) period.
    pub heartbeat_interval_ms: u64,
    /// Simple-majority threshold for ordinary decisions.
    pub default_threshold: f64,
    /// Supermajority threshold for membership and threshold changes.
    pub membership_change_threshold: f64,
    /// A member silent for longer than this is considered stale.
    pub heartbeat_timeout_ms: u64,
    pub fault_scan_interval_ms: u64,
    pub health_check_interval_ms: u64,
    /// Default lifetime of a weighted voting round.
    pub vote_timeout_ms: u64,
    pub max_entries_per_append: usize,
    /// Faults above this count make a member suspected.
    pub fault_count_threshold: u32,
    /// Reputation below this makes a member suspected.
    pub reputation_floor: f64,
    /// Malicious-pattern count above which a member is suspected.
    pub suspect_pattern_threshold: u32,
    /// Malicious-pattern count above which a member is confirmed and isolated.
    pub confirm_pattern_threshold: u32,
    /// Fixed seed for election jitter; random when absent.
    pub rng_seed: Option<u64>,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            election_timeout_range_ms: TimeoutRange::default(),
            heartbeat_interval_ms: 50,
            default_threshold: 0.67,
            membership_change_threshold: 0.75,
            heartbeat_timeout_ms: 1_000,
            fault_scan_interval_ms: 500,
            health_check_interval_ms: 250,
            vote_timeout_ms: 5_000,
            max_entries_per_append: 64,
            fault_count_threshold: 3,
            reputation_floor: 0.3,
            suspect_pattern_threshold: 2,
            confirm_pattern_threshold: 5,
            rng_seed: None,
        }
    }
}

impl ConsensusConfig {
    pub fn validate(&self) -> Result<()> {
        let range = self.election_timeout_range_ms;
        if range.min == 0 || range.min > range.max {
            return Err(ConcordError::Config(format!(
                "election timeout range [{}, {}] is empty",
                range.min, range.max
            )));
        }
        if self.heartbeat_interval_ms == 0 || self.heartbeat_interval_ms >= range.min {
            return Err(ConcordError::Config(format!(
                "heartbeat interval {}ms must be positive and shorter than the minimum election timeout {}ms",
                self.heartbeat_interval_ms, range.min
            )));
        }
        validate_threshold(self.default_threshold)?;
        validate_threshold(self.membership_change_threshold)?;
        if self.membership_change_threshold < self.default_threshold {
            return Err(ConcordError::Config(
                "membership change threshold must not be below the default threshold".into(),
            ));
        }
        for (name, value) in [
            ("heartbeat_timeout_ms", self.heartbeat_timeout_ms),
            ("fault_scan_interval_ms", self.fault_scan_interval_ms),
            ("health_check_interval_ms", self.health_check_interval_ms),
            ("vote_timeout_ms", self.vote_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConcordError::Config(format!("{name} must be positive")));
            }
        }
        if self.max_entries_per_append == 0 {
            return Err(ConcordError::Config("max_entries_per_append must be positive".into()));
        }
        if self.confirm_pattern_threshold < self.suspect_pattern_threshold {
            return Err(ConcordError::Config(
                "confirm_pattern_threshold must not be below suspect_pattern_threshold".into(),
            ));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn fault_scan_interval(&self) -> Duration {
        Duration::from_millis(self.fault_scan_interval_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }
}

/// Thresholds are fractions of the active weight and must lie in [0.5, 1.0].
pub fn validate_threshold(threshold: f64) -> Result<()> {
    if !(0.5..=1.0).contains(&threshold) || threshold.is_nan() {
        return Err(ConcordError::InvalidThreshold(threshold));
    }
    Ok(())
}
