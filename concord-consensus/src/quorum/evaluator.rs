use serde::{Deserialize, Serialize};

use concord_common::{config::validate_threshold, NodeId, Result};
use concord_p2p::MembershipRegistry;

// Absorbs float noise such as 100 * 0.7 = 70.00000000000001.
const THRESHOLD_EPSILON: f64 = 1e-9;

/// `ceil(total_weight × threshold)`.
pub fn required_weight(total_weight: u64, threshold: f64) -> u64 {
    let raw = total_weight as f64 * threshold;
    (raw - THRESHOLD_EPSILON).ceil().max(0.0) as u64
}

/// Strict count majority: more than half of `total`.
pub fn has_majority(count: usize, total: usize) -> bool {
    total > 0 && count * 2 > total
}

/// Gini coefficient of the weight distribution: 0 when every member holds
/// the same weight, approaching 1 when one member holds all of it.
pub fn weight_concentration(weights: &[u64]) -> f64 {
    let n = weights.len();
    let total: u64 = weights.iter().sum();
    if n < 2 || total == 0 {
        return 0.0;
    }

    let mut sorted = weights.to_vec();
    sorted.sort_unstable();

    // G = (2 * Σ i·x_i) / (n * Σ x) - (n + 1) / n, with 1-based i over sorted x
    let weighted: f64 = sorted
        .iter()
        .enumerate()
        .map(|(i, w)| (i as f64 + 1.0) * *w as f64)
        .sum();
    let n = n as f64;
    let gini = (2.0 * weighted) / (n * total as f64) - (n + 1.0) / n;
    gini.clamp(0.0, 1.0)
}

/// The quorum view derived from the membership registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuorumConfiguration {
    pub members: Vec<(NodeId, u64)>,
    pub total_weight: u64,
    pub threshold: f64,
    pub required_weight: u64,
}

impl QuorumConfiguration {
    pub fn from_registry(registry: &MembershipRegistry, threshold: f64) -> Result<Self> {
        validate_threshold(threshold)?;
        let members: Vec<(NodeId, u64)> = registry
            .eligible_members()
            .map(|m| (m.id.clone(), m.weight))
            .collect();
        let total_weight = members.iter().map(|(_, w)| w).sum();
        Ok(Self {
            members,
            total_weight,
            threshold,
            required_weight: required_weight(total_weight, threshold),
        })
    }

    pub fn weight_of(&self, id: &NodeId) -> Option<u64> {
        self.members.iter().find(|(m, _)| m == id).map(|(_, w)| *w)
    }

    pub fn concentration(&self) -> f64 {
        let weights: Vec<u64> = self.members.iter().map(|(_, w)| *w).collect();
        weight_concentration(&weights)
    }
}
