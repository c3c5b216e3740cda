use serde::{Deserialize, Serialize};

use concord_p2p::MembershipRegistry;

use crate::quorum::required_weight;

/// `f` in `n ≥ 3f + 1`.
pub fn max_tolerable_faults(member_count: usize) -> usize {
    member_count.saturating_sub(1) / 3
}

/// Advisory headroom before the cluster exceeds its fault bound.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaultTolerance {
    pub max_tolerable: usize,
    pub current_faults: usize,
    /// `(max_tolerable - current_faults) / max_tolerable`, 0 once the bound is met.
    pub level: f64,
}

impl FaultTolerance {
    pub fn from_registry(registry: &MembershipRegistry) -> Self {
        let max_tolerable = max_tolerable_faults(registry.member_count());
        let current_faults = registry.faulty_count();
        let level = if max_tolerable == 0 || current_faults >= max_tolerable {
            0.0
        } else {
            (max_tolerable - current_faults) as f64 / max_tolerable as f64
        };
        Self {
            max_tolerable,
            current_faults,
            level,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.current_faults >= self.max_tolerable
    }
}

/// Whether the eligible weight still reaches `threshold` of the membership.
pub fn can_achieve_quorum(registry: &MembershipRegistry, threshold: f64) -> bool {
    let membership = registry.membership_weight();
    membership > 0 && registry.eligible_weight() >= required_weight(membership, threshold)
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_common::NodeId;

    fn registry(n: usize) -> MembershipRegistry {
        let mut registry = MembershipRegistry::new();
        for i in 1..=n {
            registry
                .upsert_member(NodeId::from(format!("n{i}")), 1, 0)
                .unwrap();
        }
        registry
    }

    #[test]
    fn bound_follows_member_count() {
        assert_eq!(max_tolerable_faults(0), 0);
        assert_eq!(max_tolerable_faults(3), 0);
        assert_eq!(max_tolerable_faults(4), 1);
        assert_eq!(max_tolerable_faults(7), 2);
        assert_eq!(max_tolerable_faults(10), 3);
    }

    #[test]
    fn healthy_cluster_has_full_headroom() {
        let tolerance = FaultTolerance::from_registry(&registry(7));
        assert_eq!(tolerance.max_tolerable, 2);
        assert_eq!(tolerance.current_faults, 0);
        assert_eq!(tolerance.level, 1.0);
    }

    #[test]
    fn headroom_shrinks_with_faults() {
        let mut registry = registry(7);
        registry.isolate(&NodeId::from("n7"), "test").unwrap();
        let tolerance = FaultTolerance::from_registry(&registry);
        assert_eq!(tolerance.level, 0.5);

        registry.isolate(&NodeId::from("n6"), "test").unwrap();
        let tolerance = FaultTolerance::from_registry(&registry);
        assert_eq!(tolerance.level, 0.0);
        assert!(tolerance.is_exhausted());
    }

    #[test]
    fn quorum_lost_when_eligible_weight_drops() {
        let mut registry = registry(4);
        assert!(can_achieve_quorum(&registry, 0.67));
        registry.isolate(&NodeId::from("n4"), "test").unwrap();
        assert!(can_achieve_quorum(&registry, 0.67));
        registry.isolate(&NodeId::from("n3"), "test").unwrap();
        assert!(!can_achieve_quorum(&registry, 0.67));
    }

    #[test]
    fn empty_registry_cannot_reach_quorum() {
        assert!(!can_achieve_quorum(&MembershipRegistry::new(), 0.5));
    }
}
