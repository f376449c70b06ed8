//! Candidate pool selection.
//!
//! Given a node and the eligible pools, keeps the pools whose selector
//! matches the node and orders them best first:
//!
//! 1. more matched selector requirements
//! 2. fewer allocatable sub-blocks
//! 3. fewer per-node host bits
//! 4. smaller matched selector key
//! 5. smaller base address (IPv4 before IPv6), then pool name
//!
//! The order is total, so the same node and pools always give the same
//! ranking regardless of the order the pools were passed in.

use crate::registry::Pool;
use crate::selector::{self, NodeFields, SelectorMatch};
use ipnet::IpNet;
use std::cmp::Ordering;
use std::net::IpAddr;
use std::sync::Arc;

/// A pool that matches a node, with the data it is ranked by
#[derive(Debug, Clone)]
pub struct Candidate {
    /// The matching pool
    pub pool: Arc<Pool>,
    /// How the pool's selector matched the node
    pub matched: SelectorMatch,
}

impl Candidate {
    fn compare(&self, other: &Self) -> Ordering {
        other
            .matched
            .specificity
            .cmp(&self.matched.specificity)
            .then_with(|| self.pool.capacity().cmp(&other.pool.capacity()))
            .then_with(|| self.pool.host_bits().cmp(&other.pool.host_bits()))
            .then_with(|| self.matched.key.cmp(&other.matched.key))
            .then_with(|| compare_base(self.pool.base_block(), other.pool.base_block()))
            .then_with(|| self.pool.name().cmp(other.pool.name()))
    }
}

fn compare_base(a: Option<IpNet>, b: Option<IpNet>) -> Ordering {
    match (a.map(|n| n.network()), b.map(|n| n.network())) {
        (Some(IpAddr::V4(a)), Some(IpAddr::V4(b))) => a.cmp(&b),
        (Some(IpAddr::V6(a)), Some(IpAddr::V6(b))) => a.cmp(&b),
        (Some(IpAddr::V4(_)), Some(IpAddr::V6(_))) => Ordering::Less,
        (Some(IpAddr::V6(_)), Some(IpAddr::V4(_))) => Ordering::Greater,
        (a, b) => a.is_none().cmp(&b.is_none()),
    }
}

/// Matching pools for a node, best first
#[must_use]
pub fn rank(node: NodeFields<'_>, pools: &[Arc<Pool>]) -> Vec<Candidate> {
    let mut candidates: Vec<Candidate> = pools
        .iter()
        .filter_map(|pool| {
            selector::evaluate(pool.node_selector(), node).map(|matched| Candidate {
                pool: Arc::clone(pool),
                matched,
            })
        })
        .collect();
    candidates.sort_by(Candidate::compare);
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::create_test_cluster_cidr;
    use crds::ClusterCIDRSpec;
    use std::collections::BTreeMap;

    fn pool(name: &str, ipv4: &str, ipv6: &str, host_bits: i32, labels: &[(&str, &str)]) -> Arc<Pool> {
        let cc = create_test_cluster_cidr(name, ipv4, ipv6, host_bits, labels);
        Arc::new(Pool::new(name, cc.spec).unwrap())
    }

    fn node_labels() -> BTreeMap<String, String> {
        [("match", "single"), ("doublematch", "double"), ("ipv4", "true")]
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    fn select(node: NodeFields<'_>, pools: &[Arc<Pool>]) -> Option<Arc<Pool>> {
        rank(node, pools).into_iter().next().map(|c| c.pool)
    }

    fn names(candidates: &[Candidate]) -> Vec<&str> {
        candidates.iter().map(|c| c.pool.name()).collect()
    }

    #[test]
    fn test_more_specific_selector_wins_over_size() {
        let labels = node_labels();
        let node = NodeFields { name: "node", labels: &labels };
        let p1 = pool("single-label", "10.0.0.0/23", "", 8, &[("match", "single")]);
        let p2 = pool(
            "double-label",
            "10.1.0.0/20",
            "",
            8,
            &[("match", "single"), ("doublematch", "double")],
        );

        for pools in [vec![Arc::clone(&p1), Arc::clone(&p2)], vec![p2, p1]] {
            assert_eq!(select(node, &pools).unwrap().name(), "double-label");
        }
    }

    #[test]
    fn test_smaller_capacity_wins() {
        let labels = node_labels();
        let node = NodeFields { name: "node", labels: &labels };
        let pools = vec![
            pool("large", "10.0.0.0/20", "", 8, &[("match", "single")]),
            pool("small", "10.1.0.0/23", "", 8, &[("match", "single")]),
        ];
        assert_eq!(select(node, &pools).unwrap().name(), "small");
    }

    #[test]
    fn test_smaller_host_bits_wins() {
        let labels = node_labels();
        let node = NodeFields { name: "node", labels: &labels };
        // Both hand out 4 sub-blocks
        let pools = vec![
            pool("hb8", "10.0.0.0/22", "", 8, &[("match", "single")]),
            pool("hb7", "10.1.0.0/23", "", 7, &[("match", "single")]),
        ];
        assert_eq!(select(node, &pools).unwrap().name(), "hb7");
    }

    #[test]
    fn test_selector_key_then_base_address() {
        let labels = node_labels();
        let node = NodeFields { name: "node", labels: &labels };

        let by_key = vec![
            pool("match-key", "10.0.0.0/24", "", 8, &[("match", "single")]),
            pool("ipv4-key", "10.1.0.0/24", "", 8, &[("ipv4", "true")]),
        ];
        assert_eq!(names(&rank(node, &by_key)), vec!["ipv4-key", "match-key"]);

        let by_base = vec![
            pool("high", "10.9.0.0/24", "", 8, &[("ipv4", "true")]),
            pool("v6", "", "fd00::/120", 8, &[("ipv4", "true")]),
            pool("low", "10.2.0.0/24", "", 8, &[("ipv4", "true")]),
        ];
        assert_eq!(names(&rank(node, &by_base)), vec!["low", "high", "v6"]);
    }

    #[test]
    fn test_numeric_base_comparison() {
        let labels = node_labels();
        let node = NodeFields { name: "node", labels: &labels };
        // Textually "10.10" < "10.9", numerically the other way round
        let pools = vec![
            pool("ten", "10.10.0.0/24", "", 8, &[]),
            pool("nine", "10.9.0.0/24", "", 8, &[]),
        ];
        assert_eq!(select(node, &pools).unwrap().name(), "nine");
    }

    #[test]
    fn test_non_matching_pools_are_filtered() {
        let labels = node_labels();
        let node = NodeFields { name: "node", labels: &labels };
        let pools = vec![
            pool("gpu", "10.0.0.0/24", "", 8, &[("gpu", "true")]),
            pool("default", "10.1.0.0/16", "", 8, &[]),
        ];
        let ranked = rank(node, &pools);
        assert_eq!(names(&ranked), vec!["default"]);
        assert_eq!(ranked[0].matched.specificity, 0);

        assert!(select(node, &pools[..1]).is_none());
        assert!(select(node, &[]).is_none());
    }

    #[test]
    fn test_capacity_is_smallest_family() {
        let labels = node_labels();
        let node = NodeFields { name: "node", labels: &labels };
        let dual = Arc::new(
            Pool::new(
                "dual",
                ClusterCIDRSpec {
                    per_node_host_bits4: 8,
                    per_node_host_bits6: 8,
                    ipv4: "10.0.0.0/16".to_string(),
                    ipv6: "fd00::/119".to_string(),
                    ..Default::default()
                },
            )
            .unwrap(),
        );
        let v4 = pool("v4", "10.1.0.0/22", "", 8, &[]);

        // dual: min(256, 2) = 2 beats v4: 4
        assert_eq!(select(node, &[v4, dual]).unwrap().name(), "dual");
    }
}
